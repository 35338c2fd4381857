//! Tracker follows every record a Generator instance emits in fault-tolerant mode until it has
//! been fully processed. Registering a record id opens a tracking tree with one outstanding edge
//! (the delivery to the first hop). Every anchored emission adds an edge to the tree of its
//! inbound delivery, and every ack closes one. A tree without outstanding edges is complete and
//! the owning Generator instance is told the id was acked. Failing any edge of a tree, or not
//! completing the tree within the ack timeout, drops the tree and the owner is told the id
//! failed, so it can be replayed.
//!
//! Outcomes are sent over an unbounded channel per Generator instance. The tracker must never wait
//! on a Generator, which might itself be waiting on a full downstream channel.
//!
//! On shutdown outstanding trees are abandoned, no outcome is reported for them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
#[cfg(test)]
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::Result;
use crate::error::Error;
use crate::message::{DeliveryHandle, RecordId};

const MAILBOX_SIZE: usize = 1024;

/// Final state of a registered record, reported to the Generator instance that registered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked(RecordId),
    Failed(RecordId),
}

/// A tracking tree rooted at one registration.
#[derive(Debug)]
struct Tree {
    id: RecordId,
    origin: usize,
    outstanding: HashSet<u64>,
    deadline: Instant,
}

/// ActorMessage represents the messages that can be sent to the Tracker actor.
enum ActorMessage {
    Register {
        handle: DeliveryHandle,
        id: RecordId,
        origin: usize,
    },
    Anchor {
        handle: DeliveryHandle,
    },
    Ack {
        handle: DeliveryHandle,
    },
    Fail {
        handle: DeliveryHandle,
    },
    #[cfg(test)]
    Outstanding {
        respond_to: oneshot::Sender<usize>,
    },
}

struct Tracker {
    trees: HashMap<u64, Tree>,
    receiver: mpsc::Receiver<ActorMessage>,
    outcomes: Vec<mpsc::UnboundedSender<Outcome>>,
    ack_timeout: Duration,
}

impl Tracker {
    fn new(
        receiver: mpsc::Receiver<ActorMessage>,
        outcomes: Vec<mpsc::UnboundedSender<Outcome>>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            trees: HashMap::new(),
            receiver,
            outcomes,
            ack_timeout,
        }
    }

    /// Runs until every [TrackerHandle] is dropped.
    async fn run(mut self) {
        let mut sweep = tokio::time::interval((self.ack_timeout / 2).max(Duration::from_millis(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = self.receiver.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    self.handle_message(message);
                }
                _ = sweep.tick() => self.fail_expired(Instant::now()),
            }
        }

        if !self.trees.is_empty() {
            debug!(abandoned = self.trees.len(), "Tracker stopped with outstanding deliveries");
        }
    }

    fn handle_message(&mut self, message: ActorMessage) {
        match message {
            ActorMessage::Register { handle, id, origin } => {
                self.handle_register(handle, id, origin)
            }
            ActorMessage::Anchor { handle } => self.handle_anchor(handle),
            ActorMessage::Ack { handle } => self.handle_ack(handle),
            ActorMessage::Fail { handle } => self.handle_fail(handle),
            #[cfg(test)]
            ActorMessage::Outstanding { respond_to } => {
                let _ = respond_to.send(self.trees.len());
            }
        }
    }

    fn handle_register(&mut self, handle: DeliveryHandle, id: RecordId, origin: usize) {
        self.trees.insert(
            handle.tree,
            Tree {
                id,
                origin,
                outstanding: HashSet::from([handle.edge]),
                deadline: Instant::now() + self.ack_timeout,
            },
        );
    }

    /// Adds an edge to a tree that is still open. Anchoring on a tree that already failed is a
    /// no-op, the replay supersedes it.
    fn handle_anchor(&mut self, handle: DeliveryHandle) {
        if let Some(tree) = self.trees.get_mut(&handle.tree) {
            tree.outstanding.insert(handle.edge);
        }
    }

    fn handle_ack(&mut self, handle: DeliveryHandle) {
        let Some(tree) = self.trees.get_mut(&handle.tree) else {
            trace!(%handle, "Ack for a closed tree, ignoring");
            return;
        };
        if !tree.outstanding.remove(&handle.edge) {
            trace!(%handle, "Duplicate ack, ignoring");
            return;
        }
        if tree.outstanding.is_empty() {
            if let Some(tree) = self.trees.remove(&handle.tree) {
                self.report(tree.origin, Outcome::Acked(tree.id));
            }
        }
    }

    fn handle_fail(&mut self, handle: DeliveryHandle) {
        if let Some(tree) = self.trees.remove(&handle.tree) {
            self.report(tree.origin, Outcome::Failed(tree.id));
        }
    }

    /// Fails every open tree registered before `now - ack_timeout`, oldest first. Completed trees
    /// are already gone, so the sweep only visits deliveries still in flight.
    fn fail_expired(&mut self, now: Instant) {
        let mut expired: Vec<u64> = self
            .trees
            .iter()
            .filter(|(_, tree)| tree.deadline <= now)
            .map(|(tree_id, _)| *tree_id)
            .collect();
        expired.sort_unstable();

        for tree_id in expired {
            if let Some(tree) = self.trees.remove(&tree_id) {
                warn!(id = tree.id, tree = tree_id, timeout = ?self.ack_timeout, "Delivery timed out");
                self.report(tree.origin, Outcome::Failed(tree.id));
            }
        }
    }

    fn report(&self, origin: usize, outcome: Outcome) {
        let Some(outcomes) = self.outcomes.get(origin) else {
            warn!(origin, ?outcome, "No generator registered for outcome");
            return;
        };
        // the generator is gone during shutdown, nothing left to replay
        let _ = outcomes.send(outcome);
    }
}

/// TrackerHandle is the cloneable interface to the Tracker actor. Tree and edge ids are allocated
/// by the handle, so registering and anchoring never wait for a reply.
#[derive(Clone)]
pub struct TrackerHandle {
    sender: mpsc::Sender<ActorMessage>,
    next_tree: Arc<AtomicU64>,
    next_edge: Arc<AtomicU64>,
    origin: usize,
}

impl TrackerHandle {
    /// Spawns the Tracker for `origins` Generator instances and returns the handle together with
    /// one outcome receiver per Generator instance.
    pub fn new(
        ack_timeout: Duration,
        origins: usize,
    ) -> (Self, Vec<mpsc::UnboundedReceiver<Outcome>>) {
        let (sender, receiver) = mpsc::channel(MAILBOX_SIZE);
        let (outcome_txs, outcome_rxs): (Vec<_>, Vec<_>) =
            (0..origins).map(|_| mpsc::unbounded_channel()).unzip();

        let tracker = Tracker::new(receiver, outcome_txs, ack_timeout);
        tokio::spawn(tracker.run());

        let handle = Self {
            sender,
            next_tree: Arc::new(AtomicU64::new(0)),
            next_edge: Arc::new(AtomicU64::new(0)),
            origin: 0,
        };
        (handle, outcome_rxs)
    }

    /// Handle whose registrations report their outcomes to Generator instance `origin`.
    pub fn with_origin(&self, origin: usize) -> Self {
        Self {
            origin,
            ..self.clone()
        }
    }

    fn next_edge(&self) -> u64 {
        self.next_edge.fetch_add(1, Ordering::Relaxed)
    }

    /// Opens a tracking tree for `id`. The returned handle identifies the first delivery.
    pub async fn register(&self, id: RecordId) -> Result<DeliveryHandle> {
        let handle = DeliveryHandle {
            tree: self.next_tree.fetch_add(1, Ordering::Relaxed),
            edge: self.next_edge(),
        };
        self.send(ActorMessage::Register {
            handle,
            id,
            origin: self.origin,
        })
        .await?;
        Ok(handle)
    }

    /// Adds a delivery to the tree of `inbound`.
    pub async fn anchor(&self, inbound: &DeliveryHandle) -> Result<DeliveryHandle> {
        let handle = DeliveryHandle {
            tree: inbound.tree,
            edge: self.next_edge(),
        };
        self.send(ActorMessage::Anchor { handle }).await?;
        Ok(handle)
    }

    pub async fn ack(&self, handle: &DeliveryHandle) -> Result<()> {
        self.send(ActorMessage::Ack { handle: *handle }).await
    }

    pub async fn fail(&self, handle: &DeliveryHandle) -> Result<()> {
        self.send(ActorMessage::Fail { handle: *handle }).await
    }

    async fn send(&self, message: ActorMessage) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|e| Error::Tracker(format!("{:?}", e)))
    }

    /// Number of open trees. Used for testing to make sure every delivery was settled.
    #[cfg(test)]
    pub(crate) async fn outstanding(&self) -> Result<usize> {
        let (respond_to, response) = oneshot::channel();
        self.send(ActorMessage::Outstanding { respond_to }).await?;
        response
            .await
            .map_err(|e| Error::ActorPatternRecv(format!("{:?}", e)))
    }
}

impl std::fmt::Debug for TrackerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerHandle")
            .field("origin", &self.origin)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::timeout;

    use super::*;

    async fn next_outcome(rx: &mut mpsc::UnboundedReceiver<Outcome>) -> Outcome {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("outcome should arrive")
            .expect("tracker should be running")
    }

    #[tokio::test]
    async fn test_register_and_ack() {
        let (handle, mut outcomes) = TrackerHandle::new(Duration::from_secs(30), 1);
        let mut rx = outcomes.remove(0);

        let first = handle.register(7).await.unwrap();
        handle.ack(&first).await.unwrap();

        assert_eq!(next_outcome(&mut rx).await, Outcome::Acked(7));
        assert_eq!(handle.outstanding().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_anchored_tree_completes_after_every_edge() {
        let (handle, mut outcomes) = TrackerHandle::new(Duration::from_secs(30), 1);
        let mut rx = outcomes.remove(0);

        // generator -> relay -> sink
        let root = handle.register(1).await.unwrap();
        let relayed = handle.anchor(&root).await.unwrap();
        assert_eq!(relayed.tree, root.tree);
        assert_ne!(relayed.edge, root.edge);

        handle.ack(&root).await.unwrap();
        assert_eq!(handle.outstanding().await.unwrap(), 1);
        assert!(rx.try_recv().is_err());

        handle.ack(&relayed).await.unwrap();
        assert_eq!(next_outcome(&mut rx).await, Outcome::Acked(1));
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_acks_are_ignored() {
        let (handle, mut outcomes) = TrackerHandle::new(Duration::from_secs(30), 1);
        let mut rx = outcomes.remove(0);

        let root = handle.register(3).await.unwrap();
        let relayed = handle.anchor(&root).await.unwrap();
        handle.ack(&root).await.unwrap();
        handle.ack(&root).await.unwrap();
        assert_eq!(handle.outstanding().await.unwrap(), 1);

        handle.ack(&relayed).await.unwrap();
        assert_eq!(next_outcome(&mut rx).await, Outcome::Acked(3));

        // the tree is gone, acking again reports nothing
        handle.ack(&relayed).await.unwrap();
        handle
            .ack(&DeliveryHandle {
                tree: 99,
                edge: 99,
            })
            .await
            .unwrap();
        assert_eq!(handle.outstanding().await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fail_anywhere_fails_the_tree() {
        let (handle, mut outcomes) = TrackerHandle::new(Duration::from_secs(30), 1);
        let mut rx = outcomes.remove(0);

        let root = handle.register(150).await.unwrap();
        let relayed = handle.anchor(&root).await.unwrap();
        handle.ack(&root).await.unwrap();
        handle.fail(&relayed).await.unwrap();

        assert_eq!(next_outcome(&mut rx).await, Outcome::Failed(150));

        // late acks of the failed tree are ignored
        handle.ack(&relayed).await.unwrap();
        assert_eq!(handle.outstanding().await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_outcomes_routed_to_origin() {
        let (handle, mut outcomes) = TrackerHandle::new(Duration::from_secs(30), 2);
        let mut rx1 = outcomes.remove(1);
        let mut rx0 = outcomes.remove(0);

        // both generator instances start their ids at 0
        let first = handle.with_origin(0).register(0).await.unwrap();
        let second = handle.with_origin(1).register(0).await.unwrap();
        assert_ne!(first.tree, second.tree);

        handle.fail(&second).await.unwrap();
        handle.ack(&first).await.unwrap();

        assert_eq!(next_outcome(&mut rx0).await, Outcome::Acked(0));
        assert_eq!(next_outcome(&mut rx1).await, Outcome::Failed(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_tree_times_out() {
        let (handle, mut outcomes) = TrackerHandle::new(Duration::from_millis(100), 1);
        let mut rx = outcomes.remove(0);

        let root = handle.register(42).await.unwrap();
        let outcome = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(outcome, Some(Outcome::Failed(42)));

        // the ack arrives too late
        handle.ack(&root).await.unwrap();
        assert_eq!(handle.outstanding().await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tracker_stops_when_handles_dropped() {
        let (handle, mut outcomes) = TrackerHandle::new(Duration::from_secs(30), 1);
        let mut rx = outcomes.remove(0);

        handle.register(5).await.unwrap();
        drop(handle);

        // abandoned without an outcome, the outcome channel closes with the tracker
        let outcome = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(outcome, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_trees_are_not_swept() {
        let (handle, mut outcomes) = TrackerHandle::new(Duration::from_millis(100), 1);
        let mut rx = outcomes.remove(0);

        for id in 0..1_000 {
            let root = handle.register(id).await.unwrap();
            handle.ack(&root).await.unwrap();
        }
        let lost = handle.register(1_000).await.unwrap();
        let late = handle.register(1_001).await.unwrap();
        for id in 0..1_000 {
            assert_eq!(next_outcome(&mut rx).await, Outcome::Acked(id));
        }
        // only the two open trees remain to be swept
        assert_eq!(handle.outstanding().await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(next_outcome(&mut rx).await, Outcome::Failed(1_000));
        assert_eq!(next_outcome(&mut rx).await, Outcome::Failed(1_001));
        assert!(rx.try_recv().is_err());
        assert_eq!(handle.outstanding().await.unwrap(), 0);

        handle.ack(&lost).await.unwrap();
        handle.ack(&late).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
