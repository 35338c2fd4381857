//! Rate control for the Generator's emission loop. Every `sleep_every`-th record id the loop is
//! suspended for `delay` before the record is built, so the delay bounds how fast downstream can
//! ingest, independent of how fast downstream could go. The sleep is the only intentional
//! suspension point of a stage instance and it wakes up immediately on shutdown.

use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::config::components::RateControlConfig;
use crate::error::Error;
use crate::message::RecordId;

#[derive(Debug, Clone)]
pub struct RateController {
    config: RateControlConfig,
}

impl RateController {
    pub fn new(config: RateControlConfig) -> Self {
        Self { config }
    }

    /// Whether the loop has to sleep before emitting `id`.
    pub fn should_sleep(&self, id: RecordId) -> bool {
        !self.config.delay.is_zero()
            && self
                .config
                .sleep_every
                .is_some_and(|every| id % every.get() == 0)
    }

    /// Sleeps if `id` falls on the configured period. Returns [Error::Interrupted] if the
    /// shutdown signal arrives while sleeping.
    pub async fn throttle(&self, id: RecordId, cln_token: &CancellationToken) -> Result<()> {
        if !self.should_sleep(id) {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = cln_token.cancelled() => Err(Error::Interrupted),
            _ = tokio::time::sleep(self.config.delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;

    fn controller(delay_ms: u64, every: u64) -> RateController {
        RateController::new(RateControlConfig {
            delay: Duration::from_millis(delay_ms),
            sleep_every: NonZeroU64::new(every),
        })
    }

    #[test]
    fn test_should_sleep_policy() {
        let rc = controller(10, 4);
        assert!(rc.should_sleep(0));
        assert!(!rc.should_sleep(1));
        assert!(!rc.should_sleep(3));
        assert!(rc.should_sleep(4));
        assert!(rc.should_sleep(8));

        // zero delay never sleeps
        let rc = controller(0, 1);
        assert!(!rc.should_sleep(0));
        assert!(!rc.should_sleep(1));

        // a disabled period never sleeps
        let rc = controller(10, 0);
        assert!(!rc.should_sleep(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_bounds_emission_time() {
        let delay = Duration::from_millis(25);
        let every = 10;
        let rc = controller(25, every);
        let cln_token = CancellationToken::new();

        let start = Instant::now();
        for id in 0..2 * every {
            rc.throttle(id, &cln_token).await.unwrap();
        }
        // ids 0 and 10 sleep
        assert!(start.elapsed() >= 2 * delay);
    }

    #[tokio::test]
    async fn test_throttle_interrupted_by_shutdown() {
        let rc = controller(60_000, 1);
        let cln_token = CancellationToken::new();

        let token = cln_token.clone();
        let handle = tokio::spawn(async move { rc.throttle(0, &token).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cln_token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("throttle should wake up on cancellation")
            .unwrap();
        assert!(matches!(result, Err(Error::Interrupted)));
    }

    #[tokio::test]
    async fn test_throttle_without_sleep_ignores_shutdown() {
        let rc = controller(60_000, 2);
        let cln_token = CancellationToken::new();
        cln_token.cancel();
        // id 1 is off-period, nothing to interrupt
        assert!(rc.throttle(1, &cln_token).await.is_ok());
        assert!(matches!(
            rc.throttle(2, &cln_token).await,
            Err(Error::Interrupted)
        ));
    }
}
