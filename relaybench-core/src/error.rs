use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    /// The rate controller sleep was woken up by the shutdown signal. This terminates the
    /// owning Generator instance and is never retried.
    #[error("Interrupted while rate limiting")]
    Interrupted,

    #[error("Delivery Error - {0}")]
    Delivery(String),

    #[error("Tracker Error - {0}")]
    Tracker(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),

    #[error("Forwarder Error - {0}")]
    Forwarder(String),
}
