use thiserror::Error;

/// Crate-wide error type capturing common failure cases.
#[derive(Debug, Error)]
pub enum HuddleError {
    /// Input parameters failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Networking failure on a listener or connection.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
    /// Framing or serialization failure on the control channel.
    #[error("frame error: {0}")]
    Frame(#[from] crate::messages::FrameError),
    /// Protocol-level violation by a peer.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A bounded resource (meeting codes, session queue, retries) ran out.
    #[error("resource exhausted: {0}")]
    Resource(String),
    /// Internal invariant violation; fatal for the process.
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}
