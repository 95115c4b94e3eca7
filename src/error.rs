use thiserror::Error;

/// Failure of one bridge call. Only the message crosses the wire.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("RPC call timed out")]
    Timeout,
    /// Host-page bridge timeout, naming the op.
    #[error("HB bridge timeout: {0}")]
    BridgeTimeout(String),
    #[error("{0}")]
    ChannelUnavailable(String),
    #[error("{0}")]
    Remote(String),
    #[error("invalid RPC request: {0}")]
    InvalidRequest(String),
    #[error("bridge closed")]
    Closed,
}
