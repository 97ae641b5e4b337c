use thiserror::Error;

/// The error type for all caller-visible results of client operations
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered a request with ok=false. This does not affect the connection.
    #[error("remote error {code}: {message}")]
    Remote {
        code: String,
        message: String,
    },
    /// The server's traffic was inconsistent with the client's protocol state. The connection is
    ///  torn down when this happens.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out waiting for a response")]
    Timeout,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl ClientError {
    pub fn is_remote(&self) -> bool {
        matches!(self, ClientError::Remote { .. })
    }
}

/// A protocol violation detected on the dispatch path. It is cloneable so that the triggering
///  caller and the connection's teardown can both report it.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ProtocolViolation(pub String);

impl From<ProtocolViolation> for ClientError {
    fn from(value: ProtocolViolation) -> Self {
        ClientError::ProtocolViolation(value.0)
    }
}
