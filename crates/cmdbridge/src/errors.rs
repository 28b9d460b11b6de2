use thiserror::Error;

/// `errno` value the helper reports for a missing path.
pub const ENOENT: i32 = 2;

#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("cmdbridge: transport lost: {0}")]
    TransportLost(String),

    #[error("cmdbridge: could not start helper {path}: {reason}")]
    StartFailed { path: String, reason: String },

    #[error("cmdbridge: protocol error: {0}")]
    Protocol(String),

    #[error("remote: no such file or directory: {0}")]
    NotFound(String),

    #[error("remote: permission denied: {0}")]
    PermissionDenied(String),

    #[error("remote: {message}")]
    Remote {
        code: i32,
        errno: Option<i32>,
        message: String,
    },

    #[error("cmdbridge: operation cancelled")]
    Cancelled,

    #[error("cmdbridge: {0}")]
    Usage(String),

    #[error("cmdbridge: {0}")]
    Deploy(String),

    #[error("cmdbridge: i/o error: {0}")]
    Io(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<BridgeError>,
    },
}

impl BridgeError {
    /// Wrap `self` with a message describing the failed operation.
    pub fn context(self, context: impl Into<String>) -> Self {
        BridgeError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through [`BridgeError::Context`] layers.
    pub fn root(&self) -> &BridgeError {
        match self {
            BridgeError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// `true` when the helper reported that the path does not exist.
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            BridgeError::NotFound(_) => true,
            BridgeError::Remote { errno, .. } => *errno == Some(ENOENT),
            _ => false,
        }
    }

    /// `true` when the transport is gone and the client must be re-initialised.
    pub fn is_transport_lost(&self) -> bool {
        matches!(self.root(), BridgeError::TransportLost(_))
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
