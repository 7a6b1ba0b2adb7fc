//! Error types and gRPC status conversion

use thiserror::Error;
use tonic::{Code, Status};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for arpc
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// A server was started without a port
    #[error("port is required")]
    PortRequired,

    /// The connection pool was closed before the operation
    #[error("connection pool is closed")]
    PoolClosed,

    /// Root CA certificates could not be loaded from the environment
    #[error("load root CA certificates: {0}")]
    Certificates(String),

    /// An identity token source could not be created or queried
    #[error("create token source: {0}")]
    TokenSource(String),

    /// The target could not be turned into a valid endpoint
    #[error("invalid endpoint '{uri}': {reason}")]
    InvalidEndpoint {
        /// URI that was rejected
        uri: String,
        /// Why it was rejected
        reason: String,
    },

    /// Opening a connection failed
    #[error("open connection: {0}")]
    Connect(#[from] tonic::transport::Error),

    /// Health was requested for a service that is not registered
    #[error("unknown service {0}")]
    UnknownService(String),

    /// A service references a dependency that has no probe
    #[error("unknown dependency {0}")]
    UnknownDependency(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is the pool-closed sentinel
    pub fn is_pool_closed(&self) -> bool {
        matches!(self, Self::PoolClosed)
    }

    /// gRPC code reported to remote callers for this error
    pub fn code(&self) -> Code {
        match self {
            Self::UnknownService(_) => Code::NotFound,
            Self::UnknownDependency(_) => Code::Unknown,
            Self::PortRequired | Self::Config(_) | Self::InvalidEndpoint { .. } => {
                Code::InvalidArgument
            }
            Self::PoolClosed => Code::FailedPrecondition,
            Self::TokenSource(_) => Code::Unauthenticated,
            Self::Connect(_) => Code::Unavailable,
            Self::Certificates(_) | Self::Io(_) | Self::Internal(_) => Code::Internal,
        }
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        Status::new(err.code(), err.to_string())
    }
}
