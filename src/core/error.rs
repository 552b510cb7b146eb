use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Cluster '{0}' is not active")]
    ClusterUnavailable(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("{0} is closed")]
    Closed(String),

    #[error("No replica available: {0}")]
    NoReplicaAvailable(String),

    #[error("Quorum not met: required {required} surviving replicas, {survived} survived")]
    QuorumNotMet { required: usize, survived: usize },
}

impl DbError {
    /// True when the error means the replica itself is unusable, as opposed to
    /// the statement being rejected.
    pub fn indicates_replica_failure(&self) -> bool {
        matches!(self, Self::ConnectionError(_) | Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
