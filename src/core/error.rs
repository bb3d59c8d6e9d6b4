use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShuttleError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run ledger error: {0}")]
    Ledger(String),

    #[error("Run {0} not found in ledger")]
    RunNotFound(u32),

    #[error("Object store error: {0}")]
    Store(String),

    #[error("Invalid object path '{0}'")]
    InvalidPath(String),

    #[error("Conditions archive error: {0}")]
    Archive(String),

    #[error("File exchange error: {0}")]
    FileExchange(String),

    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

pub type Result<T> = std::result::Result<T, ShuttleError>;

impl<T> From<std::sync::PoisonError<T>> for ShuttleError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for ShuttleError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ShuttleError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
