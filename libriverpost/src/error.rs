//! Error types for riverpost

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RiverError>;

#[derive(Error, Debug)]
pub enum RiverError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl RiverError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            RiverError::InvalidInput(_) => 3,
            RiverError::Config(_) => 2,
            RiverError::Provider(ProviderError::Authentication(_)) => 2,
            RiverError::Provider(_) => 1,
            RiverError::Store(_) => 1,
            RiverError::Bus(_) => 1,
        }
    }

    /// True when the failure is expected to clear up on a later cycle
    pub fn is_transient(&self) -> bool {
        match self {
            RiverError::Provider(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Posting failed: {0}")]
    Posting(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Temporarily unavailable, retry later: {0}")]
    Retry(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_) | ProviderError::RateLimit(_) | ProviderError::Retry(_)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Invalid command name: {0:?}")]
    InvalidCommand(String),

    #[error("Invalid argument for {command}: {reason}")]
    InvalidArgument { command: String, reason: String },
}
