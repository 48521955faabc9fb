use thiserror::Error;

/// Main error type for the trading bot
#[derive(Error, Debug)]
pub enum QtradeError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Ledger errors
    #[error("Insufficient position: requested {requested} shares, only {open} open")]
    InsufficientPosition { requested: u32, open: u32 },

    #[error("Insufficient funds: cost ${cost:.2} exceeds balance ${balance:.2}")]
    InsufficientFunds { cost: f64, balance: f64 },

    // Market data errors
    #[error("Insufficient history: {bars} bars available, {required} required")]
    InsufficientHistory { bars: usize, required: usize },

    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    // Persistence errors
    #[error("Malformed persisted state: {0}")]
    MalformedPersistedState(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl QtradeError {
    /// Recoverable errors abort the current instrument's cycle but must not
    /// abort the batch of other instruments.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            QtradeError::InsufficientPosition { .. }
                | QtradeError::InsufficientFunds { .. }
                | QtradeError::InsufficientHistory { .. }
                | QtradeError::MarketDataUnavailable(_)
                | QtradeError::MalformedPersistedState(_)
        )
    }
}

/// Result type alias for QtradeError
pub type Result<T> = std::result::Result<T, QtradeError>;
