//! Bot error types

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors that can occur while running a strategy
#[derive(Error, Debug, Clone)]
pub enum BotError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Market not found: {0}")]
    MarketNotFound(String),

    #[error("Market data error: {0}")]
    MarketData(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Request failed after {attempts} attempts: {reason}")]
    SubmissionFailed { attempts: u32, reason: String },

    #[error("Data integrity: {0}")]
    DataIntegrity(String),

    #[error("Insufficient {token} balance: required {required}, available {available}")]
    InsufficientBalance {
        token: String,
        required: Decimal,
        available: Decimal,
    },

    #[error("State persistence error: {0}")]
    StatePersistence(String),

    #[error("Notification delivery error: {0}")]
    Notification(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),
}

impl BotError {
    /// Anomalies that abort the current pair quietly instead of being reported
    pub fn is_skip_condition(&self) -> bool {
        matches!(self, BotError::MarketNotFound(_) | BotError::DataIntegrity(_))
    }
}

impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        BotError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for BotError {
    fn from(err: std::io::Error) -> Self {
        BotError::StatePersistence(err.to_string())
    }
}

impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        BotError::Http(err.to_string())
    }
}

impl From<config::ConfigError> for BotError {
    fn from(err: config::ConfigError) -> Self {
        BotError::Config(err.to_string())
    }
}

/// Result type for bot operations
pub type BotResult<T> = std::result::Result<T, BotError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_skip_conditions() {
        assert!(BotError::MarketNotFound("XPR_XUSDC".into()).is_skip_condition());
        assert!(BotError::DataIntegrity("zero price".into()).is_skip_condition());
        assert!(!BotError::MarketData("timeout".into()).is_skip_condition());
        assert!(!BotError::InsufficientBalance {
            token: "XPR".into(),
            required: dec!(10),
            available: dec!(5),
        }
        .is_skip_condition());
    }

    #[test]
    fn test_io_error_maps_to_persistence() {
        let err: BotError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert!(matches!(err, BotError::StatePersistence(_)));
    }
}
