// src/errors.rs
use rust_decimal::Decimal;
use thiserror::Error;

/// Failure reported by (or while talking to) the exchange.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("exchange rejected request ({code}): {msg}")]
    Rejected { code: i64, msg: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("API credentials are missing")]
    MissingCredentials,
}

impl ExchangeError {
    /// Timeouts, throttling and connection drops. A read can simply be retried;
    /// a write has an unknown outcome and must be re-checked first.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout(_) | ExchangeError::RateLimited(_) | ExchangeError::Network(_)
        )
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExchangeError::Timeout(e.to_string())
        } else if e.is_decode() {
            ExchangeError::Decode(e.to_string())
        } else {
            ExchangeError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        ExchangeError::Decode(e.to_string())
    }
}

/// Reasons an order is refused locally before anything is sent.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("no usable balance (available: {0})")]
    InsufficientBalance(Decimal),

    #[error("quantity {qty} is zero or below the exchange minimum {min_qty}")]
    QuantityBelowMinimum { qty: Decimal, min_qty: Decimal },

    #[error("notional {notional} is below the exchange minimum {min_notional}")]
    BelowMinNotional {
        notional: Decimal,
        min_notional: Decimal,
    },

    #[error("order needs {required} of margin but only {available} is available")]
    ExceedsMargin {
        required: Decimal,
        available: Decimal,
    },

    #[error("invalid symbol rules: {0}")]
    InvalidRules(String),

    #[error("signal carries no usable {0} level")]
    MissingProtectiveLevel(&'static str),

    #[error("price must be positive, got {0}")]
    InvalidPrice(Decimal),

    #[error("position is flat, nothing to protect")]
    FlatPosition,

    #[error("no stop-loss/take-profit levels could be derived")]
    NoProtectiveLevels,
}

/// Why protective orders could not be put on the book.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtectionError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Startup configuration problems. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
