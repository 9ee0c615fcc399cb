//! Error types for the trading engine

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the trading engine
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // Gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Gateway timeout after {0}ms")]
    GatewayTimeout(u64),

    #[error("Gateway connection failed: {0}")]
    GatewayConnection(String),

    #[error("Market data unavailable for {0}")]
    MarketDataUnavailable(String),

    // Execution errors
    #[error("Quote rejected: {0}")]
    QuoteRejected(String),

    #[error("Insufficient balance: {available} available, {required} required")]
    InsufficientBalance { available: f64, required: f64 },

    #[error("Settlement failed: {0}")]
    SettlementFailed(String),

    #[error("Signer unavailable for owner {0}")]
    SignerUnavailable(String),

    #[error("Task {0} was cancelled")]
    Cancelled(String),

    // Registry errors
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Registry conflict on task {task_id}: {reason}")]
    RegistryConflict { task_id: String, reason: String },

    #[error("Invalid state transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Registry persistence failed: {0}")]
    Persistence(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Gateway(_) | Error::GatewayTimeout(_) | Error::GatewayConnection(_)
        )
    }

    /// Classify this error for an execution result
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Gateway(_)
            | Error::GatewayTimeout(_)
            | Error::GatewayConnection(_)
            | Error::MarketDataUnavailable(_) => ErrorKind::TransientGatewayError,
            Error::QuoteRejected(_) => ErrorKind::QuoteRejected,
            Error::InsufficientBalance { .. } => ErrorKind::InsufficientFunds,
            Error::SettlementFailed(_) => ErrorKind::DeterministicSettlementFailure,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::RegistryConflict { .. } => ErrorKind::RegistryConflict,
            Error::Config(_)
            | Error::InvalidTask(_)
            | Error::InvalidAddress(_)
            | Error::SignerUnavailable(_) => ErrorKind::ConfigurationError,
            Error::TaskNotFound(_)
            | Error::InvalidTransition { .. }
            | Error::Persistence(_)
            | Error::Serialization(_)
            | Error::Deserialization(_)
            | Error::Io(_)
            | Error::Internal(_)
            | Error::Anyhow(_) => ErrorKind::Internal,
        }
    }

    /// Expected concurrency outcome rather than a fault
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::RegistryConflict { .. })
    }
}

/// Failure taxonomy carried on execution results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network, timeout or congestion; retried
    TransientGatewayError,
    /// Slippage or price impact beyond the task's tolerance
    QuoteRejected,
    /// Wallet cannot cover the trade
    InsufficientFunds,
    /// Rejected at settlement; not retried
    DeterministicSettlementFailure,
    /// Malformed task or missing collaborator setup
    ConfigurationError,
    /// Lost the state-transition race to another evaluation
    RegistryConflict,
    /// Task cancelled before the next attempt
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::TransientGatewayError => "network or gateway unavailable, retries exhausted",
            ErrorKind::QuoteRejected => "quote exceeded slippage or price impact tolerance",
            ErrorKind::InsufficientFunds => "insufficient funds",
            ErrorKind::DeterministicSettlementFailure => "transaction rejected at settlement",
            ErrorKind::ConfigurationError => "task or wallet configuration error",
            ErrorKind::RegistryConflict => "already being executed",
            ErrorKind::Cancelled => "task cancelled",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(text)
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::GatewayTimeout(10_000).is_retryable());
        assert!(Error::Gateway("node congested".into()).is_retryable());
        assert!(!Error::SettlementFailed("custom program error".into()).is_retryable());
        assert!(!Error::QuoteRejected("impact 12%".into()).is_retryable());
    }

    #[test]
    fn test_kind_mapping() {
        let err = Error::InsufficientBalance {
            available: 0.0,
            required: 0.1,
        };
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert_eq!(
            Error::GatewayTimeout(30_000).kind(),
            ErrorKind::TransientGatewayError
        );
        assert!(Error::RegistryConflict {
            task_id: "t".into(),
            reason: "busy".into()
        }
        .is_conflict());
    }

    #[test]
    fn test_error_kind_is_human_readable() {
        assert_eq!(ErrorKind::InsufficientFunds.to_string(), "insufficient funds");
    }
}
