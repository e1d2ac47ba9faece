//! Error types for the bandit tuner.

use std::path::PathBuf;

use thiserror::Error;

use crate::mab::CallId;

/// Errors that can occur when configuring or driving the tuner.
///
/// Data-quality problems (bad latency samples, unmatched reports) and
/// telemetry write failures are deliberately absent: they are recovered
/// locally with a warning and never surface on the decision path.
#[derive(Debug, Error)]
pub enum TunerError {
    /// Error extracting configuration from figment.
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A recognized option carried a value outside its legal range.
    #[error("invalid configuration for `{key}`: {reason}")]
    InvalidConfig {
        /// The offending configuration key
        key: &'static str,
        /// Human readable explanation
        reason: String,
    },

    /// The reward log destination could not be opened.
    #[error("failed to open reward log {path}: {source}")]
    TelemetryOpen {
        /// Path that failed to open
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// `decide`/`report` was called while the tuner was not active.
    #[error("tuner is not active (state: {0})")]
    NotActive(&'static str),

    /// `initialize` was called on a tuner that already left the uninitialized state.
    #[error("tuner already initialized (state: {0})")]
    AlreadyInitialized(&'static str),

    /// The host offered no legal action for a call.
    #[error("no legal actions offered for bucket {0}")]
    NoLegalActions(String),

    /// The host reused a call id that is still in flight.
    #[error("call id {0:?} is already in flight")]
    DuplicateCallId(CallId),

    /// An action string could not be parsed.
    #[error("invalid action `{0}`")]
    InvalidAction(String),

    /// A telemetry or feedback line could not be parsed.
    #[error("invalid record `{line}`: {reason}")]
    InvalidRecord {
        /// The raw line
        line: String,
        /// What was wrong with it
        reason: &'static str,
    },
}

impl TunerError {
    /// Whether this error indicates a host/plugin contract mismatch.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            TunerError::NotActive(_)
                | TunerError::AlreadyInitialized(_)
                | TunerError::NoLegalActions(_)
                | TunerError::DuplicateCallId(_)
        )
    }
}

impl From<figment::Error> for TunerError {
    fn from(e: figment::Error) -> Self {
        TunerError::Config(Box::new(e))
    }
}

/// Result type alias for tuner operations.
pub type Result<T> = std::result::Result<T, TunerError>;
