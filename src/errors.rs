//! Engine error taxonomy
//!
//! Nothing in this taxonomy is fatal to the process. `Unavailable` degrades a
//! tick or pauses the session, `InvalidInput` keeps a pause open until a valid
//! value arrives, `GateViolation` is reported but never changes state, and
//! `PersistenceCorrupt` falls back to default optimizer state.

use crate::models::SessionState;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Transient external dependency failure (all endpoints failed or timed out)
    Unavailable(String),
    /// Malformed account address or out-of-range configuration
    InvalidInput(String),
    /// Transition attempted without satisfying the confidence threshold
    GateViolation { confidence: f64, threshold: f64 },
    /// Saved optimizer state could not be decoded
    PersistenceCorrupt(String),
    /// Command issued from a session state that does not accept it
    InvalidState {
        command: &'static str,
        state: SessionState,
    },
}

impl EngineError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "unavailable: {}", msg),
            Self::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            Self::GateViolation {
                confidence,
                threshold,
            } => write!(
                f,
                "confidence gate not satisfied: {:.1} < {:.1}",
                confidence, threshold
            ),
            Self::PersistenceCorrupt(msg) => write!(f, "persisted state corrupt: {}", msg),
            Self::InvalidState { command, state } => {
                write!(f, "{} not allowed in state {}", command, state)
            }
        }
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
