//! PhaseGate Backend Library
//!
//! Confidence-gated session orchestrator: boots a session, runs a simulation
//! against live chain data, learns a confidence score, and only then allows
//! the one-way move to live mode.

pub mod api;
pub mod config;
pub mod errors;
pub mod feed;
pub mod models;
pub mod optimizer;
pub mod orchestrator;
pub mod preflight;
pub mod provider;

pub use config::EngineConfig;
pub use errors::{EngineError, EngineResult};
pub use orchestrator::PhaseOrchestrator;
