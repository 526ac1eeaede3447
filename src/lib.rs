//! Voice Banking Orchestrator
//!
//! A conversational banking backend that:
//! - Drives a per-session dialogue state machine over pending actions
//! - Resolves spoken utterances into intents and entities
//! - Guards transfers behind an explicit confirmation and an OTP check
//! - Applies each confirmed debit exactly once, atomically with its ledger entry
//! - Renders every outcome as natural speech for the voice frontend
//!
//! TURN LOOP:
//! UTTERANCE → RESOLVE → LOAD SESSION → TRANSITION → SIDE EFFECT? → RENDER → APPEND
//!
//! One turn of one session runs at a time; turns of different sessions run
//! in parallel.

pub mod accounts;
pub mod api;
pub mod config;
pub mod error;
pub mod gemini;
pub mod intent;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod otp;
pub mod renderer;
pub mod session;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use orchestrator::DialogueOrchestrator;
