//! yarasweep agent library.
//!
//! Exposes the agent's modules for integration testing. In production the
//! `yarasweep` binary (main.rs) is used.

pub mod cli;
pub mod error;
pub mod logging;
pub mod metrics_server;
pub mod orchestrator;
pub mod output;
pub mod publisher;
pub mod server;

pub use error::AgentError;
pub use orchestrator::RunOutcome;
