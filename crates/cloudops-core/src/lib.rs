//! `cloudops-core` — durable, resumable orchestration of cloud lifecycle
//! operations (start, stop, restart, deploy, transport).
//!
//! ```text
//! trigger ─▶ Orchestrator::run_cycle
//!               │ select due + stale actions, partition by owner
//!               ▼
//!            Runner ── claim ──▶ ActionDb (redb, conditional updates)
//!               │
//!               ▼
//!            executor::execute ──▶ PlatformApi
//!               │
//!               ▼
//!            Machine::resolve ──▶ persisted transition + log entry
//! ```
//!
//! Nothing blocks between steps: waiting for the platform is a polling step
//! that parks the action until the next cycle.

pub mod config;
pub mod error;
pub mod io;
pub mod orchestrator;
pub mod paths;
pub mod platform;

pub use error::{EngineError, Result};
