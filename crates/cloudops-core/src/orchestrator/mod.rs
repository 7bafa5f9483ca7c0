//! Action orchestration: data model, store, step machines, and the
//! dispatch/runner pair that moves actions forward one step per cycle.

pub mod action;
pub mod db;
pub mod dispatch;
pub mod executor;
pub mod machine;
pub mod retry;
pub mod runner;
pub mod sweeper;

pub use action::{
    Action, ActionLogEntry, ActionPayload, ActionStatus, ActionTarget, LogLevel, NewAction,
    OperationType, Step, StepData,
};
pub use db::{ActionDb, ActionFilter, ClaimRequest};
pub use dispatch::Orchestrator;
pub use executor::StepOutcome;
pub use machine::{Machine, Next, Resolution};
pub use retry::{RetryDecision, RetryPolicy};
pub use runner::{CycleReport, Runner, Transition};
pub use sweeper::{SweepReport, Sweeper};
