//! Shared primitives for the pacts execution engine.
//!
//! Everything that crosses a crate boundary lives here: the step/intent
//! input model, discovery candidates, the run state owned by the
//! coordinator, and the engine configuration.

mod cache;
mod candidate;
mod config;
mod state;
mod step;

pub use cache::{normalize_label, CacheEntry, CacheKey};
pub use candidate::{Candidate, Strategy};
pub use config::EngineConfig;
pub use state::{
    ExecutedStep, FailureKind, HealEvent, PlanStep, ReqId, RunContext, RunRecord, RunState, Verdict,
};
pub use step::{Action, Hints, Intent, Step};
