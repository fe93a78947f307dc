//! Resumable run orchestration engine.
//!
//! Free-text instructions run as multi-step plans: planning produces ordered
//! steps with permitted action types, and execution performs them sequentially
//! (do mode) or dependency-parallel with a sequential tail (think mode),
//! persisting enough state to survive restarts and to pause for user input.
//!
//! - **[`core`]**: Pure, deterministic logic (resume point, plan splicing,
//!   dependency inference, routing heuristics). No I/O.
//! - **[`io`]**: Side-effecting operations (repository, checkpoints, retry,
//!   event log, postprocessing pool).
//! - **[`agents`]**: Collaborator seams (executor, strategists, evaluator).
//!
//! Orchestration modules ([`start`], [`execute`], [`reflection`], [`finalize`],
//! [`resume`]) coordinate core logic with I/O behind the [`Engine`] handle.

pub mod agents;
pub mod core;
pub mod engine;
pub mod events;
pub(crate) mod execute;
pub mod exit_codes;
pub(crate) mod finalize;
pub mod io;
pub mod logging;
pub(crate) mod reflection;
pub(crate) mod resume;
pub mod router;
pub mod start;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use engine::Engine;
pub use events::{EventSink, RunEvent};
pub use start::{ResumeRequest, RunOutcome, StartRequest};
