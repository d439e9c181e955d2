//! Worker orchestration for modsync
//!
//! This crate runs the worker pools of each sync phase and decides what their
//! failures mean for the run.
//!
//! # Features
//!
//! - **Phase execution**: Spawn a fixed pool of workers and collect them in completion order
//! - **Fault classification**: Connection faults stay local, anything else cancels the phase
//! - **Partial success**: A phase only fails outright when every worker faulted
//! - **Cancellation scopes**: Interrupts are routed to the innermost scope, so a
//!   destructive phase can turn them into a hard abort
//!
//! # Examples
//!
//! ```rust
//! use modsync_engine::{CancelScopeStack, InterruptPolicy, TaskOrchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let root = CancellationToken::new();
//! let scopes = CancelScopeStack::new(root.clone());
//! let orchestrator = TaskOrchestrator::new(root);
//!
//! let _scope = scopes.push("download", InterruptPolicy::Graceful);
//! let report = orchestrator
//!     .run_phase("download", 4, |worker, _cancel| async move {
//!         println!("worker {worker} running");
//!         Ok(())
//!     })
//!     .await;
//! assert!(report.is_clean());
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod executor;
pub mod scope;
pub mod task;

pub use executor::{PhaseReport, TaskOrchestrator};
pub use scope::{CancelScopeStack, InterruptOutcome, InterruptPolicy, ScopeGuard};
pub use task::{TaskId, TaskOutcome, TaskStatus};
