//! # sweeprun
//!
//! A hierarchical parameter-sweep orchestrator. Tasks form a tree; any node
//! can declare loop variables that expand it into the cross-product of their
//! values, and each variant runs through a fixed lifecycle on a bounded
//! worker pool with brokered scratch-disk admission.
//!
//! ## Architecture Overview
//!
//! - **[`task`]**: The task tree, lifecycle state machine, sweep expansion,
//!   and the per-sweep log
//! - **[`broker`]**: Blocking FIFO admission of scratch-disk demands against
//!   a byte budget
//! - **[`results`]**: The ordered, sparse results table shared by a sweep's
//!   variants
//! - **[`shell`]**: An execute hook that runs external commands and captures
//!   their outputs
//! - **[`config`]**: Run-wide configuration (workspace, pool size, budgets,
//!   timeouts)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sweeprun::results::Value;
//! use sweeprun::task::{FnExecute, LoopVariable, Measurement, TaskNode};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut tb = TaskNode::builder("tb")
//!         .param("vdd", 1.0)
//!         .loop_var(LoopVariable::linspace("vdd", "vdd", 0.8, 1.2, 5)?)
//!         .execute(FnExecute(|ctx: &mut sweeprun::task::ExecContext| {
//!             let vdd = ctx.param("vdd").and_then(Value::as_f64).unwrap_or(0.0);
//!             ctx.record("gain", vdd * 10.0);
//!             Ok(())
//!         }))
//!         .measurement(Measurement::namespace_key("gain", "gain"))
//!         .build();
//!
//!     tb.start(true).await?;
//!     println!("{}", tb.results().unwrap().to_csv());
//!     Ok(())
//! }
//! ```

/// Scratch-disk admission: FIFO broker granting work directories against a
/// byte budget.
pub mod broker;

/// Command-line surface and the TOML sweep-file loader.
pub mod cli;

/// Run-wide configuration.
pub mod config;

/// Workspace path layout and shared constants.
pub mod env;

/// The ordered, sparse results table and its value type.
pub mod results;

/// Shell-command execute hook.
pub mod shell;

/// Hierarchical tasks: lifecycle, sweep expansion, measurement, logging.
pub mod task;

pub use broker::{BrokerError, DiskBroker, Resource};
pub use config::OrchestratorConfig;
pub use results::{ResultsTable, Value};
pub use shell::ShellCommand;
pub use task::{
    ExecContext, Execute, FnExecute, LoopVariable, Measurement, Namespace, Summarize, TaskError,
    TaskNode, TaskStatus,
};
