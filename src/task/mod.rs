//! Hierarchical task orchestration: lifecycle, sweep expansion, and the
//! shared sweep log.

pub mod log;
pub mod node;
pub mod sweep;
pub mod types;


pub use log::SweepLog;
pub use node::{TaskNode, TaskNodeBuilder};
pub use sweep::LoopVariable;
pub use types::{
    ExecContext, Execute, FnExecute, Measurement, Namespace, Summarize, TaskError, TaskStatus,
};
