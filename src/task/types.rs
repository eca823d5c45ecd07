//! Core task types: lifecycle states, the error taxonomy, the measurement
//! namespace, and the caller-supplied hook traits.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::broker::BrokerError;
use crate::results::Value;

/// Lifecycle state of a task node.
///
/// Progresses `Uninitialized -> Initialized -> Running -> Measured ->
/// Finalized`; `Error` is terminal and reachable from any non-terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Uninitialized,
    Initialized,
    Running,
    Measured,
    Finalized,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finalized | TaskStatus::Error)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, TaskStatus::Error)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Uninitialized => "uninitialized",
            TaskStatus::Initialized => "initialized",
            TaskStatus::Running => "running",
            TaskStatus::Measured => "measured",
            TaskStatus::Finalized => "finalized",
            TaskStatus::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Task-level error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The caller-supplied execute hook raised. Marks only the raising
    /// variant; siblings keep running.
    #[error("execute hook failed in '{node}': {message}")]
    Execution { node: String, message: String },

    /// A measurement binding could not be evaluated against the namespace.
    #[error("measurement '{name}' failed in '{node}': {message}")]
    Measure {
        node: String,
        name: String,
        message: String,
    },

    /// The disk broker refused or timed out the node's work-directory grant.
    /// Fatal for that node's initialization; not retried.
    #[error(transparent)]
    Resource(#[from] BrokerError),
}

/// Typed environment a measurement binding is evaluated against: the node's
/// parameters, the values its execute hook recorded, and completed child
/// measurements under dotted `child.key` names.
pub type Namespace = HashMap<String, Value>;

type MeasureFn = Arc<dyn Fn(&Namespace) -> Result<Value> + Send + Sync>;

/// A named measurement binding: a closure over the [`Namespace`] whose
/// result lands in the sweep results table under `name`.
#[derive(Clone)]
pub struct Measurement {
    name: String,
    eval: MeasureFn,
}

impl Measurement {
    pub fn new<F>(name: impl Into<String>, eval: F) -> Self
    where
        F: Fn(&Namespace) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            eval: Arc::new(eval),
        }
    }

    /// Binding that copies a namespace key verbatim, failing when the key is
    /// absent. The common case for values recorded by an execute hook.
    pub fn namespace_key(name: impl Into<String>, key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(name, move |ns: &Namespace| {
            ns.get(&key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("namespace has no value for '{}'", key))
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn evaluate(&self, namespace: &Namespace) -> Result<Value> {
        (self.eval)(namespace)
    }
}

impl fmt::Debug for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Measurement")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Context handed to an execute hook: the variant's identity, its work
/// directory, its resolved parameters, and a place to record output values
/// for later measurement.
#[derive(Debug)]
pub struct ExecContext {
    name: String,
    path: Vec<String>,
    work_dir: PathBuf,
    params: HashMap<String, Value>,
    outputs: HashMap<String, Value>,
}

impl ExecContext {
    pub(crate) fn new(
        name: String,
        path: Vec<String>,
        work_dir: PathBuf,
        params: HashMap<String, Value>,
    ) -> Self {
        Self {
            name,
            path,
            work_dir,
            params,
            outputs: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted ancestor names, root first.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Scratch directory granted by the broker; removed on success, kept on
    /// error.
    pub fn work_dir(&self) -> &PathBuf {
        &self.work_dir
    }

    pub fn params(&self) -> &HashMap<String, Value> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Record an output value; it becomes visible to measurement bindings
    /// under `key`.
    pub fn record(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.outputs.insert(key.into(), value.into());
    }

    pub(crate) fn into_outputs(self) -> HashMap<String, Value> {
        self.outputs
    }
}

/// Caller-supplied work executed by each variant.
#[async_trait::async_trait]
pub trait Execute: Send + Sync {
    async fn execute(&self, ctx: &mut ExecContext) -> Result<()>;
}

/// Adapter turning a plain closure into an [`Execute`] hook.
pub struct FnExecute<F>(pub F);

#[async_trait::async_trait]
impl<F> Execute for FnExecute<F>
where
    F: Fn(&mut ExecContext) -> Result<()> + Send + Sync,
{
    async fn execute(&self, ctx: &mut ExecContext) -> Result<()> {
        (self.0)(ctx)
    }
}

/// Caller-overridable hook run once per sweep after every variant finished,
/// before finalization.
#[async_trait::async_trait]
pub trait Summarize: Send + Sync {
    async fn summarize(&self, results: &crate::results::ResultsTable) -> Result<()>;
}
