//! The task-lifecycle state machine.
//!
//! A [`TaskNode`] is one task in a hierarchy: it owns its parameters and
//! child tasks, expands itself into sweep variants, fans them out onto a
//! bounded worker pool, waits, aggregates their measurements into the shared
//! results table, and finalizes or preserves its work area depending on the
//! outcome. Sibling variants fail independently: every variant future is
//! joined and inspected before any batch decision is taken.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::broker::{DiskBroker, Resource};
use crate::config::OrchestratorConfig;
use crate::env;
use crate::results::{ResultsTable, Value};

use super::log::SweepLog;
use super::sweep::{self, LoopVariable};
use super::types::{ExecContext, Execute, Measurement, Namespace, Summarize, TaskError, TaskStatus};

/// Shared handles every node in one run uses: the root's broker and the
/// run-wide configuration.
#[derive(Clone)]
pub(crate) struct RunContext {
    pub(crate) broker: Arc<DiskBroker>,
    pub(crate) config: Arc<OrchestratorConfig>,
}

/// State owned by the un-expanded instance of a sweep and shared by all of
/// its variants: the results table behind its lock, the sweep log, and the
/// per-variant status slots.
pub(crate) struct MasterState {
    pub(crate) log: SweepLog,
    results: Mutex<ResultsTable>,
    statuses: Mutex<Vec<TaskStatus>>,
    overall: Mutex<TaskStatus>,
}

impl MasterState {
    fn new(sweep: String, variant_count: usize) -> Self {
        Self {
            log: SweepLog::detached(sweep),
            results: Mutex::new(ResultsTable::new()),
            statuses: Mutex::new(vec![TaskStatus::Uninitialized; variant_count]),
            overall: Mutex::new(TaskStatus::Running),
        }
    }

    /// Write one keyed row at a variant's sweep index, under the master lock.
    fn record_row(&self, row: &[(String, Value)], index: usize) {
        self.results.lock().unwrap().add_row(row, index);
    }

    fn record_status(&self, index: usize, status: TaskStatus) {
        let mut statuses = self.statuses.lock().unwrap();
        if let Some(slot) = statuses.get_mut(index) {
            *slot = status;
        }
    }

    fn set_overall(&self, status: TaskStatus) {
        *self.overall.lock().unwrap() = status;
    }

    pub(crate) fn overall(&self) -> TaskStatus {
        self.overall.lock().unwrap().clone()
    }

    pub(crate) fn statuses(&self) -> Vec<TaskStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub(crate) fn results_snapshot(&self) -> ResultsTable {
        self.results.lock().unwrap().clone()
    }
}

/// One task in the hierarchy. Built through [`TaskNode::builder`]; driven
/// through [`TaskNode::start`].
pub struct TaskNode {
    name: String,
    parallel: bool,
    disk_demand: Option<u64>,
    config: OrchestratorConfig,
    params: HashMap<String, Value>,
    children: Vec<TaskNode>,
    loop_vars: Vec<LoopVariable>,
    measurements: Vec<Measurement>,
    execute: Option<Arc<dyn Execute>>,
    summarize: Option<Arc<dyn Summarize>>,

    // Runtime state, reset by `clone_tree`.
    status: TaskStatus,
    index: usize,
    path: Vec<String>,
    work_dir: Option<PathBuf>,
    resource: Option<Resource>,
    outputs: HashMap<String, Value>,
    measured: HashMap<String, Value>,
    sweep_point: Vec<(String, Value)>,
    master: Option<Arc<MasterState>>,
    is_master: bool,
    variants: Vec<TaskNode>,
    ctx: Option<RunContext>,
}

/// Explicit registration of a node's parameters, children, sweep axes, and
/// hooks.
pub struct TaskNodeBuilder {
    node: TaskNode,
}

impl TaskNodeBuilder {
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.node.params.insert(name.into(), value.into());
        self
    }

    pub fn child(mut self, child: TaskNode) -> Self {
        self.node.children.push(child);
        self
    }

    pub fn loop_var(mut self, var: LoopVariable) -> Self {
        self.node.loop_vars.push(var);
        self
    }

    pub fn measurement(mut self, measurement: Measurement) -> Self {
        self.node.measurements.push(measurement);
        self
    }

    pub fn execute(mut self, hook: impl Execute + 'static) -> Self {
        self.node.execute = Some(Arc::new(hook));
        self
    }

    pub fn summarize(mut self, hook: impl Summarize + 'static) -> Self {
        self.node.summarize = Some(Arc::new(hook));
        self
    }

    /// Declare the node non-parallel: its variants run one at a time.
    pub fn serial(mut self) -> Self {
        self.node.parallel = false;
        self
    }

    /// Scratch-disk demand in bytes (defaults to the configured per-node
    /// demand).
    pub fn disk_demand(mut self, bytes: u64) -> Self {
        self.node.disk_demand = Some(bytes);
        self
    }

    /// Run configuration. Only meaningful on the root of a run; children
    /// inherit the root's context.
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.node.config = config;
        self
    }

    pub fn build(self) -> TaskNode {
        self.node
    }
}

impl TaskNode {
    pub fn builder(name: impl Into<String>) -> TaskNodeBuilder {
        TaskNodeBuilder {
            node: TaskNode {
                name: name.into(),
                parallel: true,
                disk_demand: None,
                config: OrchestratorConfig::default(),
                params: HashMap::new(),
                children: Vec::new(),
                loop_vars: Vec::new(),
                measurements: Vec::new(),
                execute: None,
                summarize: None,
                status: TaskStatus::Uninitialized,
                index: 0,
                path: Vec::new(),
                work_dir: None,
                resource: None,
                outputs: HashMap::new(),
                measured: HashMap::new(),
                sweep_point: Vec::new(),
                master: None,
                is_master: false,
                variants: Vec::new(),
                ctx: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position of this variant within its sweep (dense, `0..N-1`).
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current lifecycle state. For a started sweep master this reflects the
    /// whole sweep, so it stays observable while a detached run is driving.
    pub fn status(&self) -> TaskStatus {
        if self.is_master {
            if let Some(master) = &self.master {
                return master.overall();
            }
        }
        self.status.clone()
    }

    pub fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    pub fn params(&self) -> &HashMap<String, Value> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.params.insert(name.into(), value.into());
    }

    pub fn children(&self) -> &[TaskNode] {
        &self.children
    }

    pub fn child(&self, name: &str) -> Option<&TaskNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut TaskNode> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// Completed variants of the last `start(wait = true)` call, in sweep
    /// order.
    pub fn variants(&self) -> &[TaskNode] {
        &self.variants
    }

    /// Measurement values this variant recorded (sweep point included).
    pub fn measured(&self) -> &HashMap<String, Value> {
        &self.measured
    }

    /// Number of variants this node expands into.
    pub fn sweep_len(&self) -> usize {
        sweep::product_len(&self.loop_vars)
    }

    /// Per-variant statuses of the sweep, indexed by sweep position.
    pub fn variant_statuses(&self) -> Vec<TaskStatus> {
        self.master
            .as_ref()
            .map(|m| m.statuses())
            .unwrap_or_default()
    }

    /// Snapshot of the sweep's results table.
    pub fn results(&self) -> Option<ResultsTable> {
        self.master.as_ref().map(|m| m.results_snapshot())
    }

    /// Deep copy of the template: parameters, children, axes, and shared
    /// hooks, with all runtime state reset. Mutating the clone never touches
    /// the original.
    pub fn clone_tree(&self) -> TaskNode {
        TaskNode {
            name: self.name.clone(),
            parallel: self.parallel,
            disk_demand: self.disk_demand,
            config: self.config.clone(),
            params: self.params.clone(),
            children: self.children.iter().map(|c| c.clone_tree()).collect(),
            loop_vars: self.loop_vars.clone(),
            measurements: self.measurements.clone(),
            execute: self.execute.clone(),
            summarize: self.summarize.clone(),
            status: TaskStatus::Uninitialized,
            index: 0,
            path: Vec::new(),
            work_dir: None,
            resource: None,
            outputs: HashMap::new(),
            measured: HashMap::new(),
            sweep_point: Vec::new(),
            master: None,
            is_master: false,
            variants: Vec::new(),
            ctx: None,
        }
    }

    /// Drive this node as the root of a run.
    ///
    /// Expands the node into its sweep variants and submits each variant's
    /// run to a bounded worker pool (size 1 for non-parallel nodes, else the
    /// configured cap). With `wait = true` this blocks until every variant
    /// finished, then finalizes (or, if any variant errored, preserves all
    /// work areas and returns the aggregate failure). With `wait = false` the
    /// same drive continues on a detached task; progress stays observable
    /// via [`status`](Self::status) and [`results`](Self::results).
    pub async fn start(&mut self, wait: bool) -> Result<()> {
        if self.path.is_empty() {
            self.path = vec![self.name.clone()];
        }
        let ctx = self.ensure_context();
        self.start_with(ctx, wait).await
    }

    /// Lazily create the run-wide broker and config handles, once, at the
    /// root.
    fn ensure_context(&mut self) -> RunContext {
        if let Some(ctx) = &self.ctx {
            return ctx.clone();
        }
        let config = Arc::new(self.config.clone());
        let broker = Arc::new(DiskBroker::new(
            &config.workspace_root,
            config.disk_budget,
            config.polling_interval(),
        ));
        let ctx = RunContext { broker, config };
        self.ctx = Some(ctx.clone());
        ctx
    }

    pub(crate) async fn start_with(&mut self, ctx: RunContext, wait: bool) -> Result<()> {
        if let Err(err) = self.initialize(&ctx).await {
            self.status = TaskStatus::Error;
            return Err(err);
        }
        let work_dir = match &self.work_dir {
            Some(dir) => dir.clone(),
            None => return Err(anyhow!("'{}' initialized without a work directory", self.name)),
        };

        let variant_count = self.sweep_len();
        let master = Arc::new(MasterState::new(self.name.clone(), variant_count));
        if let Err(err) = master.log.attach(&env::sweep_log_path(&work_dir)).await {
            warn!(sweep = %self.name, error = %err, "running without a sweep log file");
        }
        self.master = Some(Arc::clone(&master));
        self.is_master = true;

        let variants = match self.expand(&master) {
            Ok(variants) => variants,
            Err(err) => {
                self.status = TaskStatus::Error;
                master.set_overall(TaskStatus::Error);
                return Err(err);
            }
        };
        master
            .log
            .info(format!("expanded into {} variant(s)", variants.len()))
            .await;

        let pool_size = if self.parallel {
            ctx.config.max_parallel.max(1)
        } else {
            1
        };
        let drive = drive_sweep(
            variants,
            ctx,
            Arc::clone(&master),
            pool_size,
            self.summarize.clone(),
            work_dir,
        );

        if wait {
            self.variants = drive.await;
            self.status = master.overall();
            if self.status.is_error() {
                let failed = master.statuses().iter().filter(|s| s.is_error()).count();
                if failed > 0 {
                    return Err(anyhow!(
                        "sweep '{}' failed: {} of {} variant(s) errored",
                        self.name,
                        failed,
                        variant_count
                    ));
                }
                return Err(anyhow!(
                    "sweep '{}' failed while summarizing or finalizing; see the sweep log",
                    self.name
                ));
            }
            Ok(())
        } else {
            tokio::spawn(drive);
            Ok(())
        }
    }

    /// Acquire this node's disk grant and work directory. Idempotent; a
    /// broker timeout is fatal for the node and is not retried.
    async fn initialize(&mut self, ctx: &RunContext) -> Result<()> {
        if self.status != TaskStatus::Uninitialized {
            return Ok(());
        }
        let demand = self.disk_demand.unwrap_or(ctx.config.default_disk_demand);
        let subdir = env::dotted_path(&self.path);
        let resource = ctx
            .broker
            .acquire(&self.name, demand, ctx.config.acquire_timeout(), Some(subdir))
            .await
            .map_err(TaskError::Resource)?;
        self.work_dir = Some(resource.path().to_path_buf());
        self.resource = Some(resource);
        self.status = TaskStatus::Initialized;
        debug!(node = %self.name, dir = %env::dotted_path(&self.path), "initialized");
        Ok(())
    }

    /// Expand the node into its sweep variants: one deep clone per
    /// cross-product point, dense indices, fresh suffixed names, the sweep
    /// point applied to the dotted target parameters, and the shared master
    /// attached. Zero loop variables yield exactly one variant, the node
    /// itself, which shares the master's work directory.
    fn expand(&self, master: &Arc<MasterState>) -> Result<Vec<TaskNode>> {
        let swept = !self.loop_vars.is_empty();
        let points = sweep::cartesian_points(&self.loop_vars);
        let mut variants = Vec::with_capacity(points.len());
        for point in points {
            let mut variant = self.clone_tree();
            variant.index = point.index;
            if swept {
                variant.name = format!("{}_{}", self.name, point.index);
            } else {
                // The sole variant of an unswept node is the node itself: it
                // runs in the master's own directory and holds no grant of
                // its own, so `initialize` has nothing left to acquire.
                variant.work_dir = self.work_dir.clone();
                variant.status = TaskStatus::Initialized;
            }
            variant.path = self.path.clone();
            if let Some(last) = variant.path.last_mut() {
                *last = variant.name.clone();
            }
            for (var_name, target, value) in point.bindings {
                variant.sweep_point.push((var_name, value.clone()));
                variant.set_param_path(&target, value)?;
            }
            // Variants never re-expand or re-summarize.
            variant.loop_vars.clear();
            variant.summarize = None;
            variant.master = Some(Arc::clone(master));
            variants.push(variant);
        }
        Ok(variants)
    }

    /// Set a parameter through a dotted path (`"amp.bias"` descends into
    /// child `amp`).
    fn set_param_path(&mut self, target: &str, value: Value) -> Result<()> {
        match target.split_once('.') {
            None => {
                self.params.insert(target.to_string(), value);
                Ok(())
            }
            Some((child_name, rest)) => {
                let name = self.name.clone();
                let child = self
                    .children
                    .iter_mut()
                    .find(|c| c.name == child_name)
                    .ok_or_else(|| {
                        anyhow!("sweep target '{}' names no child '{}' of '{}'", target, child_name, name)
                    })?;
                child.set_param_path(rest, value)
            }
        }
    }

    /// One variant's full run, executed inside the worker pool. Never
    /// returns an error: the outcome lands in the variant's status, the
    /// master's status slots, and the sweep log.
    fn run(mut self, ctx: RunContext, master: Arc<MasterState>) -> BoxFuture<'static, TaskNode> {
        async move {
            if let Err(err) = self.initialize(&ctx).await {
                master
                    .log
                    .error(format!("variant '{}' failed to initialize: {:#}", self.name, err))
                    .await;
                self.status = TaskStatus::Error;
                master.record_status(self.index, TaskStatus::Error);
                return self;
            }
            self.status = TaskStatus::Running;
            master
                .log
                .info(format!("variant '{}' running", self.name))
                .await;

            let mut failure: Option<anyhow::Error> = None;

            if let Some(hook) = self.execute.clone() {
                let work_dir = self.work_dir.clone().unwrap_or_default();
                let mut exec_ctx = ExecContext::new(
                    self.name.clone(),
                    self.path.clone(),
                    work_dir,
                    self.params.clone(),
                );
                let outcome = hook.execute(&mut exec_ctx).await;
                // Outputs recorded before a failure are kept for measurement.
                self.outputs = exec_ctx.into_outputs();
                if let Err(err) = outcome {
                    failure = Some(
                        TaskError::Execution {
                            node: self.name.clone(),
                            message: format!("{err:#}"),
                        }
                        .into(),
                    );
                }
            }

            if failure.is_none() {
                let parent_path = self.path.clone();
                for child in &mut self.children {
                    let mut path = parent_path.clone();
                    path.push(child.name.clone());
                    child.path = path;
                    if let Err(err) = child.start_with(ctx.clone(), true).await {
                        failure = Some(err);
                        break;
                    }
                }
            }

            // Measurement is guaranteed: partial values are captured even
            // after an execute or child failure, and only then does the
            // error propagate.
            if let Err(err) = self.measure(&master) {
                master.log.error(format!("{:#}", err)).await;
                if failure.is_none() {
                    failure = Some(err);
                }
            }

            match failure {
                None => {
                    self.status = TaskStatus::Measured;
                    master
                        .log
                        .info(format!("variant '{}' measured", self.name))
                        .await;
                }
                Some(err) => {
                    self.status = TaskStatus::Error;
                    master
                        .log
                        .error(format!("variant '{}' failed: {:#}", self.name, err))
                        .await;
                }
            }
            master.record_status(self.index, self.status.clone());
            self
        }
        .boxed()
    }

    /// Evaluate the measurement bindings against this variant's namespace
    /// and write its row at `index`. Successful bindings land in the row
    /// even when a later one fails.
    fn measure(&mut self, master: &MasterState) -> Result<()> {
        let namespace = self.namespace();
        let mut row: Vec<(String, Value)> =
            Vec::with_capacity(1 + self.sweep_point.len() + self.measurements.len());
        row.push(("variant".to_string(), Value::Str(self.name.clone())));
        row.extend(self.sweep_point.iter().cloned());

        let mut first_failure: Option<TaskError> = None;
        for measurement in &self.measurements {
            match measurement.evaluate(&namespace) {
                Ok(value) => row.push((measurement.name().to_string(), value)),
                Err(err) => {
                    if first_failure.is_none() {
                        first_failure = Some(TaskError::Measure {
                            node: self.name.clone(),
                            name: measurement.name().to_string(),
                            message: format!("{err:#}"),
                        });
                    }
                }
            }
        }

        self.measured = row.iter().cloned().collect();
        master.record_row(&row, self.index);

        match first_failure {
            None => Ok(()),
            Some(err) => Err(err.into()),
        }
    }

    /// The typed environment measurements see: own parameters, execute-hook
    /// outputs, and completed child measurements under dotted names.
    fn namespace(&self) -> Namespace {
        let mut namespace: Namespace = self.params.clone();
        for child in &self.children {
            for variant in &child.variants {
                for (key, value) in &variant.measured {
                    namespace.insert(format!("{}.{}", variant.name, key), value.clone());
                }
            }
        }
        namespace.extend(self.outputs.clone());
        namespace
    }

    fn finalize(&mut self) {
        self.status = TaskStatus::Finalized;
    }

    /// Remove every file under the work directory (tolerating not-found,
    /// retrying transient failures), drop the directory, and release the
    /// disk grant. Skipped entirely for errored variants so the work area
    /// survives for postmortem, and for variants without a grant of their
    /// own: those share the master's directory, which still has a results
    /// file and sweep log to receive.
    async fn clean(&mut self, ctx: &RunContext) -> Result<()> {
        if self.status.is_error() {
            return Ok(());
        }
        if self.resource.is_none() {
            return Ok(());
        }
        let Some(dir) = self.work_dir.clone() else {
            return Ok(());
        };

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            remove_entry_with_retry(&entry.path()).await?;
        }
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        if let Some(resource) = self.resource.take() {
            ctx.broker.release(resource);
        }
        self.work_dir = None;
        Ok(())
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("index", &self.index)
            .field("children", &self.children.len())
            .field("loop_vars", &self.loop_vars.len())
            .finish_non_exhaustive()
    }
}

/// Fan the variants out onto the worker pool, join them all, then decide the
/// batch outcome: summarize, and either finalize plus clean every variant or
/// preserve everything when any of them failed.
async fn drive_sweep(
    variants: Vec<TaskNode>,
    ctx: RunContext,
    master: Arc<MasterState>,
    pool_size: usize,
    summarize: Option<Arc<dyn Summarize>>,
    master_dir: PathBuf,
) -> Vec<TaskNode> {
    let semaphore = Arc::new(Semaphore::new(pool_size));
    let mut handles = Vec::with_capacity(variants.len());
    for variant in variants {
        let semaphore = Arc::clone(&semaphore);
        let ctx = ctx.clone();
        let master = Arc::clone(&master);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("worker pool semaphore closed");
            variant.run(ctx, master).await
        }));
    }

    // Join everything before inspecting anything: a failing sibling never
    // cancels the rest.
    let mut completed = Vec::with_capacity(handles.len());
    let mut panicked = 0usize;
    for handle in handles {
        match handle.await {
            Ok(variant) => completed.push(variant),
            Err(err) => {
                panicked += 1;
                master
                    .log
                    .error(format!("variant task panicked: {}", err))
                    .await;
            }
        }
    }
    completed.sort_by_key(|v| v.index);

    let mut sweep_failed = panicked > 0 || completed.iter().any(|v| v.status.is_error());

    if let Some(hook) = summarize {
        let snapshot = master.results_snapshot();
        if let Err(err) = hook.summarize(&snapshot).await {
            master
                .log
                .error(format!("summarize hook failed: {:#}", err))
                .await;
            sweep_failed = true;
        }
    }

    if sweep_failed {
        master
            .log
            .error("sweep failed; work directories preserved for inspection")
            .await;
        master.set_overall(TaskStatus::Error);
        master.log.close().await;
        return completed;
    }

    for variant in &mut completed {
        variant.finalize();
        master.record_status(variant.index, TaskStatus::Finalized);
        if let Err(err) = variant.clean(&ctx).await {
            master
                .log
                .error(format!("clean failed for '{}': {:#}", variant.name, err))
                .await;
        }
    }

    let results_path = env::results_path(&master_dir);
    let snapshot = master.results_snapshot();
    match snapshot.write_csv(&results_path).await {
        Ok(()) => {
            master
                .log
                .info(format!(
                    "sweep finished: {} row(s) written to {}",
                    snapshot.num_rows(),
                    results_path.display()
                ))
                .await;
            master.set_overall(TaskStatus::Finalized);
        }
        Err(err) => {
            master
                .log
                .error(format!("failed to write results: {:#}", err))
                .await;
            master.set_overall(TaskStatus::Error);
        }
    }
    master.log.close().await;
    completed
}

/// Delete one directory entry, retrying a few times for transient failures
/// and treating not-found as success.
async fn remove_entry_with_retry(path: &Path) -> Result<()> {
    const ATTEMPTS: u32 = 3;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = if path.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        match result {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) if attempt < ATTEMPTS => {
                debug!(path = %path.display(), error = %err, attempt, "retrying delete");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}
