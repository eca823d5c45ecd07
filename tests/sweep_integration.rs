//! End-to-end sweep runs through the public API.

use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tempfile::TempDir;

use sweeprun::{
    ExecContext, Execute, FnExecute, LoopVariable, Measurement, OrchestratorConfig, ResultsTable,
    Summarize, TaskNode, TaskStatus, Value,
};

fn test_config(workspace: &TempDir) -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_workspace_root(workspace.path())
        .with_polling_interval(Duration::from_millis(10))
        .with_acquire_timeout(Duration::from_secs(5))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_axis_sweep_fills_twelve_rows_in_order() {
    let workspace = TempDir::new().unwrap();
    let mut tb = TaskNode::builder("tb")
        .param("vdd", 0.0)
        .param("temp", 0.0)
        .config(test_config(&workspace))
        .loop_var(
            LoopVariable::from_values(
                "vdd",
                "vdd",
                vec![Value::Float(0.8), Value::Float(1.0), Value::Float(1.2)],
            )
            .unwrap(),
        )
        .loop_var(
            LoopVariable::from_values(
                "temp",
                "temp",
                vec![
                    Value::Float(-40.0),
                    Value::Float(27.0),
                    Value::Float(85.0),
                    Value::Float(125.0),
                ],
            )
            .unwrap(),
        )
        .execute(FnExecute(|ctx: &mut ExecContext| {
            let vdd = ctx.param("vdd").and_then(Value::as_f64).unwrap();
            let temp = ctx.param("temp").and_then(Value::as_f64).unwrap();
            ctx.record("metric", vdd * 1000.0 + temp);
            Ok(())
        }))
        .measurement(Measurement::namespace_key("metric", "metric"))
        .build();

    assert_eq!(tb.sweep_len(), 12);
    tb.start(true).await.unwrap();

    assert_eq!(tb.status(), TaskStatus::Finalized);
    assert_eq!(tb.variants().len(), 12);
    assert_eq!(tb.variant_statuses(), vec![TaskStatus::Finalized; 12]);

    // Row-major: the first axis varies slowest.
    let vdds = [0.8, 1.0, 1.2];
    let temps = [-40.0, 27.0, 85.0, 125.0];
    let results = tb.results().unwrap();
    assert_eq!(results.num_rows(), 12);
    for (i, vdd) in vdds.iter().enumerate() {
        for (j, temp) in temps.iter().enumerate() {
            let row = i * temps.len() + j;
            assert_eq!(results.get("vdd", row), Some(Value::Float(*vdd)));
            assert_eq!(results.get("temp", row), Some(Value::Float(*temp)));
            assert_eq!(
                results.get("metric", row),
                Some(Value::Float(vdd * 1000.0 + temp))
            );
            assert_eq!(
                results.get("variant", row),
                Some(Value::Str(format!("tb_{row}")))
            );
        }
    }

    // The master directory keeps the log and the rendered table; the
    // variants' scratch directories are gone.
    let master_dir = tb.work_dir().unwrap();
    assert!(master_dir.join("sweep.log").is_file());
    let csv = std::fs::read_to_string(master_dir.join("results.csv")).unwrap();
    assert_eq!(csv.lines().count(), 13);
    for variant in tb.variants() {
        assert!(variant.work_dir().is_none());
        assert!(!workspace.path().join(variant.name()).exists());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_failing_variant_fails_the_sweep_but_not_its_siblings() {
    let workspace = TempDir::new().unwrap();
    let mut tb = TaskNode::builder("tb")
        .param("i", 0)
        .config(test_config(&workspace))
        .loop_var(
            LoopVariable::from_values(
                "i",
                "i",
                (0..4i64).map(Value::Int).collect(),
            )
            .unwrap(),
        )
        .execute(FnExecute(|ctx: &mut ExecContext| {
            let i = ctx.param("i").and_then(Value::as_i64).unwrap();
            ctx.record("echo", i);
            if i == 2 {
                return Err(anyhow!("injected failure"));
            }
            Ok(())
        }))
        .measurement(Measurement::namespace_key("echo", "echo"))
        .build();

    let err = tb.start(true).await.unwrap_err();
    assert!(err.to_string().contains("1 of 4"));
    assert_eq!(tb.status(), TaskStatus::Error);

    let statuses = tb.variant_statuses();
    for (index, status) in statuses.iter().enumerate() {
        if index == 2 {
            assert_eq!(*status, TaskStatus::Error);
        } else {
            assert_eq!(*status, TaskStatus::Measured);
        }
    }

    // All four rows exist; no finalization means every work directory and
    // the log survive for inspection, and no results.csv was rendered.
    let results = tb.results().unwrap();
    assert_eq!(results.num_rows(), 4);
    for variant in tb.variants() {
        assert!(variant.work_dir().unwrap().is_dir());
    }
    let master_dir = tb.work_dir().unwrap();
    assert!(master_dir.join("sweep.log").is_file());
    assert!(!master_dir.join("results.csv").exists());
    let log = std::fs::read_to_string(master_dir.join("sweep.log")).unwrap();
    assert!(log.contains("injected failure"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nested_sweep_rolls_child_measurements_up() {
    let workspace = TempDir::new().unwrap();
    let stage = TaskNode::builder("stage")
        .param("bias", 0.0)
        .loop_var(
            LoopVariable::from_values(
                "bias",
                "bias",
                vec![Value::Float(1.0), Value::Float(2.0)],
            )
            .unwrap(),
        )
        .execute(FnExecute(|ctx: &mut ExecContext| {
            let bias = ctx.param("bias").and_then(Value::as_f64).unwrap();
            ctx.record("gain", bias * 5.0);
            Ok(())
        }))
        .measurement(Measurement::namespace_key("gain", "gain"))
        .build();

    let mut tb = TaskNode::builder("tb")
        .config(test_config(&workspace))
        .child(stage)
        .measurement(Measurement::new("gain_spread", |ns: &sweeprun::Namespace| {
            let lo = ns
                .get("stage_0.gain")
                .and_then(Value::as_f64)
                .ok_or_else(|| anyhow!("missing stage_0.gain"))?;
            let hi = ns
                .get("stage_1.gain")
                .and_then(Value::as_f64)
                .ok_or_else(|| anyhow!("missing stage_1.gain"))?;
            Ok(Value::Float(hi - lo))
        }))
        .build();

    tb.start(true).await.unwrap();

    assert_eq!(tb.status(), TaskStatus::Finalized);
    let results = tb.results().unwrap();
    assert_eq!(results.get("gain_spread", 0), Some(Value::Float(5.0)));
}

struct SlowEcho;

#[async_trait]
impl Execute for SlowEcho {
    async fn execute(&self, ctx: &mut ExecContext) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let i = ctx.param("i").and_then(Value::as_i64).unwrap_or(0);
        ctx.record("echo", i);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn detached_run_is_observable_until_finalized() {
    let workspace = TempDir::new().unwrap();
    let mut tb = TaskNode::builder("bg")
        .param("i", 0)
        .config(test_config(&workspace))
        .loop_var(LoopVariable::from_values("i", "i", (0..3i64).map(Value::Int).collect()).unwrap())
        .execute(SlowEcho)
        .measurement(Measurement::namespace_key("echo", "echo"))
        .build();

    tb.start(false).await.unwrap();
    assert_ne!(tb.status(), TaskStatus::Uninitialized);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tb.status() != TaskStatus::Finalized {
        assert_ne!(tb.status(), TaskStatus::Error);
        assert!(
            tokio::time::Instant::now() < deadline,
            "detached run never finished"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let results = tb.results().unwrap();
    assert_eq!(results.num_rows(), 3);
}

struct MeanGain;

#[async_trait]
impl Summarize for MeanGain {
    async fn summarize(&self, results: &ResultsTable) -> Result<()> {
        let column = results
            .column("gain")
            .ok_or_else(|| anyhow!("no gain column"))?;
        let values: Vec<f64> = column
            .iter()
            .filter_map(|cell| cell.as_ref().and_then(Value::as_f64))
            .collect();
        if values.is_empty() {
            return Err(anyhow!("gain column is empty"));
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn summarize_runs_once_over_the_full_table() {
    let workspace = TempDir::new().unwrap();
    let mut tb = TaskNode::builder("tb")
        .param("vdd", 0.0)
        .config(test_config(&workspace))
        .loop_var(
            LoopVariable::from_values(
                "vdd",
                "vdd",
                vec![Value::Float(0.9), Value::Float(1.1)],
            )
            .unwrap(),
        )
        .execute(FnExecute(|ctx: &mut ExecContext| {
            let vdd = ctx.param("vdd").and_then(Value::as_f64).unwrap();
            ctx.record("gain", vdd * 2.0);
            Ok(())
        }))
        .measurement(Measurement::namespace_key("gain", "gain"))
        .summarize(MeanGain)
        .build();

    tb.start(true).await.unwrap();
    assert_eq!(tb.status(), TaskStatus::Finalized);
}

struct FailingSummary;

#[async_trait]
impl Summarize for FailingSummary {
    async fn summarize(&self, _results: &ResultsTable) -> Result<()> {
        Err(anyhow!("summary rejected the batch"))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_summarize_preserves_the_batch() {
    let workspace = TempDir::new().unwrap();
    let mut tb = TaskNode::builder("tb")
        .config(test_config(&workspace))
        .execute(FnExecute(|ctx: &mut ExecContext| {
            ctx.record("ok", true);
            Ok(())
        }))
        .measurement(Measurement::namespace_key("ok", "ok"))
        .summarize(FailingSummary)
        .build();

    assert!(tb.start(true).await.is_err());
    assert_eq!(tb.status(), TaskStatus::Error);
    // The variant itself measured fine; only the batch outcome is an error.
    assert_eq!(tb.variant_statuses(), vec![TaskStatus::Measured]);
    for variant in tb.variants() {
        assert!(variant.work_dir().unwrap().is_dir());
    }
}
