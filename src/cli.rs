//! Command-line surface: parse a sweep description from TOML, build the task
//! tree, and drive it.
//!
//! A sweep file is one node, recursively:
//!
//! ```toml
//! name = "tb"
//!
//! [params]
//! corner = "tt"
//!
//! [[sweep]]
//! name = "vdd"
//! values = [0.8, 1.0, 1.2]
//!
//! [command]
//! program = "sh"
//! args = ["-c", "echo gain=$SWEEP_VDD"]
//!
//! [[measure]]
//! name = "gain"
//!
//! [[children]]
//! name = "amp"
//! ...
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;

use crate::config::OrchestratorConfig;
use crate::results::Value;
use crate::shell::ShellCommand;
use crate::task::{LoopVariable, Measurement, TaskNode, TaskStatus};

#[derive(Parser)]
#[command(name = "sweeprun", version, about = "Hierarchical parameter-sweep runner")]
pub struct Cli {
    /// Orchestrator configuration file (defaults apply when omitted).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the sweep described by a TOML file and wait for it to finish.
    Run {
        /// Sweep description file.
        sweep: PathBuf,
    },
    /// Print the effective configuration and exit.
    ShowConfig,
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => OrchestratorConfig::from_toml_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };

    match cli.command {
        Commands::Run { sweep } => {
            let raw = std::fs::read_to_string(&sweep)
                .with_context(|| format!("failed to read sweep file {}", sweep.display()))?;
            let spec: NodeSpec = toml::from_str(&raw)
                .with_context(|| format!("invalid sweep file {}", sweep.display()))?;
            let mut root = build_node(spec, Some(config))?;

            info!(sweep = %root.name(), variants = root.sweep_len(), "starting sweep");
            root.start(true).await?;

            if let Some(dir) = root.work_dir() {
                info!(sweep = %root.name(), dir = %dir.display(), "sweep finalized");
            }
            if root.status() != TaskStatus::Finalized {
                bail!("sweep '{}' did not finalize", root.name());
            }
            Ok(())
        }
        Commands::ShowConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// One node of the sweep file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeSpec {
    name: String,
    #[serde(default)]
    params: HashMap<String, Value>,
    #[serde(default, rename = "sweep")]
    sweeps: Vec<SweepSpec>,
    #[serde(default)]
    command: Option<CommandSpec>,
    #[serde(default, rename = "measure")]
    measures: Vec<MeasureSpec>,
    #[serde(default)]
    children: Vec<NodeSpec>,
    #[serde(default)]
    serial: bool,
    #[serde(default)]
    disk_demand: Option<u64>,
}

/// One sweep axis. Exactly one of `values`, `linspace`, or `range` must be
/// given; `target` defaults to the axis name.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SweepSpec {
    name: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    values: Option<Vec<Value>>,
    #[serde(default)]
    linspace: Option<LinspaceSpec>,
    #[serde(default)]
    range: Option<RangeSpec>,
}

#[derive(Debug, Deserialize)]
struct LinspaceSpec {
    start: f64,
    stop: f64,
    points: usize,
}

#[derive(Debug, Deserialize)]
struct RangeSpec {
    start: f64,
    stop: f64,
    step: f64,
}

/// A measurement bound to an output key (`key` defaults to `name`).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MeasureSpec {
    name: String,
    #[serde(default)]
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandSpec {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

fn build_node(spec: NodeSpec, config: Option<OrchestratorConfig>) -> Result<TaskNode> {
    let NodeSpec {
        name,
        params,
        sweeps,
        command,
        measures,
        children,
        serial,
        disk_demand,
    } = spec;

    let mut builder = TaskNode::builder(name.as_str());
    if let Some(config) = config {
        builder = builder.config(config);
    }
    if serial {
        builder = builder.serial();
    }
    if let Some(demand) = disk_demand {
        builder = builder.disk_demand(demand);
    }
    for (param, value) in params {
        builder = builder.param(param, value);
    }
    for sweep in sweeps {
        builder = builder.loop_var(build_loop_var(&name, sweep)?);
    }
    if let Some(command) = command {
        builder = builder.execute(ShellCommand::new(command.program).args(command.args));
    }
    for measure in measures {
        let key = measure.key.unwrap_or_else(|| measure.name.clone());
        builder = builder.measurement(Measurement::namespace_key(measure.name, key));
    }
    for child in children {
        builder = builder.child(build_node(child, None)?);
    }
    Ok(builder.build())
}

fn build_loop_var(node: &str, spec: SweepSpec) -> Result<LoopVariable> {
    let target = spec.target.unwrap_or_else(|| spec.name.clone());
    match (spec.values, spec.linspace, spec.range) {
        (Some(values), None, None) => LoopVariable::from_values(spec.name, target, values),
        (None, Some(l), None) => {
            LoopVariable::linspace(spec.name, target, l.start, l.stop, l.points)
        }
        (None, None, Some(r)) => {
            LoopVariable::step_range(spec.name, target, r.start, r.stop, r.step)
        }
        _ => bail!(
            "sweep axis '{}' of '{}' needs exactly one of values, linspace, or range",
            spec.name,
            node
        ),
    }
}
