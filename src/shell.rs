//! An [`Execute`] hook that runs an external command in the variant's work
//! directory.
//!
//! Parameters are exported to the child process as `SWEEP_<NAME>` environment
//! variables, and `key=value` lines on its stdout are recorded as outputs, so
//! measurements can bind to them by name.

use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::results::Value;
use crate::task::{ExecContext, Execute};

pub struct ShellCommand {
    program: String,
    args: Vec<String>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl Execute for ShellCommand {
    async fn execute(&self, ctx: &mut ExecContext) -> Result<()> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(ctx.work_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (name, value) in ctx.params() {
            command.env(param_env_name(name), value.to_string());
        }

        debug!(node = %ctx.name(), program = %self.program, "running command");
        let output = command
            .output()
            .await
            .with_context(|| format!("failed to spawn '{}'", self.program))?;

        // Outputs are recorded before the exit status is checked, so partial
        // results from a failing command still reach measurement.
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if let Some((key, value)) = line.split_once('=') {
                ctx.record(key.trim(), parse_value(value.trim()));
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "'{}' exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
        }
        Ok(())
    }
}

/// `vdd` becomes `SWEEP_VDD`; anything that is not alphanumeric maps to `_`.
fn param_env_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("SWEEP_{sanitized}")
}

/// Typed reading of a stdout value: bool, then integer, then float, else the
/// raw string.
fn parse_value(raw: &str) -> Value {
    if let Ok(b) = raw.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::Float(f);
    }
    Value::Str(raw.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use super::*;
    use crate::results::Value;
    use crate::task::ExecContext;

    fn test_ctx(dir: &TempDir, params: HashMap<String, Value>) -> ExecContext {
        ExecContext::new(
            "sh".to_string(),
            vec!["sh".to_string()],
            dir.path().to_path_buf(),
            params,
        )
    }

    #[test]
    fn env_names_are_prefixed_and_sanitized() {
        assert_eq!(param_env_name("vdd"), "SWEEP_VDD");
        assert_eq!(param_env_name("amp.bias"), "SWEEP_AMP_BIAS");
    }

    #[test]
    fn values_parse_typed_before_falling_back_to_strings() {
        assert_eq!(parse_value("true"), Value::Bool(true));
        assert_eq!(parse_value("42"), Value::Int(42));
        assert_eq!(parse_value("2.5"), Value::Float(2.5));
        assert_eq!(parse_value("tt_corner"), Value::Str("tt_corner".into()));
    }

    #[tokio::test]
    async fn stdout_pairs_become_outputs() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_ctx(&dir, HashMap::new());
        let hook = ShellCommand::new("sh")
            .arg("-c")
            .arg("echo gain=12.5; echo corner=tt; echo not a pair");

        hook.execute(&mut ctx).await.unwrap();
        let outputs = ctx.into_outputs();
        assert_eq!(outputs.get("gain"), Some(&Value::Float(12.5)));
        assert_eq!(outputs.get("corner"), Some(&Value::Str("tt".into())));
        assert_eq!(outputs.len(), 2);
    }

    #[tokio::test]
    async fn params_are_exported_to_the_environment() {
        let dir = TempDir::new().unwrap();
        let params = HashMap::from([("vdd".to_string(), Value::Float(1.2))]);
        let mut ctx = test_ctx(&dir, params);
        let hook = ShellCommand::new("sh").arg("-c").arg("echo vdd_seen=$SWEEP_VDD");

        hook.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.into_outputs().get("vdd_seen"), Some(&Value::Float(1.2)));
    }

    #[tokio::test]
    async fn nonzero_exit_fails_but_keeps_outputs() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_ctx(&dir, HashMap::new());
        let hook = ShellCommand::new("sh").arg("-c").arg("echo partial=1; exit 3");

        let err = hook.execute(&mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("exited with"));
        assert_eq!(ctx.into_outputs().get("partial"), Some(&Value::Int(1)));
    }
}
