//! Parameter-sweep expansion.
//!
//! A [`LoopVariable`] names one axis of a sweep: a resolved value sequence
//! and the dotted parameter path it drives. [`cartesian_points`] turns an
//! ordered set of loop variables into the full cross-product in row-major
//! order, first variable varying slowest, mirroring nested-loop order.

use anyhow::{Result, anyhow};

use crate::results::Value;

/// One sweep axis. Values are resolved at construction and frozen; there is
/// no mutation API.
#[derive(Debug, Clone)]
pub struct LoopVariable {
    name: String,
    target: String,
    values: Vec<Value>,
}

impl LoopVariable {
    /// Axis over an explicit value list. The list must not be empty.
    pub fn from_values(
        name: impl Into<String>,
        target: impl Into<String>,
        values: Vec<Value>,
    ) -> Result<Self> {
        let name = name.into();
        if values.is_empty() {
            return Err(anyhow!("loop variable '{}' has no values", name));
        }
        Ok(Self {
            name,
            target: target.into(),
            values,
        })
    }

    /// `n` evenly spaced points across `[start, stop]` inclusive.
    pub fn linspace(
        name: impl Into<String>,
        target: impl Into<String>,
        start: f64,
        stop: f64,
        n: usize,
    ) -> Result<Self> {
        let name = name.into();
        if n == 0 {
            return Err(anyhow!("loop variable '{}' needs at least one point", name));
        }
        let values = if n == 1 {
            vec![Value::Float(start)]
        } else {
            let step = (stop - start) / (n - 1) as f64;
            (0..n)
                .map(|i| Value::Float(start + step * i as f64))
                .collect()
        };
        Ok(Self {
            name,
            target: target.into(),
            values,
        })
    }

    /// Points from `start` to at most `stop`, advancing by `step`.
    pub fn step_range(
        name: impl Into<String>,
        target: impl Into<String>,
        start: f64,
        stop: f64,
        step: f64,
    ) -> Result<Self> {
        let name = name.into();
        if step <= 0.0 || stop < start {
            return Err(anyhow!(
                "loop variable '{}' has an empty range (start {}, stop {}, step {})",
                name,
                start,
                stop,
                step
            ));
        }
        let mut values = Vec::new();
        let mut v = start;
        // Tolerance keeps the endpoint when accumulated error lands us just past it.
        while v <= stop + step * 1e-9 {
            values.push(Value::Float(v));
            v += step;
        }
        Ok(Self {
            name,
            target: target.into(),
            values,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted parameter path this axis drives, e.g. `"amp.bias"`.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One point of the cross-product: its dense index and the per-axis
/// bindings `(variable name, target path, value)`.
#[derive(Debug, Clone)]
pub(crate) struct SweepPoint {
    pub index: usize,
    pub bindings: Vec<(String, String, Value)>,
}

/// Number of variants a set of loop variables expands into. The empty set
/// expands into exactly one variant.
pub(crate) fn product_len(vars: &[LoopVariable]) -> usize {
    vars.iter().map(|v| v.len()).product()
}

/// Full cartesian product in row-major order, first variable slowest.
pub(crate) fn cartesian_points(vars: &[LoopVariable]) -> Vec<SweepPoint> {
    let total = product_len(vars);
    // Stride of axis i is the product of the lengths of the axes after it.
    let strides: Vec<usize> = (0..vars.len())
        .map(|i| vars[i + 1..].iter().map(|v| v.len()).product())
        .collect();

    (0..total)
        .map(|index| {
            let bindings = vars
                .iter()
                .zip(&strides)
                .map(|(var, stride)| {
                    let digit = (index / stride) % var.len();
                    (
                        var.name.clone(),
                        var.target.clone(),
                        var.values[digit].clone(),
                    )
                })
                .collect();
            SweepPoint { index, bindings }
        })
        .collect()
}
