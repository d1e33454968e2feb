// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Built-in chart transforms: filter, sort, group/aggregate, sample, limit,
//! and per-field statistics.
//!
//! Every function takes a [`TaskContext`] and checks it every
//! [`CHECK_EVERY`] rows so a cancelled task stops early.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;

use super::task::{TaskContext, TaskError, TaskRegistry};

/// Rows processed between cancellation checks.
pub const CHECK_EVERY: usize = 4096;

/// How a dataset is reshaped before charting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Drop rows where this field is missing or null
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub descending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Aggregate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Filled in by the engine for large datasets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingParams>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

/// Stride sampling: keep every `step`-th row (and always the last one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub step: usize,
    pub target_points: usize,
}

impl SamplingParams {
    /// Parameters reducing `len` rows to roughly `target_points`.
    #[must_use]
    pub fn for_len(len: usize, target_points: usize) -> Self {
        let target_points = target_points.max(1);
        Self {
            step: len.div_ceil(target_points).max(1),
            target_points,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleMethod {
    /// Evenly spaced rows, first and last included
    #[default]
    Systematic,
    /// The first `size` rows
    Head,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleOptions {
    pub size: usize,
    #[serde(default)]
    pub method: SampleMethod,
}

impl SampleOptions {
    #[must_use]
    pub fn systematic(size: usize) -> Self {
        Self { size, method: SampleMethod::Systematic }
    }
}

/// Summary of the numeric values of one field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub field: String,
    /// Rows with a numeric value
    pub count: usize,
    /// Rows where the field is absent, null or non-numeric
    pub missing: usize,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    /// Population standard deviation
    pub std_dev: Option<f64>,
}

/// Apply `config` to `rows`: filter → sort → group → sample → limit.
pub fn apply_transform(
    rows: Vec<Value>,
    config: &TransformConfig,
    ctx: &TaskContext,
) -> Result<Vec<Value>, TaskError> {
    let mut rows = rows;

    if let Some(ref field) = config.filter {
        let mut kept = Vec::with_capacity(rows.len());
        for (i, row) in rows.into_iter().enumerate() {
            if i % CHECK_EVERY == 0 {
                ctx.checkpoint()?;
            }
            if !row.get(field).map_or(true, Value::is_null) {
                kept.push(row);
            }
        }
        rows = kept;
    }

    if let Some(ref field) = config.sort_by {
        ctx.checkpoint()?;
        rows.sort_by(|a, b| {
            let (a, b) = (a.get(field), b.get(field));
            let ord = compare_values(a, b);
            // Missing values stay last in both directions
            if config.descending && is_present(a) && is_present(b) {
                ord.reverse()
            } else {
                ord
            }
        });
    }

    if let Some(ref group) = config.group_by {
        let aggregate = config.aggregate.unwrap_or(Aggregate::Count);
        rows = group_rows(&rows, group, config.value_field.as_deref(), aggregate, ctx)?;
    }

    if let Some(params) = config.sampling {
        rows = stride_sample(rows, params.step, ctx)?;
    }

    if let Some(limit) = config.limit {
        rows.truncate(limit);
    }

    Ok(rows)
}

/// Reduce `rows` according to `options`.
pub fn sample_rows(
    rows: Vec<Value>,
    options: &SampleOptions,
    ctx: &TaskContext,
) -> Result<Vec<Value>, TaskError> {
    let len = rows.len();
    if options.size == 0 {
        return Ok(Vec::new());
    }
    if len <= options.size {
        return Ok(rows);
    }

    match options.method {
        SampleMethod::Head => {
            let mut rows = rows;
            rows.truncate(options.size);
            Ok(rows)
        }
        SampleMethod::Systematic => {
            if options.size == 1 {
                return Ok(rows.into_iter().last().into_iter().collect());
            }
            // size - 1 gaps across len - 1 positions; index 0 and len - 1 always kept
            let gap = (len - 1) as f64 / (options.size - 1) as f64;
            let mut wanted = (0..options.size)
                .map(|i| ((i as f64 * gap).round() as usize).min(len - 1))
                .peekable();

            let mut out = Vec::with_capacity(options.size);
            for (i, row) in rows.into_iter().enumerate() {
                if i % CHECK_EVERY == 0 {
                    ctx.checkpoint()?;
                }
                if wanted.peek() == Some(&i) {
                    out.push(row);
                    while wanted.peek() == Some(&i) {
                        wanted.next();
                    }
                }
            }
            Ok(out)
        }
    }
}

/// Statistics over the numeric values of `field`.
pub fn compute_statistics(
    rows: &[Value],
    field: &str,
    ctx: &TaskContext,
) -> Result<Statistics, TaskError> {
    let mut stats = Statistics {
        field: field.to_string(),
        ..Default::default()
    };
    let mut sum_sq = 0.0;

    for (i, row) in rows.iter().enumerate() {
        if i % CHECK_EVERY == 0 {
            ctx.checkpoint()?;
        }
        let Some(v) = row.get(field).and_then(numeric) else {
            stats.missing += 1;
            continue;
        };
        stats.count += 1;
        stats.sum += v;
        sum_sq += v * v;
        stats.min = Some(stats.min.map_or(v, |m| m.min(v)));
        stats.max = Some(stats.max.map_or(v, |m| m.max(v)));
    }

    if stats.count > 0 {
        let n = stats.count as f64;
        let mean = stats.sum / n;
        let variance = (sum_sq / n - mean * mean).max(0.0);
        stats.mean = Some(mean);
        stats.std_dev = Some(variance.sqrt());
    }
    Ok(stats)
}

fn stride_sample(rows: Vec<Value>, step: usize, ctx: &TaskContext) -> Result<Vec<Value>, TaskError> {
    if step <= 1 || rows.len() <= 1 {
        return Ok(rows);
    }
    let last = rows.len() - 1;
    let mut out = Vec::with_capacity(rows.len() / step + 1);
    for (i, row) in rows.into_iter().enumerate() {
        if i % CHECK_EVERY == 0 {
            ctx.checkpoint()?;
        }
        if i % step == 0 || i == last {
            out.push(row);
        }
    }
    Ok(out)
}

fn group_rows(
    rows: &[Value],
    group: &str,
    value_field: Option<&str>,
    aggregate: Aggregate,
    ctx: &TaskContext,
) -> Result<Vec<Value>, TaskError> {
    struct Acc {
        key: Value,
        count: usize,
        sum: f64,
        min: Option<f64>,
        max: Option<f64>,
    }

    let mut order: Vec<Acc> = Vec::new();
    let mut index: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for (i, row) in rows.iter().enumerate() {
        if i % CHECK_EVERY == 0 {
            ctx.checkpoint()?;
        }
        let key = row.get(group).cloned().unwrap_or(Value::Null);
        let slot = *index.entry(key.to_string()).or_insert_with(|| {
            order.push(Acc { key, count: 0, sum: 0.0, min: None, max: None });
            order.len() - 1
        });
        let acc = &mut order[slot];

        match value_field {
            Some(field) => {
                if let Some(v) = row.get(field).and_then(numeric) {
                    acc.count += 1;
                    acc.sum += v;
                    acc.min = Some(acc.min.map_or(v, |m| m.min(v)));
                    acc.max = Some(acc.max.map_or(v, |m| m.max(v)));
                }
            }
            None => acc.count += 1,
        }
    }

    let out_field = match aggregate {
        Aggregate::Count => "count",
        _ => value_field.unwrap_or("value"),
    };

    Ok(order
        .into_iter()
        .map(|acc| {
            let value = match aggregate {
                Aggregate::Count => json!(acc.count),
                Aggregate::Sum => json!(acc.sum),
                Aggregate::Avg if acc.count > 0 => json!(acc.sum / acc.count as f64),
                Aggregate::Avg => Value::Null,
                Aggregate::Min => acc.min.map_or(Value::Null, |v| json!(v)),
                Aggregate::Max => acc.max.map_or(Value::Null, |v| json!(v)),
            };
            let mut row = Map::new();
            row.insert(group.to_string(), acc.key);
            row.insert(out_field.to_string(), value);
            Value::Object(row)
        })
        .collect())
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn is_present(v: Option<&Value>) -> bool {
    v.is_some_and(|v| !v.is_null())
}

/// Numbers before strings before everything else; missing/null last.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            Some(Value::Number(_)) => 0,
            Some(Value::String(_)) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Null) | None => 4,
            Some(_) => 3,
        }
    }

    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task handlers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TransformPayload {
    data: Vec<Value>,
    #[serde(default)]
    config: TransformConfig,
}

#[derive(Deserialize)]
struct SamplePayload {
    data: Vec<Value>,
    options: SampleOptions,
}

#[derive(Deserialize)]
struct StatisticsPayload {
    data: Vec<Value>,
    field: String,
}

fn decode<T: for<'de> Deserialize<'de>>(payload: Value) -> Result<T, TaskError> {
    serde_json::from_value(payload).map_err(|e| TaskError::InvalidPayload(e.to_string()))
}

fn transform_task(payload: Value, ctx: &TaskContext) -> Result<Value, TaskError> {
    let TransformPayload { data, config } = decode(payload)?;
    Ok(Value::Array(apply_transform(data, &config, ctx)?))
}

fn sample_task(payload: Value, ctx: &TaskContext) -> Result<Value, TaskError> {
    let SamplePayload { data, options } = decode(payload)?;
    Ok(Value::Array(sample_rows(data, &options, ctx)?))
}

fn statistics_task(payload: Value, ctx: &TaskContext) -> Result<Value, TaskError> {
    let StatisticsPayload { data, field } = decode(payload)?;
    let stats = compute_statistics(&data, &field, ctx)?;
    serde_json::to_value(stats).map_err(|e| TaskError::Failed(e.to_string()))
}

pub(crate) fn register_builtins(registry: &mut TaskRegistry) {
    registry.register(super::TASK_TRANSFORM, transform_task);
    registry.register(super::TASK_SAMPLE, sample_task);
    registry.register(super::TASK_STATISTICS, statistics_task);
}
