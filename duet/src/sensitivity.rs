//! Static sensitivity analysis. A query whose worst-case single-record
//! influence cannot be bounded from the public schema is refused outright.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::DatasetSchema;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityMetric {
    L1,
    L2,
}

impl fmt::Display for SensitivityMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensitivityMetric::L1 => f.write_str("L1"),
            SensitivityMetric::L2 => f.write_str("L2"),
        }
    }
}

/// Query shapes the engine knows how to bound.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryKind {
    Count,
    Sum { column: String },
    /// Mean over a dataset whose row count is public (`row_bound`).
    Mean { column: String },
    /// Counts per half-open bin `[edges[i], edges[i + 1])`.
    Histogram { column: String, edges: Vec<f64> },
    /// Whether any row exceeds `threshold`.
    Indicator { column: String, threshold: f64 },
    /// Caller-declared sensitivity for kernels the engine cannot analyse.
    Declared { l1: Option<f64>, l2: Option<f64> },
}

impl QueryKind {
    pub fn name(&self) -> &'static str {
        match self {
            QueryKind::Count => "count",
            QueryKind::Sum { .. } => "sum",
            QueryKind::Mean { .. } => "mean",
            QueryKind::Histogram { .. } => "histogram",
            QueryKind::Indicator { .. } => "indicator",
            QueryKind::Declared { .. } => "declared",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum SensitivityError {
    #[error("{query} query has unbounded sensitivity: {reason}")]
    Unbounded { query: &'static str, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensitivityDescriptor {
    pub metric: SensitivityMetric,
    pub bound: f64,
}

impl SensitivityDescriptor {
    pub fn new(metric: SensitivityMetric, bound: f64) -> Self {
        Self { metric, bound }
    }

    /// Derives the descriptor for `kind` under the add/remove-one-record
    /// relation. `Mean` uses replace-one with the public row count.
    pub fn describe(
        kind: &QueryKind,
        schema: &DatasetSchema,
        row_bound: Option<u64>,
        metric: SensitivityMetric,
    ) -> Result<Self, SensitivityError> {
        let query = kind.name();
        let unbounded = |reason: String| SensitivityError::Unbounded { query, reason };
        let bound = match kind {
            QueryKind::Count => 1.0,
            QueryKind::Sum { column } => {
                let bounds = column_bounds(schema, column).map_err(unbounded)?;
                bounds.max_magnitude()
            }
            QueryKind::Mean { column } => {
                let bounds = column_bounds(schema, column).map_err(unbounded)?;
                let rows = match row_bound {
                    Some(rows) if rows > 0 => rows,
                    _ => {
                        return Err(unbounded(
                            "mean requires a public non-zero row count".into(),
                        ))
                    }
                };
                bounds.width() / rows as f64
            }
            QueryKind::Histogram { column, edges } => {
                if !schema.has_column(column) {
                    return Err(unbounded(format!("unknown column `{column}`")));
                }
                if edges.len() < 2 {
                    return Err(unbounded("histogram needs at least two edges".into()));
                }
                let ordered = edges
                    .windows(2)
                    .all(|pair| pair[0].is_finite() && pair[1].is_finite() && pair[0] < pair[1]);
                if !ordered {
                    return Err(unbounded(
                        "histogram edges must be finite and strictly increasing".into(),
                    ));
                }
                1.0
            }
            QueryKind::Indicator { column, threshold } => {
                if !schema.has_column(column) {
                    return Err(unbounded(format!("unknown column `{column}`")));
                }
                if !threshold.is_finite() {
                    return Err(unbounded("indicator threshold must be finite".into()));
                }
                1.0
            }
            QueryKind::Declared { l1, l2 } => {
                let declared = match metric {
                    SensitivityMetric::L1 => *l1,
                    SensitivityMetric::L2 => *l2,
                };
                match declared {
                    Some(bound) if bound.is_finite() && bound >= 0.0 => bound,
                    Some(bound) => {
                        return Err(unbounded(format!("declared {metric} bound {bound} is invalid")))
                    }
                    None => return Err(unbounded(format!("no {metric} bound declared"))),
                }
            }
        };
        Ok(Self { metric, bound })
    }
}

fn column_bounds(
    schema: &DatasetSchema,
    column: &str,
) -> Result<crate::dataset::ColumnBounds, String> {
    if !schema.has_column(column) {
        return Err(format!("unknown column `{column}`"));
    }
    let bounds = schema
        .bounds(column)
        .ok_or_else(|| format!("column `{column}` has no clipping bounds"))?;
    if !bounds.is_well_formed() {
        return Err(format!(
            "column `{column}` bounds [{}, {}] are malformed",
            bounds.lower, bounds.upper
        ));
    }
    Ok(bounds)
}
