use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

impl DatasetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Clipping range declared for a numeric column. The kernel clamps every
/// value into this range before aggregating.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnBounds {
    pub lower: f64,
    pub upper: f64,
}

impl ColumnBounds {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    pub fn is_well_formed(&self) -> bool {
        self.lower.is_finite() && self.upper.is_finite() && self.lower <= self.upper
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.lower, self.upper)
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    pub fn max_magnitude(&self) -> f64 {
        self.lower.abs().max(self.upper.abs())
    }
}

/// Public metadata about a protected dataset. Column entries without bounds
/// are known to exist but cannot back a sensitivity-bounded aggregate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub columns: BTreeMap<String, Option<ColumnBounds>>,
}

impl DatasetSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bounded_column(mut self, name: impl Into<String>, lower: f64, upper: f64) -> Self {
        self.columns
            .insert(name.into(), Some(ColumnBounds::new(lower, upper)));
        self
    }

    pub fn with_unbounded_column(mut self, name: impl Into<String>) -> Self {
        self.columns.insert(name.into(), None);
        self
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn bounds(&self, name: &str) -> Option<ColumnBounds> {
        self.columns.get(name).copied().flatten()
    }
}

/// Opaque reference to a protected data source. Only public metadata lives
/// here; rows stay with the numeric kernel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetHandle {
    pub id: DatasetId,
    pub row_bound: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub schema: DatasetSchema,
}

impl DatasetHandle {
    pub fn new(id: impl Into<String>, schema: DatasetSchema) -> Self {
        Self {
            id: DatasetId::new(id),
            row_bound: None,
            created_at: Utc::now(),
            schema,
        }
    }

    pub fn with_row_bound(mut self, rows: u64) -> Self {
        self.row_bound = Some(rows);
        self
    }
}
