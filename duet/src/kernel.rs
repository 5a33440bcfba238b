//! Numeric kernel seam. The engine never touches rows itself; it asks a
//! kernel for the exact answer and immediately hands it to a mechanism.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::{
    dataset::{DatasetHandle, DatasetId},
    mechanism::TrueAnswer,
    sensitivity::QueryKind,
    session::QueryRequest,
};

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("no rows loaded for dataset {0}")]
    UnknownDataset(DatasetId),
    #[error("dataset {dataset} has no column `{column}`")]
    UnknownColumn { dataset: DatasetId, column: String },
    #[error("column `{column}` has no clipping bounds")]
    Unclipped { column: String },
    #[error("dataset {dataset} holds {actual} rows but {declared} are declared public")]
    RowCountMismatch {
        dataset: DatasetId,
        declared: u64,
        actual: u64,
    },
    #[error("no evaluator registered for declared query `{0}`")]
    MissingEvaluator(String),
    #[error("kernel failure: {0}")]
    Failed(String),
}

pub trait NumericKernel: Send + Sync {
    fn evaluate(
        &self,
        request: &QueryRequest,
        handle: &DatasetHandle,
    ) -> Result<TrueAnswer, EvaluationError>;
}

/// Columnar rows for one dataset.
#[derive(Clone, Debug, Default)]
pub struct InMemoryTable {
    columns: HashMap<String, Vec<f64>>,
    rows: usize,
}

impl InMemoryTable {
    pub fn new(rows: usize) -> Self {
        Self {
            columns: HashMap::new(),
            rows,
        }
    }

    /// Missing trailing values are padded with zero; extra values are dropped.
    pub fn with_column(mut self, name: impl Into<String>, mut values: Vec<f64>) -> Self {
        values.resize(self.rows, 0.0);
        self.columns.insert(name.into(), values);
        self
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }
}

type DeclaredEvaluator = Arc<dyn Fn(&InMemoryTable) -> Result<TrueAnswer, EvaluationError> + Send + Sync>;

/// Reference kernel over in-process tables. Clips every value to the
/// schema's declared bounds before aggregating.
#[derive(Default)]
pub struct InMemoryKernel {
    tables: RwLock<HashMap<DatasetId, InMemoryTable>>,
    declared: RwLock<HashMap<String, DeclaredEvaluator>>,
}

impl fmt::Debug for InMemoryKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryKernel")
            .field("tables", &self.tables.read().len())
            .field("declared", &self.declared.read().len())
            .finish()
    }
}

impl InMemoryKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_table(&self, dataset: DatasetId, table: InMemoryTable) {
        self.tables.write().insert(dataset, table);
    }

    /// Evaluator for `QueryKind::Declared` requests, looked up by request label.
    pub fn register_declared<F>(&self, label: impl Into<String>, evaluator: F)
    where
        F: Fn(&InMemoryTable) -> Result<TrueAnswer, EvaluationError> + Send + Sync + 'static,
    {
        self.declared.write().insert(label.into(), Arc::new(evaluator));
    }

    fn clipped(
        handle: &DatasetHandle,
        table: &InMemoryTable,
        column: &str,
    ) -> Result<Vec<f64>, EvaluationError> {
        let values = table
            .column(column)
            .ok_or_else(|| EvaluationError::UnknownColumn {
                dataset: handle.id.clone(),
                column: column.to_string(),
            })?;
        let bounds = handle
            .schema
            .bounds(column)
            .ok_or_else(|| EvaluationError::Unclipped {
                column: column.to_string(),
            })?;
        Ok(values.iter().map(|value| bounds.clamp(*value)).collect())
    }

    fn raw<'t>(
        handle: &DatasetHandle,
        table: &'t InMemoryTable,
        column: &str,
    ) -> Result<&'t [f64], EvaluationError> {
        table
            .column(column)
            .ok_or_else(|| EvaluationError::UnknownColumn {
                dataset: handle.id.clone(),
                column: column.to_string(),
            })
    }
}

impl NumericKernel for InMemoryKernel {
    fn evaluate(
        &self,
        request: &QueryRequest,
        handle: &DatasetHandle,
    ) -> Result<TrueAnswer, EvaluationError> {
        let tables = self.tables.read();
        let table = tables
            .get(&handle.id)
            .ok_or_else(|| EvaluationError::UnknownDataset(handle.id.clone()))?;
        debug!(
            "kernel evaluating dataset={} query={} rows={}",
            handle.id,
            request.kind.name(),
            table.rows()
        );

        match &request.kind {
            QueryKind::Count => Ok(TrueAnswer::Scalar(table.rows() as f64)),
            QueryKind::Sum { column } => {
                let values = Self::clipped(handle, table, column)?;
                Ok(TrueAnswer::Scalar(values.iter().sum()))
            }
            QueryKind::Mean { column } => {
                let actual = table.rows() as u64;
                match handle.row_bound {
                    Some(declared) if declared == actual && actual > 0 => {}
                    declared => {
                        return Err(EvaluationError::RowCountMismatch {
                            dataset: handle.id.clone(),
                            declared: declared.unwrap_or(0),
                            actual,
                        })
                    }
                }
                let values = Self::clipped(handle, table, column)?;
                Ok(TrueAnswer::Scalar(values.iter().sum::<f64>() / actual as f64))
            }
            QueryKind::Histogram { column, edges } => {
                let values = Self::raw(handle, table, column)?;
                let mut counts = vec![0.0; edges.len().saturating_sub(1)];
                for value in values {
                    if let Some(bin) = edges
                        .windows(2)
                        .position(|pair| *value >= pair[0] && *value < pair[1])
                    {
                        counts[bin] += 1.0;
                    }
                }
                Ok(TrueAnswer::Vector(counts))
            }
            QueryKind::Indicator { column, threshold } => {
                let values = Self::raw(handle, table, column)?;
                Ok(TrueAnswer::Binary(
                    values.iter().any(|value| value > threshold),
                ))
            }
            QueryKind::Declared { .. } => {
                let evaluator = self
                    .declared
                    .read()
                    .get(&request.label)
                    .cloned()
                    .ok_or_else(|| EvaluationError::MissingEvaluator(request.label.clone()))?;
                evaluator(table)
            }
        }
    }
}
