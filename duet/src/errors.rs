use duet_telemetry::TelemetryError;
use thiserror::Error;

use crate::{
    config::ConfigError,
    cost::CostError,
    dataset::DatasetId,
    journal::JournalError,
    ledger::LedgerError,
    mechanism::MechanismError,
    sensitivity::SensitivityError,
};

pub type DuetResult<T> = Result<T, DuetError>;

#[derive(Debug, Error)]
pub enum DuetError {
    #[error(transparent)]
    InvalidCost(#[from] CostError),
    #[error(transparent)]
    UnboundedSensitivity(#[from] SensitivityError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Mechanism(#[from] MechanismError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    /// Kernel or noise failure after budget was reserved; the reservation
    /// has been released.
    #[error("query failed during {stage}: {reason}")]
    MechanismFailure { stage: &'static str, reason: String },
    #[error("dataset {0} already has a ledger")]
    DatasetAlreadyRegistered(DatasetId),
}

impl DuetError {
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, DuetError::Ledger(LedgerError::BudgetExceeded { .. }))
    }

    /// True for errors that rejected a query before any budget was touched.
    pub fn is_invalid_cost(&self) -> bool {
        matches!(
            self,
            DuetError::InvalidCost(_)
                | DuetError::Ledger(LedgerError::InvalidCost(_))
                | DuetError::Mechanism(MechanismError::InvalidCost(_))
        )
    }
}
