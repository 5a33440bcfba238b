//! duet: differential-privacy budget accounting and noise calibration.
//!
//! Analysts submit queries against a [`DatasetHandle`]. Each query carries a
//! requested [`PrivacyCost`]; the engine bounds its sensitivity from the
//! public schema, reserves the cost on the dataset's [`PrivacyLedger`], asks
//! the [`NumericKernel`] for the exact answer, noises it and only then commits
//! the charge. Anything that fails after the reservation releases it.
//!
//! ```text
//! run_query ─► select mechanism ─► describe sensitivity ─► ledger.reserve
//!                                                              │
//!   answer ◄─ ledger.commit ◄─ mechanism::apply ◄─ kernel.evaluate
//! ```

pub mod composition;
pub mod config;
pub mod cost;
pub mod dataset;
pub mod errors;
pub mod journal;
pub mod kernel;
pub mod ledger;
pub mod mechanism;
pub mod sensitivity;
pub mod session;

pub use crate::composition::{cumulative_cost, remaining_for, CompositionMode};
pub use crate::config::{load_config, ConfigError, ConfigFormat, DuetConfig};
pub use crate::cost::{CostError, PrivacyCost};
pub use crate::dataset::{ColumnBounds, DatasetHandle, DatasetId, DatasetSchema};
pub use crate::errors::{DuetError, DuetResult};
pub use crate::journal::{JsonLinesJournal, LedgerJournal, MemoryJournal, NoopJournal};
pub use crate::kernel::{EvaluationError, InMemoryKernel, InMemoryTable, NumericKernel};
pub use crate::ledger::{LedgerError, LedgerSnapshot, LedgerState, PrivacyLedger, QueryId};
pub use crate::mechanism::{MechanismKind, NoisedAnswer, TrueAnswer};
pub use crate::sensitivity::{QueryKind, SensitivityDescriptor, SensitivityMetric};
pub use crate::session::{PrivacyEngine, QueryOutcome, QueryRecord, QueryRequest};
