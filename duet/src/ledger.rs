//! Per-dataset privacy ledger: the single owner of mutable budget state.
//!
//! Admission, commit and abort all take the ledger's own lock, so two
//! sessions can never both pass the admission check against the same
//! remaining budget. Ledgers for different datasets share nothing.

use std::{collections::BTreeMap, fmt, sync::Arc};

use blake3::Hasher;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    composition::{self, CompositionError, CompositionMode},
    cost::{CostError, PrivacyCost},
    dataset::DatasetId,
    journal::{JournalError, JournalRecord, LedgerJournal},
    mechanism::MechanismKind,
    sensitivity::SensitivityDescriptor,
};

pub const DEFAULT_EXHAUSTION_FLOOR: f64 = 1e-9;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(pub [u8; 32]);

impl QueryId {
    pub fn derive(dataset: &str, label: &str, nonce: u64) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(dataset.as_bytes());
        hasher.update(&[0]);
        hasher.update(label.as_bytes());
        hasher.update(&nonce.to_le_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn random(dataset: &str, label: &str) -> Self {
        Self::derive(dataset, label, rand::thread_rng().next_u64())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..16])
    }
}

impl fmt::Debug for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryId({})", self.to_hex())
    }
}

impl Serialize for QueryId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for QueryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| de::Error::custom("query id must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    Active,
    /// Terminal: no further chargeable query is admitted.
    Exhausted,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    InvalidCost(#[from] CostError),
    #[error(transparent)]
    Composition(#[from] CompositionError),
    #[error("invalid total budget {budget}: {reason}")]
    InvalidBudget {
        budget: PrivacyCost,
        reason: &'static str,
    },
    #[error(
        "privacy budget exceeded on dataset {dataset}: requested {requested}, remaining {remaining}"
    )]
    BudgetExceeded {
        dataset: DatasetId,
        requested: PrivacyCost,
        remaining: PrivacyCost,
    },
    #[error(
        "composition mode for dataset {dataset} is locked to {current}; refusing switch to {requested}"
    )]
    CompositionModeLocked {
        dataset: DatasetId,
        current: CompositionMode,
        requested: CompositionMode,
    },
    #[error("reservation {seq} is not pending on dataset {dataset}")]
    UnknownReservation { dataset: DatasetId, seq: u64 },
    #[error("dataset {dataset} still has {pending} pending reservation(s)")]
    ReservationsPending { dataset: DatasetId, pending: usize },
    #[error("ledger for dataset {dataset} is closed")]
    Closed { dataset: DatasetId },
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// What the ledger remembers about a charge. No answers, true or noised.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub query_id: QueryId,
    pub cost: PrivacyCost,
    pub mechanism: MechanismKind,
    /// `None` for entries replayed from a journal.
    pub sensitivity: Option<SensitivityDescriptor>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct ReservationMeta {
    pub query_id: QueryId,
    pub mechanism: MechanismKind,
    pub sensitivity: Option<SensitivityDescriptor>,
}

/// Proof of a provisional charge. Consumed by exactly one `commit` or `abort`.
#[derive(Debug)]
#[must_use = "a reservation must be committed or aborted"]
pub struct ReservationToken {
    dataset_id: DatasetId,
    seq: u64,
    cost: PrivacyCost,
}

impl ReservationToken {
    pub fn dataset_id(&self) -> &DatasetId {
        &self.dataset_id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn cost(&self) -> PrivacyCost {
        self.cost
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommitReceipt {
    pub entry: LedgerEntry,
    /// This commit moved the ledger into `Exhausted`.
    pub exhausted: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub dataset_id: DatasetId,
    pub state: LedgerState,
    pub composition: CompositionMode,
    pub total_budget: PrivacyCost,
    pub spent: PrivacyCost,
    pub remaining: PrivacyCost,
    pub committed_queries: usize,
    pub pending_reservations: usize,
}

struct LedgerInner {
    state: LedgerState,
    history: Vec<LedgerEntry>,
    pending: BTreeMap<u64, LedgerEntry>,
    next_seq: u64,
    closed: bool,
}

impl LedgerInner {
    fn charged(&self) -> impl Iterator<Item = &PrivacyCost> {
        self.history
            .iter()
            .map(|entry| &entry.cost)
            .chain(self.pending.values().map(|entry| &entry.cost))
    }

    fn open(
        &mut self,
        dataset_id: &DatasetId,
        cost: PrivacyCost,
        meta: ReservationMeta,
    ) -> ReservationToken {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(
            seq,
            LedgerEntry {
                seq,
                query_id: meta.query_id,
                cost,
                mechanism: meta.mechanism,
                sensitivity: meta.sensitivity,
                timestamp: Utc::now(),
            },
        );
        ReservationToken {
            dataset_id: dataset_id.clone(),
            seq,
            cost,
        }
    }
}

pub struct PrivacyLedger {
    dataset_id: DatasetId,
    total_budget: PrivacyCost,
    composition: CompositionMode,
    exhaustion_floor: f64,
    journal: Arc<dyn LedgerJournal>,
    inner: Mutex<LedgerInner>,
}

impl fmt::Debug for PrivacyLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivacyLedger")
            .field("dataset_id", &self.dataset_id)
            .field("total_budget", &self.total_budget)
            .field("composition", &self.composition)
            .finish_non_exhaustive()
    }
}

impl PrivacyLedger {
    pub fn new(
        dataset_id: DatasetId,
        total_budget: PrivacyCost,
        mode: CompositionMode,
        journal: Arc<dyn LedgerJournal>,
    ) -> Result<Self, LedgerError> {
        total_budget.validate()?;
        if total_budget.epsilon <= 0.0 {
            return Err(LedgerError::InvalidBudget {
                budget: total_budget,
                reason: "total epsilon must be > 0",
            });
        }
        mode.validate()?;
        if mode.slack() > 0.0 && mode.slack() >= total_budget.delta {
            return Err(LedgerError::InvalidBudget {
                budget: total_budget,
                reason: "advanced composition slack must be smaller than the delta budget",
            });
        }
        info!(
            "ledger created dataset={} budget={} composition={}",
            dataset_id, total_budget, mode
        );
        Ok(Self {
            dataset_id,
            total_budget,
            composition: mode,
            exhaustion_floor: DEFAULT_EXHAUSTION_FLOOR,
            journal,
            inner: Mutex::new(LedgerInner {
                state: LedgerState::Active,
                history: Vec::new(),
                pending: BTreeMap::new(),
                next_seq: 0,
                closed: false,
            }),
        })
    }

    /// Rebuilds a ledger from the records its journal holds for `dataset_id`.
    pub fn restore(
        dataset_id: DatasetId,
        total_budget: PrivacyCost,
        mode: CompositionMode,
        journal: Arc<dyn LedgerJournal>,
    ) -> Result<Self, LedgerError> {
        let mut records = journal.load(&dataset_id)?;
        let ledger = Self::new(dataset_id, total_budget, mode, journal)?;
        if records.is_empty() {
            return Ok(ledger);
        }
        records.sort_by_key(|record| record.seq);
        {
            let mut inner = ledger.inner.lock();
            for record in records {
                let cost = PrivacyCost::new(record.epsilon, record.delta)?;
                inner.next_seq = inner.next_seq.max(record.seq + 1);
                inner.history.push(LedgerEntry {
                    seq: record.seq,
                    query_id: record.query_id,
                    cost,
                    mechanism: record.mechanism,
                    sensitivity: None,
                    timestamp: record.timestamp,
                });
            }
            let spent = composition::cumulative_cost(mode, inner.charged());
            if !spent.fits_within(&ledger.total_budget) {
                warn!(
                    "ledger restored over budget dataset={} spent={} budget={}",
                    ledger.dataset_id, spent, ledger.total_budget
                );
                inner.state = LedgerState::Exhausted;
            }
            ledger.refresh_state(&mut inner);
            info!(
                "ledger restored dataset={} entries={} spent={}",
                ledger.dataset_id,
                inner.history.len(),
                spent
            );
        }
        Ok(ledger)
    }

    pub fn with_exhaustion_floor(mut self, floor: f64) -> Self {
        self.exhaustion_floor = floor.max(0.0);
        {
            let mut inner = self.inner.lock();
            self.refresh_state(&mut inner);
        }
        self
    }

    pub fn dataset_id(&self) -> &DatasetId {
        &self.dataset_id
    }

    pub fn total_budget(&self) -> PrivacyCost {
        self.total_budget
    }

    pub fn composition(&self) -> CompositionMode {
        self.composition
    }

    /// The composition mode is fixed for the ledger's lifetime. Re-asserting
    /// the current mode is accepted; anything else is refused.
    pub fn set_composition(&self, mode: CompositionMode) -> Result<(), LedgerError> {
        if mode == self.composition {
            return Ok(());
        }
        Err(LedgerError::CompositionModeLocked {
            dataset: self.dataset_id.clone(),
            current: self.composition,
            requested: mode,
        })
    }

    pub fn state(&self) -> LedgerState {
        self.inner.lock().state
    }

    pub fn reserve(
        &self,
        cost: PrivacyCost,
        meta: ReservationMeta,
    ) -> Result<ReservationToken, LedgerError> {
        cost.validate()?;
        let mut inner = self.inner.lock();

        if inner.closed {
            return Err(LedgerError::Closed {
                dataset: self.dataset_id.clone(),
            });
        }
        if cost.is_zero() {
            return Ok(inner.open(&self.dataset_id, cost, meta));
        }

        if !cost.fits_within(&self.total_budget) {
            warn!(
                "ledger rejected oversized query dataset={} requested={} budget={}",
                self.dataset_id, cost, self.total_budget
            );
            return Err(self.exceeded(&inner, cost));
        }
        if inner.state == LedgerState::Exhausted {
            warn!(
                "ledger rejected query on exhausted budget dataset={} requested={}",
                self.dataset_id, cost
            );
            return Err(self.exceeded(&inner, cost));
        }
        let projected =
            composition::cumulative_cost(self.composition, inner.charged().chain([&cost]));
        if !projected.fits_within(&self.total_budget) {
            warn!(
                "ledger rejected query dataset={} requested={} projected={} budget={}",
                self.dataset_id, cost, projected, self.total_budget
            );
            return Err(self.exceeded(&inner, cost));
        }

        let token = inner.open(&self.dataset_id, cost, meta);
        info!(
            "ledger reserved dataset={} seq={} cost={} projected={}",
            self.dataset_id, token.seq, cost, projected
        );
        Ok(token)
    }

    /// Makes a reservation permanent and persists it. If the journal write
    /// fails the charge still stands in memory and the error is returned.
    pub fn commit(&self, token: ReservationToken) -> Result<CommitReceipt, LedgerError> {
        let mut inner = self.inner.lock();
        let mut entry = self.take_pending(&mut inner, &token)?;
        entry.timestamp = Utc::now();
        inner.history.push(entry.clone());
        let persisted = self
            .journal
            .append(&JournalRecord::from_entry(&self.dataset_id, &entry));
        let was_active = inner.state == LedgerState::Active;
        self.refresh_state(&mut inner);
        info!(
            "ledger committed dataset={} seq={} query={} cost={}",
            self.dataset_id, entry.seq, entry.query_id, entry.cost
        );
        persisted?;
        Ok(CommitReceipt {
            exhausted: was_active && inner.state == LedgerState::Exhausted,
            entry,
        })
    }

    /// Drops a reservation without charging anything.
    pub fn abort(&self, token: ReservationToken) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        let entry = self.take_pending(&mut inner, &token)?;
        warn!(
            "ledger aborted reservation dataset={} seq={} query={} cost={}",
            self.dataset_id, entry.seq, entry.query_id, entry.cost
        );
        Ok(())
    }

    /// Total budget minus the composed cost of committed and pending charges.
    pub fn remaining(&self) -> PrivacyCost {
        let inner = self.inner.lock();
        self.remaining_locked(&inner)
    }

    /// Composed cost of committed charges only.
    pub fn spent(&self) -> PrivacyCost {
        let inner = self.inner.lock();
        composition::cumulative_cost(
            self.composition,
            inner.history.iter().map(|entry| &entry.cost),
        )
    }

    /// Largest per-query cost that still admits `k` more identical queries.
    pub fn remaining_for(&self, k: usize) -> PrivacyCost {
        let inner = self.inner.lock();
        let charged: Vec<PrivacyCost> = inner.charged().copied().collect();
        composition::remaining_for(self.composition, &self.total_budget, &charged, k)
    }

    pub fn history(&self) -> Vec<LedgerEntry> {
        self.inner.lock().history.clone()
    }

    pub fn pending_reservations(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let inner = self.inner.lock();
        self.snapshot_locked(&inner)
    }

    /// Stops admitting reservations and returns the final snapshot. Refused
    /// while any reservation is pending, so no in-flight charge can land on a
    /// ledger that is no longer registered.
    pub fn close(&self) -> Result<LedgerSnapshot, LedgerError> {
        let mut inner = self.inner.lock();
        if !inner.pending.is_empty() {
            return Err(LedgerError::ReservationsPending {
                dataset: self.dataset_id.clone(),
                pending: inner.pending.len(),
            });
        }
        inner.closed = true;
        Ok(self.snapshot_locked(&inner))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn snapshot_locked(&self, inner: &LedgerInner) -> LedgerSnapshot {
        LedgerSnapshot {
            dataset_id: self.dataset_id.clone(),
            state: inner.state,
            composition: self.composition,
            total_budget: self.total_budget,
            spent: composition::cumulative_cost(
                self.composition,
                inner.history.iter().map(|entry| &entry.cost),
            ),
            remaining: self.remaining_locked(inner),
            committed_queries: inner.history.len(),
            pending_reservations: inner.pending.len(),
        }
    }

    fn exceeded(&self, inner: &LedgerInner, requested: PrivacyCost) -> LedgerError {
        LedgerError::BudgetExceeded {
            dataset: self.dataset_id.clone(),
            requested,
            remaining: self.remaining_locked(inner),
        }
    }

    fn remaining_locked(&self, inner: &LedgerInner) -> PrivacyCost {
        let composed = composition::cumulative_cost(self.composition, inner.charged());
        self.total_budget.saturating_sub(&composed)
    }

    fn take_pending(
        &self,
        inner: &mut LedgerInner,
        token: &ReservationToken,
    ) -> Result<LedgerEntry, LedgerError> {
        let unknown = || LedgerError::UnknownReservation {
            dataset: self.dataset_id.clone(),
            seq: token.seq,
        };
        if token.dataset_id != self.dataset_id {
            return Err(unknown());
        }
        inner.pending.remove(&token.seq).ok_or_else(unknown)
    }

    /// Exhaustion only looks at committed history; pending charges may still abort.
    fn refresh_state(&self, inner: &mut LedgerInner) {
        if inner.state == LedgerState::Exhausted {
            return;
        }
        let spent = composition::cumulative_cost(
            self.composition,
            inner.history.iter().map(|entry| &entry.cost),
        );
        let remaining = self.total_budget.saturating_sub(&spent);
        if remaining.epsilon <= self.exhaustion_floor {
            inner.state = LedgerState::Exhausted;
            warn!(
                "ledger exhausted dataset={} spent={} budget={}",
                self.dataset_id, spent, self.total_budget
            );
        }
    }
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use crate::journal::NoopJournal;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn admitted_queries_never_overspend(
            total in 0.5..5.0f64,
            requests in proptest::collection::vec((0.01..1.5f64, any::<bool>()), 1..60),
            advanced in any::<bool>(),
        ) {
            let mode = if advanced {
                CompositionMode::Advanced { slack: 1e-7 }
            } else {
                CompositionMode::Basic
            };
            let budget = PrivacyCost::new(total, 1e-5).unwrap();
            let ledger = PrivacyLedger::new(
                DatasetId::new("prop"),
                budget,
                mode,
                Arc::new(NoopJournal),
            )
            .unwrap();
            for (i, (epsilon, commit)) in requests.into_iter().enumerate() {
                let meta = ReservationMeta {
                    query_id: QueryId::derive("prop", "q", i as u64),
                    mechanism: MechanismKind::Laplace,
                    sensitivity: None,
                };
                if let Ok(token) = ledger.reserve(PrivacyCost { epsilon, delta: 0.0 }, meta) {
                    if commit {
                        ledger.commit(token).unwrap();
                    } else {
                        ledger.abort(token).unwrap();
                    }
                }
                prop_assert!(ledger.spent().fits_within(&budget));
                prop_assert_eq!(ledger.pending_reservations(), 0);
            }
        }
    }
}
