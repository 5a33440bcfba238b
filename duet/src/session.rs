//! Query orchestration: select, describe, reserve, evaluate, noise, commit.
//!
//! The only place a [`TrueAnswer`] exists is between kernel evaluation and
//! [`mechanism::apply`], both inside [`PrivacyEngine::run_query`].

use std::{sync::Arc, time::Instant};

use dashmap::{mapref::entry::Entry, DashMap};
use duet_telemetry::TelemetryHandle;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    composition::CompositionMode,
    config::DuetConfig,
    cost::PrivacyCost,
    dataset::{DatasetHandle, DatasetId},
    errors::{DuetError, DuetResult},
    journal::{JsonLinesJournal, LedgerJournal, NoopJournal},
    kernel::NumericKernel,
    ledger::{
        CommitReceipt, LedgerError, LedgerSnapshot, LedgerState, PrivacyLedger, QueryId,
        ReservationMeta, ReservationToken,
    },
    mechanism::{self, MechanismKind, NoisedAnswer, TrueAnswer},
    sensitivity::{QueryKind, SensitivityDescriptor},
};

pub const METRIC_ADMITTED: &str = "queries.admitted";
pub const METRIC_REJECTED: &str = "queries.rejected";
pub const METRIC_ABORTED: &str = "reservations.aborted";
pub const METRIC_EXHAUSTED: &str = "ledgers.exhausted";
pub const METRIC_QUERY_LATENCY: &str = "query.total";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Caller label; also the lookup key for declared-query evaluators.
    pub label: String,
    pub kind: QueryKind,
    /// Explicit mechanism; inferred from the query and cost when `None`.
    #[serde(default)]
    pub mechanism: Option<MechanismKind>,
}

impl QueryRequest {
    pub fn new(label: impl Into<String>, kind: QueryKind) -> Self {
        Self {
            label: label.into(),
            kind,
            mechanism: None,
        }
    }

    pub fn with_mechanism(mut self, mechanism: MechanismKind) -> Self {
        self.mechanism = Some(mechanism);
        self
    }
}

/// What the caller gets back about a released query. Never holds the true answer.
///
/// Only built for admitted queries; refusals surface as errors instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub query_id: QueryId,
    pub dataset_id: DatasetId,
    pub label: String,
    pub seq: u64,
    pub mechanism: MechanismKind,
    pub sensitivity: SensitivityDescriptor,
    pub requested: PrivacyCost,
    pub noised_answer: NoisedAnswer,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub record: QueryRecord,
    pub remaining: PrivacyCost,
    pub ledger_state: LedgerState,
}

impl QueryOutcome {
    pub fn answer(&self) -> &NoisedAnswer {
        &self.record.noised_answer
    }
}

/// Holds a reservation for the duration of one query and aborts it on drop
/// unless [`ChargeGuard::commit`] ran.
#[must_use = "dropping the guard aborts the reservation"]
pub struct ChargeGuard<'a> {
    ledger: &'a PrivacyLedger,
    telemetry: &'a TelemetryHandle,
    seq: u64,
    token: Option<ReservationToken>,
}

impl<'a> ChargeGuard<'a> {
    pub fn new(
        ledger: &'a PrivacyLedger,
        token: ReservationToken,
        telemetry: &'a TelemetryHandle,
    ) -> Self {
        Self {
            ledger,
            telemetry,
            seq: token.seq(),
            token: Some(token),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn commit(mut self) -> Result<CommitReceipt, LedgerError> {
        match self.token.take() {
            Some(token) => self.ledger.commit(token),
            None => Err(LedgerError::UnknownReservation {
                dataset: self.ledger.dataset_id().clone(),
                seq: self.seq,
            }),
        }
    }
}

impl Drop for ChargeGuard<'_> {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        match self.ledger.abort(token) {
            Ok(()) => bump(self.telemetry, METRIC_ABORTED),
            Err(err) => warn!(
                "charge guard failed to abort dataset={} seq={} error={}",
                self.ledger.dataset_id(),
                self.seq,
                err
            ),
        }
    }
}

fn bump(telemetry: &TelemetryHandle, metric: &str) {
    if let Err(err) = telemetry.record_counter(metric, 1) {
        warn!("telemetry counter failed metric={} error={}", metric, err);
    }
}

/// Registry of per-dataset ledgers plus the collaborators every query needs.
pub struct PrivacyEngine {
    config: DuetConfig,
    ledgers: DashMap<DatasetId, Arc<PrivacyLedger>>,
    journal: Arc<dyn LedgerJournal>,
    kernel: Arc<dyn NumericKernel>,
    telemetry: TelemetryHandle,
    rng: Mutex<ChaCha20Rng>,
}

impl PrivacyEngine {
    /// Opens the configured journal (if any) and builds the engine.
    pub fn new(config: DuetConfig, kernel: Arc<dyn NumericKernel>) -> DuetResult<Self> {
        let journal: Arc<dyn LedgerJournal> = match &config.journal.path {
            Some(path) => Arc::new(JsonLinesJournal::open(path)?),
            None => Arc::new(NoopJournal),
        };
        Self::with_journal(config, kernel, journal)
    }

    pub fn with_journal(
        config: DuetConfig,
        kernel: Arc<dyn NumericKernel>,
        journal: Arc<dyn LedgerJournal>,
    ) -> DuetResult<Self> {
        config.validate()?;
        let rng = match config.mechanism.noise_seed {
            Some(seed) => {
                warn!("noise rng seeded from config seed={}", seed);
                ChaCha20Rng::seed_from_u64(seed)
            }
            None => ChaCha20Rng::from_entropy(),
        };
        let telemetry = TelemetryHandle::from_config(config.telemetry.clone());
        info!(
            "privacy engine ready composition={} default_budget={}",
            config.ledger.composition,
            config.ledger.default_budget()
        );
        Ok(Self {
            config,
            ledgers: DashMap::new(),
            journal,
            kernel,
            telemetry,
            rng: Mutex::new(rng),
        })
    }

    pub fn config(&self) -> &DuetConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &TelemetryHandle {
        &self.telemetry
    }

    /// Creates the dataset's ledger with an explicit budget, replaying any
    /// journaled history. Fails if the dataset already has a ledger.
    pub fn register_dataset(
        &self,
        handle: &DatasetHandle,
        budget: PrivacyCost,
        mode: CompositionMode,
    ) -> DuetResult<Arc<PrivacyLedger>> {
        match self.ledgers.entry(handle.id.clone()) {
            Entry::Occupied(_) => Err(DuetError::DatasetAlreadyRegistered(handle.id.clone())),
            Entry::Vacant(slot) => {
                let ledger = Arc::new(self.open_ledger(&handle.id, budget, mode)?);
                slot.insert(ledger.clone());
                Ok(ledger)
            }
        }
    }

    pub fn ledger(&self, dataset: &DatasetId) -> Option<Arc<PrivacyLedger>> {
        self.ledgers.get(dataset).map(|entry| entry.value().clone())
    }

    /// Remaining budget for the handle's dataset, creating its ledger from
    /// config defaults if this is the first contact.
    pub fn remaining_budget(&self, handle: &DatasetHandle) -> DuetResult<PrivacyCost> {
        Ok(self.ledger_for(handle)?.remaining())
    }

    pub fn snapshot(&self, handle: &DatasetHandle) -> Option<LedgerSnapshot> {
        self.ledger(&handle.id).map(|ledger| ledger.snapshot())
    }

    /// Drops the dataset's ledger. Journaled history survives and is replayed
    /// if the dataset is used again. Refused while a query on the dataset
    /// holds a reservation; `Ok(None)` when the dataset has no ledger.
    pub fn close_dataset(&self, handle: &DatasetHandle) -> DuetResult<Option<LedgerSnapshot>> {
        let Some(ledger) = self.ledger(&handle.id) else {
            return Ok(None);
        };
        let snapshot = ledger.close().map_err(|err| {
            warn!("ledger close refused dataset={} error={}", handle.id, err);
            err
        })?;
        self.ledgers
            .remove_if(&handle.id, |_, current| Arc::ptr_eq(current, &ledger));
        info!(
            "ledger closed dataset={} spent={} committed={}",
            handle.id, snapshot.spent, snapshot.committed_queries
        );
        Ok(Some(snapshot))
    }

    pub fn run_query(
        &self,
        handle: &DatasetHandle,
        request: &QueryRequest,
        cost: PrivacyCost,
    ) -> DuetResult<QueryOutcome> {
        let started = Instant::now();
        let result = self.execute(handle, request, cost);
        match &result {
            Ok(_) => bump(&self.telemetry, METRIC_ADMITTED),
            Err(err) if err.is_budget_exceeded() || err.is_invalid_cost() => {
                bump(&self.telemetry, METRIC_REJECTED)
            }
            Err(_) => {}
        }
        let elapsed = started.elapsed().as_millis() as u64;
        if let Err(err) = self
            .telemetry
            .record_latency_ms(METRIC_QUERY_LATENCY, elapsed)
        {
            warn!("telemetry latency failed error={}", err);
        }
        result
    }

    fn execute(
        &self,
        handle: &DatasetHandle,
        request: &QueryRequest,
        cost: PrivacyCost,
    ) -> DuetResult<QueryOutcome> {
        let mechanism = MechanismKind::select(request.mechanism, &request.kind, &cost);
        mechanism.validate(&cost)?;
        let descriptor = SensitivityDescriptor::describe(
            &request.kind,
            &handle.schema,
            handle.row_bound,
            mechanism.metric(),
        )?;

        let query_id = QueryId::random(handle.id.as_str(), &request.label);
        let meta = ReservationMeta {
            query_id,
            mechanism,
            sensitivity: Some(descriptor),
        };
        let mut ledger = self.ledger_for(handle)?;
        let reserved = ledger.reserve(cost, meta.clone());
        let token = match reserved {
            // Raced a close; the replacement ledger replays the journal.
            Err(LedgerError::Closed { .. }) => {
                self.ledgers
                    .remove_if(&handle.id, |_, current| Arc::ptr_eq(current, &ledger));
                ledger = self.ledger_for(handle)?;
                ledger.reserve(cost, meta)?
            }
            reserved => reserved?,
        };
        let guard = ChargeGuard::new(&ledger, token, &self.telemetry);

        let answer = self
            .kernel
            .evaluate(request, handle)
            .map_err(|err| DuetError::MechanismFailure {
                stage: "evaluation",
                reason: err.to_string(),
            })?;
        let noised = self.noise(mechanism, answer, &descriptor, &cost)?;

        let receipt = guard.commit()?;
        if receipt.exhausted {
            bump(&self.telemetry, METRIC_EXHAUSTED);
        }
        let entry = receipt.entry;
        Ok(QueryOutcome {
            record: QueryRecord {
                query_id,
                dataset_id: handle.id.clone(),
                label: request.label.clone(),
                seq: entry.seq,
                mechanism,
                sensitivity: descriptor,
                requested: cost,
                noised_answer: noised,
            },
            remaining: ledger.remaining(),
            ledger_state: ledger.state(),
        })
    }

    fn noise(
        &self,
        mechanism: MechanismKind,
        answer: TrueAnswer,
        descriptor: &SensitivityDescriptor,
        cost: &PrivacyCost,
    ) -> DuetResult<NoisedAnswer> {
        let mut rng = self.rng.lock();
        mechanism::apply(mechanism, answer, descriptor, cost, &mut *rng).map_err(|err| {
            DuetError::MechanismFailure {
                stage: "noise",
                reason: err.to_string(),
            }
        })
    }

    fn ledger_for(&self, handle: &DatasetHandle) -> DuetResult<Arc<PrivacyLedger>> {
        if let Some(ledger) = self.ledger(&handle.id) {
            return Ok(ledger);
        }
        match self.ledgers.entry(handle.id.clone()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let ledger = Arc::new(self.open_ledger(
                    &handle.id,
                    self.config.ledger.default_budget(),
                    self.config.ledger.composition,
                )?);
                slot.insert(ledger.clone());
                Ok(ledger)
            }
        }
    }

    fn open_ledger(
        &self,
        dataset: &DatasetId,
        budget: PrivacyCost,
        mode: CompositionMode,
    ) -> DuetResult<PrivacyLedger> {
        let ledger = PrivacyLedger::restore(dataset.clone(), budget, mode, self.journal.clone())?
            .with_exhaustion_floor(self.config.ledger.exhaustion_floor);
        Ok(ledger)
    }
}
