use duet::journal::{JournalError, JournalRecord, JsonLinesJournal, LedgerJournal};
use duet::ledger::{LedgerError, ReservationMeta};
use duet::session::{METRIC_ABORTED, METRIC_ADMITTED, METRIC_EXHAUSTED, METRIC_REJECTED};
use duet::*;
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};

const ROWS: usize = 6;

fn schema() -> DatasetSchema {
    DatasetSchema::new()
        .with_bounded_column("age", 0.0, 100.0)
        .with_bounded_column("visits", 0.0, 10.0)
        .with_unbounded_column("income")
}

fn handle(id: &str) -> DatasetHandle {
    DatasetHandle::new(id, schema()).with_row_bound(ROWS as u64)
}

fn kernel_for(ids: &[&str]) -> Arc<InMemoryKernel> {
    let kernel = InMemoryKernel::new();
    for id in ids {
        kernel.insert_table(
            DatasetId::new(*id),
            InMemoryTable::new(ROWS)
                .with_column("age", vec![23.0, 35.0, 41.0, 58.0, 67.0, 102.0])
                .with_column("visits", vec![1.0, 0.0, 3.0, 7.0, 2.0, 12.0])
                .with_column("income", vec![1e4, 2e4, 3e4, 4e4, 5e4, 1e7]),
        );
    }
    Arc::new(kernel)
}

fn seeded_config() -> DuetConfig {
    let mut config = DuetConfig::default();
    config.mechanism.noise_seed = Some(2024);
    config
}

fn engine_for(ids: &[&str]) -> PrivacyEngine {
    PrivacyEngine::with_journal(seeded_config(), kernel_for(ids), Arc::new(NoopJournal)).unwrap()
}

fn pure(epsilon: f64) -> PrivacyCost {
    PrivacyCost::pure(epsilon).unwrap()
}

fn count() -> QueryRequest {
    QueryRequest::new("count", QueryKind::Count)
}

#[test]
fn unit_budget_admits_two_of_three_point_four_queries() {
    let engine = engine_for(&["clinic"]);
    let clinic = handle("clinic");

    for _ in 0..2 {
        let outcome = engine.run_query(&clinic, &count(), pure(0.4)).unwrap();
        assert_eq!(outcome.record.requested, pure(0.4));
        assert_eq!(outcome.record.mechanism, MechanismKind::Laplace);
    }

    let err = engine.run_query(&clinic, &count(), pure(0.4)).unwrap_err();
    assert!(err.is_budget_exceeded());
    match &err {
        DuetError::Ledger(LedgerError::BudgetExceeded { remaining, requested, .. }) => {
            assert!((remaining.epsilon - 0.2).abs() < 1e-12);
            assert_eq!(*requested, pure(0.4));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.to_string().contains("remaining"));

    let remaining = engine.remaining_budget(&clinic).unwrap();
    assert!((remaining.epsilon - 0.2).abs() < 1e-12);
    let snapshot = engine.snapshot(&clinic).unwrap();
    assert_eq!(snapshot.committed_queries, 2);
    assert_eq!(snapshot.pending_reservations, 0);
    assert_eq!(engine.telemetry().counter(METRIC_ADMITTED), 2);
    assert_eq!(engine.telemetry().counter(METRIC_REJECTED), 1);
}

#[test]
fn concurrent_queries_cannot_both_spend_the_last_budget() {
    for round in 0..16 {
        let id = format!("race-{round}");
        let engine = engine_for(&[id.as_str()]);
        let dataset = handle(&id);
        let barrier = Barrier::new(2);
        let (engine_ref, dataset_ref, barrier_ref) = (&engine, &dataset, &barrier);

        let results: Vec<DuetResult<QueryOutcome>> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..2)
                .map(move |_| {
                    scope.spawn(move || {
                        barrier_ref.wait();
                        engine_ref.run_query(dataset_ref, &count(), pure(0.6))
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().unwrap())
                .collect()
        });

        let admitted = results.iter().filter(|result| result.is_ok()).count();
        assert_eq!(admitted, 1, "round {round}");
        assert!(results
            .iter()
            .filter_map(|result| result.as_ref().err())
            .all(DuetError::is_budget_exceeded));
        let ledger = engine.ledger(&dataset.id).unwrap();
        assert_eq!(ledger.history().len(), 1);
        assert!((ledger.spent().epsilon - 0.6).abs() < 1e-12);
    }
}

#[test]
fn kernel_failure_releases_the_reservation() {
    let engine = engine_for(&["clinic"]);
    let clinic = handle("clinic");
    engine.run_query(&clinic, &count(), pure(0.3)).unwrap();
    let before = engine.remaining_budget(&clinic).unwrap();

    let misdeclared = DatasetHandle::new("clinic", schema()).with_row_bound(ROWS as u64 + 4);
    let mean = QueryRequest::new(
        "mean-age",
        QueryKind::Mean {
            column: "age".into(),
        },
    );
    let err = engine.run_query(&misdeclared, &mean, pure(0.3)).unwrap_err();
    assert!(matches!(
        err,
        DuetError::MechanismFailure {
            stage: "evaluation",
            ..
        }
    ));

    assert_eq!(engine.remaining_budget(&clinic).unwrap(), before);
    let ledger = engine.ledger(&clinic.id).unwrap();
    assert_eq!(ledger.history().len(), 1);
    assert_eq!(ledger.pending_reservations(), 0);
    assert_eq!(engine.telemetry().counter(METRIC_ABORTED), 1);
}

#[test]
fn noise_failure_releases_the_reservation() {
    let engine = engine_for(&["clinic"]);
    let clinic = handle("clinic");
    let before = engine.remaining_budget(&clinic).unwrap();

    // Randomized response cannot noise a numeric count.
    let mismatched = count().with_mechanism(MechanismKind::RandomizedResponse);
    let err = engine.run_query(&clinic, &mismatched, pure(0.3)).unwrap_err();
    assert!(matches!(err, DuetError::MechanismFailure { stage: "noise", .. }));
    assert!(!err.is_budget_exceeded());

    assert_eq!(engine.remaining_budget(&clinic).unwrap(), before);
    let ledger = engine.ledger(&clinic.id).unwrap();
    assert!(ledger.history().is_empty());
    assert_eq!(ledger.pending_reservations(), 0);
    assert_eq!(engine.telemetry().counter(METRIC_ABORTED), 1);
    assert_eq!(engine.telemetry().counter(METRIC_ADMITTED), 0);
}

struct FailingJournal;

impl LedgerJournal for FailingJournal {
    fn append(&self, _record: &JournalRecord) -> Result<(), JournalError> {
        Err(JournalError::Io {
            path: "/var/lib/duet/ledger.jsonl".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        })
    }

    fn load(&self, _dataset_id: &DatasetId) -> Result<Vec<JournalRecord>, JournalError> {
        Ok(Vec::new())
    }
}

#[test]
fn journal_failure_keeps_the_charge_and_withholds_the_answer() {
    let engine = PrivacyEngine::with_journal(
        seeded_config(),
        kernel_for(&["clinic"]),
        Arc::new(FailingJournal),
    )
    .unwrap();
    let clinic = handle("clinic");

    let err = engine.run_query(&clinic, &count(), pure(0.4)).unwrap_err();
    assert!(matches!(err, DuetError::Ledger(LedgerError::Journal(_))));
    assert!(err.to_string().contains("disk full"));

    let ledger = engine.ledger(&clinic.id).unwrap();
    assert!((ledger.spent().epsilon - 0.4).abs() < 1e-12);
    assert_eq!(ledger.history().len(), 1);
    assert_eq!(ledger.pending_reservations(), 0);
    assert_eq!(engine.telemetry().counter(METRIC_ABORTED), 0);
    assert_eq!(engine.telemetry().counter(METRIC_ADMITTED), 0);
}

#[test]
fn close_dataset_waits_for_in_flight_reservations() {
    let engine = engine_for(&["clinic"]);
    let clinic = handle("clinic");
    engine.run_query(&clinic, &count(), pure(0.2)).unwrap();
    let ledger = engine.ledger(&clinic.id).unwrap();
    let held = ledger
        .reserve(
            pure(0.3),
            ReservationMeta {
                query_id: QueryId::derive("clinic", "held", 0),
                mechanism: MechanismKind::Laplace,
                sensitivity: None,
            },
        )
        .unwrap();

    let err = engine.close_dataset(&clinic).unwrap_err();
    assert!(matches!(
        err,
        DuetError::Ledger(LedgerError::ReservationsPending { pending: 1, .. })
    ));
    assert!(engine.snapshot(&clinic).is_some());

    ledger.abort(held).unwrap();
    let closed = engine.close_dataset(&clinic).unwrap().unwrap();
    assert_eq!(closed.committed_queries, 1);
    assert_eq!(closed.pending_reservations, 0);
    assert!(engine.snapshot(&clinic).is_none());
}

struct BrokenKernel;

impl NumericKernel for BrokenKernel {
    fn evaluate(
        &self,
        _request: &QueryRequest,
        _handle: &DatasetHandle,
    ) -> Result<TrueAnswer, EvaluationError> {
        Err(EvaluationError::Failed("storage offline".into()))
    }
}

#[test]
fn custom_kernel_failures_never_charge() {
    let engine =
        PrivacyEngine::with_journal(seeded_config(), Arc::new(BrokenKernel), Arc::new(NoopJournal))
            .unwrap();
    let clinic = handle("clinic");
    for _ in 0..5 {
        let err = engine.run_query(&clinic, &count(), pure(0.5)).unwrap_err();
        assert!(err.to_string().contains("storage offline"));
    }
    assert_eq!(engine.remaining_budget(&clinic).unwrap(), pure(1.0));
    assert_eq!(engine.telemetry().counter(METRIC_ABORTED), 5);
}

#[test]
fn invalid_costs_are_rejected_before_any_mutation() {
    let engine = engine_for(&["clinic"]);
    let clinic = handle("clinic");
    let start = engine.remaining_budget(&clinic).unwrap();

    let attempts = [
        PrivacyCost {
            epsilon: 0.0,
            delta: 0.0,
        },
        PrivacyCost {
            epsilon: -0.5,
            delta: 0.0,
        },
        PrivacyCost {
            epsilon: f64::NAN,
            delta: 0.0,
        },
        PrivacyCost {
            epsilon: 0.5,
            delta: 1.0,
        },
    ];
    for cost in attempts {
        let err = engine.run_query(&clinic, &count(), cost).unwrap_err();
        assert!(err.is_invalid_cost(), "{cost:?} gave {err:?}");
    }

    let ledger = engine.ledger(&clinic.id).unwrap();
    assert!(ledger.history().is_empty());
    assert_eq!(ledger.pending_reservations(), 0);
    assert_eq!(engine.remaining_budget(&clinic).unwrap(), start);
}

#[test]
fn unbounded_sensitivity_is_refused_without_reserving() {
    let engine = engine_for(&["clinic"]);
    let clinic = handle("clinic");
    let income = QueryRequest::new(
        "income-total",
        QueryKind::Sum {
            column: "income".into(),
        },
    );
    let err = engine.run_query(&clinic, &income, pure(0.5)).unwrap_err();
    assert!(matches!(err, DuetError::UnboundedSensitivity(_)));
    assert_eq!(engine.remaining_budget(&clinic).unwrap(), pure(1.0));
}

#[test]
fn gaussian_release_uses_l2_sensitivity() {
    let engine = engine_for(&["clinic"]);
    let clinic = handle("clinic");
    engine
        .register_dataset(
            &clinic,
            PrivacyCost::new(2.0, 1e-5).unwrap(),
            CompositionMode::Basic,
        )
        .unwrap();
    let visits = QueryRequest::new(
        "visits-total",
        QueryKind::Sum {
            column: "visits".into(),
        },
    );
    let outcome = engine
        .run_query(&clinic, &visits, PrivacyCost::new(0.5, 1e-6).unwrap())
        .unwrap();
    assert_eq!(outcome.record.mechanism, MechanismKind::Gaussian);
    assert_eq!(outcome.record.sensitivity.metric, SensitivityMetric::L2);
    assert_eq!(outcome.record.sensitivity.bound, 10.0);
    assert!(outcome.answer().as_scalar().is_some());
    assert!((outcome.remaining.delta - 9e-6).abs() < 1e-15);

    let too_loose = engine
        .run_query(&clinic, &visits, PrivacyCost::new(1.5, 1e-6).unwrap())
        .unwrap_err();
    assert!(too_loose.is_invalid_cost());
}

#[test]
fn histogram_and_indicator_queries_release_shaped_answers() {
    let engine = engine_for(&["clinic"]);
    let clinic = handle("clinic");
    let bins = QueryRequest::new(
        "age-bins",
        QueryKind::Histogram {
            column: "age".into(),
            edges: vec![0.0, 30.0, 60.0, 90.0],
        },
    );
    let histogram = engine.run_query(&clinic, &bins, pure(0.3)).unwrap();
    assert_eq!(histogram.answer().as_vector().map(<[f64]>::len), Some(3));

    let indicator = QueryRequest::new(
        "any-frequent",
        QueryKind::Indicator {
            column: "visits".into(),
            threshold: 5.0,
        },
    );
    let flagged = engine.run_query(&clinic, &indicator, pure(0.3)).unwrap();
    assert_eq!(flagged.record.mechanism, MechanismKind::RandomizedResponse);
    assert!(flagged.answer().as_binary().is_some());

    let geometric = count().with_mechanism(MechanismKind::Geometric);
    let noisy_count = engine.run_query(&clinic, &geometric, pure(0.3)).unwrap();
    let value = noisy_count.answer().as_scalar().unwrap();
    assert_eq!(value.fract(), 0.0);
}

#[test]
fn exhaustion_is_terminal_but_exact_zero_cost_still_runs() {
    let engine = engine_for(&["clinic"]);
    let clinic = handle("clinic");
    let outcome = engine.run_query(&clinic, &count(), pure(1.0)).unwrap();
    assert_eq!(outcome.ledger_state, LedgerState::Exhausted);
    assert_eq!(engine.telemetry().counter(METRIC_EXHAUSTED), 1);

    assert!(engine
        .run_query(&clinic, &count(), pure(0.01))
        .unwrap_err()
        .is_budget_exceeded());

    let exact = count().with_mechanism(MechanismKind::Exact);
    let released = engine.run_query(&clinic, &exact, PrivacyCost::ZERO).unwrap();
    assert_eq!(released.answer(), &NoisedAnswer::Scalar(ROWS as f64));

    // Zero cost without declaring Exact is refused.
    assert!(engine
        .run_query(&clinic, &count(), PrivacyCost::ZERO)
        .unwrap_err()
        .is_invalid_cost());
}

#[test]
fn composition_mode_cannot_change_after_creation() {
    let engine = engine_for(&["clinic"]);
    let clinic = handle("clinic");
    let ledger = engine
        .register_dataset(
            &clinic,
            PrivacyCost::new(3.0, 1e-5).unwrap(),
            CompositionMode::Advanced { slack: 1e-6 },
        )
        .unwrap();
    assert!(ledger
        .set_composition(CompositionMode::Advanced { slack: 1e-6 })
        .is_ok());
    let err = ledger.set_composition(CompositionMode::Basic).unwrap_err();
    assert!(matches!(err, LedgerError::CompositionModeLocked { .. }));
}

#[test]
fn journal_restores_spent_budget_across_engines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    let mut config = seeded_config();
    config.journal.path = Some(path.clone());
    let clinic = handle("clinic");

    {
        let engine = PrivacyEngine::new(config.clone(), kernel_for(&["clinic"])).unwrap();
        engine.run_query(&clinic, &count(), pure(0.25)).unwrap();
        engine.run_query(&clinic, &count(), pure(0.25)).unwrap();
        let closed = engine.close_dataset(&clinic).unwrap().unwrap();
        assert_eq!(closed.committed_queries, 2);
    }

    let engine = PrivacyEngine::new(config, kernel_for(&["clinic"])).unwrap();
    let remaining = engine.remaining_budget(&clinic).unwrap();
    assert!((remaining.epsilon - 0.5).abs() < 1e-12);
    assert!(engine
        .run_query(&clinic, &count(), pure(0.6))
        .unwrap_err()
        .is_budget_exceeded());

    let journal = JsonLinesJournal::open(&path).unwrap();
    let records = journal.load(&clinic.id).unwrap();
    assert_eq!(
        records.iter().map(|record| record.seq).collect::<Vec<_>>(),
        vec![0, 1]
    );

    let contents = std::fs::read_to_string(&path).unwrap();
    for line in contents.lines() {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        let keys: BTreeSet<&str> = value
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(
            keys,
            BTreeSet::from([
                "dataset_id",
                "delta",
                "epsilon",
                "mechanism",
                "query_id",
                "seq",
                "timestamp",
            ])
        );
    }
}

#[test]
fn datasets_do_not_share_budget() {
    let engine = engine_for(&["north", "south"]);
    let north = handle("north");
    let south = handle("south");
    engine.run_query(&north, &count(), pure(0.9)).unwrap();
    let outcome = engine.run_query(&south, &count(), pure(0.9)).unwrap();
    assert!((outcome.remaining.epsilon - 0.1).abs() < 1e-12);
    assert!(engine
        .run_query(&north, &count(), pure(0.2))
        .unwrap_err()
        .is_budget_exceeded());
}
