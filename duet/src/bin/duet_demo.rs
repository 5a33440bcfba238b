use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use duet::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "duet-demo", about = "Runs private queries against a synthetic dataset")]
struct Args {
    /// TOML or YAML engine config; built-in defaults when omitted.
    #[arg(long, env = "DUET_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "auto")]
    format: ConfigFormat,

    #[arg(long, default_value_t = 500)]
    rows: usize,

    /// Epsilon charged per query.
    #[arg(long, default_value_t = 0.25)]
    epsilon: f64,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json: bool,
}

fn synth_table(rows: usize, rng: &mut ChaCha20Rng) -> InMemoryTable {
    let ages = (0..rows).map(|_| rng.gen_range(18.0..95.0)).collect();
    let visits = (0..rows).map(|_| rng.gen_range(0.0..14.0f64).floor()).collect();
    InMemoryTable::new(rows)
        .with_column("age", ages)
        .with_column("visits", visits)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if args.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match &args.config {
        Some(path) => load_config(path, args.format)?,
        None => DuetConfig::default(),
    };

    let mut rng = ChaCha20Rng::seed_from_u64(config.mechanism.noise_seed.unwrap_or(1));
    let handle = DatasetHandle::new(
        "synthetic-clinic",
        DatasetSchema::new()
            .with_bounded_column("age", 0.0, 100.0)
            .with_bounded_column("visits", 0.0, 12.0),
    )
    .with_row_bound(args.rows as u64);
    let kernel = InMemoryKernel::new();
    kernel.insert_table(handle.id.clone(), synth_table(args.rows, &mut rng));

    let engine = PrivacyEngine::new(config, Arc::new(kernel))?;
    let queries = [
        QueryRequest::new("patients", QueryKind::Count),
        QueryRequest::new(
            "mean-age",
            QueryKind::Mean {
                column: "age".into(),
            },
        ),
        QueryRequest::new(
            "age-bands",
            QueryKind::Histogram {
                column: "age".into(),
                edges: vec![0.0, 30.0, 50.0, 70.0, 100.0],
            },
        ),
        QueryRequest::new(
            "frequent-visitors",
            QueryKind::Indicator {
                column: "visits".into(),
                threshold: 10.0,
            },
        ),
        QueryRequest::new(
            "total-visits",
            QueryKind::Sum {
                column: "visits".into(),
            },
        ),
    ];

    let cost = PrivacyCost::pure(args.epsilon)?;
    for request in queries.iter().cycle().take(queries.len() * 2) {
        match engine.run_query(&handle, request, cost) {
            Ok(outcome) => println!("{}", serde_json::to_string(&outcome.record)?),
            Err(err) if err.is_budget_exceeded() => {
                warn!("query refused label={} reason={}", request.label, err);
                break;
            }
            Err(err) => return Err(err.into()),
        }
    }

    if let Some(snapshot) = engine.close_dataset(&handle)? {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    let telemetry = engine.telemetry().flush();
    for (name, value) in &telemetry.counters {
        info!("telemetry counter name={} value={}", name, value);
    }
    for (name, summary) in &telemetry.latencies_ms {
        info!(
            "telemetry latency name={} count={} p95_ms={}",
            name, summary.count, summary.p95
        );
    }
    Ok(())
}
