//! `persona` command line: data prep, search, registry, retraining, scoring
//! and serving.
//!
//! Every command prints a JSON document on stdout; logs go to stderr. The
//! process exit status is the error code of the failure, 0 on success.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::warn;

use persona_core::api::{self, AppState};
use persona_core::common::config::AppCfg;
use persona_core::common::log::init_logging;
use persona_core::data::domain::{Dataset, TimeWindow};
use persona_core::data::repo_sqlite::SqliteFeatureTable;
use persona_core::data::service::{ingest_file, read_csv};
use persona_core::data::synth::{self, BlobSpec};
use persona_core::evaluation::stattest::StatTestDrift;
use persona_core::inference::batch;
use persona_core::inference::domain::{ActiveModel, Predictor};
use persona_core::inference::remote::HttpPredictor;
use persona_core::inference::service::load_active;
use persona_core::orchestration::notify;
use persona_core::orchestration::service::RetrainingOrchestrator;
use persona_core::registry::domain::ModelRegistry;
use persona_core::registry::repo_sqlite::SqliteRegistry;
use persona_core::registry::service::{promote, register_and_promote};
use persona_core::training::kmeans::KMeans;
use persona_core::training::repo_sqlite::SqliteRunHistory;
use persona_core::training::service::{search, select_best_from_history, SearchSpec};
use persona_core::{ErrorCode, PersonaError};

#[derive(Parser)]
#[command(name = "persona", version, about = "Customer persona clustering lifecycle")]
struct Cli {
    /// TOML config file; defaults and environment apply without one.
    #[arg(long, global = true, env = "PERSONA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a month of synthetic persona data as CSV.
    Synth(SynthArgs),
    /// Append a CSV file to a warehouse feature table.
    Ingest {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        table: String,
    },
    /// Train one candidate per cluster count and log them as runs.
    Search {
        #[arg(long)]
        data: PathBuf,
        /// Override `search.seed`.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Register and promote the best run recorded so far.
    RegisterBest,
    /// Promote an existing registry version.
    Promote {
        #[arg(long)]
        version: u32,
    },
    /// List registry versions.
    Versions,
    /// Drift check, then search, select, register and promote on drift.
    Retrain {
        #[arg(long)]
        reference: PathBuf,
        #[arg(long)]
        current: PathBuf,
    },
    /// Label one month of a feature table.
    BatchScore(BatchArgs),
    /// Serve `/predict`, `/health` and `/reload`.
    Serve,
}

#[derive(Args)]
struct SynthArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value_t = 3000)]
    rows: usize,
    #[arg(long, default_value_t = 1.0)]
    cluster_std: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long)]
    year: i32,
    #[arg(long)]
    month: u32,
}

#[derive(Args)]
struct BatchArgs {
    #[arg(long)]
    table: String,
    #[arg(long)]
    year: i32,
    #[arg(long)]
    month: u32,
    /// Predict in-process with the Production model instead of calling
    /// `predict.url`.
    #[arg(long)]
    local: bool,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    Ok(())
}

struct Stores {
    history: Arc<SqliteRunHistory>,
    registry: Arc<SqliteRegistry>,
}

fn open_stores(cfg: &AppCfg) -> anyhow::Result<Stores> {
    let path = cfg.tracking_db_path();
    ensure_parent(&path)?;
    Ok(Stores {
        history: Arc::new(SqliteRunHistory::open(&path)?),
        registry: Arc::new(SqliteRegistry::open(&path)?),
    })
}

fn warehouse_table(cfg: &AppCfg, table: &str, create: bool) -> anyhow::Result<SqliteFeatureTable> {
    let path = cfg.warehouse_db_path();
    ensure_parent(&path)?;
    let table = if create {
        SqliteFeatureTable::create_path(&path, table)?
    } else {
        SqliteFeatureTable::open_path(&path, table)?
    };
    Ok(table)
}

fn clusterer(cfg: &AppCfg) -> KMeans {
    KMeans::new(cfg.search.n_init, cfg.search.max_iter)
}

fn run(cli: Cli, cfg: AppCfg) -> anyhow::Result<()> {
    match cli.command {
        Command::Synth(args) => {
            let spec = BlobSpec {
                rows: args.rows,
                cluster_std: args.cluster_std,
                seed: args.seed,
                year: args.year,
                month: args.month,
            };
            let blobs = synth::generate(&spec)?;
            synth::write_csv(&args.out, &blobs.records)?;
            let dataset = Dataset::new(blobs.records);
            print_json(&serde_json::json!({
                "path": args.out,
                "dataset_id": dataset.id(),
                "rows": dataset.len(),
            }))
        }
        Command::Ingest { file, table } => {
            let table = warehouse_table(&cfg, &table, true)?;
            print_json(&ingest_file(&file, &table)?)
        }
        Command::Search { data, seed } => {
            let stores = open_stores(&cfg)?;
            let dataset = read_csv(&data)?;
            let mut spec = SearchSpec::from_cfg(cfg.experiment.clone(), &cfg.search);
            if seed.is_some() {
                spec.seed = seed;
            }
            spec.tags.insert("dataset_id".into(), dataset.id().to_string());
            let result = search(&dataset, &spec, &clusterer(&cfg), stores.history.as_ref())?;
            let candidates: Vec<_> = result
                .candidates
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "run_id": r.run_id,
                        "k": r.candidate.cluster_count(),
                        "inertia": r.candidate.inertia(),
                        "silhouette": r.candidate.silhouette(),
                        "score": r.candidate.score(),
                    })
                })
                .collect();
            print_json(&serde_json::json!({
                "parent_run_id": result.parent.run_id,
                "seed": result.parent.seed,
                "candidates": candidates,
                "skipped": result.skipped,
            }))
        }
        Command::RegisterBest => {
            let stores = open_stores(&cfg)?;
            let best = select_best_from_history(
                stores.history.as_ref(),
                &cfg.experiment,
                cfg.search.history_top_n,
            )?;
            let result = register_and_promote(stores.registry.as_ref(), &cfg.model_name, &best.run_id)?;
            print_json(&result)
        }
        Command::Promote { version } => {
            let stores = open_stores(&cfg)?;
            print_json(&promote(stores.registry.as_ref(), &cfg.model_name, version)?)
        }
        Command::Versions => {
            let stores = open_stores(&cfg)?;
            print_json(&stores.registry.list_versions(&cfg.model_name)?)
        }
        Command::Retrain { reference, current } => {
            let stores = open_stores(&cfg)?;
            let reference = read_csv(&reference)?;
            let current = read_csv(&current)?;
            let drift = StatTestDrift::new(cfg.drift.clone());
            let km = clusterer(&cfg);
            let notifier = notify::from_cfg(&cfg.notify)?;
            let mut spec = SearchSpec::from_cfg(cfg.experiment.clone(), &cfg.search);
            spec.tags.insert("dataset_id".into(), current.id().to_string());
            let orchestrator = RetrainingOrchestrator {
                drift: &drift,
                clusterer: &km,
                history: stores.history.as_ref(),
                registry: stores.registry.as_ref(),
                notifier: notifier.as_ref(),
                model_name: cfg.model_name.clone(),
                search: spec,
                history_top_n: cfg.search.history_top_n,
                no_drift_message: cfg.notify.no_drift_message.clone(),
            };
            print_json(&orchestrator.run(&reference, &current)?)
        }
        Command::BatchScore(args) => {
            let window = TimeWindow::month(args.year, args.month)?;
            let table = warehouse_table(&cfg, &args.table, false)?;
            let predictor: Box<dyn Predictor> = if args.local {
                let stores = open_stores(&cfg)?;
                Box::new(load_active(
                    stores.registry.as_ref(),
                    stores.history.as_ref(),
                    &cfg.model_name,
                )?)
            } else {
                Box::new(HttpPredictor::from_cfg(&cfg.predict)?)
            };
            print_json(&batch::run(&window, &table, predictor.as_ref())?)
        }
        Command::Serve => {
            let stores = open_stores(&cfg)?;
            let active = match load_active(
                stores.registry.as_ref(),
                stores.history.as_ref(),
                &cfg.model_name,
            ) {
                Ok(model) => ActiveModel::new(model),
                Err(err) => {
                    warn!(error = %err, "starting without a model; POST /reload once one is promoted");
                    ActiveModel::default()
                }
            };
            let state = AppState {
                active,
                registry: stores.registry,
                history: stores.history,
                model_name: cfg.model_name.clone(),
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("building tokio runtime")?;
            runtime.block_on(api::serve(&cfg.serve.bind, state))?;
            Ok(())
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    let code = err
        .downcast_ref::<PersonaError>()
        .map(PersonaError::code)
        .unwrap_or(ErrorCode::Internal);
    code as u8
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let cfg = match AppCfg::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("persona: {err}");
            return ExitCode::from(err.code() as u8);
        }
    };
    if let Err(err) = init_logging(&cfg.log) {
        eprintln!("persona: {err}");
    }

    match run(cli, cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("persona: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}
