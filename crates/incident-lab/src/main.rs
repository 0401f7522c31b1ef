//! incident-lab — release gate for agent safety incidents
//!
//! Exit codes: the verdict code for `grade` and `run` (OK 0, BLOCK 1,
//! WARN 2), 0 for every other successful command, 3 for any error.
//!
//! # Usage
//!
//! ```bash
//! incident-lab --config gate.toml run incidents/INC_004.json --promote
//! incident-lab grade --erosion 0.18 --delayed 0.05 --max-category 0.1 --regression
//! incident-lab transition REG-INC_004-1a2b3c4d --to MONITORING --actor qa --reason "quiet"
//! incident-lab debt record incidents/INC_004.json --release v2.3.0
//! incident-lab debt status
//! ```
//!
//! `debt status` exits 1 when any ledger entry blocks the release.

mod cli;
mod report;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, DebtCommand, ExportFormat, SchemaDocument};
use incident_gate::blast_radius::ScenarioCorpus;
use incident_gate::config::ConfigOverrides;
use incident_gate::debt::{aging, aging_report, DebtLevel, RiskAcceptance};
use incident_gate::lifecycle::RegressionCaseExport;
use incident_gate::replay::{summarize, Perturbation, RoutingPolicy};
use incident_gate::trajectory::IncidentRecord;
use incident_gate::{
    BlastRadiusEstimator, BlastRadiusExport, CancellationToken, CausalGraph, DebtLedgerStore,
    DebtRecord, GateConfig, GateError, GradingThresholds, Incident, IncidentPipeline,
    JsonlRegressionStore, LifecycleManager, LifecycleState, RegressionCase, ReplayEngine,
    RiskGrader, RiskVerdict, Signals, StaticCorpus, StructuredError,
};

/// Operational failure, never confused with a verdict
const EXIT_ERROR: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let json = cli.json;
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            report_error(&err, json);
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn report_error(err: &anyhow::Error, json: bool) {
    let structured = match err.downcast_ref::<GateError>() {
        Some(gate) => StructuredError {
            message: format!("{err:#}"),
            ..gate.to_structured()
        },
        None => StructuredError {
            code: "CLI_ERROR".to_string(),
            message: format!("{err:#}"),
            recoverable: false,
        },
    };
    if json {
        match serde_json::to_string_pretty(&structured) {
            Ok(body) => println!("{body}"),
            Err(_) => eprintln!("error[{}]: {}", structured.code, structured.message),
        }
    } else {
        eprintln!("error[{}]: {}", structured.code, structured.message);
    }
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// File, then `INCIDENT_GATE_*`, then flags
fn resolve_config(cli: &Cli) -> Result<GateConfig> {
    let mut config = GateConfig::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load configuration {}", path.display()),
        None => "Failed to build default configuration".to_string(),
    })?;
    config.apply_overrides(&ConfigOverrides::from_env()?);
    config.apply_overrides(&ConfigOverrides {
        store_path: cli.store_path.clone(),
        debt_ledger: cli.debt_ledger.clone(),
        ..Default::default()
    });
    config.validate()?;
    Ok(config)
}

/// Cancelled on Ctrl-C so long scans stop without recording anything
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            trigger.cancel();
        }
    });
    cancel
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn load_incident(path: &Path) -> Result<Incident> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read incident {}", path.display()))?;
    let record: IncidentRecord = if is_yaml(path) {
        serde_yaml::from_str(&text).map_err(GateError::from)?
    } else {
        serde_json::from_str(&text).map_err(GateError::from)?
    };
    Ok(Incident::from_record(record)
        .with_context(|| format!("Invalid incident {}", path.display()))?)
}

fn load_corpora(paths: &[&Path]) -> Result<Vec<Arc<dyn ScenarioCorpus>>> {
    paths
        .iter()
        .map(|path| {
            let corpus = StaticCorpus::load(path)
                .with_context(|| format!("Failed to load corpus {}", path.display()))?;
            Ok(Arc::new(corpus) as Arc<dyn ScenarioCorpus>)
        })
        .collect()
}

async fn open_lifecycle(config: &GateConfig) -> Result<Arc<LifecycleManager>> {
    let store = JsonlRegressionStore::open(&config.store_path)
        .await
        .with_context(|| {
            format!("Failed to open regression store {}", config.store_path.display())
        })?;
    Ok(Arc::new(LifecycleManager::new(Arc::new(store))))
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print!("{}", text(value));
    }
    Ok(())
}

fn verdict_exit(verdict: &RiskVerdict) -> u8 {
    u8::try_from(verdict.exit_code).unwrap_or(EXIT_ERROR)
}

async fn run(cli: Cli) -> Result<u8> {
    let config = resolve_config(&cli)?;
    init_tracing(&config.log_filter);
    let json = cli.json;
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Command::Replay(args) => {
            let incident = load_incident(&args.incident)?;
            let mut safeguards = if args.candidate {
                config.candidate.clone()
            } else {
                config.baseline.clone()
            };
            if let Some(threshold) = args.threshold {
                safeguards.threshold = threshold;
            }
            let trace = ReplayEngine::default().replay_incident(&incident, &safeguards, &cancel)?;
            emit(json, &trace, report::trace)?;
            Ok(0)
        }

        Command::Counterfactual(args) => {
            let incident = load_incident(&args.incident)?;
            let mut perturbations = Vec::new();
            if let Some(delta) = args.threshold_delta {
                perturbations.push(Perturbation::ThresholdDelta { delta });
            }
            if let Some(hook) = args.remove_safeguard {
                perturbations.push(Perturbation::RemoveSafeguard { hook: Some(hook) });
            }
            if args.remove_all {
                perturbations.push(Perturbation::RemoveSafeguard { hook: None });
            }
            if let Some(from_turn) = args.human_review_from {
                perturbations.push(Perturbation::AlternateRouting {
                    policy: RoutingPolicy::HumanReview { from_turn },
                });
            }
            if args.conservative {
                perturbations.push(Perturbation::ConservativeModel);
            }
            if perturbations.is_empty() {
                perturbations = config.counterfactuals.clone();
            }

            let results = ReplayEngine::default().counterfactual_batch(
                incident.id(),
                incident.trajectory(),
                &config.baseline,
                &perturbations,
                &cancel,
            )?;
            let summary = summarize(&results);
            let body = serde_json::json!({ "results": results, "summary": summary });
            emit(json, &body, |_| report::counterfactuals(&results, &summary))?;
            Ok(0)
        }

        Command::BlastRadius(args) => {
            let incident = load_incident(&args.incident)?;
            let taxonomy = config.taxonomy()?;
            let fingerprint = incident.fingerprint(&taxonomy)?;
            let paths: Vec<&Path> = config
                .corpora
                .iter()
                .chain(args.corpora.iter())
                .map(|p| p.as_path())
                .collect();
            let corpora = load_corpora(&paths)?;
            let estimator = BlastRadiusEstimator::new(config.blast_radius.clone())?;
            let report = match estimator
                .estimate(incident.id(), &fingerprint, &corpora, &cancel)
                .await
            {
                Ok(report) => report,
                Err(GateError::CorpusUnavailable { corpora, partial }) => {
                    warn!(unavailable = ?corpora, "Reporting partial blast radius");
                    *partial
                }
                Err(e) => return Err(e.into()),
            };
            emit(json, &report.export(), |_| report::blast_radius(&report))?;
            Ok(0)
        }

        Command::Grade(args) => {
            let signals = match &args.signals {
                Some(path) => {
                    let text = std::fs::read_to_string(path)
                        .with_context(|| format!("Failed to read signals {}", path.display()))?;
                    if is_yaml(path) {
                        serde_yaml::from_str::<Signals>(&text).map_err(GateError::from)?
                    } else {
                        serde_json::from_str::<Signals>(&text).map_err(GateError::from)?
                    }
                }
                None => Signals::new(
                    args.erosion,
                    args.delayed,
                    args.max_category,
                    args.affected_categories,
                    args.regression,
                ),
            };
            let verdict = RiskGrader::new(config.grading.clone())?.grade(&signals)?;
            emit(json, &verdict, report::verdict)?;
            Ok(verdict_exit(&verdict))
        }

        Command::Run(args) => {
            let incident = load_incident(&args.incident)?;
            let pipeline = build_pipeline(&config).await?;
            let assessment = pipeline.assess(&incident, &cancel).await?;

            let case = if args.promote {
                match pipeline
                    .promote(&incident, &assessment, &args.actor, &cancel)
                    .await
                {
                    Ok(case) => {
                        clear_debt(&config, &case, &args.actor).await?;
                        Some(case)
                    }
                    Err(GateError::DuplicateRegression {
                        fingerprint,
                        existing_case,
                    }) => {
                        warn!(
                            fingerprint = %fingerprint,
                            existing_case = ?existing_case,
                            "Pattern already tracked, not promoted"
                        );
                        None
                    }
                    Err(e) => return Err(e.into()),
                }
            } else {
                None
            };

            if json {
                let exported = case.as_ref().map(|c| c.export()).transpose()?;
                let body = serde_json::json!({
                    "assessment": assessment,
                    "regression_case": exported,
                });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                print!("{}", report::assessment(&assessment));
                if let Some(case) = &case {
                    println!();
                    print!("{}", report::case(case));
                }
            }
            Ok(verdict_exit(&assessment.verdict))
        }

        Command::Promote(args) => {
            let incident = load_incident(&args.incident)?;
            let pipeline = build_pipeline(&config).await?;
            let assessment = pipeline.assess(&incident, &cancel).await?;
            let case = pipeline
                .promote(&incident, &assessment, &args.actor, &cancel)
                .await?;
            clear_debt(&config, &case, &args.actor).await?;
            emit(json, &case.export()?, |_| report::case(&case))?;
            Ok(0)
        }

        Command::Transition(args) => {
            let to = LifecycleState::parse(&args.to).ok_or_else(|| {
                GateError::invalid_config(format!("unknown lifecycle state '{}'", args.to))
            })?;
            let lifecycle = open_lifecycle(&config).await?;
            let case = lifecycle
                .transition(&args.case_id, to, &args.actor, &args.reason)
                .await?;
            emit(json, &case.export()?, |_| report::case(&case))?;
            Ok(0)
        }

        Command::Retire(args) => {
            let lifecycle = open_lifecycle(&config).await?;
            let case = lifecycle
                .emergency_retire(&args.case_id, &args.actor, &args.reason)
                .await?;
            emit(json, &case.export()?, |_| report::case(&case))?;
            Ok(0)
        }

        Command::Decay(args) => {
            let lifecycle = open_lifecycle(&config).await?;
            let recommendations = lifecycle
                .apply_decay(&config.decay, chrono::Utc::now(), args.apply)
                .await?;
            emit(json, &recommendations, |r| report::decay(r, args.apply))?;
            Ok(0)
        }

        Command::Export(args) => {
            let lifecycle = open_lifecycle(&config).await?;
            let exports: Vec<RegressionCaseExport> = match &args.case_id {
                Some(id) => vec![lifecycle.export(id).await?],
                None => lifecycle.export_all().await?,
            };
            match args.format {
                ExportFormat::Json => println!("{}", serde_json::to_string_pretty(&exports)?),
                ExportFormat::Yaml => print!("{}", serde_yaml::to_string(&exports)?),
            }
            info!(cases = exports.len(), "Regression cases exported");
            Ok(0)
        }

        Command::Coverage => {
            let lifecycle = open_lifecycle(&config).await?;
            let summary = lifecycle.coverage().await?;
            emit(json, &summary, report::coverage)?;
            Ok(0)
        }

        Command::CausalGraph(args) => {
            let incident = load_incident(&args.incident)?;
            let graph = CausalGraph::from_incident(&incident, &config.taxonomy()?)?;
            emit(json, &graph.export(), |_| graph.to_mermaid())?;
            Ok(0)
        }

        Command::Debt(command) => debt(&config, command, json, &cancel).await,

        Command::Schema(args) => {
            let schema = match args.document {
                SchemaDocument::Verdict => schemars::schema_for!(RiskVerdict),
                SchemaDocument::Signals => schemars::schema_for!(Signals),
                SchemaDocument::BlastRadius => schemars::schema_for!(BlastRadiusExport),
                SchemaDocument::RegressionCase => schemars::schema_for!(RegressionCaseExport),
                SchemaDocument::GradingThresholds => schemars::schema_for!(GradingThresholds),
            };
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(0)
        }
    }
}

/// Marks the promoted incident's open debt as cleared by `case`
async fn clear_debt(config: &GateConfig, case: &RegressionCase, actor: &str) -> Result<()> {
    let store = DebtLedgerStore::new(config.debt.clone());
    if !store.path().exists() {
        return Ok(());
    }
    let incident_id = case.record.source_incident.clone();
    let cases = vec![case.id().to_string()];
    let actor = actor.to_string();
    let cleared = store
        .update(move |ledger| {
            Ok(ledger.mark_mitigated(&incident_id, &cases, &actor, chrono::Utc::now()))
        })
        .await
        .with_context(|| format!("Failed to update debt ledger {}", store.path().display()))?;
    if let Some(entry) = cleared {
        info!(debt_id = %entry.debt_id, case_id = %case.id(), "Alignment debt mitigated");
    }
    Ok(())
}

async fn debt(
    config: &GateConfig,
    command: DebtCommand,
    json: bool,
    cancel: &CancellationToken,
) -> Result<u8> {
    let store = DebtLedgerStore::new(config.debt.clone());
    let now = chrono::Utc::now();
    match command {
        DebtCommand::Record(args) => {
            let incident = load_incident(&args.incident)?;
            let pipeline = build_pipeline(config).await?;
            let assessment = pipeline.assess(&incident, cancel).await?;
            let record = DebtRecord::from_assessment(
                &incident,
                &assessment,
                pipeline.taxonomy(),
                args.release,
            );
            let (entry, created) = store
                .update(move |ledger| Ok(ledger.record(record, now)))
                .await?;
            if created {
                info!(
                    debt_id = %entry.debt_id,
                    severity = %entry.severity,
                    "Alignment debt recorded"
                );
            } else {
                info!(debt_id = %entry.debt_id, "Incident already carries open debt");
            }
            emit(json, &entry, report::debt_entry)?;
            Ok(0)
        }
        DebtCommand::Mitigate(args) => {
            let incident_id = args.incident_id.clone();
            let entry = store
                .update(move |ledger| {
                    ledger
                        .mark_mitigated(&args.incident_id, &args.cases, &args.actor, now)
                        .ok_or_else(|| GateError::DebtNotFound {
                            key: args.incident_id.clone(),
                        })
                })
                .await?;
            info!(debt_id = %entry.debt_id, incident_id = %incident_id, "Alignment debt mitigated");
            emit(json, &entry, report::debt_entry)?;
            Ok(0)
        }
        DebtCommand::Accept(args) => {
            let expires = now + chrono::Duration::days(i64::from(args.days));
            let acceptance = RiskAcceptance {
                approved_by: args.approved_by,
                approved_at: now,
                expires,
                conditions: args.conditions,
            };
            let debt_id = args.debt_id;
            let entry = store
                .update(move |ledger| ledger.accept(&debt_id, acceptance))
                .await?;
            warn!(
                debt_id = %entry.debt_id,
                expires = %expires.date_naive(),
                "Alignment debt accepted, releases proceed until expiry"
            );
            emit(json, &entry, report::debt_entry)?;
            Ok(0)
        }
        DebtCommand::Status => {
            let ledger = store.load().await?;
            let summary = ledger.summary(&config.debt, now);
            let aging = aging_report(&aging::analyze(&ledger, &config.debt.aging, now));
            let blocking = ledger.blocking(now);
            let body = serde_json::json!({
                "summary": summary,
                "aging": aging,
                "blocking": blocking,
            });
            emit(json, &body, |_| report::debt_status(&summary, &aging, &blocking))?;
            let blocked = !blocking.is_empty() || summary.status == DebtLevel::Block;
            Ok(u8::from(blocked))
        }
        DebtCommand::Enforce => {
            let policy = config.debt.aging.clone();
            let changed = store
                .update(move |ledger| Ok(aging::enforce(ledger, &policy, now)))
                .await?;
            info!(blocked = changed.len(), "Debt aging enforced");
            emit(json, &changed, |ids| {
                if ids.is_empty() {
                    "No open debt has exceeded its SLO\n".to_string()
                } else {
                    ids.iter().map(|id| format!("Now blocking: {id}\n")).collect()
                }
            })?;
            Ok(0)
        }
    }
}

async fn build_pipeline(config: &GateConfig) -> Result<IncidentPipeline> {
    let taxonomy = config.taxonomy()?;
    let paths: Vec<&Path> = config.corpora.iter().map(|p| p.as_path()).collect();
    let corpora = load_corpora(&paths)?;
    let lifecycle = open_lifecycle(config).await?;
    Ok(IncidentPipeline::new(config.clone(), taxonomy)?
        .with_corpora(corpora)
        .with_lifecycle(lifecycle))
}
