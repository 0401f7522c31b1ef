//! Command-line surface

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Replay agent safety incidents, grade candidate safeguards and manage the
/// regression cases they produce
#[derive(Parser, Debug)]
#[command(name = "incident-lab", author, version, about, long_about = None)]
pub struct Cli {
    /// Gate configuration (TOML). Defaults apply when omitted.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Emit JSON on stdout instead of text reports
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,

    /// Regression ledger directory (overrides INCIDENT_GATE_STORE_PATH)
    #[arg(long, global = true, value_name = "DIR")]
    pub store_path: Option<PathBuf>,

    /// Alignment debt ledger file (overrides INCIDENT_GATE_DEBT_LEDGER)
    #[arg(long, global = true, value_name = "PATH")]
    pub debt_ledger: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replay an incident under the baseline (or candidate) safeguards
    Replay(ReplayArgs),
    /// Re-run an incident under perturbed safeguards
    Counterfactual(CounterfactualArgs),
    /// Scan scenario corpora for the incident's vulnerability pattern
    BlastRadius(BlastRadiusArgs),
    /// Grade a signal tuple; exits with the verdict code
    Grade(GradeArgs),
    /// Full assessment of one incident; exits with the verdict code
    Run(RunArgs),
    /// Assess an incident and promote it to a regression case
    Promote(PromoteArgs),
    /// Advance a regression case one lifecycle step
    Transition(TransitionArgs),
    /// Emergency ACTIVE -> RETIRED
    Retire(RetireArgs),
    /// Evaluate the decay policy over every case
    Decay(DecayArgs),
    /// Export regression cases for the regression runner
    Export(ExportArgs),
    /// Registry counts by state and failure category
    Coverage,
    /// Causal graph of an incident (Mermaid, or JSON with --json)
    CausalGraph(CausalGraphArgs),
    /// Alignment debt ledger
    #[command(subcommand)]
    Debt(DebtCommand),
    /// Print the JSON schema of an exported document
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Incident record (JSON or YAML)
    pub incident: PathBuf,
    /// Replay under the candidate configuration
    #[arg(long, default_value_t = false)]
    pub candidate: bool,
    /// Override the drift threshold
    #[arg(long)]
    pub threshold: Option<f64>,
}

#[derive(Args, Debug)]
pub struct CounterfactualArgs {
    pub incident: PathBuf,
    /// Shift the baseline threshold by this amount
    #[arg(long, allow_hyphen_values = true)]
    pub threshold_delta: Option<f64>,
    /// Disable one hook
    #[arg(long, value_name = "HOOK", conflicts_with = "remove_all")]
    pub remove_safeguard: Option<String>,
    /// Disable every hook
    #[arg(long, default_value_t = false)]
    pub remove_all: bool,
    /// Force human review from this turn on
    #[arg(long, value_name = "TURN")]
    pub human_review_from: Option<u32>,
    /// All hooks with a tightened threshold
    #[arg(long, default_value_t = false)]
    pub conservative: bool,
}

#[derive(Args, Debug)]
pub struct BlastRadiusArgs {
    pub incident: PathBuf,
    /// Additional scenario catalogue (repeatable)
    #[arg(long = "corpus", value_name = "PATH")]
    pub corpora: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct GradeArgs {
    /// Signals document (JSON or YAML); flags below are ignored when set
    #[arg(long, value_name = "PATH")]
    pub signals: Option<PathBuf>,
    #[arg(long, default_value_t = 0.0)]
    pub erosion: f64,
    #[arg(long, default_value_t = 0.0)]
    pub delayed: f64,
    #[arg(long, default_value_t = 0.0)]
    pub max_category: f64,
    #[arg(long, default_value_t = 0)]
    pub affected_categories: u32,
    #[arg(long, default_value_t = false)]
    pub regression: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    pub incident: PathBuf,
    /// Promote the incident to a regression case after grading
    #[arg(long, default_value_t = false)]
    pub promote: bool,
    #[arg(long, default_value = "incident-lab")]
    pub actor: String,
}

#[derive(Args, Debug)]
pub struct PromoteArgs {
    pub incident: PathBuf,
    #[arg(long)]
    pub actor: String,
}

#[derive(Args, Debug)]
pub struct TransitionArgs {
    pub case_id: String,
    /// Target state (MONITORING, DEPRECATED, RETIRED)
    #[arg(long)]
    pub to: String,
    #[arg(long)]
    pub actor: String,
    #[arg(long)]
    pub reason: String,
}

#[derive(Args, Debug)]
pub struct RetireArgs {
    pub case_id: String,
    #[arg(long)]
    pub actor: String,
    #[arg(long)]
    pub reason: String,
}

#[derive(Args, Debug)]
pub struct DecayArgs {
    /// Perform the recommended transitions (dry run otherwise)
    #[arg(long, default_value_t = false)]
    pub apply: bool,
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Single case; every case when omitted
    pub case_id: Option<String>,
    #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
    pub format: ExportFormat,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Yaml,
}

#[derive(Args, Debug)]
pub struct CausalGraphArgs {
    pub incident: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum DebtCommand {
    /// Assess an incident and record its gap in the ledger
    Record(DebtRecordArgs),
    /// Clear an incident's open debt with regression cases
    Mitigate(DebtMitigateArgs),
    /// Accept the risk of an open entry for a limited time
    Accept(DebtAcceptArgs),
    /// Ledger totals, aging and blocking entries; exits 1 when anything blocks
    Status,
    /// Block releases on entries past their aging SLO
    Enforce,
}

#[derive(Args, Debug)]
pub struct DebtRecordArgs {
    pub incident: PathBuf,
    /// Release the gap shipped in
    #[arg(long)]
    pub release: String,
}

#[derive(Args, Debug)]
pub struct DebtMitigateArgs {
    pub incident_id: String,
    /// Regression case clearing the debt (repeatable)
    #[arg(long = "case", value_name = "CASE_ID", required = true)]
    pub cases: Vec<String>,
    #[arg(long)]
    pub actor: String,
}

#[derive(Args, Debug)]
pub struct DebtAcceptArgs {
    pub debt_id: String,
    #[arg(long)]
    pub approved_by: String,
    /// Acceptance lifetime
    #[arg(long, default_value_t = 30)]
    pub days: u32,
    /// Condition attached to the acceptance (repeatable)
    #[arg(long = "condition")]
    pub conditions: Vec<String>,
}

#[derive(Args, Debug)]
pub struct SchemaArgs {
    #[arg(value_enum)]
    pub document: SchemaDocument,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaDocument {
    Verdict,
    Signals,
    BlastRadius,
    RegressionCase,
    GradingThresholds,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "incident-lab",
            "grade",
            "--erosion",
            "0.18",
            "--regression",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Command::Grade(args) => {
                assert_eq!(args.erosion, 0.18);
                assert!(args.regression);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_negative_threshold_delta() {
        let cli = Cli::try_parse_from([
            "incident-lab",
            "counterfactual",
            "inc.json",
            "--threshold-delta",
            "-0.1",
        ])
        .unwrap();
        match cli.command {
            Command::Counterfactual(args) => assert_eq!(args.threshold_delta, Some(-0.1)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_debt_subcommands() {
        let cli = Cli::try_parse_from([
            "incident-lab",
            "debt",
            "mitigate",
            "INC_004",
            "--case",
            "REG-1",
            "--case",
            "REG-2",
            "--actor",
            "qa",
        ])
        .unwrap();
        match cli.command {
            Command::Debt(DebtCommand::Mitigate(args)) => {
                assert_eq!(args.cases, vec!["REG-1", "REG-2"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        let without_case =
            Cli::try_parse_from(["incident-lab", "debt", "mitigate", "INC_004", "--actor", "qa"]);
        assert!(without_case.is_err());
    }
}
