use absa_core::stage_outputs::{
    parse_stage_output, AteOutput, AtsaOutput, ModeratorOutput, ValidatorOutput,
};
use absa_gate::{AlignmentLexicon, InjectionGate, StageOneSignals};
use absa_memory::{
    CompletedSample, EpisodicOrchestrator, MemoryPolicy, OrchestratorOptions, StageOutputs,
    DEFAULT_POLICY_PATH,
};
use absa_store::{MemoryStore, PruneConfig};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "absa-mem")]
#[command(about = "Episodic memory tools for the ABSA debate pipeline", long_about = None)]
struct Cli {
    /// Log filter, overrides RUST_LOG (logs go to stderr)
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect the memory policy
    Policy {
        #[command(subcommand)]
        action: PolicyCommands,
    },
    /// Maintain the episode store
    Store {
        #[command(subcommand)]
        action: StoreCommands,
    },
    /// Build the debate memory slot for one sample
    Slot {
        #[arg(long)]
        sample: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Evaluate the injection gate for one sample
    Gate {
        #[arg(long)]
        sample: PathBuf,
        /// Use the Stage-2 gate instead of the debate gate
        #[arg(long)]
        relaxed: bool,
        #[arg(long)]
        lexicon: Option<PathBuf>,
    },
    /// Store an episode for a finished sample, if the condition writes
    Append {
        #[arg(long)]
        sample: PathBuf,
        #[arg(long)]
        text_id: String,
        #[arg(long, default_value = "valid")]
        split: String,
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Subcommand)]
enum PolicyCommands {
    Show {
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Subcommand)]
enum StoreCommands {
    Stats(StoreArgs),
    Validate(StoreArgs),
    Prune(StoreArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, default_value = "C1")]
    condition: String,
    #[arg(long)]
    policy: Option<PathBuf>,
    #[arg(long)]
    store: Option<PathBuf>,
    #[arg(long)]
    topk: Option<i64>,
    #[arg(long)]
    keep_last_n: Option<usize>,
}

impl RunArgs {
    fn orchestrator(&self) -> Result<EpisodicOrchestrator> {
        EpisodicOrchestrator::new(OrchestratorOptions {
            policy_path: self.policy.clone(),
            store_path: self.store.clone(),
            keep_last_n: self.keep_last_n,
            topk: self.topk,
            ..OrchestratorOptions::new(self.condition.clone())
        })
        .context("Failed to build episodic orchestrator")
    }
}

#[derive(Args)]
struct StoreArgs {
    #[arg(long)]
    store: Option<PathBuf>,
    #[arg(long)]
    policy: Option<PathBuf>,
    #[arg(long)]
    keep_last_n: Option<usize>,
}

impl StoreArgs {
    fn open(&self) -> Result<MemoryStore> {
        let policy_path = self
            .policy
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_POLICY_PATH));
        let loaded = MemoryPolicy::load(&policy_path).context("Failed to load memory policy")?;
        let store = &loaded.policy.memory().store;
        let path = self.store.clone().unwrap_or_else(|| store.path.clone());
        Ok(MemoryStore::new(
            path,
            PruneConfig {
                enabled: store.prune.enabled,
                keep_last_n: self.keep_last_n.unwrap_or(store.prune.keep_last_n),
            },
        ))
    }
}

#[derive(Debug, Deserialize)]
struct SampleFile {
    text: String,
    #[serde(default = "default_language")]
    language: String,
    #[serde(default)]
    stage1: StageFile,
    #[serde(default)]
    stage2: Option<StageFile>,
    #[serde(default)]
    moderator: Value,
}

#[derive(Debug, Default, Deserialize)]
struct StageFile {
    #[serde(default)]
    ate: Value,
    #[serde(default)]
    atsa: Value,
    #[serde(default)]
    validator: Value,
}

fn default_language() -> String {
    "ko".to_string()
}

struct ParsedStage {
    ate: AteOutput,
    atsa: AtsaOutput,
    validator: ValidatorOutput,
}

impl ParsedStage {
    fn parse(stage: StageFile) -> Result<Self> {
        Ok(Self {
            ate: parse_stage_output(stage.ate).context("Invalid ate output")?,
            atsa: parse_stage_output(stage.atsa).context("Invalid atsa output")?,
            validator: parse_stage_output(stage.validator).context("Invalid validator output")?,
        })
    }

    fn outputs(&self) -> StageOutputs<'_> {
        StageOutputs {
            ate: &self.ate,
            atsa: &self.atsa,
            validator: &self.validator,
        }
    }
}

struct Sample {
    text: String,
    language: String,
    stage1: ParsedStage,
    stage2: Option<ParsedStage>,
    moderator: Option<ModeratorOutput>,
}

impl Sample {
    fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read sample {}", path.display()))?;
        let file: SampleFile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse sample {}", path.display()))?;
        let moderator = if file.moderator.is_null() {
            None
        } else {
            Some(parse_stage_output(file.moderator).context("Invalid moderator output")?)
        };
        Ok(Self {
            text: file.text,
            language: file.language,
            stage1: ParsedStage::parse(file.stage1)?,
            stage2: file.stage2.map(ParsedStage::parse).transpose()?,
            moderator,
        })
    }

    fn signals(&self) -> StageOneSignals<'_> {
        StageOneSignals {
            text: &self.text,
            ate: &self.stage1.ate,
            atsa: &self.stage1.atsa,
            validator: &self.stage1.validator,
        }
    }
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to render output")?
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    match cli.command {
        Commands::Policy { action } => match action {
            PolicyCommands::Show { run } => {
                let orchestrator = run.orchestrator()?;
                print_json(orchestrator.effective_policy())?;
            }
        },
        Commands::Store { action } => match action {
            StoreCommands::Stats(args) => {
                let stats = args.open()?.stats().context("Failed to read store")?;
                print_json(&stats)?;
            }
            StoreCommands::Validate(args) => {
                let store = args.open()?;
                let entries = store.validate().context("Store validation failed")?;
                print_json(&json!({
                    "path": store.path().display().to_string(),
                    "entries": entries,
                    "valid": true,
                }))?;
            }
            StoreCommands::Prune(args) => {
                let report = args.open()?.prune_now().context("Failed to prune store")?;
                print_json(&report)?;
            }
        },
        Commands::Slot { sample, run } => {
            let sample = Sample::load(&sample)?;
            let orchestrator = run.orchestrator()?;
            let payload = orchestrator
                .get_slot_payload_for_current_sample(
                    &sample.text,
                    sample.stage1.outputs(),
                    &sample.language,
                )
                .context("Failed to build memory slot")?;
            print_json(&payload)?;
        }
        Commands::Gate {
            sample,
            relaxed,
            lexicon,
        } => {
            let sample = Sample::load(&sample)?;
            let lexicon = match lexicon {
                Some(path) => AlignmentLexicon::load(&path)
                    .with_context(|| format!("Failed to load lexicon {}", path.display()))?,
                None => AlignmentLexicon::default(),
            };
            let gate = InjectionGate::new(lexicon);
            let decision = if relaxed {
                gate.should_inject_stage2_with_reason(sample.signals())
            } else {
                gate.should_inject_advisory_with_reason(sample.signals())
            };
            let filter = gate.filter_aspects(&sample.text, &sample.stage1.ate);
            print_json(&json!({
                "gate": if relaxed { "stage2" } else { "debate" },
                "fired": decision.fired,
                "reason": decision.reason_str(),
                "aspect_filter": filter,
            }))?;
        }
        Commands::Append {
            sample,
            text_id,
            split,
            run,
        } => {
            let sample = Sample::load(&sample)?;
            let mut orchestrator = run.orchestrator()?;
            let stage2 = sample.stage2.as_ref().unwrap_or(&sample.stage1);
            let appended = orchestrator
                .append_episode_if_needed(CompletedSample {
                    text: &sample.text,
                    text_id: &text_id,
                    stage1: sample.stage1.outputs(),
                    stage2: stage2.outputs(),
                    moderator: sample.moderator.as_ref(),
                    language_code: &sample.language,
                    split: &split,
                })
                .context("Failed to append episode")?;
            print_json(&json!({
                "condition": orchestrator.condition().as_str(),
                "appended": appended.is_some(),
                "episode_id": appended,
            }))?;
        }
    }

    Ok(())
}
