//! The `abstain probe` command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use comfy_table::{Cell, Table};
use tracing::debug;

use abstain_core::consistency::{ConsistencyClass, ConsistencyPipeline, ConsistencyReport, DropReason};
use abstain_core::engine::{ExperimentRunner, ModelSpec};
use abstain_core::judge::Judge;
use abstain_core::parser;
use abstain_core::prompt::PromptVariant;
use abstain_core::session::CancelHandle;
use abstain_providers::config::load_config_from;
use abstain_providers::MockClient;

use super::{build_clients, cancel_on_ctrl_c, timestamp, ConsoleReporter};

/// Occurs in every generation prompt and in no quiz prompt.
const GENERATION_PROMPT_KEY: &str = "Write each question as its own block";

pub struct ProbeArgs {
    pub experiment: PathBuf,
    pub generation_model: Option<String>,
    pub answering_model: Option<String>,
    pub variant: String,
    pub rounds: Option<usize>,
    pub output: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub mock_reply: Option<String>,
    pub mock_generation: Option<PathBuf>,
}

fn model_spec(value: &str) -> Result<ModelSpec> {
    value.parse::<ModelSpec>().map_err(anyhow::Error::msg)
}

pub async fn execute(args: ProbeArgs) -> Result<()> {
    let config = load_config_from(args.config.as_deref())?;
    let experiment = parser::parse_experiment(&args.experiment)?;
    let variant: PromptVariant = args.variant.parse().map_err(anyhow::Error::msg)?;

    let mut probe = experiment.probe.clone().unwrap_or_default();
    if let Some(rounds) = args.rounds {
        probe.rounds = rounds;
    }
    anyhow::ensure!(probe.rounds >= 1, "probe needs at least one generation round");
    anyhow::ensure!(
        probe.candidates_per_prompt >= 1,
        "candidates_per_prompt must be at least 1"
    );

    let generation = match args
        .generation_model
        .as_deref()
        .or(probe.generation_model.as_deref())
    {
        Some(value) => model_spec(value).context("invalid generation model")?,
        None => ModelSpec {
            provider: config.default_provider.clone(),
            model: config.default_model.clone(),
        },
    };
    let answering = match args
        .answering_model
        .as_deref()
        .or(probe.answering_model.as_deref())
    {
        Some(value) => model_spec(value).context("invalid answering model")?,
        None => generation.clone(),
    };
    let judge_spec = probe
        .judge_model
        .as_deref()
        .or(experiment.judge_model.as_deref())
        .map(model_spec)
        .transpose()
        .context("invalid judge model")?;

    let mock = match (&args.mock_reply, &args.mock_generation) {
        (None, None) => None,
        (reply, generation_file) => {
            let mut mock = MockClient::new();
            if let Some(path) = generation_file {
                let script = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                mock = mock.route(GENERATION_PROMPT_KEY, &script);
            }
            if let Some(reply) = reply {
                mock = mock.otherwise(reply);
            }
            Some(Arc::new(mock))
        }
    };

    let providers = [&generation, &answering]
        .into_iter()
        .chain(judge_spec.as_ref())
        .map(|spec| spec.provider.as_str());
    let clients = build_clients(providers, &config, mock)?;
    let client = |spec: &ModelSpec| {
        clients
            .get(&spec.provider)
            .cloned()
            .with_context(|| format!("no client for provider '{}'", spec.provider))
    };

    // The answering session is configured exactly like an experiment session.
    let runner = ExperimentRunner::new(clients.clone(), config.runner_config());
    let session_config = runner.session_config(&experiment, &answering, variant);
    session_config
        .validate()
        .with_context(|| format!("cannot answer with variant '{variant}'"))?;

    let mut pipeline = ConsistencyPipeline::new(
        probe.clone(),
        client(&generation)?,
        generation.model.clone(),
        session_config,
        client(&answering)?,
    );
    if let Some(spec) = &judge_spec {
        pipeline = pipeline.with_judge(Judge::new(client(spec)?, spec.model.clone()));
    }

    eprintln!(
        "abstain v{} — Probing {} ({} round(s) x {} candidates), answering with {} ({variant})",
        env!("CARGO_PKG_VERSION"),
        generation,
        probe.rounds,
        probe.candidates_per_prompt,
        answering,
    );
    eprintln!();

    let cancel = CancelHandle::new();
    cancel_on_ctrl_c(&cancel);
    let report = pipeline.run(&cancel, &ConsoleReporter).await?;

    print_summary(&report);

    let output = args.output.unwrap_or_else(|| config.output_dir.clone());
    std::fs::create_dir_all(&output)
        .with_context(|| format!("failed to create output directory {}", output.display()))?;
    let path = output.join(format!("probe-{}.json", timestamp()));
    report.save_json(&path)?;
    debug!(records = report.records.len(), dropped = report.dropped.len(), "probe report written");
    eprintln!("Results saved to: {}", path.display());

    Ok(())
}

fn print_summary(report: &ConsistencyReport) {
    let mut table = Table::new();
    table.set_header(vec!["Outcome", "Count"]);
    for class in ConsistencyClass::ALL {
        table.add_row(vec![Cell::new(class), Cell::new(report.aggregate.count(class))]);
    }
    for reason in [
        DropReason::Unverifiable,
        DropReason::EmptyQuestion,
        DropReason::Duplicate,
        DropReason::NotAnswered,
    ] {
        let count = report.aggregate.dropped.get(&reason).copied().unwrap_or(0);
        table.add_row(vec![
            Cell::new(format!("dropped: {reason}")),
            Cell::new(count),
        ]);
    }
    eprintln!("\n{table}");

    if !report.generation_failures.is_empty() {
        eprintln!(
            "{} generation prompt(s) failed:",
            report.generation_failures.len()
        );
        for failure in &report.generation_failures {
            eprintln!("  {failure}");
        }
    }
}
