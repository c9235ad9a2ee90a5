//! The `abstain run` command.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use comfy_table::{Cell, Table};
use tracing::warn;

use abstain_core::engine::{ExperimentRunner, ModelSpec};
use abstain_core::judge::Judge;
use abstain_core::model::Experiment;
use abstain_core::parser;
use abstain_core::report::ExperimentReport;
use abstain_core::session::CancelHandle;
use abstain_providers::config::load_config_from;
use abstain_providers::MockClient;

use super::{build_clients, cancel_on_ctrl_c, parse_models, parse_variants, timestamp, ConsoleReporter};

pub struct RunArgs {
    pub experiment: PathBuf,
    pub models: Option<String>,
    pub variants: Option<String>,
    pub parallelism: Option<usize>,
    pub temperature: Option<f64>,
    pub output: Option<PathBuf>,
    pub format: String,
    pub config: Option<PathBuf>,
    pub resume: Option<PathBuf>,
    pub mock_reply: Option<String>,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    if let Some(parallelism) = args.parallelism {
        anyhow::ensure!(parallelism >= 1, "parallelism must be at least 1");
    }
    if let Some(temperature) = args.temperature {
        anyhow::ensure!(
            (0.0..=2.0).contains(&temperature),
            "temperature must be between 0.0 and 2.0"
        );
    }
    let formats = parse_formats(&args.format)?;

    let config = load_config_from(args.config.as_deref())?;
    let mut runner_config = config.runner_config();
    if let Some(parallelism) = args.parallelism {
        runner_config.parallelism = parallelism;
    }
    if let Some(temperature) = args.temperature {
        runner_config.temperature = temperature;
    }

    let experiment = parser::parse_experiment(&args.experiment)?;
    for warning in parser::validate_experiment(&experiment) {
        let prefix = warning
            .question_id
            .as_ref()
            .map(|id| format!("[{id}] "))
            .unwrap_or_default();
        eprintln!("Warning: {prefix}{}", warning.message);
    }
    anyhow::ensure!(
        !experiment.questions.is_empty(),
        "experiment '{}' has no questions",
        experiment.id
    );

    let previous = args
        .resume
        .as_deref()
        .map(|path| load_previous(path, &experiment))
        .transpose()?;

    let (models, variants) = match &previous {
        Some(report) => (
            report
                .models
                .iter()
                .map(|m| m.parse::<ModelSpec>().map_err(anyhow::Error::msg))
                .collect::<Result<Vec<_>>>()?,
            report.variants.clone(),
        ),
        None => (
            parse_models(args.models.as_deref(), &config)?,
            match &args.variants {
                Some(list) => parse_variants(list)?,
                None => experiment.variants.clone(),
            },
        ),
    };

    let judge_spec = experiment
        .judge_model
        .as_deref()
        .map(|m| m.parse::<ModelSpec>().map_err(anyhow::Error::msg))
        .transpose()
        .context("invalid judge_model")?;

    let mock = args
        .mock_reply
        .as_deref()
        .map(|reply| Arc::new(MockClient::with_fixed_response(reply)));
    let providers = models
        .iter()
        .chain(judge_spec.as_ref())
        .map(|spec| spec.provider.as_str());
    let clients = build_clients(providers, &config, mock)?;

    let mut runner = ExperimentRunner::new(clients.clone(), runner_config);
    if let Some(spec) = &judge_spec {
        if let Some(client) = clients.get(&spec.provider) {
            runner = runner.with_judge(Judge::new(client.clone(), spec.model.clone()));
        }
    }

    let cancel = CancelHandle::new();
    cancel_on_ctrl_c(&cancel);
    let reporter = ConsoleReporter;

    let report = match previous {
        Some(previous) => {
            let pending = previous.unfinished().count();
            eprintln!(
                "abstain v{} — Resuming {pending} unfinished session(s) of {}",
                env!("CARGO_PKG_VERSION"),
                experiment.name
            );
            eprintln!();
            runner.resume(&experiment, previous, &cancel, &reporter).await?
        }
        None => {
            eprintln!(
                "abstain v{} — Running {} questions x {} models x {} variants",
                env!("CARGO_PKG_VERSION"),
                experiment.questions.len(),
                models.len(),
                variants.len()
            );
            eprintln!();
            runner
                .run(&experiment, &models, &variants, &cancel, &reporter)
                .await?
        }
    };

    print_summary(&report);

    let output = args.output.unwrap_or_else(|| config.output_dir.clone());
    std::fs::create_dir_all(&output)
        .with_context(|| format!("failed to create output directory {}", output.display()))?;
    let stamp = timestamp();
    for format in formats {
        match format {
            Format::Json => {
                let path = output.join(format!("report-{stamp}.json"));
                report.save_json(&path)?;
                eprintln!("Results saved to: {}", path.display());
            }
            Format::Markdown => {
                let path = output.join(format!("report-{stamp}.md"));
                std::fs::write(&path, markdown(&report))?;
                eprintln!("Markdown report: {}", path.display());
            }
        }
    }

    if report.cancelled {
        warn!(unfinished = report.unfinished().count(), "run interrupted");
        eprintln!("Run was interrupted; continue it with --resume and the saved JSON report.");
    }

    Ok(())
}

#[derive(Clone, Copy)]
enum Format {
    Json,
    Markdown,
}

fn parse_formats(format: &str) -> Result<Vec<Format>> {
    if format == "all" {
        return Ok(vec![Format::Json, Format::Markdown]);
    }
    format
        .split(',')
        .map(str::trim)
        .map(|f| match f {
            "json" => Ok(Format::Json),
            "markdown" | "md" => Ok(Format::Markdown),
            other => anyhow::bail!("unknown format '{other}': expected json, markdown or all"),
        })
        .collect()
}

fn load_previous(path: &Path, experiment: &Experiment) -> Result<ExperimentReport> {
    let report = ExperimentReport::load_json(path)?;
    anyhow::ensure!(
        report.experiment.id == experiment.id,
        "report {} belongs to experiment '{}', not '{}'",
        path.display(),
        report.experiment.id,
        experiment.id
    );
    Ok(report)
}

fn markdown(report: &ExperimentReport) -> String {
    let mut md = report.to_markdown();
    for (i, &from) in report.variants.iter().enumerate() {
        for &to in &report.variants[i + 1..] {
            md.push('\n');
            md.push_str(&report.transitions(from, to).to_markdown());
        }
    }
    md
}

fn print_summary(report: &ExperimentReport) {
    let mut table = Table::new();
    table.set_header(vec![
        "Model",
        "Variant",
        "Trials",
        "Correct",
        "Incorrect",
        "Blank",
        "Payoff",
        "Acc. given answer",
        "Latency",
    ]);

    for stats in &report.stats {
        let accuracy = stats
            .accuracy_given_answer
            .map(|a| format!("{:.1}%", a * 100.0))
            .unwrap_or_else(|| "-".into());
        table.add_row(vec![
            Cell::new(&stats.model),
            Cell::new(stats.variant),
            Cell::new(stats.trials),
            Cell::new(stats.correct),
            Cell::new(stats.incorrect),
            Cell::new(stats.blank),
            Cell::new(format!("{:.2}", stats.total_payoff)),
            Cell::new(accuracy),
            Cell::new(format!("{}ms", stats.avg_latency_ms)),
        ]);
    }

    eprintln!("\n{table}");
}
