//! abstain CLI — run uncertainty-framing experiments against language models.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "abstain",
    version,
    about = "Uncertainty-framing experiments for language models"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment across models and prompt variants
    Run {
        /// Path to the experiment .toml file
        #[arg(long)]
        experiment: PathBuf,

        /// Models to run (e.g. "anthropic/claude-sonnet-4-20250514,openai/gpt-4o")
        #[arg(long)]
        models: Option<String>,

        /// Prompt variants (comma-separated); defaults to the experiment's list
        #[arg(long)]
        variants: Option<String>,

        /// Max concurrent sessions
        #[arg(long)]
        parallelism: Option<usize>,

        /// Sampling temperature
        #[arg(long)]
        temperature: Option<f64>,

        /// Output directory
        #[arg(long)]
        output: Option<PathBuf>,

        /// Output format: json, markdown, all
        #[arg(long, default_value = "json")]
        format: String,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,

        /// Continue the unfinished sessions of an earlier report
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Answer every prompt with this text instead of calling a provider
        #[arg(long)]
        mock_reply: Option<String>,
    },

    /// Run the self-knowledge consistency probe
    Probe {
        /// Experiment .toml file supplying scoring, grading and [probe]
        #[arg(long)]
        experiment: PathBuf,

        /// Model that writes the candidate questions (provider/model)
        #[arg(long)]
        generation_model: Option<String>,

        /// Model that answers them (provider/model)
        #[arg(long)]
        answering_model: Option<String>,

        /// Prompt variant for the answering pass
        #[arg(long, default_value = "with_blank")]
        variant: String,

        /// Override the number of generation rounds
        #[arg(long)]
        rounds: Option<usize>,

        /// Output directory
        #[arg(long)]
        output: Option<PathBuf>,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,

        /// Answer quiz prompts with this text instead of calling a provider
        #[arg(long)]
        mock_reply: Option<String>,

        /// File whose contents answer generation prompts in mock mode
        #[arg(long)]
        mock_generation: Option<PathBuf>,
    },

    /// Compare classifications between two variants of a report
    Compare {
        /// Report JSON
        #[arg(long)]
        report: PathBuf,

        /// Baseline variant
        #[arg(long, default_value = "plain")]
        from: String,

        /// Variant compared against the baseline
        #[arg(long, default_value = "with_blank")]
        to: String,

        /// Output format: text, json, markdown
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Validate experiment TOML files
    Validate {
        /// Path to an experiment file or directory
        #[arg(long)]
        experiment: PathBuf,
    },

    /// List available models
    ListModels {
        /// Filter to specific provider
        #[arg(long)]
        provider: Option<String>,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Create starter config and example experiment
    Init,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("abstain=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            experiment,
            models,
            variants,
            parallelism,
            temperature,
            output,
            format,
            config,
            resume,
            mock_reply,
        } => {
            commands::run::execute(commands::run::RunArgs {
                experiment,
                models,
                variants,
                parallelism,
                temperature,
                output,
                format,
                config,
                resume,
                mock_reply,
            })
            .await
        }
        Commands::Probe {
            experiment,
            generation_model,
            answering_model,
            variant,
            rounds,
            output,
            config,
            mock_reply,
            mock_generation,
        } => {
            commands::probe::execute(commands::probe::ProbeArgs {
                experiment,
                generation_model,
                answering_model,
                variant,
                rounds,
                output,
                config,
                mock_reply,
                mock_generation,
            })
            .await
        }
        Commands::Compare {
            report,
            from,
            to,
            format,
        } => commands::compare::execute(report, from, to, format),
        Commands::Validate { experiment } => commands::validate::execute(experiment),
        Commands::ListModels { provider, config } => {
            commands::list_models::execute(provider, config).await
        }
        Commands::Init => commands::init::execute(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
