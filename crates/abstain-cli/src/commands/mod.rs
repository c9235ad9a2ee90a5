pub mod compare;
pub mod init;
pub mod list_models;
pub mod probe;
pub mod run;
pub mod validate;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use abstain_core::engine::ModelSpec;
use abstain_core::model::{Classification, Trial};
use abstain_core::prompt::PromptVariant;
use abstain_core::session::{CancelHandle, ProgressReporter, SessionRecord};
use abstain_core::traits::ModelClient;
use abstain_providers::{create_client, AbstainConfig, MockClient};

/// Console progress reporter.
pub struct ConsoleReporter;

impl ProgressReporter for ConsoleReporter {
    fn on_session_start(&self, model: &str, variant: PromptVariant, questions: usize) {
        eprintln!("  Starting: {model} :: {variant} ({questions} questions)");
    }

    fn on_trial_complete(&self, model: &str, variant: PromptVariant, trial: &Trial) {
        let marker = match trial.classification {
            Classification::Correct => "OK",
            Classification::Incorrect => "WRONG",
            Classification::Blank => "BLANK",
        };
        let degraded = if trial.degraded { " (no reply)" } else { "" };
        eprintln!(
            "  {model} :: {variant} :: {} [{marker}]{degraded} total {} ({} attempt(s), {}ms)",
            trial.question_id, trial.running_total, trial.attempts, trial.latency_ms,
        );
    }

    fn on_session_finish(&self, record: &SessionRecord) {
        let note = if record.cancelled { " (cancelled)" } else { "" };
        eprintln!(
            "  Done: {} :: {} {}/{} trials, total {}{note}",
            record.model,
            record.variant,
            record.trials.len(),
            record.question_count,
            record.running_total,
        );
    }
}

/// Parse a comma-separated model list. Entries without a provider use the
/// configured default provider.
pub fn parse_models(list: Option<&str>, config: &AbstainConfig) -> Result<Vec<ModelSpec>> {
    let Some(list) = list else {
        return Ok(vec![ModelSpec {
            provider: config.default_provider.clone(),
            model: config.default_model.clone(),
        }]);
    };
    let models = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s.contains('/') {
                s.parse::<ModelSpec>().map_err(anyhow::Error::msg)
            } else {
                Ok(ModelSpec {
                    provider: config.default_provider.clone(),
                    model: s.to_string(),
                })
            }
        })
        .collect::<Result<Vec<_>>>()?;
    anyhow::ensure!(!models.is_empty(), "--models must name at least one model");
    Ok(models)
}

/// Parse a comma-separated list of prompt variants.
pub fn parse_variants(list: &str) -> Result<Vec<PromptVariant>> {
    let variants = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<PromptVariant>().map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()?;
    anyhow::ensure!(!variants.is_empty(), "at least one variant is required");
    Ok(variants)
}

/// Build clients for the named providers, or one shared mock when `mock`
/// is given.
pub fn build_clients<'a>(
    providers: impl IntoIterator<Item = &'a str>,
    config: &AbstainConfig,
    mock: Option<Arc<MockClient>>,
) -> Result<HashMap<String, Arc<dyn ModelClient>>> {
    let mut clients: HashMap<String, Arc<dyn ModelClient>> = HashMap::new();
    for name in providers {
        if clients.contains_key(name) {
            continue;
        }
        let client: Arc<dyn ModelClient> = match &mock {
            Some(mock) => mock.clone() as Arc<dyn ModelClient>,
            None => {
                let Some(provider_config) = config.providers.get(name) else {
                    anyhow::bail!(
                        "provider '{}' not found in config. Available: {:?}",
                        name,
                        config.providers.keys().collect::<Vec<_>>()
                    );
                };
                create_client(name, provider_config)?
            }
        };
        clients.insert(name.to_string(), client);
    }
    Ok(clients)
}

/// Cancel `handle` on the first Ctrl-C; exit on the second.
pub fn cancel_on_ctrl_c(handle: &CancelHandle) {
    let handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("\nInterrupted: finishing in-flight trials, then saving a partial report.");
        handle.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

pub fn timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H%M%S").to_string()
}
