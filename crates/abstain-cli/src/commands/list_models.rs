//! The `abstain list-models` command.

use std::path::PathBuf;

use anyhow::Result;

use abstain_core::traits::ModelInfo;
use abstain_providers::config::load_config_from;
use abstain_providers::ollama::OllamaClient;
use abstain_providers::{create_client, ProviderConfig};

pub async fn execute(provider_filter: Option<String>, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config_from(config_path.as_deref())?;

    let mut names: Vec<&String> = config.providers.keys().collect();
    names.sort();

    let mut found_any = false;
    for name in names {
        if provider_filter.as_ref().is_some_and(|filter| filter != name) {
            continue;
        }

        let models: Vec<ModelInfo> = match &config.providers[name] {
            ProviderConfig::Ollama { base_url } => {
                match OllamaClient::new(base_url).list_models_async().await {
                    Ok(models) => models,
                    Err(e) => {
                        eprintln!("Provider {name}: {e:#}");
                        continue;
                    }
                }
            }
            other => create_client(name, other)?.available_models(),
        };

        if models.is_empty() {
            continue;
        }
        found_any = true;
        println!("Provider: {name}");
        for model in &models {
            if model.max_context > 0 {
                println!(
                    "  {} — {} ({}K context)",
                    model.id,
                    model.name,
                    model.max_context / 1000
                );
            } else {
                println!("  {} — {}", model.id, model.name);
            }
        }
        println!();
    }

    if !found_any {
        println!("No providers configured. Run `abstain init` to create a config file.");
    }

    Ok(())
}
