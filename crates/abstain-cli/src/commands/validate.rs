//! The `abstain validate` command.

use std::path::PathBuf;

use anyhow::Result;

use abstain_core::parser;

pub fn execute(path: PathBuf) -> Result<()> {
    let experiments = if path.is_dir() {
        parser::load_experiment_directory(&path)?
    } else {
        vec![parser::parse_experiment(&path)?]
    };

    let mut total_warnings = 0;

    for experiment in &experiments {
        let variants: Vec<String> = experiment.variants.iter().map(ToString::to_string).collect();
        println!(
            "Experiment: {} ({} questions; variants: {})",
            experiment.name,
            experiment.questions.len(),
            variants.join(", ")
        );

        let warnings = parser::validate_experiment(experiment);
        for w in &warnings {
            let prefix = w
                .question_id
                .as_ref()
                .map(|id| format!("  [{id}]"))
                .unwrap_or_else(|| "  ".to_string());
            println!("{prefix} WARNING: {}", w.message);
        }
        total_warnings += warnings.len();
    }

    if total_warnings == 0 {
        println!("All experiments valid.");
    } else {
        println!("\n{total_warnings} warning(s) found.");
    }

    Ok(())
}
