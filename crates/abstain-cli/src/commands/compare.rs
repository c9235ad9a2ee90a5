//! The `abstain compare` command.

use std::path::PathBuf;

use anyhow::Result;

use abstain_core::model::Classification;
use abstain_core::prompt::PromptVariant;
use abstain_core::report::ExperimentReport;

pub fn execute(report_path: PathBuf, from: String, to: String, format: String) -> Result<()> {
    let report = ExperimentReport::load_json(&report_path)?;
    let from: PromptVariant = from.parse().map_err(anyhow::Error::msg)?;
    let to: PromptVariant = to.parse().map_err(anyhow::Error::msg)?;
    anyhow::ensure!(from != to, "--from and --to must name different variants");

    let matrix = report.transitions(from, to);

    match format.as_str() {
        "markdown" | "md" => {
            println!("{}", matrix.to_markdown());
        }
        "json" => {
            println!("{}", serde_json::to_string_pretty(&matrix)?);
        }
        _ => {
            println!(
                "Transitions {from} -> {to}: {} paired, {} unpaired",
                matrix.paired, matrix.unpaired
            );
            if matrix.paired == 0 {
                println!("No question was answered under both variants.");
                return Ok(());
            }
            for f in Classification::ALL {
                for t in Classification::ALL {
                    let n = matrix.get(f, t);
                    if n > 0 {
                        println!("  {f} -> {t}: {n}");
                    }
                }
            }
            let to_blank = matrix.get(Classification::Incorrect, Classification::Blank);
            let lost = matrix.get(Classification::Correct, Classification::Blank);
            println!("\n{to_blank} wrong answer(s) became blank; {lost} correct answer(s) became blank.");
        }
    }

    Ok(())
}
