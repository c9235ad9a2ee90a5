//! The `abstain init` command.

use std::path::Path;

use anyhow::Result;

pub fn execute() -> Result<()> {
    if Path::new("abstain.toml").exists() {
        println!("abstain.toml already exists, skipping.");
    } else {
        std::fs::write("abstain.toml", SAMPLE_CONFIG)?;
        println!("Created abstain.toml");
    }

    std::fs::create_dir_all("experiments")?;
    let example_path = Path::new("experiments/example.toml");
    if example_path.exists() {
        println!("experiments/example.toml already exists, skipping.");
    } else {
        std::fs::write(example_path, EXAMPLE_EXPERIMENT)?;
        println!("Created experiments/example.toml");
    }

    println!("\nNext steps:");
    println!("  1. Edit abstain.toml with your API keys");
    println!("  2. Run: abstain validate --experiment experiments/example.toml");
    println!("  3. Run: abstain run --experiment experiments/example.toml");

    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# abstain configuration

default_provider = "anthropic"
default_model = "claude-sonnet-4-20250514"
default_temperature = 0.0
max_tokens = 1024
max_retries = 3
retry_delay_ms = 1000
call_timeout_secs = 120
parallelism = 4
output_dir = "./abstain-results"

[providers.anthropic]
type = "anthropic"
api_key = "${ANTHROPIC_API_KEY}"

[providers.openai]
type = "openai"
api_key = "${OPENAI_API_KEY}"

# Any OpenAI-compatible endpoint works, e.g. Together for open-weight models.
[providers.together]
type = "openai"
api_key = "${TOGETHER_API_KEY}"
base_url = "https://api.together.xyz"

[providers.ollama]
type = "ollama"
base_url = "http://localhost:11434"
"#;

const EXAMPLE_EXPERIMENT: &str = r#"[experiment]
id = "example"
name = "Example Experiment"
description = "Three questions under every framing of the scoring rule"
variants = ["plain", "with_blank", "running_total"]

[scoring]
correct = 1.0
incorrect = -0.25
blank = 0.0

[grading]
unparsed_policy = "incorrect"
numeric_tolerance = 0.0

[[questions]]
id = "capital"
stem = "What is the capital of Australia?"
answer = "Canberra"

[[questions]]
id = "moons"
stem = "How many moons does Mars have?"
answer = "2"
match_rule = "numeric"

[[questions]]
id = "noble-gas"
stem = "Which of these is a noble gas?"
choices = [
    { label = "A", text = "Nitrogen" },
    { label = "B", text = "Argon" },
    { label = "C", text = "Chlorine" },
]
answer = "B"
"#;
