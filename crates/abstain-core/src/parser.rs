//! TOML experiment parser.
//!
//! Loads experiments from TOML files and directories, reads JSONL question
//! banks, and validates the result.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::consistency::ProbeConfig;
use crate::grader::{GradingConfig, UnparsedPolicy};
use crate::model::{Choice, Experiment, FakeStatistics, MatchRule, Question};
use crate::prompt::PromptVariant;
use crate::response::parse_number;
use crate::scoring::ScoringConfig;

/// Intermediate TOML structure for parsing experiment files.
#[derive(Debug, Deserialize)]
struct TomlExperimentFile {
    experiment: TomlExperimentHeader,
    scoring: TomlScoring,
    grading: TomlGrading,
    #[serde(default)]
    fake_statistics: Option<FakeStatistics>,
    #[serde(default)]
    probe: Option<ProbeConfig>,
    #[serde(default)]
    questions: Vec<TomlQuestion>,
}

#[derive(Debug, Deserialize)]
struct TomlExperimentHeader {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    variants: Vec<String>,
    #[serde(default)]
    max_trials: Option<usize>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    judge_model: Option<String>,
    /// JSONL question bank, relative to the experiment file.
    #[serde(default)]
    questions_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TomlScoring {
    correct: f64,
    incorrect: f64,
    blank: f64,
}

/// Both fields are required: how unparsed replies score is an experimental
/// variable, not something to default silently.
#[derive(Debug, Deserialize)]
struct TomlGrading {
    unparsed_policy: UnparsedPolicy,
    numeric_tolerance: f64,
}

#[derive(Debug, Deserialize)]
struct TomlQuestion {
    id: String,
    #[serde(alias = "question")]
    stem: String,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default, alias = "ground_truth")]
    answer: Option<String>,
    #[serde(default)]
    match_rule: Option<MatchRule>,
    #[serde(default)]
    difficulty: Option<String>,
}

impl TomlQuestion {
    fn into_question(self) -> Question {
        let match_rule = self.match_rule.unwrap_or(if self.choices.is_empty() {
            MatchRule::Normalized
        } else {
            MatchRule::Exact
        });
        Question {
            id: self.id,
            stem: self.stem,
            choices: self.choices,
            ground_truth: self.answer,
            match_rule,
            difficulty: self.difficulty,
        }
    }
}

/// A line of a JSONL question bank: either a full question or the short
/// `{"question": ..., "answer": ...}` form.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonlQuestion {
    Full(Question),
    Bank {
        question: String,
        #[serde(default)]
        answer: Option<String>,
        #[serde(default)]
        difficulty: Option<String>,
    },
}

/// Parse a single TOML file into an `Experiment`.
pub fn parse_experiment(path: &Path) -> Result<Experiment> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read experiment file: {}", path.display()))?;

    parse_experiment_str(&content, path)
}

/// Parse a TOML string into an `Experiment`. A `questions_file` is resolved
/// relative to `source_path`.
pub fn parse_experiment_str(content: &str, source_path: &Path) -> Result<Experiment> {
    let parsed: TomlExperimentFile = toml::from_str(content)
        .with_context(|| format!("failed to parse TOML: {}", source_path.display()))?;

    let scoring = ScoringConfig::new(
        parsed.scoring.correct,
        parsed.scoring.incorrect,
        parsed.scoring.blank,
    )
    .with_context(|| format!("invalid [scoring] in {}", source_path.display()))?;

    let grading = GradingConfig::new(
        parsed.grading.unparsed_policy,
        parsed.grading.numeric_tolerance,
    )
    .with_context(|| format!("invalid [grading] in {}", source_path.display()))?;

    let variants = if parsed.experiment.variants.is_empty() {
        default_variants(parsed.fake_statistics.is_some())
    } else {
        parsed
            .experiment
            .variants
            .iter()
            .map(|v| v.parse().map_err(|e: String| anyhow::anyhow!("{}", e)))
            .collect::<Result<Vec<PromptVariant>>>()?
    };

    let mut questions: Vec<Question> = parsed
        .questions
        .into_iter()
        .map(TomlQuestion::into_question)
        .collect();

    if let Some(file) = &parsed.experiment.questions_file {
        let base = source_path.parent().unwrap_or_else(|| Path::new("."));
        questions.extend(load_questions_jsonl(&base.join(file))?);
    }

    Ok(Experiment {
        id: parsed.experiment.id,
        name: parsed.experiment.name,
        description: parsed.experiment.description,
        variants,
        max_trials: parsed.experiment.max_trials,
        system_prompt: parsed.experiment.system_prompt,
        judge_model: parsed.experiment.judge_model,
        scoring,
        grading,
        fake_statistics: parsed.fake_statistics,
        questions,
        probe: parsed.probe,
    })
}

fn default_variants(with_fake_statistics: bool) -> Vec<PromptVariant> {
    PromptVariant::ALL
        .into_iter()
        .filter(|v| with_fake_statistics || *v != PromptVariant::FakeStatistics)
        .collect()
}

/// Load a JSONL question bank. Blank lines are skipped; short-form lines get
/// ids derived from the file name and line number.
pub fn load_questions_jsonl(path: &Path) -> Result<Vec<Question>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read question bank: {}", path.display()))?;
    let prefix = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "q".to_string());

    let mut questions = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry: JsonlQuestion = serde_json::from_str(line).with_context(|| {
            format!("invalid question on line {} of {}", number + 1, path.display())
        })?;
        questions.push(match entry {
            JsonlQuestion::Full(question) => question,
            JsonlQuestion::Bank {
                question,
                answer,
                difficulty,
            } => Question {
                id: format!("{prefix}-{}", number + 1),
                stem: question,
                choices: Vec::new(),
                ground_truth: answer,
                match_rule: MatchRule::Normalized,
                difficulty,
            },
        });
    }
    Ok(questions)
}

/// Recursively load all `.toml` experiment files from a directory.
pub fn load_experiment_directory(dir: &Path) -> Result<Vec<Experiment>> {
    let mut experiments = Vec::new();

    if !dir.is_dir() {
        anyhow::bail!("not a directory: {}", dir.display());
    }

    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory: {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            experiments.extend(load_experiment_directory(&path)?);
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            match parse_experiment(&path) {
                Ok(experiment) => experiments.push(experiment),
                Err(e) => {
                    tracing::warn!("skipping {}: {:#}", path.display(), e);
                }
            }
        }
    }

    Ok(experiments)
}

/// A warning from experiment validation.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    /// The question ID (if applicable).
    pub question_id: Option<String>,
    /// Warning message.
    pub message: String,
}

impl ValidationWarning {
    fn question(id: &str, message: impl Into<String>) -> Self {
        Self {
            question_id: Some(id.to_string()),
            message: message.into(),
        }
    }

    fn experiment(message: impl Into<String>) -> Self {
        Self {
            question_id: None,
            message: message.into(),
        }
    }
}

/// Validate an experiment for common issues.
pub fn validate_experiment(experiment: &Experiment) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    if experiment.questions.is_empty() && experiment.probe.is_none() {
        warnings.push(ValidationWarning::experiment(
            "experiment has no questions and no [probe] section",
        ));
    }

    let mut seen_ids = HashSet::new();
    for question in &experiment.questions {
        if !seen_ids.insert(&question.id) {
            warnings.push(ValidationWarning::question(
                &question.id,
                format!("duplicate question ID: {}", question.id),
            ));
        }
    }

    for question in &experiment.questions {
        let id = question.id.as_str();
        if question.stem.trim().is_empty() {
            warnings.push(ValidationWarning::question(id, "question stem is empty"));
        }

        let Some(truth) = question.ground_truth.as_deref() else {
            warnings.push(ValidationWarning::question(
                id,
                "no ground truth; answers will be graded as unverified",
            ));
            continue;
        };

        if question.is_multiple_choice() {
            let mut labels = HashSet::new();
            for choice in &question.choices {
                if !labels.insert(choice.label.trim()) {
                    warnings.push(ValidationWarning::question(
                        id,
                        format!("duplicate choice label: {}", choice.label),
                    ));
                }
            }
            if !question.choices.iter().any(|c| c.label.trim() == truth.trim()) {
                warnings.push(ValidationWarning::question(
                    id,
                    format!("ground truth '{truth}' is not one of the choice labels"),
                ));
            }
        } else if question.match_rule == MatchRule::Numeric && parse_number(truth).is_none() {
            warnings.push(ValidationWarning::question(
                id,
                format!("numeric question has non-numeric ground truth '{truth}'"),
            ));
        }
    }

    if let Some(fake) = experiment.fake_statistics {
        if fake.correct > fake.attempted {
            warnings.push(ValidationWarning::experiment(format!(
                "fake statistics claim {} correct out of {} attempted",
                fake.correct, fake.attempted
            )));
        }
    }

    if experiment.variants.contains(&PromptVariant::FakeStatistics)
        && experiment.fake_statistics.is_none()
    {
        warnings.push(ValidationWarning::experiment(
            "variant 'fake_statistics' requires a [fake_statistics] block",
        ));
    }

    if experiment
        .questions
        .iter()
        .any(|q| q.match_rule == MatchRule::Judge && !q.is_multiple_choice())
        && experiment.judge_model.is_none()
    {
        warnings.push(ValidationWarning::experiment(
            "judge questions without judge_model fall back to normalized matching",
        ));
    }

    warnings
}
