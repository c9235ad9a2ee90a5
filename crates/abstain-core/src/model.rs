//! Core data model types for abstain.
//!
//! These are the types every stage of a session passes along: questions,
//! parsed answers, classifications and graded trials.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consistency::ProbeConfig;
use crate::grader::GradingConfig;
use crate::judge::JudgeVerdict;
use crate::prompt::PromptVariant;
use crate::scoring::ScoringConfig;

/// A single question put to a model. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    /// Unique identifier within a session.
    pub id: String,
    /// The question text shown to the model.
    pub stem: String,
    /// Answer options; empty for free-text questions.
    #[serde(default)]
    pub choices: Vec<Choice>,
    /// The verified answer, if one is known. For multiple-choice questions
    /// this is the label of the correct choice.
    #[serde(default)]
    pub ground_truth: Option<String>,
    /// How a free-text answer is compared to the ground truth.
    #[serde(default)]
    pub match_rule: MatchRule,
    /// Opaque difficulty label, carried through to reports untouched.
    #[serde(default)]
    pub difficulty: Option<String>,
}

impl Question {
    /// A free-text question with a known answer.
    pub fn free_text(id: impl Into<String>, stem: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stem: stem.into(),
            choices: Vec::new(),
            ground_truth: Some(answer.into()),
            match_rule: MatchRule::default(),
            difficulty: None,
        }
    }

    /// A multiple-choice question; `answer` is the label of the correct choice.
    pub fn multiple_choice(
        id: impl Into<String>,
        stem: impl Into<String>,
        choices: &[(&str, &str)],
        answer: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            stem: stem.into(),
            choices: choices
                .iter()
                .map(|(label, text)| Choice {
                    label: (*label).to_string(),
                    text: (*text).to_string(),
                })
                .collect(),
            ground_truth: Some(answer.into()),
            match_rule: MatchRule::Exact,
            difficulty: None,
        }
    }

    pub fn is_multiple_choice(&self) -> bool {
        !self.choices.is_empty()
    }
}

/// One option of a multiple-choice question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    /// Short label such as "A" or "1".
    pub label: String,
    /// The option text.
    pub text: String,
}

/// How a free-text answer is compared against the ground truth.
///
/// Multiple-choice questions always compare choice labels exactly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    /// Byte-for-byte after trimming.
    Exact,
    /// Case, inner whitespace and trailing punctuation are ignored.
    #[default]
    Normalized,
    /// Both sides parsed as numbers and compared within the grading tolerance.
    Numeric,
    /// A judge model decides; falls back to `Normalized` without a judge.
    Judge,
}

/// A claimed prior performance, shown to the model regardless of its real record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FakeStatistics {
    /// Number of questions the model is told it attempted.
    pub attempted: u32,
    /// Number of those it is told it got right.
    pub correct: u32,
}

/// The outcome of grading one answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Correct,
    Incorrect,
    Blank,
}

impl Classification {
    pub const ALL: [Classification; 3] = [
        Classification::Correct,
        Classification::Incorrect,
        Classification::Blank,
    ];
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Correct => write!(f, "correct"),
            Classification::Incorrect => write!(f, "incorrect"),
            Classification::Blank => write!(f, "blank"),
        }
    }
}

impl FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "correct" => Ok(Classification::Correct),
            "incorrect" => Ok(Classification::Incorrect),
            "blank" => Ok(Classification::Blank),
            other => Err(format!("unknown classification: {other}")),
        }
    }
}

/// What the response parser extracted from a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ParsedAnswer {
    /// A concrete answer. For multiple-choice questions, the matched choice label.
    Value { value: String },
    /// An explicit abstention.
    Blank,
    /// A multiple-choice answer that matched no choice, or more than one.
    Ambiguous { value: String },
    /// No usable answer could be extracted.
    Unparsed { reason: UnparsedReason },
}

impl ParsedAnswer {
    pub fn value(value: impl Into<String>) -> Self {
        ParsedAnswer::Value {
            value: value.into(),
        }
    }

    pub fn as_value(&self) -> Option<&str> {
        match self {
            ParsedAnswer::Value { value } => Some(value),
            _ => None,
        }
    }
}

/// Why a reply produced no usable answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnparsedReason {
    /// The reply has no `Answer:` line.
    MissingMarker,
    /// The value after the marker could not be read for this question type.
    UnparseableValue { value: String },
    /// Every attempt to reach the model failed.
    ClientFailure { message: String },
}

/// One graded question/prompt/response cycle. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trial {
    /// Zero-based position in the session.
    pub index: usize,
    pub question_id: String,
    /// The rendered prompt text.
    pub prompt: String,
    /// The model's raw reply; empty when the call never succeeded.
    pub raw_response: String,
    pub parsed: ParsedAnswer,
    pub classification: Classification,
    pub payoff: f64,
    /// Sum of payoffs of this trial and every trial before it.
    pub running_total: f64,
    /// Number of model calls made for this trial, including retries.
    pub attempts: u32,
    /// True when the model could not be reached and the trial was recorded
    /// without a reply.
    #[serde(default)]
    pub degraded: bool,
    /// True when an answer was given but there was no ground truth to check it.
    #[serde(default)]
    pub unverified: bool,
    /// The last client error, if any attempt failed.
    #[serde(default)]
    pub failure: Option<String>,
    /// Verdict of the judge model, for judge-graded questions.
    #[serde(default)]
    pub judge_verdict: Option<JudgeVerdict>,
    /// Latency of the successful call in milliseconds.
    #[serde(default)]
    pub latency_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// An experiment: one question list run under several prompt variants.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Variants to run, one session per model and variant.
    pub variants: Vec<PromptVariant>,
    pub max_trials: Option<usize>,
    /// Overrides the default quiz system prompt.
    pub system_prompt: Option<String>,
    /// `provider/model` used to grade `judge` questions.
    pub judge_model: Option<String>,
    pub scoring: ScoringConfig,
    pub grading: GradingConfig,
    pub fake_statistics: Option<FakeStatistics>,
    pub questions: Vec<Question>,
    /// Settings for the consistency probe, if the experiment defines one.
    pub probe: Option<ProbeConfig>,
}

impl Experiment {
    pub fn summary(&self) -> ExperimentSummary {
        ExperimentSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            question_count: self.questions.len(),
            scoring: self.scoring,
            grading: self.grading,
            fake_statistics: self.fake_statistics,
        }
    }
}

/// Summary of an experiment (without the question list).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub id: String,
    pub name: String,
    pub question_count: usize,
    pub scoring: ScoringConfig,
    pub grading: GradingConfig,
    #[serde(default)]
    pub fake_statistics: Option<FakeStatistics>,
}
