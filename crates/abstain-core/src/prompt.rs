//! Prompt rendering for scored trials.
//!
//! Rendering is pure: the same question, scoring config, snapshot and variant
//! always produce the same text. Every prompt ends with the instruction to
//! finish on an `Answer: <value or blank>` line, which the response parser
//! relies on.

use std::fmt::{self, Write as _};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::{Classification, FakeStatistics, MatchRule, Question};
use crate::scoring::ScoringConfig;

/// The closing instruction every trial prompt carries.
pub const ANSWER_INSTRUCTION: &str =
    "Finish your reply with a final line of the form `Answer: <value or blank>`.";

/// Which framing of the scoring rule the prompt uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptVariant {
    /// Payoffs only.
    Plain,
    /// Payoffs plus an explicit invitation to abstain.
    WithBlank,
    /// Abstention option plus the running score and the previous outcome.
    RunningTotal,
    /// Abstention option plus a claimed prior record.
    FakeStatistics,
}

impl PromptVariant {
    pub const ALL: [PromptVariant; 4] = [
        PromptVariant::Plain,
        PromptVariant::WithBlank,
        PromptVariant::RunningTotal,
        PromptVariant::FakeStatistics,
    ];

    /// Whether the prompt explicitly tells the model it may leave the answer blank.
    pub fn offers_blank(self) -> bool {
        !matches!(self, PromptVariant::Plain)
    }
}

impl fmt::Display for PromptVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptVariant::Plain => write!(f, "plain"),
            PromptVariant::WithBlank => write!(f, "with_blank"),
            PromptVariant::RunningTotal => write!(f, "running_total"),
            PromptVariant::FakeStatistics => write!(f, "fake_statistics"),
        }
    }
}

impl FromStr for PromptVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "plain" | "base" => Ok(PromptVariant::Plain),
            "with_blank" | "blank" | "suggest_empty" => Ok(PromptVariant::WithBlank),
            "running_total" | "running" => Ok(PromptVariant::RunningTotal),
            "fake_statistics" | "fake_stats" => Ok(PromptVariant::FakeStatistics),
            other => Err(format!("unknown prompt variant: {other}")),
        }
    }
}

/// Read-only view of a session's state, taken before each trial.
///
/// `fake_statistics` and the real counts are independent on purpose; the
/// renderer shows whichever the variant asks for and never reconciles them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub trials_completed: usize,
    pub running_total: f64,
    pub correct: u32,
    pub incorrect: u32,
    pub blank: u32,
    /// Outcome of the most recent trial.
    pub previous: Option<Classification>,
    pub fake_statistics: Option<FakeStatistics>,
}

/// Render the prompt for one trial.
pub fn render(
    question: &Question,
    scoring: &ScoringConfig,
    snapshot: &SessionSnapshot,
    variant: PromptVariant,
) -> String {
    let mut out = String::new();

    out.push_str("You are taking a scored quiz.\n\n");
    out.push_str("Scoring:\n");
    let _ = writeln!(out, "- Correct answer: {} points", scoring.correct());
    let _ = writeln!(out, "- Incorrect answer: {} points", scoring.incorrect());
    let _ = writeln!(out, "- Blank answer: {} points", scoring.blank());

    if variant.offers_blank() {
        let _ = writeln!(
            out,
            "\nIf you are not confident, you may leave the answer blank by writing `Answer: blank`. A blank answer scores {} points.",
            scoring.blank()
        );
    }

    if let Some(fake) = snapshot.fake_statistics {
        let _ = writeln!(
            out,
            "\nSo far you have attempted {} questions and answered {} of them correctly.",
            fake.attempted, fake.correct
        );
    }

    if variant == PromptVariant::RunningTotal {
        let _ = writeln!(
            out,
            "\nYour current score is {} points after {} questions.",
            snapshot.running_total, snapshot.trials_completed
        );
        if let Some(previous) = snapshot.previous {
            let _ = writeln!(out, "Your previous answer was {previous}.");
        }
    }

    let _ = writeln!(
        out,
        "\nQuestion {}: {}",
        snapshot.trials_completed + 1,
        question.stem.trim()
    );
    for choice in &question.choices {
        let _ = writeln!(out, "{}. {}", choice.label, choice.text);
    }
    if question.is_multiple_choice() {
        out.push_str("Answer with the label of one choice.\n");
    } else if question.match_rule == MatchRule::Numeric {
        out.push_str("Give the answer as a number.\n");
    }

    out.push('\n');
    out.push_str(ANSWER_INSTRUCTION);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ScoringConfig {
        ScoringConfig::new(1.0, -0.25, 0.0).unwrap()
    }

    #[test]
    fn plain_prompt_embeds_payoffs_question_and_instruction() {
        let q = Question::multiple_choice(
            "q1",
            "Which planet is largest?",
            &[("A", "Mars"), ("B", "Jupiter")],
            "B",
        );
        let text = render(&q, &config(), &SessionSnapshot::default(), PromptVariant::Plain);

        assert!(text.contains("Correct answer: 1 points"));
        assert!(text.contains("Incorrect answer: -0.25 points"));
        assert!(text.contains("Blank answer: 0 points"));
        assert!(text.contains("Question 1: Which planet is largest?"));
        assert!(text.contains("A. Mars\nB. Jupiter"));
        assert!(!text.contains("leave the answer blank"));
        assert!(text.ends_with(ANSWER_INSTRUCTION));
    }

    #[test]
    fn with_blank_offers_abstention() {
        let q = Question::free_text("q1", "Capital of Burkina Faso?", "Ouagadougou");
        let text = render(&q, &config(), &SessionSnapshot::default(), PromptVariant::WithBlank);
        assert!(text.contains("`Answer: blank`"));
        assert!(!text.contains("current score"));
    }

    #[test]
    fn running_total_shows_real_score_and_previous_outcome() {
        let q = Question::free_text("q3", "2 + 2?", "4");
        let snapshot = SessionSnapshot {
            trials_completed: 2,
            running_total: 0.75,
            correct: 1,
            incorrect: 1,
            blank: 0,
            previous: Some(Classification::Incorrect),
            fake_statistics: None,
        };
        let text = render(&q, &config(), &snapshot, PromptVariant::RunningTotal);
        assert!(text.contains("Your current score is 0.75 points after 2 questions."));
        assert!(text.contains("Your previous answer was incorrect."));
        assert!(text.contains("Question 3: 2 + 2?"));
    }

    #[test]
    fn fake_statistics_are_rendered_even_when_they_contradict_reality() {
        let q = Question::free_text("q", "Stem", "x");
        let snapshot = SessionSnapshot {
            trials_completed: 5,
            running_total: -1.25,
            correct: 0,
            incorrect: 5,
            blank: 0,
            previous: Some(Classification::Incorrect),
            fake_statistics: Some(FakeStatistics {
                attempted: 20,
                correct: 19,
            }),
        };
        let text = render(&q, &config(), &snapshot, PromptVariant::FakeStatistics);
        assert!(text.contains("attempted 20 questions and answered 19 of them correctly"));
        assert!(!text.contains("-1.25"));

        let both = render(&q, &config(), &snapshot, PromptVariant::RunningTotal);
        assert!(both.contains("answered 19 of them correctly"));
        assert!(both.contains("Your current score is -1.25 points"));
    }

    #[test]
    fn numeric_questions_ask_for_a_number() {
        let mut q = Question::free_text("q", "How many moons does Mars have?", "2");
        q.match_rule = MatchRule::Numeric;
        let text = render(&q, &config(), &SessionSnapshot::default(), PromptVariant::Plain);
        assert!(text.contains("Give the answer as a number."));
    }

    #[test]
    fn rendering_is_deterministic() {
        let q = Question::free_text("q", "Stem", "x");
        let s = SessionSnapshot::default();
        assert_eq!(
            render(&q, &config(), &s, PromptVariant::WithBlank),
            render(&q, &config(), &s, PromptVariant::WithBlank)
        );
    }

    #[test]
    fn variant_parse_accepts_aliases() {
        assert_eq!("suggest_empty".parse::<PromptVariant>().unwrap(), PromptVariant::WithBlank);
        assert_eq!("running-total".parse::<PromptVariant>().unwrap(), PromptVariant::RunningTotal);
        assert_eq!(PromptVariant::FakeStatistics.to_string(), "fake_statistics");
        assert!("shouting".parse::<PromptVariant>().is_err());
    }
}
