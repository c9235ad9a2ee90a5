//! Grading parsed answers against ground truth.
//!
//! How unparsed and ambiguous replies are scored is itself an experimental
//! variable, so [`GradingConfig`] has no default: callers must choose an
//! [`UnparsedPolicy`] and a numeric tolerance explicitly.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::judge::JudgeVerdict;
use crate::model::{Classification, MatchRule, ParsedAnswer, Question};
use crate::response::parse_number;
use crate::scoring::ScoringConfig;

/// How replies without a gradable answer are classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnparsedPolicy {
    /// Score them like a wrong answer.
    Incorrect,
    /// Score them like an abstention.
    Blank,
}

impl UnparsedPolicy {
    fn classification(self) -> Classification {
        match self {
            UnparsedPolicy::Incorrect => Classification::Incorrect,
            UnparsedPolicy::Blank => Classification::Blank,
        }
    }
}

/// Grading parameters. Both fields are required.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGradingConfig", into = "RawGradingConfig")]
pub struct GradingConfig {
    unparsed_policy: UnparsedPolicy,
    numeric_tolerance: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawGradingConfig {
    unparsed_policy: UnparsedPolicy,
    numeric_tolerance: f64,
}

impl GradingConfig {
    pub fn new(unparsed_policy: UnparsedPolicy, numeric_tolerance: f64) -> Result<Self, ConfigError> {
        if !numeric_tolerance.is_finite() || numeric_tolerance < 0.0 {
            return Err(ConfigError::InvalidTolerance(numeric_tolerance));
        }
        Ok(Self {
            unparsed_policy,
            numeric_tolerance,
        })
    }

    pub fn unparsed_policy(&self) -> UnparsedPolicy {
        self.unparsed_policy
    }

    pub fn numeric_tolerance(&self) -> f64 {
        self.numeric_tolerance
    }
}

impl TryFrom<RawGradingConfig> for GradingConfig {
    type Error = ConfigError;

    fn try_from(raw: RawGradingConfig) -> Result<Self, Self::Error> {
        GradingConfig::new(raw.unparsed_policy, raw.numeric_tolerance)
    }
}

impl From<GradingConfig> for RawGradingConfig {
    fn from(config: GradingConfig) -> Self {
        Self {
            unparsed_policy: config.unparsed_policy,
            numeric_tolerance: config.numeric_tolerance,
        }
    }
}

/// The result of grading one answer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grade {
    pub classification: Classification,
    pub payoff: f64,
    /// An answer was given but the question has no ground truth to check it.
    pub unverified: bool,
}

/// Grades parsed answers and assigns payoffs.
#[derive(Debug, Clone, Copy)]
pub struct Grader {
    scoring: ScoringConfig,
    grading: GradingConfig,
}

impl Grader {
    pub fn new(scoring: ScoringConfig, grading: GradingConfig) -> Self {
        Self { scoring, grading }
    }

    pub fn scoring(&self) -> &ScoringConfig {
        &self.scoring
    }

    pub fn grading(&self) -> &GradingConfig {
        &self.grading
    }

    /// Grade an answer without a judge verdict.
    pub fn grade(&self, parsed: &ParsedAnswer, question: &Question) -> Grade {
        self.grade_with_verdict(parsed, question, None)
    }

    /// Grade an answer, using a judge verdict for `judge` questions when one
    /// is available.
    pub fn grade_with_verdict(
        &self,
        parsed: &ParsedAnswer,
        question: &Question,
        verdict: Option<JudgeVerdict>,
    ) -> Grade {
        let mut unverified = false;
        let classification = match parsed {
            ParsedAnswer::Blank => Classification::Blank,
            ParsedAnswer::Unparsed { .. } | ParsedAnswer::Ambiguous { .. } => {
                self.grading.unparsed_policy.classification()
            }
            ParsedAnswer::Value { value } => match question.ground_truth.as_deref() {
                Some(truth) => self.classify_value(value, truth, question, verdict),
                None => {
                    unverified = true;
                    self.grading.unparsed_policy.classification()
                }
            },
        };

        Grade {
            classification,
            payoff: self.scoring.payoff(classification),
            unverified,
        }
    }

    fn classify_value(
        &self,
        value: &str,
        truth: &str,
        question: &Question,
        verdict: Option<JudgeVerdict>,
    ) -> Classification {
        if question.is_multiple_choice() {
            return correct_if(value.trim() == truth.trim());
        }

        match question.match_rule {
            MatchRule::Exact => correct_if(value.trim() == truth.trim()),
            MatchRule::Normalized => correct_if(normalize(value) == normalize(truth)),
            MatchRule::Numeric => match (parse_number(value), parse_number(truth)) {
                (Some(got), Some(expected)) => {
                    correct_if((got - expected).abs() <= self.grading.numeric_tolerance)
                }
                _ => correct_if(normalize(value) == normalize(truth)),
            },
            MatchRule::Judge => match verdict {
                Some(JudgeVerdict::Correct) => Classification::Correct,
                Some(JudgeVerdict::Incorrect) => Classification::Incorrect,
                Some(JudgeVerdict::Doubt) => Classification::Blank,
                Some(JudgeVerdict::Error) | None => {
                    correct_if(normalize(value) == normalize(truth))
                }
            },
        }
    }
}

fn correct_if(matched: bool) -> Classification {
    if matched {
        Classification::Correct
    } else {
        Classification::Incorrect
    }
}

/// Lowercase, collapse whitespace, drop surrounding quotes and trailing punctuation.
pub fn normalize(s: &str) -> String {
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_matches(|c| matches!(c, '"' | '\'' | '`' | '\u{201c}' | '\u{201d}'))
        .trim_end_matches(|c| matches!(c, '.' | ',' | '!' | '?' | ';' | ':'))
        .trim()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UnparsedReason;
    use crate::response;

    fn grader(policy: UnparsedPolicy) -> Grader {
        Grader::new(
            ScoringConfig::new(1.0, -0.25, 0.0).unwrap(),
            GradingConfig::new(policy, 0.01).unwrap(),
        )
    }

    fn mc() -> Question {
        Question::multiple_choice("q", "?", &[("A", "x"), ("B", "y"), ("C", "z")], "B")
    }

    #[test]
    fn multiple_choice_scenarios() {
        let g = grader(UnparsedPolicy::Incorrect);
        let q = mc();

        let correct = g.grade(&response::parse("I think ... Answer: B", &q), &q);
        assert_eq!(correct.classification, Classification::Correct);
        assert_eq!(correct.payoff, 1.0);

        let blank = g.grade(&response::parse("Answer: ", &q), &q);
        assert_eq!(blank.classification, Classification::Blank);
        assert_eq!(blank.payoff, 0.0);

        let wrong = g.grade(&response::parse("Answer: C", &q), &q);
        assert_eq!(wrong.classification, Classification::Incorrect);
        assert_eq!(wrong.payoff, -0.25);
    }

    #[test]
    fn unparsed_follows_explicit_policy() {
        let q = mc();
        let unparsed = ParsedAnswer::Unparsed {
            reason: UnparsedReason::MissingMarker,
        };
        let ambiguous = ParsedAnswer::Ambiguous { value: "Q".into() };

        let strict = grader(UnparsedPolicy::Incorrect);
        assert_eq!(strict.grade(&unparsed, &q).classification, Classification::Incorrect);
        assert_eq!(strict.grade(&ambiguous, &q).payoff, -0.25);

        let lenient = grader(UnparsedPolicy::Blank);
        assert_eq!(lenient.grade(&unparsed, &q).classification, Classification::Blank);
        assert_eq!(lenient.grade(&ambiguous, &q).payoff, 0.0);
    }

    #[test]
    fn normalized_text_matching() {
        let g = grader(UnparsedPolicy::Incorrect);
        let q = Question::free_text("q", "Capital?", "Ulaanbaatar");
        for answer in ["ulaanbaatar", "Ulaanbaatar.", "  ULAANBAATAR ", "\"Ulaanbaatar\""] {
            assert_eq!(
                g.grade(&ParsedAnswer::value(answer), &q).classification,
                Classification::Correct,
                "{answer:?}"
            );
        }
        assert_eq!(
            g.grade(&ParsedAnswer::value("Ulan Bator"), &q).classification,
            Classification::Incorrect
        );
    }

    #[test]
    fn exact_matching_is_case_sensitive() {
        let g = grader(UnparsedPolicy::Incorrect);
        let mut q = Question::free_text("q", "Symbol for sodium?", "Na");
        q.match_rule = MatchRule::Exact;
        assert_eq!(g.grade(&ParsedAnswer::value("Na"), &q).classification, Classification::Correct);
        assert_eq!(g.grade(&ParsedAnswer::value("NA"), &q).classification, Classification::Incorrect);
    }

    #[test]
    fn numeric_tolerance() {
        let g = grader(UnparsedPolicy::Incorrect);
        let mut q = Question::free_text("q", "Pi to two places?", "3.14");
        q.match_rule = MatchRule::Numeric;
        assert_eq!(g.grade(&ParsedAnswer::value("3.141"), &q).classification, Classification::Correct);
        assert_eq!(g.grade(&ParsedAnswer::value("3.2"), &q).classification, Classification::Incorrect);

        let exact = Grader::new(
            ScoringConfig::new(1.0, 0.0, 0.0).unwrap(),
            GradingConfig::new(UnparsedPolicy::Incorrect, 0.0).unwrap(),
        );
        assert_eq!(exact.grade(&ParsedAnswer::value("3.141"), &q).classification, Classification::Incorrect);
        assert_eq!(exact.grade(&ParsedAnswer::value("3.14"), &q).classification, Classification::Correct);
    }

    #[test]
    fn judge_verdicts() {
        let g = grader(UnparsedPolicy::Incorrect);
        let mut q = Question::free_text("q", "Who wrote it?", "Mary Shelley");
        q.match_rule = MatchRule::Judge;
        let answer = ParsedAnswer::value("Shelley");

        let graded = |v| g.grade_with_verdict(&answer, &q, v).classification;
        assert_eq!(graded(Some(JudgeVerdict::Correct)), Classification::Correct);
        assert_eq!(graded(Some(JudgeVerdict::Incorrect)), Classification::Incorrect);
        assert_eq!(graded(Some(JudgeVerdict::Doubt)), Classification::Blank);
        // Falls back to normalized matching.
        assert_eq!(graded(Some(JudgeVerdict::Error)), Classification::Incorrect);
        assert_eq!(
            g.grade(&ParsedAnswer::value("mary shelley"), &q).classification,
            Classification::Correct
        );
    }

    #[test]
    fn missing_ground_truth_is_unverified() {
        let g = grader(UnparsedPolicy::Blank);
        let mut q = Question::free_text("q", "?", "x");
        q.ground_truth = None;
        let grade = g.grade(&ParsedAnswer::value("anything"), &q);
        assert!(grade.unverified);
        assert_eq!(grade.classification, Classification::Blank);

        let blank = g.grade(&ParsedAnswer::Blank, &q);
        assert!(!blank.unverified);
    }

    #[test]
    fn tolerance_must_be_explicit_and_sane() {
        assert!(GradingConfig::new(UnparsedPolicy::Blank, -0.1).is_err());
        assert!(GradingConfig::new(UnparsedPolicy::Blank, f64::NAN).is_err());

        let missing = toml::from_str::<GradingConfig>("unparsed_policy = \"blank\"");
        assert!(missing.is_err(), "numeric_tolerance has no default");
        let missing = toml::from_str::<GradingConfig>("numeric_tolerance = 0.5");
        assert!(missing.is_err(), "unparsed_policy has no default");
    }
}
