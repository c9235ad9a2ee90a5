//! Payoff values and the scoring policy.
//!
//! A `ScoringConfig` can only be obtained through validation, so grading code
//! never sees a config that violates `incorrect <= blank < correct`.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::Classification;

/// Points awarded per classification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawScoringConfig", into = "RawScoringConfig")]
pub struct ScoringConfig {
    correct: f64,
    incorrect: f64,
    blank: f64,
}

/// Unvalidated on-disk shape of a scoring config.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawScoringConfig {
    correct: f64,
    incorrect: f64,
    blank: f64,
}

impl ScoringConfig {
    /// Validate and build a scoring config.
    ///
    /// A negative `incorrect` (a true penalty) and `blank == incorrect`
    /// (plain binary scoring) are both accepted.
    pub fn new(correct: f64, incorrect: f64, blank: f64) -> Result<Self, ConfigError> {
        if !(correct.is_finite() && incorrect.is_finite() && blank.is_finite()) {
            return Err(ConfigError::NonFinitePayoff {
                correct,
                incorrect,
                blank,
            });
        }
        if !(incorrect <= blank && blank < correct) {
            return Err(ConfigError::PayoffOrdering {
                correct,
                incorrect,
                blank,
            });
        }
        Ok(Self {
            correct,
            incorrect,
            blank,
        })
    }

    pub fn correct(&self) -> f64 {
        self.correct
    }

    pub fn incorrect(&self) -> f64 {
        self.incorrect
    }

    pub fn blank(&self) -> f64 {
        self.blank
    }

    /// Payoff for a classification under this config.
    pub fn payoff(&self, classification: Classification) -> f64 {
        payoff(classification, self)
    }
}

impl TryFrom<RawScoringConfig> for ScoringConfig {
    type Error = ConfigError;

    fn try_from(raw: RawScoringConfig) -> Result<Self, Self::Error> {
        ScoringConfig::new(raw.correct, raw.incorrect, raw.blank)
    }
}

impl From<ScoringConfig> for RawScoringConfig {
    fn from(config: ScoringConfig) -> Self {
        Self {
            correct: config.correct,
            incorrect: config.incorrect,
            blank: config.blank,
        }
    }
}

/// The scoring policy: a total function from classification to points.
pub fn payoff(classification: Classification, config: &ScoringConfig) -> f64 {
    match classification {
        Classification::Correct => config.correct,
        Classification::Incorrect => config.incorrect,
        Classification::Blank => config.blank,
    }
}
