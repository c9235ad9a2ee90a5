//! Free-text grading by a judge model.
//!
//! Used for questions whose `match_rule` is `judge`. The judge sees the
//! question, the received answer and the expected answer, and ends its reply
//! with a `Category:` line.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ClientError;
use crate::response::last_marker_value;
use crate::traits::{ModelClient, ModelRequest};

const CATEGORY_MARKER: &str = "category:";

/// System prompt given to the judge model.
pub const JUDGE_SYSTEM_PROMPT: &str = "You grade answers to factual questions. \
Compare the received answer with the expected answer and reply with exactly one line \
`Category: <CATEGORY>` where CATEGORY is one of: CORRECT (the received answer means the \
same as the expected answer), INCORRECT (it gives a different answer), DOUBT (it declines \
to answer or says it does not know), ERROR (the input is unusable).";

/// The judge's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JudgeVerdict {
    Correct,
    Incorrect,
    Doubt,
    Error,
}

impl fmt::Display for JudgeVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JudgeVerdict::Correct => write!(f, "CORRECT"),
            JudgeVerdict::Incorrect => write!(f, "INCORRECT"),
            JudgeVerdict::Doubt => write!(f, "DOUBT"),
            JudgeVerdict::Error => write!(f, "ERROR"),
        }
    }
}

/// Read the verdict from a judge reply. `None` if no known category is present.
pub fn parse_verdict(raw: &str) -> Option<JudgeVerdict> {
    let value = last_marker_value(raw, CATEGORY_MARKER)?;
    let word: String = value
        .trim_matches(|c: char| !c.is_ascii_alphabetic())
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    match word.to_ascii_uppercase().as_str() {
        "CORRECT" => Some(JudgeVerdict::Correct),
        "INCORRECT" => Some(JudgeVerdict::Incorrect),
        "DOUBT" => Some(JudgeVerdict::Doubt),
        "ERROR" => Some(JudgeVerdict::Error),
        _ => None,
    }
}

/// Render the judge's user prompt.
pub fn render_judge_prompt(question: &str, received: &str, expected: &str) -> String {
    format!(
        "Question: {}\nReceived Answer: {}\nExpected Answer: {}\n",
        question.trim(),
        received.trim(),
        expected.trim()
    )
}

/// A judge model bound to a client.
#[derive(Clone)]
pub struct Judge {
    client: Arc<dyn ModelClient>,
    model: String,
}

impl Judge {
    pub fn new(client: Arc<dyn ModelClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Ask the judge for a verdict. An unreadable reply yields `JudgeVerdict::Error`.
    pub async fn verdict(
        &self,
        question: &str,
        received: &str,
        expected: &str,
    ) -> Result<JudgeVerdict, ClientError> {
        let request = ModelRequest {
            model: self.model.clone(),
            prompt: render_judge_prompt(question, received, expected),
            system_prompt: Some(JUDGE_SYSTEM_PROMPT.to_string()),
            max_tokens: 256,
            temperature: 0.0,
        };
        let response = self.client.send(&request).await?;
        Ok(parse_verdict(&response.content).unwrap_or_else(|| {
            warn!(model = %self.model, "judge reply has no category line");
            JudgeVerdict::Error
        }))
    }
}
