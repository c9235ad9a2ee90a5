//! Per-session statistics and cross-variant transition matrices.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::model::Classification;
use crate::prompt::PromptVariant;
use crate::session::SessionRecord;

/// Summary of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub model: String,
    pub variant: PromptVariant,
    pub trials: usize,
    pub correct: u32,
    pub incorrect: u32,
    pub blank: u32,
    /// Trials recorded without a model reply.
    pub degraded: u32,
    /// Answers given to questions without ground truth.
    pub unverified: u32,
    pub correct_fraction: f64,
    pub incorrect_fraction: f64,
    pub blank_fraction: f64,
    pub total_payoff: f64,
    /// `correct / (correct + incorrect)`; absent when every trial was blank.
    pub accuracy_given_answer: Option<f64>,
    pub avg_latency_ms: u64,
    pub cancelled: bool,
}

impl SessionStats {
    pub fn from_record(record: &SessionRecord) -> Self {
        let trials = record.trials.len();
        let count = |c: Classification| {
            record
                .trials
                .iter()
                .filter(|t| t.classification == c)
                .count() as u32
        };
        let correct = count(Classification::Correct);
        let incorrect = count(Classification::Incorrect);
        let blank = count(Classification::Blank);

        let fraction = |n: u32| {
            if trials == 0 {
                0.0
            } else {
                n as f64 / trials as f64
            }
        };
        let answered = correct + incorrect;
        let total_latency: u64 = record.trials.iter().map(|t| t.latency_ms).sum();

        Self {
            model: record.model.clone(),
            variant: record.variant,
            trials,
            correct,
            incorrect,
            blank,
            degraded: record.trials.iter().filter(|t| t.degraded).count() as u32,
            unverified: record.trials.iter().filter(|t| t.unverified).count() as u32,
            correct_fraction: fraction(correct),
            incorrect_fraction: fraction(incorrect),
            blank_fraction: fraction(blank),
            total_payoff: record.trials.iter().map(|t| t.payoff).sum(),
            accuracy_given_answer: (answered > 0).then(|| correct as f64 / answered as f64),
            avg_latency_ms: if trials == 0 {
                0
            } else {
                total_latency / trials as u64
            },
            cancelled: record.cancelled,
        }
    }
}

/// Compute stats for every session, in input order.
pub fn compute_session_stats(records: &[SessionRecord]) -> Vec<SessionStats> {
    records.iter().map(SessionStats::from_record).collect()
}

/// How each question's classification under one variant maps to its
/// classification under another, for the same model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionMatrix {
    pub from: PromptVariant,
    pub to: PromptVariant,
    /// `counts[from_class][to_class]`.
    pub counts: BTreeMap<Classification, BTreeMap<Classification, usize>>,
    /// Questions answered under both variants.
    pub paired: usize,
    /// Questions answered under only one of the two variants.
    pub unpaired: usize,
}

impl TransitionMatrix {
    /// Pair trials by (model, question id) across the two variants.
    pub fn compute(records: &[SessionRecord], from: PromptVariant, to: PromptVariant) -> Self {
        let before = outcomes(records, from);
        let after = outcomes(records, to);

        let mut counts: BTreeMap<Classification, BTreeMap<Classification, usize>> =
            Classification::ALL
                .iter()
                .map(|f| (*f, Classification::ALL.iter().map(|t| (*t, 0)).collect()))
                .collect();

        let mut paired = 0;
        for (key, from_class) in &before {
            if let Some(to_class) = after.get(key) {
                *counts
                    .entry(*from_class)
                    .or_default()
                    .entry(*to_class)
                    .or_default() += 1;
                paired += 1;
            }
        }
        let unpaired = before.len() + after.len() - 2 * paired;

        Self {
            from,
            to,
            counts,
            paired,
            unpaired,
        }
    }

    pub fn get(&self, from: Classification, to: Classification) -> usize {
        self.counts
            .get(&from)
            .and_then(|row| row.get(&to))
            .copied()
            .unwrap_or(0)
    }

    /// Format as a markdown table, rows are the `from` variant.
    pub fn to_markdown(&self) -> String {
        let mut md = format!(
            "**{} \u{2192} {}** ({} paired, {} unpaired)\n\n",
            self.from, self.to, self.paired, self.unpaired
        );
        md.push_str(&format!("| {} \\ {} |", self.from, self.to));
        for to in Classification::ALL {
            md.push_str(&format!(" {to} |"));
        }
        md.push('\n');
        md.push_str("|---|");
        for _ in Classification::ALL {
            md.push_str("---|");
        }
        md.push('\n');
        for from in Classification::ALL {
            md.push_str(&format!("| {from} |"));
            for to in Classification::ALL {
                md.push_str(&format!(" {} |", self.get(from, to)));
            }
            md.push('\n');
        }
        md
    }
}

fn outcomes(
    records: &[SessionRecord],
    variant: PromptVariant,
) -> HashMap<(&str, &str), Classification> {
    records
        .iter()
        .filter(|r| r.variant == variant)
        .flat_map(|r| {
            r.trials
                .iter()
                .map(move |t| ((r.model.as_str(), t.question_id.as_str()), t.classification))
        })
        .collect()
}
