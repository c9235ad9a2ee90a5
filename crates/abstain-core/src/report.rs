//! Experiment report types with JSON persistence.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::ExperimentSummary;
use crate::prompt::PromptVariant;
use crate::session::SessionRecord;
use crate::statistics::{compute_session_stats, SessionStats, TransitionMatrix};

/// A complete experiment report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentReport {
    /// Unique report identifier.
    pub id: Uuid,
    /// When the report was created.
    pub created_at: DateTime<Utc>,
    /// Summary of the experiment.
    pub experiment: ExperimentSummary,
    /// Models that were run, as `provider/model`.
    pub models: Vec<String>,
    pub variants: Vec<PromptVariant>,
    /// One record per (model, variant) session.
    pub sessions: Vec<SessionRecord>,
    /// Statistics per session, in the same order as `sessions`.
    pub stats: Vec<SessionStats>,
    /// Total wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// The run was interrupted; some sessions may be incomplete.
    #[serde(default)]
    pub cancelled: bool,
}

impl ExperimentReport {
    /// Assemble a report, computing statistics from the session records.
    pub fn new(
        experiment: ExperimentSummary,
        models: Vec<String>,
        variants: Vec<PromptVariant>,
        sessions: Vec<SessionRecord>,
        duration_ms: u64,
        cancelled: bool,
    ) -> Self {
        let stats = compute_session_stats(&sessions);
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            experiment,
            models,
            variants,
            sessions,
            stats,
            duration_ms,
            cancelled,
        }
    }

    /// Save the report as JSON to a file.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize report")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        Ok(())
    }

    /// Load a report from a JSON file.
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read report from {}", path.display()))?;
        let report: ExperimentReport =
            serde_json::from_str(&content).context("failed to parse report JSON")?;
        Ok(report)
    }

    /// Classification transitions between two variants, paired per model and question.
    pub fn transitions(&self, from: PromptVariant, to: PromptVariant) -> TransitionMatrix {
        TransitionMatrix::compute(&self.sessions, from, to)
    }

    /// Sessions that stopped before answering every question.
    pub fn unfinished(&self) -> impl Iterator<Item = &SessionRecord> {
        self.sessions.iter().filter(|s| s.is_resumable())
    }

    /// Format the per-session statistics as markdown.
    pub fn to_markdown(&self) -> String {
        let mut md = format!(
            "## {} ({} questions)\n\n",
            self.experiment.name, self.experiment.question_count
        );
        md.push_str("| Model | Variant | Trials | Correct | Incorrect | Blank | Degraded | Payoff | Acc. given answer |\n");
        md.push_str("|-------|---------|--------|---------|-----------|-------|----------|--------|-------------------|\n");
        for s in &self.stats {
            let accuracy = s
                .accuracy_given_answer
                .map(|a| format!("{:.1}%", a * 100.0))
                .unwrap_or_else(|| "-".into());
            md.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} | {} | {:.2} | {} |\n",
                s.model,
                s.variant,
                s.trials,
                s.correct,
                s.incorrect,
                s.blank,
                s.degraded,
                s.total_payoff,
                accuracy
            ));
        }
        md
    }
}
