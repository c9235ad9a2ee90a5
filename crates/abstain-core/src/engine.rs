//! Experiment runner.
//!
//! Runs one session per (model, variant) pair over the experiment's question
//! list. Sessions are independent and run concurrently up to `parallelism`;
//! trials inside a session stay sequential.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::judge::Judge;
use crate::model::Experiment;
use crate::prompt::PromptVariant;
use crate::report::ExperimentReport;
use crate::session::{
    CancelHandle, ProgressReporter, SessionConfig, SessionController, SessionLimits,
    SessionRecord,
};
use crate::traits::{ModelClient, DEFAULT_SYSTEM_PROMPT};

/// Configuration for the experiment runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum sessions running at once.
    pub parallelism: usize,
    /// Temperature for trial prompts.
    pub temperature: f64,
    /// Max tokens per reply.
    pub max_tokens: u32,
    /// Timeout and retry bounds for every model call.
    pub limits: SessionLimits,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            temperature: 0.0,
            max_tokens: 1024,
            limits: SessionLimits::default(),
        }
    }
}

/// Which model to run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelSpec {
    /// Provider name (e.g. "anthropic").
    pub provider: String,
    /// Model identifier (e.g. "claude-sonnet-4-20250514").
    pub model: String,
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

impl FromStr for ModelSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => Ok(Self {
                provider: provider.to_string(),
                model: model.to_string(),
            }),
            _ => Err(format!("invalid model spec '{s}': expected provider/model")),
        }
    }
}

/// Runs the session matrix of an experiment.
pub struct ExperimentRunner {
    clients: HashMap<String, Arc<dyn ModelClient>>,
    judge: Option<Judge>,
    config: RunnerConfig,
}

impl ExperimentRunner {
    pub fn new(clients: HashMap<String, Arc<dyn ModelClient>>, config: RunnerConfig) -> Self {
        Self {
            clients,
            judge: None,
            config,
        }
    }

    /// Grade `judge` questions with this judge in every session.
    pub fn with_judge(mut self, judge: Judge) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Build the session configuration for one (model, variant) pair.
    pub fn session_config(
        &self,
        experiment: &Experiment,
        spec: &ModelSpec,
        variant: PromptVariant,
    ) -> SessionConfig {
        let mut limits = self.config.limits;
        if experiment.max_trials.is_some() {
            limits.max_trials = experiment.max_trials;
        }
        SessionConfig {
            provider: spec.provider.clone(),
            model: spec.model.clone(),
            variant,
            scoring: experiment.scoring,
            grading: experiment.grading,
            fake_statistics: experiment
                .fake_statistics
                .filter(|_| variant == PromptVariant::FakeStatistics),
            system_prompt: Some(
                experiment
                    .system_prompt
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            ),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            limits,
        }
    }

    /// Run every (model, variant) session.
    ///
    /// All sessions are constructed before any trial runs, so a configuration
    /// error aborts the run without side effects.
    pub async fn run(
        &self,
        experiment: &Experiment,
        models: &[ModelSpec],
        variants: &[PromptVariant],
        cancel: &CancelHandle,
        progress: &dyn ProgressReporter,
    ) -> Result<ExperimentReport, ConfigError> {
        let start = Instant::now();
        let mut sessions = Vec::new();

        for spec in models {
            let Some(client) = self.clients.get(&spec.provider) else {
                warn!("provider '{}' not found, skipping {}", spec.provider, spec);
                continue;
            };
            for &variant in variants {
                let config = self.session_config(experiment, spec, variant);
                sessions.push(self.controller(
                    SessionController::new(config, experiment.questions.clone(), client.clone())?,
                ));
            }
        }

        info!(
            experiment = %experiment.id,
            sessions = sessions.len(),
            parallelism = self.config.parallelism,
            "starting experiment"
        );
        let records = self.run_sessions(sessions, cancel, progress).await;

        Ok(ExperimentReport::new(
            experiment.summary(),
            models.iter().map(ToString::to_string).collect(),
            variants.to_vec(),
            records,
            start.elapsed().as_millis() as u64,
            cancel.is_cancelled(),
        ))
    }

    /// Continue the unfinished sessions of an earlier report. Finished
    /// sessions are carried over unchanged.
    pub async fn resume(
        &self,
        experiment: &Experiment,
        previous: ExperimentReport,
        cancel: &CancelHandle,
        progress: &dyn ProgressReporter,
    ) -> Result<ExperimentReport, ConfigError> {
        let start = Instant::now();
        let mut slots: Vec<Option<SessionRecord>> = Vec::new();
        let mut pending = Vec::new();

        for record in previous.sessions {
            if !record.is_resumable() {
                slots.push(Some(record));
                continue;
            }
            let Some(client) = self.clients.get(&record.provider) else {
                warn!(
                    "provider '{}' not found, keeping session {} as is",
                    record.provider, record.id
                );
                slots.push(Some(record));
                continue;
            };
            let spec = ModelSpec {
                provider: record.provider.clone(),
                model: record.model.clone(),
            };
            let config = self.session_config(experiment, &spec, record.variant);
            let session = SessionController::resume(
                record,
                config,
                experiment.questions.clone(),
                client.clone(),
            )?;
            pending.push((slots.len(), self.controller(session)));
            slots.push(None);
        }

        info!(resumed = pending.len(), "resuming experiment");
        let (positions, sessions): (Vec<usize>, Vec<SessionController>) =
            pending.into_iter().unzip();
        let records = self.run_sessions(sessions, cancel, progress).await;
        for (position, record) in positions.into_iter().zip(records) {
            slots[position] = Some(record);
        }

        Ok(ExperimentReport::new(
            experiment.summary(),
            previous.models,
            previous.variants,
            slots.into_iter().flatten().collect(),
            previous.duration_ms + start.elapsed().as_millis() as u64,
            cancel.is_cancelled(),
        ))
    }

    fn controller(&self, session: SessionController) -> SessionController {
        match &self.judge {
            Some(judge) => session.with_judge(judge.clone()),
            None => session,
        }
    }

    /// Run sessions concurrently; records come back in input order.
    async fn run_sessions(
        &self,
        sessions: Vec<SessionController>,
        cancel: &CancelHandle,
        progress: &dyn ProgressReporter,
    ) -> Vec<SessionRecord> {
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let mut futures = FuturesUnordered::new();

        for (index, session) in sessions.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            futures.push(async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await.ok();
                (index, session.run(cancel, progress).await)
            });
        }

        let mut records = Vec::with_capacity(futures.len());
        while let Some(done) = futures.next().await {
            records.push(done);
        }
        records.sort_by_key(|(index, _)| *index);
        records.into_iter().map(|(_, record)| record).collect()
    }
}
