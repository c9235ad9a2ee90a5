//! The session controller.
//!
//! A session runs an ordered list of questions against one model under one
//! prompt variant. Trials run strictly in order because every prompt may
//! depend on the score produced by all earlier trials. The controller is an
//! explicit state machine (`Idle -> Running -> Finished`); a model failure
//! degrades a single trial and never aborts the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ClientError, ConfigError};
use crate::grader::{Grade, Grader, GradingConfig};
use crate::judge::{Judge, JudgeVerdict};
use crate::model::{
    Classification, FakeStatistics, MatchRule, ParsedAnswer, Question, Trial, UnparsedReason,
};
use crate::prompt::{self, PromptVariant, SessionSnapshot};
use crate::response;
use crate::scoring::ScoringConfig;
use crate::traits::{ModelClient, ModelRequest, ModelResponse};

/// Upper bound for the exponential backoff between retries.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Timeout and retry bounds for model calls, plus an optional trial cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionLimits {
    /// Stop after this many trials (counting resumed ones).
    pub max_trials: Option<usize>,
    /// Timeout applied to every single model call.
    pub call_timeout: Duration,
    /// Retries after the first failed attempt of a trial.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_delay: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_trials: None,
            call_timeout: Duration::from_secs(120),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Everything a session needs besides its questions and client.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name of the client the model is reached through.
    pub provider: String,
    pub model: String,
    pub variant: PromptVariant,
    pub scoring: ScoringConfig,
    pub grading: GradingConfig,
    pub fake_statistics: Option<FakeStatistics>,
    pub system_prompt: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub limits: SessionLimits,
}

impl SessionConfig {
    /// Check that the variant can be rendered with this configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.variant == PromptVariant::FakeStatistics && self.fake_statistics.is_none() {
            return Err(ConfigError::MissingFakeStatistics);
        }
        Ok(())
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Finished,
}

/// Mutable session state, owned exclusively by its controller.
///
/// `fake_statistics` is kept apart from the real counts and never derived
/// from them.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    trials: Vec<Trial>,
    running_total: f64,
    correct: u32,
    incorrect: u32,
    blank: u32,
    fake_statistics: Option<FakeStatistics>,
}

impl SessionState {
    pub fn new(fake_statistics: Option<FakeStatistics>) -> Self {
        Self {
            fake_statistics,
            ..Default::default()
        }
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn running_total(&self) -> f64 {
        self.running_total
    }

    pub fn count(&self, classification: Classification) -> u32 {
        match classification {
            Classification::Correct => self.correct,
            Classification::Incorrect => self.incorrect,
            Classification::Blank => self.blank,
        }
    }

    /// Read-only view handed to the prompt renderer.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            trials_completed: self.trials.len(),
            running_total: self.running_total,
            correct: self.correct,
            incorrect: self.incorrect,
            blank: self.blank,
            previous: self.trials.last().map(|t| t.classification),
            fake_statistics: self.fake_statistics,
        }
    }

    /// Append a graded trial, stamping it with the new running total.
    fn record(&mut self, mut trial: Trial) -> &Trial {
        self.running_total += trial.payoff;
        match trial.classification {
            Classification::Correct => self.correct += 1,
            Classification::Incorrect => self.incorrect += 1,
            Classification::Blank => self.blank += 1,
        }
        trial.running_total = self.running_total;
        self.trials.push(trial);
        self.check_totals();
        &self.trials[self.trials.len() - 1]
    }

    /// The running total must equal the sum of all recorded payoffs.
    fn check_totals(&mut self) {
        let sum = sum_payoffs(&self.trials);
        if sum != self.running_total {
            error!(
                running_total = self.running_total,
                sum, "running total diverged from recorded payoffs; recomputing"
            );
            self.running_total = sum;
        }
    }
}

fn sum_payoffs(trials: &[Trial]) -> f64 {
    trials.iter().fold(0.0, |acc, t| acc + t.payoff)
}

/// A cloneable flag that asks sessions to stop before their next trial.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress reporting for sessions.
pub trait ProgressReporter: Send + Sync {
    fn on_session_start(&self, model: &str, variant: PromptVariant, questions: usize);
    fn on_trial_complete(&self, model: &str, variant: PromptVariant, trial: &Trial);
    fn on_session_finish(&self, record: &SessionRecord);
}

/// No-op progress reporter.
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn on_session_start(&self, _: &str, _: PromptVariant, _: usize) {}
    fn on_trial_complete(&self, _: &str, _: PromptVariant, _: &Trial) {}
    fn on_session_finish(&self, _: &SessionRecord) {}
}

/// Serialized outcome of a session, complete or partial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    #[serde(default)]
    pub provider: String,
    pub model: String,
    pub variant: PromptVariant,
    pub scoring: ScoringConfig,
    pub grading: GradingConfig,
    #[serde(default)]
    pub fake_statistics: Option<FakeStatistics>,
    pub status: SessionStatus,
    /// The session stopped early because it was cancelled.
    #[serde(default)]
    pub cancelled: bool,
    /// Number of questions the session was started with.
    pub question_count: usize,
    pub trials: Vec<Trial>,
    pub running_total: f64,
    pub correct: u32,
    pub incorrect: u32,
    pub blank: u32,
    /// Trials recorded without a model reply.
    pub degraded: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Whether the session stopped before it ran out of questions.
    pub fn is_resumable(&self) -> bool {
        self.status != SessionStatus::Finished
            || (self.cancelled && self.trials.len() < self.question_count)
    }

    /// Check that every recorded running total equals the prefix sum of payoffs.
    pub fn verify_totals(&self) -> Result<(), ConfigError> {
        let mut sum = 0.0;
        for trial in &self.trials {
            sum += trial.payoff;
            if (trial.running_total - sum).abs() > 1e-9 {
                return Err(ConfigError::InconsistentRecord(format!(
                    "trial {} records running total {} but payoffs sum to {}",
                    trial.index, trial.running_total, sum
                )));
            }
        }
        if (self.running_total - sum).abs() > 1e-9 {
            return Err(ConfigError::InconsistentRecord(format!(
                "session total {} does not match payoff sum {}",
                self.running_total, sum
            )));
        }
        Ok(())
    }
}

/// Result of calling a model with retries.
#[derive(Debug)]
pub struct CallOutcome {
    pub result: Result<ModelResponse, ClientError>,
    /// Number of attempts made, including the successful one.
    pub attempts: u32,
    /// Most recent failure, even if a later attempt succeeded.
    pub last_error: Option<ClientError>,
}

/// Send a request with a per-call timeout and bounded exponential backoff.
///
/// A blank reply counts as a failed attempt. Permanent errors stop retrying.
pub async fn call_with_retry(
    client: &dyn ModelClient,
    request: &ModelRequest,
    limits: &SessionLimits,
) -> CallOutcome {
    let mut retry_delay = limits.retry_delay;
    let mut last_error: Option<ClientError> = None;
    let mut attempts = 0;

    for retry in 0..=limits.max_retries {
        if retry > 0 {
            tokio::time::sleep(retry_delay).await;
            retry_delay = (retry_delay * 2).min(MAX_BACKOFF);
        }
        attempts += 1;

        let result = match tokio::time::timeout(limits.call_timeout, client.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(limits.call_timeout.as_secs())),
        };

        let err = match result {
            Ok(response) if !response.content.trim().is_empty() => {
                return CallOutcome {
                    result: Ok(response),
                    attempts,
                    last_error,
                };
            }
            Ok(_) => ClientError::EmptyResponse,
            Err(e) => e,
        };

        warn!(model = %request.model, attempt = attempts, "model call failed: {err}");
        if let Some(ms) = err.retry_after_ms() {
            retry_delay = Duration::from_millis(ms).min(MAX_BACKOFF);
        }
        let permanent = err.is_permanent();
        last_error = Some(err);
        if permanent {
            break;
        }
    }

    let err = last_error.clone().unwrap_or(ClientError::EmptyResponse);
    CallOutcome {
        result: Err(err),
        attempts,
        last_error,
    }
}

type StopCondition = Box<dyn Fn(&SessionState) -> bool + Send + Sync>;

/// Runs one session: one model, one variant, one ordered question list.
pub struct SessionController {
    id: Uuid,
    config: SessionConfig,
    grader: Grader,
    questions: Vec<Question>,
    client: Arc<dyn ModelClient>,
    judge: Option<Judge>,
    stop_condition: Option<StopCondition>,
    state: SessionState,
    status: SessionStatus,
    cancelled: bool,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl SessionController {
    /// Create an idle session. Fails if the configuration cannot run.
    pub fn new(
        config: SessionConfig,
        questions: Vec<Question>,
        client: Arc<dyn ModelClient>,
    ) -> Result<Self, ConfigError> {
        if questions.is_empty() {
            return Err(ConfigError::NoQuestions);
        }
        config.validate()?;

        Ok(Self {
            id: Uuid::new_v4(),
            grader: Grader::new(config.scoring, config.grading),
            state: SessionState::new(config.fake_statistics),
            config,
            questions,
            client,
            judge: None,
            stop_condition: None,
            status: SessionStatus::Idle,
            cancelled: false,
            started_at: Utc::now(),
            finished_at: None,
        })
    }

    /// Rebuild an unfinished session from its record.
    ///
    /// The record must belong to the same model, variant, scoring, grading,
    /// fake statistics and question order, and its running totals must add up.
    pub fn resume(
        record: SessionRecord,
        config: SessionConfig,
        questions: Vec<Question>,
        client: Arc<dyn ModelClient>,
    ) -> Result<Self, ConfigError> {
        if record.model != config.model || record.variant != config.variant {
            return Err(ConfigError::InconsistentRecord(format!(
                "record is for {}/{}, session is {}/{}",
                record.model, record.variant, config.model, config.variant
            )));
        }
        if record.scoring != config.scoring {
            return Err(ConfigError::InconsistentRecord(
                "scoring config differs from the recorded one".into(),
            ));
        }
        if record.grading != config.grading {
            return Err(ConfigError::InconsistentRecord(
                "grading config differs from the recorded one".into(),
            ));
        }
        if record.fake_statistics != config.fake_statistics {
            return Err(ConfigError::InconsistentRecord(
                "fake statistics differ from the recorded ones".into(),
            ));
        }
        if record.trials.len() > questions.len() {
            return Err(ConfigError::InconsistentRecord(format!(
                "record has {} trials but only {} questions are available",
                record.trials.len(),
                questions.len()
            )));
        }
        for (trial, question) in record.trials.iter().zip(&questions) {
            if trial.question_id != question.id {
                return Err(ConfigError::InconsistentRecord(format!(
                    "trial {} answered '{}' but question {} is '{}'",
                    trial.index, trial.question_id, trial.index, question.id
                )));
            }
        }
        record.verify_totals()?;

        let mut controller = Self::new(config, questions, client)?;
        controller.id = record.id;
        controller.started_at = record.started_at;
        for trial in record.trials {
            controller.state.record(trial);
        }
        info!(
            session = %controller.id,
            completed = controller.state.trials.len(),
            "resuming session"
        );
        Ok(controller)
    }

    /// Grade `judge` questions with this judge model.
    pub fn with_judge(mut self, judge: Judge) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Finish the session as soon as `condition` holds after a trial.
    pub fn stop_when(
        mut self,
        condition: impl Fn(&SessionState) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.stop_condition = Some(Box::new(condition));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// `Idle -> Running`. No effect in any other state.
    pub fn start(&mut self) {
        if self.status == SessionStatus::Idle {
            info!(
                session = %self.id,
                model = %self.config.model,
                variant = %self.config.variant,
                questions = self.questions.len(),
                "session started"
            );
            self.status = SessionStatus::Running;
            self.finish_if_done();
        }
    }

    /// Stop before the next trial. Completed trials are kept.
    pub fn cancel(&mut self) {
        if self.status != SessionStatus::Finished {
            warn!(session = %self.id, completed = self.state.trials.len(), "session cancelled");
            self.cancelled = true;
            self.finish();
        }
    }

    /// Run the next trial. Returns `None` once the session is finished.
    pub async fn step(&mut self) -> Option<&Trial> {
        self.start();
        if self.status != SessionStatus::Running {
            return None;
        }

        let index = self.state.trials.len();
        let question = self.questions[index].clone();
        let trial = self.execute_trial(index, &question).await;

        debug!(
            session = %self.id,
            question = %trial.question_id,
            classification = %trial.classification,
            payoff = trial.payoff,
            "trial graded"
        );
        self.state.record(trial);
        self.finish_if_done();
        self.state.trials.last()
    }

    /// Run until finished or cancelled and return the session record.
    pub async fn run(
        mut self,
        cancel: &CancelHandle,
        progress: &dyn ProgressReporter,
    ) -> SessionRecord {
        let model = self.config.model.clone();
        let variant = self.config.variant;
        progress.on_session_start(&model, variant, self.questions.len());

        self.start();
        while self.status == SessionStatus::Running {
            if cancel.is_cancelled() {
                self.cancel();
                break;
            }
            if let Some(trial) = self.step().await {
                progress.on_trial_complete(&model, variant, trial);
            }
        }

        let record = self.into_record();
        progress.on_session_finish(&record);
        record
    }

    /// Serialize the current state, whatever the status.
    pub fn into_record(self) -> SessionRecord {
        let degraded = self.state.trials.iter().filter(|t| t.degraded).count() as u32;
        SessionRecord {
            id: self.id,
            provider: self.config.provider,
            model: self.config.model,
            variant: self.config.variant,
            scoring: self.config.scoring,
            grading: self.config.grading,
            fake_statistics: self.config.fake_statistics,
            status: self.status,
            cancelled: self.cancelled,
            question_count: self.questions.len(),
            running_total: self.state.running_total,
            correct: self.state.correct,
            incorrect: self.state.incorrect,
            blank: self.state.blank,
            degraded,
            trials: self.state.trials,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    fn finish_if_done(&mut self) {
        if self.status != SessionStatus::Running {
            return;
        }
        let done = self.state.trials.len();
        let exhausted = done >= self.questions.len();
        let capped = self.config.limits.max_trials.is_some_and(|max| done >= max);
        let stopped = self
            .stop_condition
            .as_ref()
            .is_some_and(|condition| condition(&self.state));
        if exhausted || capped || stopped {
            self.finish();
        }
    }

    fn finish(&mut self) {
        self.status = SessionStatus::Finished;
        self.finished_at = Some(Utc::now());
        info!(
            session = %self.id,
            trials = self.state.trials.len(),
            total = self.state.running_total,
            cancelled = self.cancelled,
            "session finished"
        );
    }

    async fn execute_trial(&self, index: usize, question: &Question) -> Trial {
        let snapshot = self.state.snapshot();
        let prompt_text = prompt::render(question, &self.config.scoring, &snapshot, self.config.variant);

        let request = ModelRequest {
            model: self.config.model.clone(),
            prompt: prompt_text.clone(),
            system_prompt: self.config.system_prompt.clone(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let started = Instant::now();
        let outcome = call_with_retry(self.client.as_ref(), &request, &self.config.limits).await;
        let failure = outcome.last_error.as_ref().map(|e| e.to_string());

        let (raw_response, parsed, degraded, latency_ms) = match outcome.result {
            Ok(response) => {
                let parsed = response::parse(&response.content, question);
                (response.content, parsed, false, response.latency_ms)
            }
            Err(e) => {
                warn!(
                    question = %question.id,
                    attempts = outcome.attempts,
                    "retries exhausted, recording degraded trial: {e}"
                );
                let parsed = ParsedAnswer::Unparsed {
                    reason: UnparsedReason::ClientFailure {
                        message: e.to_string(),
                    },
                };
                (String::new(), parsed, true, started.elapsed().as_millis() as u64)
            }
        };

        let judge_verdict = self.judge_verdict(question, &parsed).await;
        let Grade {
            classification,
            payoff,
            unverified,
        } = self.grader.grade_with_verdict(&parsed, question, judge_verdict);

        Trial {
            index,
            question_id: question.id.clone(),
            prompt: prompt_text,
            raw_response,
            parsed,
            classification,
            payoff,
            running_total: 0.0,
            attempts: outcome.attempts,
            degraded,
            unverified,
            failure,
            judge_verdict,
            latency_ms,
            completed_at: Utc::now(),
        }
    }

    async fn judge_verdict(&self, question: &Question, parsed: &ParsedAnswer) -> Option<JudgeVerdict> {
        if question.match_rule != MatchRule::Judge || question.is_multiple_choice() {
            return None;
        }
        let received = parsed.as_value()?;
        let expected = question.ground_truth.as_deref()?;
        let Some(judge) = &self.judge else {
            debug!(question = %question.id, "no judge configured, using normalized matching");
            return None;
        };

        let call = judge.verdict(&question.stem, received, expected);
        match tokio::time::timeout(self.config.limits.call_timeout, call).await {
            Ok(Ok(verdict)) => Some(verdict),
            Ok(Err(e)) => {
                warn!(question = %question.id, "judge call failed, using normalized matching: {e}");
                None
            }
            Err(_) => {
                warn!(question = %question.id, "judge call timed out, using normalized matching");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grader::UnparsedPolicy;
    use crate::testing::ScriptedClient;

    fn config(variant: PromptVariant) -> SessionConfig {
        SessionConfig {
            provider: "scripted".into(),
            model: "test-model".into(),
            variant,
            scoring: ScoringConfig::new(1.0, -0.25, 0.0).unwrap(),
            grading: GradingConfig::new(UnparsedPolicy::Incorrect, 0.0).unwrap(),
            fake_statistics: None,
            system_prompt: None,
            temperature: 0.0,
            max_tokens: 256,
            limits: SessionLimits {
                max_trials: None,
                call_timeout: Duration::from_secs(5),
                max_retries: 2,
                retry_delay: Duration::from_millis(10),
            },
        }
    }

    fn mc(id: &str, answer: &str) -> Question {
        Question::multiple_choice(id, "Pick one", &[("A", "x"), ("B", "y"), ("C", "z")], answer)
    }

    fn questions(n: usize) -> Vec<Question> {
        (0..n).map(|i| mc(&format!("q{i}"), "B")).collect()
    }

    #[tokio::test]
    async fn single_correct_trial() {
        let client = Arc::new(ScriptedClient::replies(["I think ... Answer: B"]));
        let session =
            SessionController::new(config(PromptVariant::Plain), questions(1), client).unwrap();
        let record = session.run(&CancelHandle::new(), &NoopReporter).await;

        assert_eq!(record.status, SessionStatus::Finished);
        assert_eq!(record.trials.len(), 1);
        assert_eq!(record.trials[0].classification, Classification::Correct);
        assert_eq!(record.trials[0].payoff, 1.0);
        assert_eq!(record.running_total, 1.0);
    }

    #[tokio::test]
    async fn running_totals_are_prefix_sums() {
        let client = Arc::new(ScriptedClient::replies([
            "Answer: B",
            "Answer: C",
            "Answer: blank",
        ]));
        let session =
            SessionController::new(config(PromptVariant::RunningTotal), questions(3), client)
                .unwrap();
        let record = session.run(&CancelHandle::new(), &NoopReporter).await;

        let payoffs: Vec<f64> = record.trials.iter().map(|t| t.payoff).collect();
        let totals: Vec<f64> = record.trials.iter().map(|t| t.running_total).collect();
        assert_eq!(payoffs, vec![1.0, -0.25, 0.0]);
        assert_eq!(totals, vec![1.0, 0.75, 0.75]);
        assert_eq!((record.correct, record.incorrect, record.blank), (1, 1, 1));
        record.verify_totals().unwrap();
    }

    #[tokio::test]
    async fn running_total_feeds_the_next_prompt() {
        let client = Arc::new(ScriptedClient::replies(["Answer: B", "Answer: C", "Answer: B"]));
        let session = SessionController::new(
            config(PromptVariant::RunningTotal),
            questions(3),
            client.clone(),
        )
        .unwrap();
        session.run(&CancelHandle::new(), &NoopReporter).await;

        let prompts = client.prompts();
        assert!(prompts[0].contains("current score is 0 points after 0 questions"));
        assert!(prompts[1].contains("current score is 1 points after 1 questions"));
        assert!(prompts[1].contains("previous answer was correct"));
        assert!(prompts[2].contains("current score is 0.75 points after 2 questions"));
        assert!(prompts[2].contains("previous answer was incorrect"));
    }

    #[tokio::test]
    async fn fake_statistics_stay_fixed_while_real_score_moves() {
        let client = Arc::new(ScriptedClient::replies(["Answer: C", "Answer: C"]));
        let mut cfg = config(PromptVariant::FakeStatistics);
        cfg.fake_statistics = Some(FakeStatistics {
            attempted: 10,
            correct: 10,
        });
        let session = SessionController::new(cfg, questions(2), client.clone()).unwrap();
        let record = session.run(&CancelHandle::new(), &NoopReporter).await;

        assert_eq!(record.running_total, -0.5);
        for prompt in client.prompts() {
            assert!(prompt.contains("attempted 10 questions and answered 10 of them correctly"));
        }
    }

    #[test]
    fn fake_statistics_variant_requires_numbers() {
        let client = Arc::new(ScriptedClient::replies(Vec::<&str>::new()));
        let err = SessionController::new(config(PromptVariant::FakeStatistics), questions(1), client)
            .err()
            .unwrap();
        assert_eq!(err, ConfigError::MissingFakeStatistics);
    }

    #[test]
    fn empty_question_list_is_rejected() {
        let client = Arc::new(ScriptedClient::replies(Vec::<&str>::new()));
        let err = SessionController::new(config(PromptVariant::Plain), vec![], client)
            .err()
            .unwrap();
        assert_eq!(err, ConfigError::NoQuestions);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(ClientError::Timeout(5)),
            Ok("Answer: B".to_string()),
        ]));
        let session =
            SessionController::new(config(PromptVariant::Plain), questions(1), client.clone())
                .unwrap();
        let record = session.run(&CancelHandle::new(), &NoopReporter).await;

        let trial = &record.trials[0];
        assert_eq!(trial.classification, Classification::Correct);
        assert_eq!(trial.attempts, 2);
        assert!(!trial.degraded);
        assert!(trial.failure.as_deref().unwrap().contains("timed out"));
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_degrade_the_trial_and_the_session_continues() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(ClientError::NetworkError("down".into())),
            Err(ClientError::NetworkError("down".into())),
            Err(ClientError::NetworkError("down".into())),
            Ok("Answer: B".to_string()),
        ]));
        let session =
            SessionController::new(config(PromptVariant::Plain), questions(2), client).unwrap();
        let record = session.run(&CancelHandle::new(), &NoopReporter).await;

        assert_eq!(record.status, SessionStatus::Finished);
        assert_eq!(record.trials.len(), 2);
        let degraded = &record.trials[0];
        assert!(degraded.degraded);
        assert_eq!(degraded.attempts, 3);
        assert!(matches!(
            degraded.parsed,
            ParsedAnswer::Unparsed {
                reason: UnparsedReason::ClientFailure { .. }
            }
        ));
        assert_eq!(degraded.classification, Classification::Incorrect);
        assert_eq!(record.trials[1].classification, Classification::Correct);
        assert_eq!(record.degraded, 1);
        assert_eq!(record.running_total, 0.75);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_is_capped_at_max_backoff() {
        let client = ScriptedClient::new(vec![
            Err(ClientError::RateLimited {
                retry_after_ms: 3_600_000,
            }),
            Ok("Answer: B".to_string()),
        ]);
        let request = ModelRequest {
            model: "test-model".into(),
            prompt: "Pick one".into(),
            system_prompt: None,
            max_tokens: 16,
            temperature: 0.0,
        };
        let started = tokio::time::Instant::now();
        let outcome = call_with_retry(&client, &request, &config(PromptVariant::Plain).limits).await;

        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts, 2);
        assert!(started.elapsed() <= MAX_BACKOFF + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn blank_replies_are_retried() {
        let client = Arc::new(ScriptedClient::replies(["   ", "Answer: B"]));
        let session =
            SessionController::new(config(PromptVariant::Plain), questions(1), client).unwrap();
        let record = session.run(&CancelHandle::new(), &NoopReporter).await;
        assert_eq!(record.trials[0].attempts, 2);
        assert_eq!(record.trials[0].classification, Classification::Correct);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let client = Arc::new(ScriptedClient::new(vec![Err(
            ClientError::AuthenticationFailed("bad key".into()),
        )]));
        let mut cfg = config(PromptVariant::Plain);
        cfg.grading = GradingConfig::new(UnparsedPolicy::Blank, 0.0).unwrap();
        let session = SessionController::new(cfg, questions(1), client.clone()).unwrap();
        let record = session.run(&CancelHandle::new(), &NoopReporter).await;

        assert_eq!(client.call_count(), 1);
        assert_eq!(record.trials[0].classification, Classification::Blank);
        assert_eq!(record.trials[0].payoff, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out() {
        let client = Arc::new(
            ScriptedClient::replies(["Answer: B", "Answer: B", "Answer: B"])
                .with_delay(Duration::from_secs(30)),
        );
        let session =
            SessionController::new(config(PromptVariant::Plain), questions(1), client).unwrap();
        let record = session.run(&CancelHandle::new(), &NoopReporter).await;
        let trial = &record.trials[0];
        assert!(trial.degraded);
        assert_eq!(trial.attempts, 3);
        assert!(trial.failure.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn max_trials_stops_early() {
        let client = Arc::new(ScriptedClient::fixed("Answer: B"));
        let mut cfg = config(PromptVariant::Plain);
        cfg.limits.max_trials = Some(2);
        let session = SessionController::new(cfg, questions(5), client).unwrap();
        let record = session.run(&CancelHandle::new(), &NoopReporter).await;
        assert_eq!(record.trials.len(), 2);
        assert_eq!(record.status, SessionStatus::Finished);
        assert!(!record.cancelled);
    }

    #[tokio::test]
    async fn stop_condition_is_checked_after_each_trial() {
        let client = Arc::new(ScriptedClient::fixed("Answer: C"));
        let session = SessionController::new(config(PromptVariant::Plain), questions(10), client)
            .unwrap()
            .stop_when(|state| state.running_total() <= -0.5);
        let record = session.run(&CancelHandle::new(), &NoopReporter).await;
        assert_eq!(record.trials.len(), 2);
    }

    #[tokio::test]
    async fn cancellation_keeps_completed_trials() {
        let client = Arc::new(ScriptedClient::fixed("Answer: B"));
        let mut session =
            SessionController::new(config(PromptVariant::Plain), questions(5), client).unwrap();

        assert_eq!(session.status(), SessionStatus::Idle);
        session.step().await;
        session.step().await;
        assert_eq!(session.status(), SessionStatus::Running);

        let cancel = CancelHandle::new();
        cancel.cancel();
        let record = session.run(&cancel, &NoopReporter).await;

        assert_eq!(record.status, SessionStatus::Finished);
        assert!(record.cancelled);
        assert_eq!(record.trials.len(), 2);
        assert_eq!(record.running_total, 2.0);
        assert!(record.is_resumable());
    }

    #[tokio::test]
    async fn resume_continues_after_the_last_trial() {
        let first = Arc::new(ScriptedClient::fixed("Answer: B"));
        let mut cfg = config(PromptVariant::RunningTotal);
        cfg.limits.max_trials = Some(2);
        let partial = SessionController::new(cfg, questions(4), first)
            .unwrap()
            .run(&CancelHandle::new(), &NoopReporter)
            .await;
        assert_eq!(partial.trials.len(), 2);

        let second = Arc::new(ScriptedClient::fixed("Answer: C"));
        let session = SessionController::resume(
            partial.clone(),
            config(PromptVariant::RunningTotal),
            questions(4),
            second.clone(),
        )
        .unwrap();
        let record = session.run(&CancelHandle::new(), &NoopReporter).await;

        assert_eq!(record.id, partial.id);
        assert_eq!(record.trials.len(), 4);
        let totals: Vec<f64> = record.trials.iter().map(|t| t.running_total).collect();
        assert_eq!(totals, vec![1.0, 2.0, 1.75, 1.5]);
        assert!(second.prompts()[0].contains("current score is 2 points after 2 questions"));
    }

    #[tokio::test]
    async fn resume_rejects_tampered_totals() {
        let client = Arc::new(ScriptedClient::fixed("Answer: B"));
        let mut cfg = config(PromptVariant::Plain);
        cfg.limits.max_trials = Some(1);
        let mut record = SessionController::new(cfg, questions(2), client.clone())
            .unwrap()
            .run(&CancelHandle::new(), &NoopReporter)
            .await;
        record.trials[0].running_total = 5.0;

        let err = SessionController::resume(record, config(PromptVariant::Plain), questions(2), client)
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::InconsistentRecord(_)));
    }

    #[tokio::test]
    async fn resume_rejects_a_different_question_order() {
        let client = Arc::new(ScriptedClient::fixed("Answer: B"));
        let mut cfg = config(PromptVariant::Plain);
        cfg.limits.max_trials = Some(1);
        let record = SessionController::new(cfg, questions(2), client.clone())
            .unwrap()
            .run(&CancelHandle::new(), &NoopReporter)
            .await;

        let mut reordered = questions(2);
        reordered.reverse();
        let err = SessionController::resume(record, config(PromptVariant::Plain), reordered, client)
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::InconsistentRecord(_)));
    }

    #[tokio::test]
    async fn resume_rejects_changed_grading_or_fake_statistics() {
        let client = Arc::new(ScriptedClient::fixed("Answer: B"));
        let mut cfg = config(PromptVariant::FakeStatistics);
        cfg.fake_statistics = Some(FakeStatistics {
            attempted: 10,
            correct: 9,
        });
        cfg.limits.max_trials = Some(1);
        let record = SessionController::new(cfg.clone(), questions(2), client.clone())
            .unwrap()
            .run(&CancelHandle::new(), &NoopReporter)
            .await;
        cfg.limits.max_trials = None;

        let mut regraded = cfg.clone();
        regraded.grading = GradingConfig::new(UnparsedPolicy::Blank, 0.0).unwrap();
        let err = SessionController::resume(record.clone(), regraded, questions(2), client.clone())
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::InconsistentRecord(_)));

        let mut reframed = cfg.clone();
        reframed.fake_statistics = Some(FakeStatistics {
            attempted: 10,
            correct: 1,
        });
        let err = SessionController::resume(record.clone(), reframed, questions(2), client.clone())
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::InconsistentRecord(_)));

        assert!(SessionController::resume(record, cfg, questions(2), client).is_ok());
    }

    #[tokio::test]
    async fn judge_questions_use_the_judge() {
        let client = Arc::new(ScriptedClient::replies(["Answer: Shelley"]));
        let judge_client = Arc::new(ScriptedClient::replies(["Category: CORRECT"]));
        let mut q = Question::free_text("q", "Who wrote Frankenstein?", "Mary Shelley");
        q.match_rule = MatchRule::Judge;

        let session = SessionController::new(config(PromptVariant::Plain), vec![q], client)
            .unwrap()
            .with_judge(Judge::new(judge_client.clone(), "judge-model"));
        let record = session.run(&CancelHandle::new(), &NoopReporter).await;

        assert_eq!(record.trials[0].judge_verdict, Some(JudgeVerdict::Correct));
        assert_eq!(record.trials[0].classification, Classification::Correct);
        assert!(judge_client.prompts()[0].contains("Expected Answer: Mary Shelley"));
    }

    #[tokio::test]
    async fn judge_failure_falls_back_to_normalized_matching() {
        let client = Arc::new(ScriptedClient::replies(["Answer: mary shelley"]));
        let judge_client = Arc::new(ScriptedClient::new(vec![Err(ClientError::NetworkError(
            "down".into(),
        ))]));
        let mut q = Question::free_text("q", "Who wrote Frankenstein?", "Mary Shelley");
        q.match_rule = MatchRule::Judge;

        let session = SessionController::new(config(PromptVariant::Plain), vec![q], client)
            .unwrap()
            .with_judge(Judge::new(judge_client, "judge-model"));
        let record = session.run(&CancelHandle::new(), &NoopReporter).await;

        assert_eq!(record.trials[0].judge_verdict, None);
        assert_eq!(record.trials[0].classification, Classification::Correct);
    }

    #[tokio::test]
    async fn record_round_trips_through_json() {
        let client = Arc::new(ScriptedClient::replies(["Answer: B", "no marker"]));
        let record = SessionController::new(config(PromptVariant::WithBlank), questions(2), client)
            .unwrap()
            .run(&CancelHandle::new(), &NoopReporter)
            .await;

        let json = serde_json::to_string(&record).unwrap();
        let back: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.trials.len(), 2);
        assert_eq!(
            back.trials[1].parsed,
            ParsedAnswer::Unparsed {
                reason: UnparsedReason::MissingMarker
            }
        );
        back.verify_totals().unwrap();
    }
}
