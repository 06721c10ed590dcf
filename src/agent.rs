use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::action::{Action, DoneParams};
use crate::effectors::{truncate, EffectorOutput};
use crate::oracle::{DecisionContext, Oracle, OracleError};

pub const PARAM_SUMMARY_CHARS: usize = 200;
pub const RESULT_SUMMARY_CHARS: usize = 300;

// ========================= Core Types =========================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screenshot {
    pub mime_type: String,
    pub data_base64: String,
}

impl Screenshot {
    pub fn png(data_base64: String) -> Self {
        Self {
            mime_type: "image/png".into(),
            data_base64,
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data_base64)
    }

    pub fn encoded_len(&self) -> usize {
        self.data_base64.len()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("screenshot error: {0}")]
    Screenshot(String),
    #[error("oracle error: {0}")]
    Oracle(String),
}

impl From<OracleError> for AgentError {
    fn from(e: OracleError) -> Self {
        AgentError::Oracle(e.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Partial => "partial",
            JobStatus::Failed => "failed",
        }
    }
}

/// One executed (or rejected) loop iteration. Never mutated after append.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: u32,
    pub tool: String,
    pub params: String,
    pub result: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub summary: String,
    pub next_steps: Option<String>,
    pub steps: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_screenshot: Option<Screenshot>,
    /// Where the final screenshot was written, once persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
}

impl JobOutcome {
    pub fn failed(summary: impl Into<String>, steps: Vec<StepRecord>) -> Self {
        Self {
            status: JobStatus::Failed,
            summary: summary.into(),
            next_steps: None,
            steps,
            final_screenshot: None,
            screenshot_path: None,
        }
    }
}

// ========================= Pluggable Subsystems =========================

#[async_trait]
pub trait Desktop: Send + Sync {
    async fn screenshot(&self) -> Result<Screenshot, AgentError>;
    async fn perform(&self, action: &Action) -> EffectorOutput;
}

#[async_trait]
impl<T: Desktop + ?Sized> Desktop for Arc<T> {
    async fn screenshot(&self) -> Result<Screenshot, AgentError> {
        (**self).screenshot().await
    }

    async fn perform(&self, action: &Action) -> EffectorOutput {
        (**self).perform(action).await
    }
}

// ========================= Agent Core =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_steps: u32,
    pub history_window: usize,
    pub settle_delay: Duration,
    pub include_final_screenshot: bool,
}

/// Perceive-decide-act loop: one screenshot in, one action out, per step.
pub struct ComputerAgent<D, O>
where
    D: Desktop,
    O: Oracle,
{
    desktop: D,
    oracle: O,
    cfg: AgentConfig,
}

impl<D, O> ComputerAgent<D, O>
where
    D: Desktop,
    O: Oracle,
{
    pub fn new(desktop: D, oracle: O, cfg: AgentConfig) -> Self {
        Self {
            desktop,
            oracle,
            cfg,
        }
    }

    pub async fn run(&self, job_id: &str, task: &str) -> JobOutcome {
        let start = Instant::now();
        let max_steps = self.cfg.max_steps.max(1);
        let mut steps: Vec<StepRecord> = Vec::new();
        let mut last_result: Option<String> = None;

        let mut screenshot = match self.desktop.screenshot().await {
            Ok(shot) => shot,
            Err(err) => {
                warn!(job = %job_id, error = %err, "initial screenshot failed");
                return JobOutcome::failed(format!("Could not capture the screen: {err}"), steps);
            }
        };

        for index in 1..=max_steps {
            let window_start = steps.len().saturating_sub(self.cfg.history_window);
            let ctx = DecisionContext {
                task: task.to_string(),
                step: index,
                max_steps,
                last_result: last_result.clone(),
                history: steps[window_start..].to_vec(),
            };

            let decision = match self.oracle.decide(&ctx, &screenshot).await {
                Ok(decision) => decision,
                Err(err) => {
                    warn!(job = %job_id, step = index, error = %err, "decision oracle failed");
                    return JobOutcome::failed(
                        format!("Decision oracle failed at step {index}: {err}"),
                        steps,
                    );
                }
            };
            let tool = decision.action.tool;
            let params_summary =
                truncate(&decision.action.parameters.to_string(), PARAM_SUMMARY_CHARS);
            info!(
                job = %job_id,
                step = index,
                tool = tool.as_str(),
                reasoning = %truncate(&decision.reasoning, 160),
                "agent step"
            );

            let action = match Action::from_parts(tool, decision.action.parameters) {
                Ok(Action::Done(done)) => {
                    info!(
                        job = %job_id,
                        step = index,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "agent finished"
                    );
                    return self.finish(done, steps, screenshot);
                }
                Ok(action) => action,
                Err(err) => {
                    warn!(job = %job_id, step = index, error = %err, "rejected action parameters");
                    let result =
                        truncate(&format!("invalid parameters: {err}"), RESULT_SUMMARY_CHARS);
                    last_result = Some(format!("{} failed validation: {err}", tool.as_str()));
                    steps.push(StepRecord {
                        index,
                        tool: tool.as_str().to_string(),
                        params: params_summary,
                        result,
                    });
                    continue;
                }
            };

            let out = self.desktop.perform(&action).await;
            if !out.is_success() {
                warn!(
                    job = %job_id,
                    step = index,
                    tool = tool.as_str(),
                    error = %out.summary(),
                    "action failed"
                );
            }
            let mut result = out.summary();

            sleep(self.cfg.settle_delay).await;
            match self.desktop.screenshot().await {
                Ok(shot) => screenshot = shot,
                Err(err) => {
                    warn!(
                        job = %job_id,
                        step = index,
                        error = %err,
                        "screenshot after action failed"
                    );
                    result.push_str(&format!(" (screen not refreshed: {err})"));
                }
            }

            let result = truncate(&result, RESULT_SUMMARY_CHARS);
            last_result = Some(format!("{} -> {}", tool.as_str(), result));
            steps.push(StepRecord {
                index,
                tool: tool.as_str().to_string(),
                params: params_summary,
                result,
            });
        }

        info!(
            job = %job_id,
            steps = steps.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "step budget exhausted"
        );
        let last = last_result.unwrap_or_else(|| "no actions executed".into());
        JobOutcome {
            status: JobStatus::Partial,
            summary: format!(
                "Reached the step limit ({max_steps}) before the task was finished. \
                 Last result: {last}"
            ),
            next_steps: Some(
                "Run the task again with a higher maxSteps, or narrow the task description.".into(),
            ),
            steps,
            final_screenshot: self.cfg.include_final_screenshot.then_some(screenshot),
            screenshot_path: None,
        }
    }

    fn finish(
        &self,
        done: DoneParams,
        steps: Vec<StepRecord>,
        screenshot: Screenshot,
    ) -> JobOutcome {
        JobOutcome {
            status: done.status.unwrap_or(JobStatus::Success),
            summary: done
                .summary
                .unwrap_or_else(|| "Task completed.".to_string()),
            next_steps: done.next_steps,
            steps,
            final_screenshot: self.cfg.include_final_screenshot.then_some(screenshot),
            screenshot_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use crate::oracle::{Decision, ProposedAction};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDesktop {
        performed: Mutex<Vec<Action>>,
        shots: AtomicU32,
        fail_screenshots: bool,
    }

    #[async_trait]
    impl Desktop for RecordingDesktop {
        async fn screenshot(&self) -> Result<Screenshot, AgentError> {
            if self.fail_screenshots {
                return Err(AgentError::Screenshot("no permission".into()));
            }
            let n = self.shots.fetch_add(1, Ordering::SeqCst);
            Ok(Screenshot::png(format!("shot-{n}")))
        }

        async fn perform(&self, action: &Action) -> EffectorOutput {
            self.performed.lock().unwrap().push(action.clone());
            match action {
                Action::Shell(_) => EffectorOutput::failed("command not found"),
                _ => EffectorOutput::ok("ok"),
            }
        }
    }

    /// Replays scripted decisions, then repeats the last one forever.
    struct ScriptedOracle {
        script: Vec<(ActionKind, Value)>,
        calls: AtomicU32,
        seen: Mutex<Vec<DecisionContext>>,
    }

    impl ScriptedOracle {
        fn new(script: Vec<(ActionKind, Value)>) -> Self {
            Self {
                script,
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Oracle for ScriptedOracle {
        async fn decide(
            &self,
            ctx: &DecisionContext,
            _screenshot: &Screenshot,
        ) -> Result<Decision, OracleError> {
            self.seen.lock().unwrap().push(ctx.clone());
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let (tool, parameters) = self.script[n.min(self.script.len() - 1)].clone();
            Ok(Decision {
                reasoning: format!("call {n}"),
                action: ProposedAction { tool, parameters },
            })
        }
    }

    struct BrokenOracle;

    #[async_trait]
    impl Oracle for BrokenOracle {
        async fn decide(
            &self,
            _ctx: &DecisionContext,
            _screenshot: &Screenshot,
        ) -> Result<Decision, OracleError> {
            Err(OracleError::Parse("no JSON object in reply".into()))
        }
    }

    fn cfg(max_steps: u32) -> AgentConfig {
        AgentConfig {
            max_steps,
            history_window: 8,
            settle_delay: Duration::ZERO,
            include_final_screenshot: false,
        }
    }

    #[tokio::test]
    async fn never_done_ends_partial_after_budget() {
        let desktop = Arc::new(RecordingDesktop::default());
        let oracle = ScriptedOracle::new(vec![(ActionKind::Click, json!({"x": 5, "y": 6}))]);
        let agent = ComputerAgent::new(Arc::clone(&desktop), oracle, cfg(4));

        let outcome = agent.run("job", "click forever").await;

        assert_eq!(outcome.status, JobStatus::Partial);
        assert_eq!(outcome.steps.len(), 4);
        assert_eq!(desktop.performed.lock().unwrap().len(), 4);
        assert_eq!(
            outcome.steps.iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert!(outcome.next_steps.unwrap().contains("maxSteps"));
    }

    #[tokio::test]
    async fn done_on_first_step_executes_nothing() {
        let desktop = Arc::new(RecordingDesktop::default());
        let oracle = ScriptedOracle::new(vec![(
            ActionKind::Done,
            json!({"status": "success", "summary": "X"}),
        )]);
        let agent = ComputerAgent::new(Arc::clone(&desktop), oracle, cfg(10));

        let outcome = agent.run("job", "nothing to do").await;

        assert_eq!(outcome.status, JobStatus::Success);
        assert_eq!(outcome.summary, "X");
        assert!(outcome.steps.is_empty());
        assert!(desktop.performed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn done_status_defaults_to_success_and_can_report_partial() {
        let oracle = ScriptedOracle::new(vec![(ActionKind::Done, json!({"summary": "fine"}))]);
        let agent = ComputerAgent::new(Arc::new(RecordingDesktop::default()), oracle, cfg(3));
        assert_eq!(agent.run("a", "t").await.status, JobStatus::Success);

        let oracle = ScriptedOracle::new(vec![(
            ActionKind::Done,
            json!({"status": "partial", "summary": "half", "nextSteps": "log in first"}),
        )]);
        let agent = ComputerAgent::new(Arc::new(RecordingDesktop::default()), oracle, cfg(3));
        let outcome = agent.run("b", "t").await;
        assert_eq!(outcome.status, JobStatus::Partial);
        assert_eq!(outcome.next_steps.as_deref(), Some("log in first"));
    }

    #[tokio::test]
    async fn done_claiming_to_still_run_is_sent_back() {
        let desktop = Arc::new(RecordingDesktop::default());
        let oracle = Arc::new(ScriptedOracle::new(vec![
            (ActionKind::Done, json!({"status": "running", "summary": "still going"})),
            (ActionKind::Done, json!({"summary": "really done"})),
        ]));
        let agent = ComputerAgent::new(Arc::clone(&desktop), Arc::clone(&oracle), cfg(10));

        let outcome = agent.run("job", "finish up").await;

        assert_eq!(outcome.status, JobStatus::Success);
        assert_eq!(outcome.summary, "really done");
        assert_eq!(outcome.steps.len(), 1);
        assert!(outcome.steps[0].result.starts_with("invalid parameters"));
    }

    #[tokio::test]
    async fn effector_and_validation_errors_feed_the_next_step() {
        let desktop = Arc::new(RecordingDesktop::default());
        let oracle = Arc::new(ScriptedOracle::new(vec![
            (ActionKind::Shell, json!({"command": "frobnicate"})),
            (ActionKind::Click, json!({"x": "left"})),
            (ActionKind::Done, json!({"summary": "gave up"})),
        ]));
        let agent = ComputerAgent::new(Arc::clone(&desktop), Arc::clone(&oracle), cfg(10));

        let outcome = agent.run("job", "run a command").await;

        assert_eq!(outcome.status, JobStatus::Success);
        assert_eq!(outcome.steps.len(), 2);
        assert!(outcome.steps[0].result.contains("command not found"));
        assert!(outcome.steps[1].result.starts_with("invalid parameters"));
        // The invalid click never reached the desktop.
        assert_eq!(desktop.performed.lock().unwrap().len(), 1);

        let seen = oracle.seen.lock().unwrap();
        assert!(seen[1].last_result.as_deref().unwrap().contains("command not found"));
        assert!(seen[2].last_result.as_deref().unwrap().contains("failed validation"));
    }

    #[tokio::test]
    async fn history_window_is_bounded() {
        let oracle = Arc::new(ScriptedOracle::new(vec![(ActionKind::Wait, json!({"ms": 0}))]));
        let agent = ComputerAgent::new(
            Arc::new(RecordingDesktop::default()),
            Arc::clone(&oracle),
            cfg(12),
        );
        agent.run("job", "wait").await;

        let seen = oracle.seen.lock().unwrap();
        assert_eq!(seen.len(), 12);
        assert!(seen[0].history.is_empty());
        let last = &seen[11];
        assert_eq!(last.history.len(), 8);
        assert_eq!(last.history[0].index, 4);
        assert_eq!(last.history[7].index, 11);
    }

    #[tokio::test]
    async fn oracle_failure_is_fatal() {
        let desktop = Arc::new(RecordingDesktop::default());
        let agent = ComputerAgent::new(Arc::clone(&desktop), BrokenOracle, cfg(5));
        let outcome = agent.run("job", "anything").await;
        assert_eq!(outcome.status, JobStatus::Failed);
        assert!(outcome.summary.contains("no JSON object"));
        assert!(desktop.performed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn initial_screenshot_failure_fails_the_job() {
        let desktop = RecordingDesktop {
            fail_screenshots: true,
            ..Default::default()
        };
        let oracle = ScriptedOracle::new(vec![(ActionKind::Done, json!({}))]);
        let agent = ComputerAgent::new(desktop, oracle, cfg(5));
        let outcome = agent.run("job", "look").await;
        assert_eq!(outcome.status, JobStatus::Failed);
        assert!(outcome.summary.contains("no permission"));
    }

    #[tokio::test]
    async fn final_screenshot_is_attached_on_request() {
        let oracle = ScriptedOracle::new(vec![
            (ActionKind::Click, json!({"x": 1, "y": 1})),
            (ActionKind::Done, json!({"summary": "ok"})),
        ]);
        let mut config = cfg(5);
        config.include_final_screenshot = true;
        let agent = ComputerAgent::new(RecordingDesktop::default(), oracle, config);
        let outcome = agent.run("job", "click").await;
        assert_eq!(outcome.final_screenshot.unwrap().data_base64, "shot-1");
    }
}
