use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dagline_core::error::{DaglineError, Result};
use dagline_core::event::{EventBus, RunEvent};
use dagline_core::status::{RunStatus, StepStatus};
use dagline_core::traits::RunStore;
use dagline_core::types::{DagRun, RunId, StepOutput};

use crate::workflow::{StepAction, StepSpec, WorkflowSpec};

/// Longest delay between retry attempts.
const MAX_RETRY_BACKOFF_MS: u64 = 60_000;

/// Doubling backoff, saturating and capped. `retries` comes straight from
/// the workflow template, so the attempt number is unbounded input.
fn retry_backoff(base_ms: u64, attempt: u64) -> Duration {
    let exp = attempt.saturating_sub(1).min(u32::MAX as u64) as u32;
    let ms = base_ms
        .saturating_mul(2u64.saturating_pow(exp))
        .min(MAX_RETRY_BACKOFF_MS);
    Duration::from_millis(ms)
}

/// Shared context for the run drivers. Every state change goes through the
/// store and is published on the bus.
pub struct DriverCtx {
    pub store: Arc<dyn RunStore>,
    pub bus: Arc<EventBus>,
    pub run_id: RunId,
    pub cancel: CancellationToken,
    /// Base delay before a retry attempt, doubled per attempt.
    pub retry_backoff_ms: u64,
}

/// Whether a step may run, given the current state of its dependencies.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DepState {
    Ready,
    /// A dependency ended in a non-success terminal status.
    Blocked,
    Waiting,
}

impl DriverCtx {
    pub(crate) async fn load_run(&self) -> Result<DagRun> {
        self.store
            .get_run(&self.run_id)
            .await?
            .ok_or_else(|| DaglineError::RunNotFound(self.run_id.to_string()))
    }

    /// Persist a step and broadcast the change.
    pub(crate) async fn put_step(&self, step: &dagline_core::types::DagStep) -> Result<()> {
        self.store.update_step(&self.run_id, step).await?;
        self.bus.publish(RunEvent::StepStatusUpdated {
            run_id: self.run_id.clone(),
            step: step.clone(),
        });
        Ok(())
    }

    /// Move the run to `running` when the first step starts.
    pub(crate) async fn mark_run_running(&self) -> Result<()> {
        let run = self
            .store
            .update_run_status(&self.run_id, RunStatus::Running)
            .await?;
        self.bus.publish(RunEvent::RunStatusUpdated {
            run_id: self.run_id.clone(),
            status: run.status,
        });
        Ok(())
    }

    pub(crate) fn dep_state(&self, run: &DagRun, spec: &StepSpec) -> DepState {
        let mut waiting = false;
        for dep in &spec.depends_on {
            match run.step(dep).map(|s| s.status) {
                Some(StepStatus::Success) => {}
                Some(s) if s.is_terminal() => return DepState::Blocked,
                _ => waiting = true,
            }
        }
        if waiting {
            DepState::Waiting
        } else {
            DepState::Ready
        }
    }

    /// Run one step to a terminal status, retrying failures up to
    /// `spec.retries` extra attempts with doubling backoff.
    pub(crate) async fn execute_step(&self, spec: &StepSpec) -> Result<StepStatus> {
        let run = self.load_run().await?;
        let mut step = run
            .step(&spec.id)
            .cloned()
            .ok_or_else(|| DaglineError::Workflow(format!("step not seeded: {}", spec.id)))?;

        let action = spec.action();
        let max_attempts = spec.retries as u64 + 1;

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                step.mark_terminal(StepStatus::Cancelled, None);
                self.put_step(&step).await?;
                return Ok(StepStatus::Cancelled);
            }

            step.mark_running();
            self.put_step(&step).await?;
            debug!(run_id = %self.run_id, step_id = %step.id, attempt, "Step started");

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => {
                    step.mark_terminal(StepStatus::Cancelled, None);
                    self.put_step(&step).await?;
                    return Ok(StepStatus::Cancelled);
                }
                outcome = execute_action(&action) => outcome,
            };

            match outcome {
                Ok(output) => {
                    step.output = output;
                    step.mark_terminal(StepStatus::Success, None);
                    self.put_step(&step).await?;
                    return Ok(StepStatus::Success);
                }
                Err(message) if attempt < max_attempts => {
                    warn!(
                        run_id = %self.run_id,
                        step_id = %step.id,
                        attempt,
                        error = %message,
                        "Step attempt failed, retrying"
                    );
                    step.mark_retry(&message);
                    self.put_step(&step).await?;
                    tokio::time::sleep(retry_backoff(self.retry_backoff_ms, attempt)).await;
                }
                Err(message) => {
                    error!(
                        run_id = %self.run_id,
                        step_id = %step.id,
                        error = %message,
                        "Step failed"
                    );
                    step.output = Some(StepOutput::error(&message));
                    step.mark_terminal(StepStatus::Failed, Some(message));
                    self.put_step(&step).await?;
                    return Ok(StepStatus::Failed);
                }
            }
        }

        unreachable!("retry loop always returns")
    }

    /// Skip a step whose dependency chain cannot succeed anymore.
    pub(crate) async fn skip_step(&self, step_id: &str) -> Result<()> {
        let run = self.load_run().await?;
        if let Some(step) = run.step(step_id) {
            let mut step = step.clone();
            step.mark_terminal(
                StepStatus::Skipped,
                Some("dependency did not succeed".to_string()),
            );
            self.put_step(&step).await?;
        }
        Ok(())
    }

    /// Cancel every step that has not reached a terminal status yet.
    pub(crate) async fn cancel_remaining(&self) -> Result<()> {
        let run = self.load_run().await?;
        for step in &run.steps {
            if !step.status.is_terminal() {
                let mut step = step.clone();
                step.mark_terminal(StepStatus::Cancelled, None);
                self.put_step(&step).await?;
            }
        }
        Ok(())
    }

    /// Derive and apply the final run status, then announce completion.
    /// A run already moved to a terminal status elsewhere (external cancel)
    /// is left untouched.
    pub(crate) async fn finalize(&self) -> Result<()> {
        let run = self.load_run().await?;
        if run.status.is_terminal() {
            return Ok(());
        }

        let status = run.derived_status();
        match self.store.update_run_status(&self.run_id, status).await {
            Ok(updated) => {
                self.bus.publish(RunEvent::RunStatusUpdated {
                    run_id: self.run_id.clone(),
                    status: updated.status,
                });
                if updated.status.is_terminal() {
                    let completed = updated
                        .steps
                        .iter()
                        .filter(|s| s.status.is_terminal())
                        .count();
                    info!(
                        run_id = %self.run_id,
                        status = %updated.status,
                        completed,
                        total = updated.steps.len(),
                        "Run finished"
                    );
                    self.bus.publish(RunEvent::RunCompleted {
                        run_id: self.run_id.clone(),
                        status: updated.status,
                        completed_steps: completed,
                        total_steps: updated.steps.len(),
                    });
                }
                Ok(())
            }
            Err(DaglineError::InvalidTransition { .. }) => {
                // Lost the race against an external terminal transition
                debug!(run_id = %self.run_id, "Finalize skipped, run already terminal");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Execute a step action. `Err` carries a human-readable failure cause.
pub(crate) async fn execute_action(
    action: &StepAction,
) -> std::result::Result<Option<StepOutput>, String> {
    match action {
        StepAction::Noop => Ok(None),
        StepAction::Sleep(ms) => {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
            Ok(None)
        }
        StepAction::Run(cmd) => {
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(cmd)
                .output()
                .await
                .map_err(|e| format!("failed to spawn command: {e}"))?;

            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                Ok(Some(StepOutput::text(stdout)))
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let code = output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                Err(if stderr.is_empty() {
                    format!("command exited with status {code}")
                } else {
                    format!("command exited with status {code}: {stderr}")
                })
            }
        }
    }
}

/// Drive a run with the `sequential` engine: topological order, one step at
/// a time, dependency-gated.
pub async fn run_sequential(ctx: &DriverCtx, spec: &WorkflowSpec) -> Result<()> {
    ctx.mark_run_running().await?;
    let order = spec.topological_order()?;

    for step_id in &order {
        if ctx.cancel.is_cancelled() {
            ctx.cancel_remaining().await?;
            break;
        }

        let step_spec = spec
            .step(step_id)
            .ok_or_else(|| DaglineError::Workflow(format!("unknown step: {step_id}")))?;

        let run = ctx.load_run().await?;
        match ctx.dep_state(&run, step_spec) {
            DepState::Ready => {
                ctx.execute_step(step_spec).await?;
            }
            DepState::Blocked | DepState::Waiting => {
                // In topological order an unsatisfied dependency is final
                ctx.skip_step(step_id).await?;
            }
        }
    }

    ctx.finalize().await
}

/// Drive a run with the `stateful_dag` engine: ready steps of each wave run
/// concurrently; steps behind a failed dependency are skipped.
pub async fn run_stateful_dag(ctx: &DriverCtx, spec: &WorkflowSpec) -> Result<()> {
    ctx.mark_run_running().await?;

    loop {
        if ctx.cancel.is_cancelled() {
            ctx.cancel_remaining().await?;
            break;
        }

        let run = ctx.load_run().await?;
        let pending: Vec<&StepSpec> = spec
            .steps
            .iter()
            .filter(|s| {
                run.step(&s.id)
                    .map(|step| step.status == StepStatus::Pending)
                    .unwrap_or(false)
            })
            .collect();
        if pending.is_empty() {
            break;
        }

        let mut ready = Vec::new();
        let mut blocked = Vec::new();
        for step_spec in pending {
            match ctx.dep_state(&run, step_spec) {
                DepState::Ready => ready.push(step_spec),
                DepState::Blocked => blocked.push(step_spec.id.clone()),
                DepState::Waiting => {}
            }
        }

        for step_id in &blocked {
            ctx.skip_step(step_id).await?;
        }

        if ready.is_empty() {
            if blocked.is_empty() {
                // Nothing ready and nothing to skip: would spin forever
                warn!(run_id = %ctx.run_id, "No runnable steps remain, stopping");
                break;
            }
            continue;
        }

        let wave = ready.iter().map(|s| ctx.execute_step(s));
        for result in futures::future::join_all(wave).await {
            result?;
        }
    }

    ctx.finalize().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagline_store::MemoryRunStore;
    use dagline_core::types::EngineType;

    fn ctx_for(run: &DagRun) -> DriverCtx {
        let store = Arc::new(MemoryRunStore::new());
        DriverCtx {
            store,
            bus: Arc::new(EventBus::new(64)),
            run_id: run.id.clone(),
            cancel: CancellationToken::new(),
            retry_backoff_ms: 1,
        }
    }

    fn spec_from(yaml: &str) -> WorkflowSpec {
        let spec: WorkflowSpec = serde_yaml::from_str(yaml).unwrap();
        spec.validate().unwrap();
        spec
    }

    async fn seed(ctx: &DriverCtx, run: &DagRun) {
        ctx.store.insert_run(run).await.unwrap();
    }

    #[tokio::test]
    async fn test_sequential_happy_path() {
        let spec = spec_from(
            r#"
dag_id: linear
steps:
  - id: a
  - id: b
    depends_on: [a]
"#,
        );
        let run = spec.to_run("linear.yaml", EngineType::Sequential);
        let ctx = ctx_for(&run);
        seed(&ctx, &run).await;

        let mut events = ctx.bus.subscribe();
        run_sequential(&ctx, &spec).await.unwrap();

        let finished = ctx.load_run().await.unwrap();
        assert_eq!(finished.status, RunStatus::Success);
        assert!(finished.end_date.is_some());
        assert!(finished
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Success && s.end_time_invariant_holds()));

        // dag.run.completed must be among the published events
        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, RunEvent::RunCompleted { .. }) {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_downstream() {
        let spec = spec_from(
            r#"
dag_id: branch
steps:
  - id: bad
    run: "exit 3"
  - id: after
    depends_on: [bad]
  - id: independent
"#,
        );
        let run = spec.to_run("branch.yaml", EngineType::Sequential);
        let ctx = ctx_for(&run);
        seed(&ctx, &run).await;

        run_sequential(&ctx, &spec).await.unwrap();

        let finished = ctx.load_run().await.unwrap();
        assert_eq!(finished.status, RunStatus::Failed);
        assert_eq!(finished.step("bad").unwrap().status, StepStatus::Failed);
        assert!(finished
            .step("bad")
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .contains("status 3"));
        assert_eq!(finished.step("after").unwrap().status, StepStatus::Skipped);
        // A step without the failed dependency still runs
        assert_eq!(
            finished.step("independent").unwrap().status,
            StepStatus::Success
        );
    }

    #[test]
    fn test_retry_backoff_doubles_saturates_and_caps() {
        assert_eq!(retry_backoff(500, 1), Duration::from_millis(500));
        assert_eq!(retry_backoff(500, 2), Duration::from_millis(1000));
        assert_eq!(retry_backoff(500, 3), Duration::from_millis(2000));
        // large attempt numbers hit the cap instead of overflowing
        assert_eq!(
            retry_backoff(500, 20),
            Duration::from_millis(MAX_RETRY_BACKOFF_MS)
        );
        assert_eq!(
            retry_backoff(1, 70),
            Duration::from_millis(MAX_RETRY_BACKOFF_MS)
        );
        assert_eq!(retry_backoff(0, 70), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_large_retry_count_still_terminates() {
        let spec = spec_from(
            r#"
dag_id: stubborn
steps:
  - id: stubborn
    retries: 70
    run: "false"
"#,
        );
        let run = spec.to_run("stubborn.yaml", EngineType::Sequential);
        let mut ctx = ctx_for(&run);
        ctx.retry_backoff_ms = 0;
        seed(&ctx, &run).await;

        let mut events = ctx.bus.subscribe();
        run_sequential(&ctx, &spec).await.unwrap();

        let finished = ctx.load_run().await.unwrap();
        assert_eq!(finished.status, RunStatus::Failed);
        assert_eq!(finished.step("stubborn").unwrap().retry_count, 70);

        // The retry storm overflows the bus buffer; completion must still
        // be among the retained tail.
        let mut saw_completed = false;
        loop {
            match events.try_recv() {
                Ok(RunEvent::RunCompleted { .. }) => saw_completed = true,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn test_retries_are_counted_and_bounded() {
        let spec = spec_from(
            r#"
dag_id: flaky
steps:
  - id: flaky
    retries: 2
    run: "false"
"#,
        );
        let run = spec.to_run("flaky.yaml", EngineType::Sequential);
        let ctx = ctx_for(&run);
        seed(&ctx, &run).await;

        run_sequential(&ctx, &spec).await.unwrap();

        let finished = ctx.load_run().await.unwrap();
        let step = finished.step("flaky").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.retry_count, 2);
        assert!(matches!(step.output, Some(StepOutput::Error { .. })));
    }

    #[tokio::test]
    async fn test_precancelled_run_marks_steps_cancelled() {
        let spec = spec_from(
            r#"
dag_id: doomed
steps:
  - id: a
  - id: b
    depends_on: [a]
"#,
        );
        let run = spec.to_run("doomed.yaml", EngineType::Sequential);
        let ctx = ctx_for(&run);
        seed(&ctx, &run).await;
        ctx.cancel.cancel();

        run_sequential(&ctx, &spec).await.unwrap();

        let finished = ctx.load_run().await.unwrap();
        assert_eq!(finished.status, RunStatus::Cancelled);
        assert!(finished
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_stateful_dag_runs_waves() {
        let spec = spec_from(
            r#"
dag_id: diamond
steps:
  - id: root
  - id: left
    depends_on: [root]
  - id: right
    depends_on: [root]
  - id: join
    depends_on: [left, right]
"#,
        );
        let run = spec.to_run("diamond.yaml", EngineType::StatefulDag);
        let ctx = ctx_for(&run);
        seed(&ctx, &run).await;

        run_stateful_dag(&ctx, &spec).await.unwrap();

        let finished = ctx.load_run().await.unwrap();
        assert_eq!(finished.status, RunStatus::Success);
        let join = finished.step("join").unwrap();
        let left = finished.step("left").unwrap();
        let right = finished.step("right").unwrap();
        assert!(join.start_time.unwrap() >= left.end_time.unwrap());
        assert!(join.start_time.unwrap() >= right.end_time.unwrap());
    }

    #[tokio::test]
    async fn test_stateful_dag_skip_cascade() {
        let spec = spec_from(
            r#"
dag_id: cascade
steps:
  - id: bad
    run: "exit 1"
  - id: mid
    depends_on: [bad]
  - id: leaf
    depends_on: [mid]
"#,
        );
        let run = spec.to_run("cascade.yaml", EngineType::StatefulDag);
        let ctx = ctx_for(&run);
        seed(&ctx, &run).await;

        run_stateful_dag(&ctx, &spec).await.unwrap();

        let finished = ctx.load_run().await.unwrap();
        assert_eq!(finished.status, RunStatus::Failed);
        assert_eq!(finished.step("mid").unwrap().status, StepStatus::Skipped);
        assert_eq!(finished.step("leaf").unwrap().status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_run_command_captures_stdout() {
        let out = execute_action(&StepAction::Run("echo hello".into()))
            .await
            .unwrap();
        match out {
            Some(StepOutput::Text { content, .. }) => assert_eq!(content, "hello"),
            other => panic!("unexpected output: {other:?}"),
        }
    }
}
