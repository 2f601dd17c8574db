use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use dagline_core::event::{names, EventEnvelope};
use dagline_core::status::{RunStatus, StepStatus};
use dagline_core::types::{DagRun, DagStep, StepOutput};

/// Aggregate view recomputed from the full step set after every merge.
///
/// Buckets partition the step statuses: completed covers success, skipped
/// and cancelled; running covers running and retry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetrics {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub running_steps: usize,
    pub failed_steps: usize,
    pub pending_steps: usize,
    pub completion_percentage: f64,
}

/// Outcome of applying one envelope to the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// State was merged (possibly a no-op overwrite of equal values).
    Merged,
    /// Discarded by the stale-event guard: the update would move a step or
    /// the run backwards.
    Stale,
    /// Event for a different run.
    OtherRun,
    /// Control traffic (connected/ping/error) — no state change.
    Control,
    /// Unknown event name or unparseable payload — logged and ignored.
    Ignored,
}

/// Partial step payload of a `dag.step.status.updated` event. Absent fields
/// keep their current value (shallow merge by step id).
#[derive(Debug, Deserialize)]
struct StepPatch {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    retry_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    output: Option<StepOutput>,
    #[serde(default)]
    dependencies: Option<Vec<String>>,
}

/// Consumer-side live view of one run: a REST snapshot merged with streamed
/// events. Merging is idempotent and last-write-wins per step id; stale
/// status regressions are discarded.
#[derive(Debug, Clone)]
pub struct RunProjection {
    run: DagRun,
}

fn run_rank(status: RunStatus) -> u8 {
    match status {
        RunStatus::Pending => 0,
        RunStatus::Running => 1,
        _ => 2,
    }
}

impl RunProjection {
    /// Seed from a REST snapshot.
    pub fn new(snapshot: DagRun) -> Self {
        Self { run: snapshot }
    }

    pub fn run(&self) -> &DagRun {
        &self.run
    }

    /// Merge one event envelope into the projection.
    pub fn apply(&mut self, envelope: &EventEnvelope) -> Applied {
        match envelope.event.as_str() {
            names::CONNECTED | names::PING | names::ERROR => return Applied::Control,
            _ => {}
        }

        match &envelope.run_id {
            Some(run_id) if *run_id == self.run.id => {}
            _ => return Applied::OtherRun,
        }

        match envelope.event.as_str() {
            names::RUN_CREATED => Applied::Merged,
            names::STEP_STATUS_UPDATED => self.merge_step(&envelope.data),
            names::RUN_STATUS_UPDATED => self.merge_run_status(&envelope.data),
            names::RUN_COMPLETED => {
                let applied = self.merge_run_status(&envelope.data);
                if applied == Applied::Merged && self.run.end_date.is_none() {
                    self.run.end_date = Some(envelope.timestamp);
                }
                applied
            }
            unknown => {
                // Forward compatibility: log and ignore
                debug!(event = unknown, "Ignoring unknown event");
                Applied::Ignored
            }
        }
    }

    fn merge_run_status(&mut self, data: &serde_json::Value) -> Applied {
        let Some(raw) = data.get("status").and_then(|v| v.as_str()) else {
            debug!("Run status event without status field");
            return Applied::Ignored;
        };
        let Ok(status) = RunStatus::parse_lenient(raw) else {
            debug!(status = raw, "Unparseable run status");
            return Applied::Ignored;
        };

        if run_rank(status) < run_rank(self.run.status) {
            debug!(
                current = %self.run.status,
                incoming = %status,
                "Stale run status discarded"
            );
            return Applied::Stale;
        }
        self.run.apply_status(status);
        Applied::Merged
    }

    fn merge_step(&mut self, data: &serde_json::Value) -> Applied {
        let patch: StepPatch = match serde_json::from_value(data.clone()) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "Unparseable step payload");
                return Applied::Ignored;
            }
        };

        let status = match &patch.status {
            Some(raw) => match StepStatus::parse_lenient(raw) {
                Ok(s) => Some(s),
                Err(_) => {
                    debug!(status = %raw, "Unparseable step status");
                    return Applied::Ignored;
                }
            },
            None => None,
        };

        let step = match self.run.step_mut(&patch.id) {
            Some(step) => step,
            None => {
                // A step the snapshot did not know about yet
                let name = patch.name.clone().unwrap_or_else(|| patch.id.clone());
                self.run.steps.push(DagStep::new(&patch.id, name));
                self.run.steps.last_mut().expect("just pushed")
            }
        };

        if let Some(incoming) = status {
            if incoming.rank() < step.status.rank() {
                debug!(
                    step_id = %step.id,
                    current = %step.status,
                    incoming = %incoming,
                    "Stale step update discarded"
                );
                return Applied::Stale;
            }
            step.status = incoming;
        }

        // Shallow field overwrite: only fields present in the payload
        if let Some(name) = patch.name {
            step.name = name;
        }
        if patch.start_time.is_some() {
            step.start_time = patch.start_time;
        }
        if patch.end_time.is_some() {
            step.end_time = patch.end_time;
        }
        if patch.duration_ms.is_some() {
            step.duration_ms = patch.duration_ms;
        }
        if let Some(retry_count) = patch.retry_count {
            step.retry_count = retry_count;
        }
        if patch.error.is_some() {
            step.error = patch.error;
        }
        if patch.output.is_some() {
            step.output = patch.output;
        }
        if let Some(deps) = patch.dependencies {
            step.dependencies = deps;
        }

        Applied::Merged
    }

    /// Recompute aggregates from the full step set — O(steps) per call, no
    /// incremental counters to drift.
    pub fn metrics(&self) -> RunMetrics {
        let mut completed = 0usize;
        let mut running = 0usize;
        let mut failed = 0usize;
        let mut pending = 0usize;
        for step in &self.run.steps {
            match step.status {
                StepStatus::Success | StepStatus::Skipped | StepStatus::Cancelled => {
                    completed += 1
                }
                StepStatus::Running | StepStatus::Retry => running += 1,
                StepStatus::Failed => failed += 1,
                StepStatus::Pending => pending += 1,
            }
        }
        let total = self.run.steps.len();
        let terminal = completed + failed;
        let completion_percentage = if total == 0 {
            100.0
        } else {
            terminal as f64 / total as f64 * 100.0
        };
        RunMetrics {
            total_steps: total,
            completed_steps: completed,
            running_steps: running,
            failed_steps: failed,
            pending_steps: pending,
            completion_percentage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dagline_core::types::RunId;

    fn snapshot() -> DagRun {
        let mut run = DagRun::new("digest");
        run.id = RunId::from_string("r1");
        run.steps.push(DagStep::new("fetch", "Fetch"));
        run.steps.push(DagStep::new("parse", "Parse"));
        run.steps.push(DagStep::new("publish", "Publish"));
        run
    }

    fn step_event(step_id: &str, status: &str) -> EventEnvelope {
        EventEnvelope {
            event: names::STEP_STATUS_UPDATED.to_string(),
            run_id: Some(RunId::from_string("r1")),
            data: serde_json::json!({ "id": step_id, "status": status }),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut p = RunProjection::new(snapshot());
        let event = step_event("fetch", "running");

        assert_eq!(p.apply(&event), Applied::Merged);
        let after_first = format!("{:?}", p.run());
        assert_eq!(p.apply(&event), Applied::Merged);
        assert_eq!(format!("{:?}", p.run()), after_first);
        assert_eq!(p.run().step("fetch").unwrap().retry_count, 0);
    }

    #[test]
    fn test_stale_regression_discarded() {
        let mut p = RunProjection::new(snapshot());
        assert_eq!(p.apply(&step_event("fetch", "running")), Applied::Merged);
        assert_eq!(p.apply(&step_event("fetch", "pending")), Applied::Stale);
        assert_eq!(
            p.run().step("fetch").unwrap().status,
            StepStatus::Running
        );
    }

    #[test]
    fn test_terminal_step_not_reverted() {
        let mut p = RunProjection::new(snapshot());
        p.apply(&step_event("fetch", "success"));
        assert_eq!(p.apply(&step_event("fetch", "running")), Applied::Stale);
        assert_eq!(
            p.run().step("fetch").unwrap().status,
            StepStatus::Success
        );
    }

    #[test]
    fn test_retry_flapping_allowed() {
        let mut p = RunProjection::new(snapshot());
        p.apply(&step_event("fetch", "running"));
        assert_eq!(p.apply(&step_event("fetch", "retry")), Applied::Merged);
        assert_eq!(p.apply(&step_event("fetch", "running")), Applied::Merged);
    }

    #[test]
    fn test_unknown_event_tolerated() {
        let mut p = RunProjection::new(snapshot());
        let before = p.metrics();
        let envelope = EventEnvelope {
            event: "dag.unknown.thing".to_string(),
            run_id: Some(RunId::from_string("r1")),
            data: serde_json::json!({}),
            timestamp: Utc::now(),
        };
        assert_eq!(p.apply(&envelope), Applied::Ignored);
        assert_eq!(p.metrics(), before);
    }

    #[test]
    fn test_other_run_ignored() {
        let mut p = RunProjection::new(snapshot());
        let mut envelope = step_event("fetch", "running");
        envelope.run_id = Some(RunId::from_string("someone-else"));
        assert_eq!(p.apply(&envelope), Applied::OtherRun);
        assert_eq!(
            p.run().step("fetch").unwrap().status,
            StepStatus::Pending
        );
    }

    #[test]
    fn test_aggregate_consistency_after_every_merge() {
        let mut p = RunProjection::new(snapshot());
        let events = vec![
            step_event("fetch", "running"),
            step_event("fetch", "success"),
            step_event("parse", "running"),
            step_event("parse", "failed"),
            step_event("publish", "skipped"),
        ];
        for event in &events {
            p.apply(event);
            let m = p.metrics();
            assert_eq!(
                m.completed_steps + m.running_steps + m.failed_steps + m.pending_steps,
                m.total_steps
            );
        }
        let m = p.metrics();
        assert_eq!(m.failed_steps, 1);
        assert_eq!(m.completed_steps, 2);
        assert_eq!(m.completion_percentage, 100.0);
    }

    #[test]
    fn test_run_completed_sets_status_and_end_date() {
        let mut p = RunProjection::new(snapshot());
        for id in ["fetch", "parse", "publish"] {
            p.apply(&step_event(id, "success"));
        }
        let envelope = EventEnvelope {
            event: names::RUN_COMPLETED.to_string(),
            run_id: Some(RunId::from_string("r1")),
            data: serde_json::json!({
                "status": "success",
                "completion_percentage": 100.0,
            }),
            timestamp: Utc::now(),
        };
        assert_eq!(p.apply(&envelope), Applied::Merged);
        assert_eq!(p.run().status, RunStatus::Success);
        assert!(p.run().end_date.is_some());
    }

    #[test]
    fn test_run_status_regression_discarded() {
        let mut p = RunProjection::new(snapshot());
        let running = EventEnvelope {
            event: names::RUN_STATUS_UPDATED.to_string(),
            run_id: Some(RunId::from_string("r1")),
            data: serde_json::json!({ "status": "running" }),
            timestamp: Utc::now(),
        };
        let pending = EventEnvelope {
            event: names::RUN_STATUS_UPDATED.to_string(),
            run_id: Some(RunId::from_string("r1")),
            data: serde_json::json!({ "status": "pending" }),
            timestamp: Utc::now(),
        };
        assert_eq!(p.apply(&running), Applied::Merged);
        assert_eq!(p.apply(&pending), Applied::Stale);
        assert_eq!(p.run().status, RunStatus::Running);
    }

    #[test]
    fn test_unknown_step_is_inserted() {
        let mut p = RunProjection::new(snapshot());
        p.apply(&step_event("surprise", "running"));
        assert!(p.run().step("surprise").is_some());
        assert_eq!(p.metrics().total_steps, 4);
    }

    #[test]
    fn test_legacy_status_vocabulary_accepted() {
        let mut p = RunProjection::new(snapshot());
        assert_eq!(p.apply(&step_event("fetch", "RUNNING")), Applied::Merged);
        assert_eq!(p.apply(&step_event("fetch", "completed")), Applied::Merged);
        assert_eq!(
            p.run().step("fetch").unwrap().status,
            StepStatus::Success
        );
    }
}
