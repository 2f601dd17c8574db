use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::{aggregate_run_status, RunStatus, StepStatus};

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structured output attached to a completed step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepOutput {
    Text {
        content: String,
        timestamp: DateTime<Utc>,
    },
    Json {
        content: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    File {
        content: String,
        timestamp: DateTime<Utc>,
        size: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        download_url: Option<String>,
    },
    Error {
        content: String,
        timestamp: DateTime<Utc>,
    },
}

impl StepOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// One unit of work within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagStep {
    pub id: String,
    pub name: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<StepOutput>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl DagStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            duration_ms: None,
            retry_count: 0,
            error: None,
            output: None,
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Mark the step as started. Sets `start_time`, clears any stale end
    /// fields from a previous attempt.
    pub fn mark_running(&mut self) {
        self.status = StepStatus::Running;
        self.start_time = Some(Utc::now());
        self.end_time = None;
        self.duration_ms = None;
    }

    /// Mark a failed attempt that will be retried.
    pub fn mark_retry(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Retry;
        self.retry_count += 1;
        self.error = Some(error.into());
    }

    /// Move the step to a terminal status, maintaining the end-time
    /// invariant: `end_time` is set iff the status is terminal, and
    /// `duration_ms` equals the span between the two timestamps.
    pub fn mark_terminal(&mut self, status: StepStatus, error: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.error = error;
        let now = Utc::now();
        self.end_time = Some(now);
        if let Some(start) = self.start_time {
            self.duration_ms = Some((now - start).num_milliseconds().max(0) as u64);
        }
    }

    /// End-time invariant check, used by tests and the archive exporter.
    pub fn end_time_invariant_holds(&self) -> bool {
        self.end_time.is_some() == self.status.is_terminal()
    }
}

/// One execution instance of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagRun {
    /// Run identifier. Serialized as `id`; `run_id` is accepted on input
    /// for compatibility with producers that conflate the two.
    #[serde(alias = "run_id")]
    pub id: RunId,
    pub dag_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<DagStep>,
    /// Open, schema-less configuration map.
    #[serde(default)]
    pub conf: HashMap<String, serde_json::Value>,
    /// Open, schema-less metadata map (owner, description, tags, …).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl DagRun {
    pub fn new(dag_id: impl Into<String>) -> Self {
        Self {
            id: RunId::new(),
            dag_id: dag_id.into(),
            status: RunStatus::Pending,
            execution_date: Some(Utc::now()),
            start_date: None,
            end_date: None,
            steps: Vec::new(),
            conf: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&DagStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut DagStep> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// Recompute the aggregate status from the current step set.
    pub fn derived_status(&self) -> RunStatus {
        aggregate_run_status(self.steps.iter().map(|s| s.status))
    }

    /// Apply a run-level status, maintaining the date invariants.
    pub fn apply_status(&mut self, status: RunStatus) {
        if status == RunStatus::Running && self.start_date.is_none() {
            self.start_date = Some(Utc::now());
        }
        if status.is_terminal() && self.end_date.is_none() {
            self.end_date = Some(Utc::now());
        }
        self.status = status;
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            run_id: self.id.clone(),
            dag_id: self.dag_id.clone(),
            status: self.status,
            execution_date: self.execution_date,
            start_date: self.start_date,
            end_date: self.end_date,
            total_steps: self.steps.len(),
        }
    }
}

/// Listing shape for `GET /api/dag-runs` — a run without its step bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub run_id: RunId,
    pub dag_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    pub total_steps: usize,
}

/// Engine selector for run creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
    #[default]
    Sequential,
    StatefulDag,
}

impl EngineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::StatefulDag => "stateful_dag",
        }
    }
}

impl std::str::FromStr for EngineType {
    type Err = crate::error::DaglineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "stateful_dag" => Ok(Self::StatefulDag),
            other => Err(crate::error::DaglineError::UnknownEngine(other.to_string())),
        }
    }
}

impl std::fmt::Display for EngineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
