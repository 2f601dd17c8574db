use serde::{Deserialize, Serialize};

use crate::error::{DaglineError, Result};

/// Status of a single step within a run.
///
/// This is the canonical vocabulary; legacy spellings from other components
/// (`PENDING`, `completed`, `retrying`, …) are accepted at external
/// boundaries via [`StepStatus::parse_lenient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    /// A failed attempt is being retried; still in flight.
    Retry,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    /// Terminal statuses admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Progress rank used by the stale-event guard: pending < in-flight <
    /// terminal. Running and retry share a rank — a step may flap between
    /// them while attempts are made.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running | Self::Retry => 1,
            Self::Success | Self::Failed | Self::Skipped | Self::Cancelled => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Retry => "retry",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse any of the status vocabularies seen in the wild onto the
    /// canonical set. Unknown values are a validation error.
    pub fn parse_lenient(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "none" => Ok(Self::Pending),
            "running" | "in_progress" => Ok(Self::Running),
            "retry" | "retrying" | "up_for_retry" => Ok(Self::Retry),
            "success" | "succeeded" | "completed" | "complete" => Ok(Self::Success),
            "failed" | "failure" | "error" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(DaglineError::Validation(format!(
                "unknown step status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse_lenient(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" => Ok(Self::Pending),
            "running" | "in_progress" => Ok(Self::Running),
            "success" | "succeeded" | "completed" | "complete" => Ok(Self::Success),
            "failed" | "failure" | "error" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(DaglineError::Validation(format!(
                "unknown run status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the run status from its step statuses.
///
/// The rule, in order:
/// 1. no steps, or all pending → pending
/// 2. any step in flight (running/retry) → running
/// 3. any step failed → failed
/// 4. any step cancelled → cancelled
/// 5. all steps success/skipped → success
/// 6. otherwise (some terminal, some pending, nothing in flight) → running
pub fn aggregate_run_status<I>(statuses: I) -> RunStatus
where
    I: IntoIterator<Item = StepStatus>,
{
    let mut total = 0usize;
    let mut pending = 0usize;
    let mut in_flight = 0usize;
    let mut failed = 0usize;
    let mut cancelled = 0usize;

    for s in statuses {
        total += 1;
        match s {
            StepStatus::Pending => pending += 1,
            StepStatus::Running | StepStatus::Retry => in_flight += 1,
            StepStatus::Failed => failed += 1,
            StepStatus::Cancelled => cancelled += 1,
            StepStatus::Success | StepStatus::Skipped => {}
        }
    }

    if total == 0 || pending == total {
        RunStatus::Pending
    } else if in_flight > 0 {
        RunStatus::Running
    } else if failed > 0 {
        RunStatus::Failed
    } else if cancelled > 0 {
        RunStatus::Cancelled
    } else if pending == 0 {
        RunStatus::Success
    } else {
        RunStatus::Running
    }
}
