use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::RunStatus;
use crate::types::{DagStep, RunId};

/// Canonical event names pushed over the WebSocket.
pub mod names {
    pub const CONNECTED: &str = "connected";
    pub const RUN_CREATED: &str = "dag.run.created";
    pub const RUN_STATUS_UPDATED: &str = "dag.run.status.updated";
    pub const STEP_STATUS_UPDATED: &str = "dag.step.status.updated";
    pub const RUN_COMPLETED: &str = "dag.run.completed";
    pub const PING: &str = "ping";
    pub const ERROR: &str = "error";
}

/// A run lifecycle event broadcast on the bus.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunCreated {
        run_id: RunId,
        dag_id: String,
    },
    RunStatusUpdated {
        run_id: RunId,
        status: RunStatus,
    },
    StepStatusUpdated {
        run_id: RunId,
        step: DagStep,
    },
    RunCompleted {
        run_id: RunId,
        status: RunStatus,
        completed_steps: usize,
        total_steps: usize,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunCreated { run_id, .. }
            | Self::RunStatusUpdated { run_id, .. }
            | Self::StepStatusUpdated { run_id, .. }
            | Self::RunCompleted { run_id, .. } => run_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RunCreated { .. } => names::RUN_CREATED,
            Self::RunStatusUpdated { .. } => names::RUN_STATUS_UPDATED,
            Self::StepStatusUpdated { .. } => names::STEP_STATUS_UPDATED,
            Self::RunCompleted { .. } => names::RUN_COMPLETED,
        }
    }

    /// Wire form for the broadcaster and for clients.
    pub fn to_envelope(&self) -> EventEnvelope {
        let data = match self {
            Self::RunCreated { dag_id, .. } => serde_json::json!({ "dag_id": dag_id }),
            Self::RunStatusUpdated { status, .. } => serde_json::json!({ "status": status }),
            Self::StepStatusUpdated { step, .. } => {
                serde_json::to_value(step).unwrap_or_default()
            }
            Self::RunCompleted {
                status,
                completed_steps,
                total_steps,
                ..
            } => {
                let pct = if *total_steps == 0 {
                    100.0
                } else {
                    *completed_steps as f64 / *total_steps as f64 * 100.0
                };
                serde_json::json!({
                    "status": status,
                    "completed_steps": completed_steps,
                    "total_steps": total_steps,
                    "completion_percentage": pct,
                })
            }
        };

        EventEnvelope {
            event: self.name().to_string(),
            run_id: Some(self.run_id().clone()),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// The envelope every server-to-client message is wrapped in:
/// `{event, run_id?, data, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn bare(event: &str) -> Self {
        Self {
            event: event.to_string(),
            run_id: None,
            data: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            event: names::ERROR.to_string(),
            run_id: None,
            data: serde_json::json!({ "message": message.into() }),
            timestamp: Utc::now(),
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events; scoping happens at the connection.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
