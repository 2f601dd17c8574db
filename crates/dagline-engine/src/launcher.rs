use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dagline_core::config::{EngineConfig, StoreConfig};
use dagline_core::error::{DaglineError, Result};
use dagline_core::event::{EventBus, RunEvent};
use dagline_core::status::RunStatus;
use dagline_core::traits::RunStore;
use dagline_core::types::{DagRun, EngineType, RunId};

use dagline_store::{archive_run, SqliteRunStore};

use crate::driver::{run_sequential, run_stateful_dag, DriverCtx};
use crate::workflow::WorkflowSpec;

/// Creates runs, spawns the selected driver for each, and tracks per-run
/// cancellation tokens so the gateway can request cancellation.
pub struct RunLauncher {
    store: Arc<dyn RunStore>,
    bus: Arc<EventBus>,
    /// Mirror for runs created with `persist: true`.
    persist_store: Option<Arc<SqliteRunStore>>,
    archive_dir: PathBuf,
    workflows_dir: PathBuf,
    retry_backoff_ms: u64,
    /// Live per-run cancellation tokens. Entries are removed when the run's
    /// driver task finishes or the run is cancelled.
    tokens: Arc<Mutex<HashMap<RunId, CancellationToken>>>,
}

impl RunLauncher {
    pub fn new(
        store: Arc<dyn RunStore>,
        bus: Arc<EventBus>,
        engine_config: &EngineConfig,
        store_config: &StoreConfig,
        persist_store: Option<Arc<SqliteRunStore>>,
    ) -> Self {
        Self {
            store,
            bus,
            persist_store,
            archive_dir: PathBuf::from(&store_config.archive_dir),
            workflows_dir: PathBuf::from(&engine_config.workflows_dir),
            retry_backoff_ms: engine_config.retry_backoff_ms,
            tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn resolve_workflow_path(&self, workflow_path: &str) -> PathBuf {
        let path = Path::new(workflow_path);
        if path.is_absolute() || path.exists() {
            path.to_path_buf()
        } else {
            self.workflows_dir.join(path)
        }
    }

    /// Create and start a run. The returned record is the pending snapshot;
    /// the driver progresses it asynchronously.
    pub async fn launch(
        &self,
        workflow_path: &str,
        engine_type: EngineType,
        persist: bool,
    ) -> Result<DagRun> {
        let resolved = self.resolve_workflow_path(workflow_path);
        let spec = WorkflowSpec::load(&resolved)?;
        let run = spec.to_run(workflow_path, engine_type);

        self.store.insert_run(&run).await?;
        self.bus.publish(RunEvent::RunCreated {
            run_id: run.id.clone(),
            dag_id: run.dag_id.clone(),
        });
        info!(
            run_id = %run.id,
            dag_id = %run.dag_id,
            engine = %engine_type,
            persist,
            "Run created"
        );

        let cancel = CancellationToken::new();
        self.tokens
            .lock()
            .expect("token registry lock poisoned")
            .insert(run.id.clone(), cancel.clone());

        let ctx = DriverCtx {
            store: self.store.clone(),
            bus: self.bus.clone(),
            run_id: run.id.clone(),
            cancel,
            retry_backoff_ms: self.retry_backoff_ms,
        };
        let persist_store = persist.then(|| self.persist_store.clone()).flatten();
        let archive_dir = self.archive_dir.clone();
        let store = self.store.clone();
        let tokens = self.tokens.clone();
        let run_id = run.id.clone();

        tokio::spawn(async move {
            let result = match engine_type {
                EngineType::Sequential => run_sequential(&ctx, &spec).await,
                EngineType::StatefulDag => run_stateful_dag(&ctx, &spec).await,
            };
            if let Err(e) = result {
                error!(run_id = %run_id, error = %e, "Run driver failed");
            }

            if let Some(persist_store) = persist_store {
                match store.get_run(&run_id).await {
                    Ok(Some(finished)) => {
                        if let Err(e) = persist_store.upsert_run(&finished) {
                            error!(run_id = %run_id, error = %e, "Failed to persist run");
                        }
                        if finished.status.is_terminal() {
                            if let Err(e) = archive_run(&finished, &archive_dir) {
                                warn!(run_id = %run_id, error = %e, "Failed to archive run");
                            }
                        }
                    }
                    Ok(None) => warn!(run_id = %run_id, "Run vanished before persisting"),
                    Err(e) => error!(run_id = %run_id, error = %e, "Failed to reload run"),
                }
            }

            // The run is over either way; its token has nothing to cancel
            tokens
                .lock()
                .expect("token registry lock poisoned")
                .remove(&run_id);
        });

        Ok(run)
    }

    /// Request cancellation of a run. Advisory towards the driver: the token
    /// is cancelled first, then the store is moved to the cancelled state so
    /// the caller sees the acknowledged status immediately.
    pub async fn cancel(&self, run_id: &RunId) -> Result<DagRun> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| DaglineError::RunNotFound(run_id.to_string()))?;

        if run.status.is_terminal() {
            return Err(DaglineError::InvalidTransition {
                from: run.status.to_string(),
                to: RunStatus::Cancelled.to_string(),
            });
        }

        if let Some(token) = self
            .tokens
            .lock()
            .expect("token registry lock poisoned")
            .remove(run_id)
        {
            token.cancel();
        }

        // Mark what has not finished; the driver's own writes are idempotent
        // against these.
        for step in &run.steps {
            if !step.status.is_terminal() {
                let mut step = step.clone();
                step.mark_terminal(dagline_core::status::StepStatus::Cancelled, None);
                self.store.update_step(run_id, &step).await?;
                self.bus.publish(RunEvent::StepStatusUpdated {
                    run_id: run_id.clone(),
                    step,
                });
            }
        }

        let updated = self
            .store
            .update_run_status(run_id, RunStatus::Cancelled)
            .await?;
        self.bus.publish(RunEvent::RunStatusUpdated {
            run_id: run_id.clone(),
            status: updated.status,
        });
        let completed = updated
            .steps
            .iter()
            .filter(|s| s.status.is_terminal())
            .count();
        self.bus.publish(RunEvent::RunCompleted {
            run_id: run_id.clone(),
            status: updated.status,
            completed_steps: completed,
            total_steps: updated.steps.len(),
        });
        info!(run_id = %run_id, "Run cancelled");
        Ok(updated)
    }
}
