use std::collections::HashMap;
use std::sync::RwLock;

use futures::future::BoxFuture;
use tracing::debug;

use dagline_core::error::{DaglineError, Result};
use dagline_core::status::RunStatus;
use dagline_core::traits::RunStore;
use dagline_core::types::{DagRun, DagStep, RunId, RunSummary};

#[derive(Default)]
struct Inner {
    runs: HashMap<RunId, DagRun>,
    /// Insertion order; listings are served newest first.
    order: Vec<RunId>,
}

/// In-memory run store. Authoritative for live reads; shared across all
/// connected clients.
#[derive(Default)]
pub struct MemoryRunStore {
    inner: RwLock<Inner>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for MemoryRunStore {
    fn insert_run(&self, run: &DagRun) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("run store lock poisoned");
            if inner.runs.contains_key(&run.id) {
                return Err(DaglineError::Validation(format!(
                    "run already exists: {}",
                    run.id
                )));
            }
            inner.order.push(run.id.clone());
            inner.runs.insert(run.id.clone(), run);
            Ok(())
        })
    }

    fn get_run(&self, id: &RunId) -> BoxFuture<'_, Result<Option<DagRun>>> {
        let id = id.clone();
        Box::pin(async move {
            let inner = self.inner.read().expect("run store lock poisoned");
            Ok(inner.runs.get(&id).cloned())
        })
    }

    fn list_runs(
        &self,
        limit: usize,
        offset: usize,
        status: Option<RunStatus>,
    ) -> BoxFuture<'_, Result<(Vec<RunSummary>, usize)>> {
        Box::pin(async move {
            let inner = self.inner.read().expect("run store lock poisoned");
            let matching: Vec<&DagRun> = inner
                .order
                .iter()
                .rev()
                .filter_map(|id| inner.runs.get(id))
                .filter(|run| status.map_or(true, |s| run.status == s))
                .collect();
            let total = matching.len();
            let items = matching
                .into_iter()
                .skip(offset)
                .take(limit)
                .map(|run| run.summary())
                .collect();
            Ok((items, total))
        })
    }

    fn update_run_status(
        &self,
        id: &RunId,
        status: RunStatus,
    ) -> BoxFuture<'_, Result<DagRun>> {
        let id = id.clone();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("run store lock poisoned");
            let run = inner
                .runs
                .get_mut(&id)
                .ok_or_else(|| DaglineError::RunNotFound(id.to_string()))?;

            if run.status.is_terminal() {
                if run.status == status {
                    // Idempotent re-application of the same terminal status
                    return Ok(run.clone());
                }
                return Err(DaglineError::InvalidTransition {
                    from: run.status.to_string(),
                    to: status.to_string(),
                });
            }

            run.apply_status(status);
            debug!(run_id = %id, status = %status, "Run status updated");
            Ok(run.clone())
        })
    }

    fn update_step(&self, id: &RunId, step: &DagStep) -> BoxFuture<'_, Result<()>> {
        let id = id.clone();
        let step = step.clone();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("run store lock poisoned");
            let run = inner
                .runs
                .get_mut(&id)
                .ok_or_else(|| DaglineError::RunNotFound(id.to_string()))?;

            match run.step_mut(&step.id) {
                Some(existing) => *existing = step,
                None => run.steps.push(step),
            }
            Ok(())
        })
    }

    fn count_by_status(&self) -> BoxFuture<'_, Result<HashMap<RunStatus, usize>>> {
        Box::pin(async move {
            let inner = self.inner.read().expect("run store lock poisoned");
            let mut counts = HashMap::new();
            for run in inner.runs.values() {
                *counts.entry(run.status).or_insert(0) += 1;
            }
            Ok(counts)
        })
    }
}
