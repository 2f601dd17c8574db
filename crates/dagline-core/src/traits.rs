use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::status::RunStatus;
use crate::types::{DagRun, DagStep, RunId, RunSummary};

/// Run store — persistence backend for DagRun records.
///
/// The store is the single writer-side authority; the gateway and drivers
/// mutate runs only through it. Implementations must reject transitions out
/// of a terminal run status.
pub trait RunStore: Send + Sync + 'static {
    /// Insert a newly created run.
    fn insert_run(&self, run: &DagRun) -> BoxFuture<'_, Result<()>>;

    /// Fetch a full run with steps. Unknown id yields `Ok(None)`.
    fn get_run(&self, id: &RunId) -> BoxFuture<'_, Result<Option<DagRun>>>;

    /// List run summaries, newest first, optionally filtered by status.
    /// Returns `(items, total)` where `total` counts all matching runs.
    fn list_runs(
        &self,
        limit: usize,
        offset: usize,
        status: Option<RunStatus>,
    ) -> BoxFuture<'_, Result<(Vec<RunSummary>, usize)>>;

    /// Apply a run-level status and return the updated run.
    /// Terminal runs admit no further transition.
    fn update_run_status(
        &self,
        id: &RunId,
        status: RunStatus,
    ) -> BoxFuture<'_, Result<DagRun>>;

    /// Replace a step record within a run.
    fn update_step(&self, id: &RunId, step: &DagStep) -> BoxFuture<'_, Result<()>>;

    /// Run counts grouped by status, for `/api/metrics`.
    fn count_by_status(&self) -> BoxFuture<'_, Result<HashMap<RunStatus, usize>>>;
}
