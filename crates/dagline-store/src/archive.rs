use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use dagline_core::error::{DaglineError, Result};
use dagline_core::types::DagRun;

/// On-disk export of a finished run (`<run_id>.run_archive.json`).
#[derive(Debug, Serialize, Deserialize)]
pub struct RunArchive {
    pub archived_at: DateTime<Utc>,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub run: DagRun,
}

/// Write a terminal run to the archive directory and return the file path.
pub fn archive_run(run: &DagRun, dir: &Path) -> Result<PathBuf> {
    if !run.status.is_terminal() {
        return Err(DaglineError::Validation(format!(
            "cannot archive run {} in non-terminal status {}",
            run.id, run.status
        )));
    }

    std::fs::create_dir_all(dir)?;

    let completed_steps = run
        .steps
        .iter()
        .filter(|s| s.status.is_terminal())
        .count();
    let archive = RunArchive {
        archived_at: Utc::now(),
        total_steps: run.steps.len(),
        completed_steps,
        run: run.clone(),
    };

    let path = dir.join(format!("{}.run_archive.json", run.id));
    let json = serde_json::to_string_pretty(&archive)?;
    std::fs::write(&path, json)?;
    info!(run_id = %run.id, path = %path.display(), "Run archived");
    Ok(path)
}
