pub mod config;
pub mod error;
pub mod event;
pub mod status;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{DaglineError, Result};
pub use event::{EventBus, EventEnvelope, RunEvent};
pub use status::{aggregate_run_status, RunStatus, StepStatus};
pub use types::*;
