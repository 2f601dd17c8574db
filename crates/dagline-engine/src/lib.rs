pub mod driver;
pub mod launcher;
pub mod workflow;

pub use driver::{run_sequential, run_stateful_dag, DriverCtx};
pub use launcher::RunLauncher;
pub use workflow::{StepAction, StepSpec, WorkflowSpec};
