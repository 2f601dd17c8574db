pub mod projection;
pub mod rest;
pub mod stream;

pub use projection::{Applied, RunMetrics, RunProjection};
pub use rest::{CreatedRun, RestClient, RunPage};
pub use stream::{run_event_stream, EventStreamConfig, StreamNotice};
