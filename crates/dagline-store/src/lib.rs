pub mod archive;
pub mod memory;
pub mod sqlite;

pub use archive::archive_run;
pub use memory::MemoryRunStore;
pub use sqlite::SqliteRunStore;
