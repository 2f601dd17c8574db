use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaglineError {
    // Request validation
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown engine type: {0}")]
    UnknownEngine(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // Workflow template errors
    #[error("Workflow error: {0}")]
    Workflow(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Gateway / client transport errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Connection error: {0}")]
    Connection(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DaglineError>;
