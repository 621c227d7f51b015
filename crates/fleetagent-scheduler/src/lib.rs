pub mod compute;
pub mod facility;
pub mod runner;
pub mod store;
pub mod task;

pub use compute::*;
pub use facility::*;
pub use runner::*;
pub use store::*;
pub use task::*;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("scheduled task {0} not found")]
    NotFound(String),
    #[error("scheduled task {0} already exists")]
    AlreadyExists(String),
    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),
    #[error("invalid action: {0}")]
    InvalidAction(String),
    #[error("task facility error: {0}")]
    Facility(String),
}

impl From<rusqlite::Error> for TaskError {
    fn from(e: rusqlite::Error) -> Self {
        TaskError::Facility(e.to_string())
    }
}
