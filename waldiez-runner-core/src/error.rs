use thiserror::Error;
use waldiez_runner_model::TaskStatus;

/// Error kinds of the orchestration core. The HTTP layer maps these to
/// status codes; the runner captures them into task results instead of
/// propagating to the broker.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("{0}")]
    InvalidInput(String),

    #[error(
        "Cannot create more than {max_jobs} tasks at the same time. \
         Please wait for some tasks to finish"
    )]
    TooManyActive { max_jobs: usize },

    #[error(
        "A task with the same file already exists. \
         Task ID: {task_id}, status: {status}"
    )]
    DuplicateFlow {
        task_id: String,
        status: TaskStatus,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("Invalid workflow: {0}")]
    WorkflowValidation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Authentication failed")]
    Auth,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RunnerError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        RunnerError::InvalidInput(message.into())
    }

    pub fn storage(message: impl ToString) -> Self {
        RunnerError::Storage(message.to_string())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        RunnerError::Internal(message.into())
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;
