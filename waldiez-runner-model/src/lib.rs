//! Domain types for the Waldiez task runner.
//!
//! Everything the orchestration core and the HTTP surface agree on lives
//! here: the task lifecycle, the status-channel message format, pagination,
//! and the request/response schemas.

pub mod client;
pub mod ids;
pub mod pagination;
pub mod status_message;
pub mod task;
pub mod task_status;

pub use client::{Audience, Client};
pub use ids::{new_request_id, new_task_id};
pub use pagination::{Page, Params};
pub use status_message::StatusMessage;
pub use task::{
    InputResponse, ScheduleType, Task, TaskCreate, TaskResults, TaskResponse,
    TaskUpdate,
};
pub use task_status::TaskStatus;
