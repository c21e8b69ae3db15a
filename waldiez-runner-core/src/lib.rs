//! Task orchestration core for the Waldiez runner.
//!
//! The code path from "task accepted" to "terminal state recorded":
//! admission, dispatch, child supervision, the Redis I/O fabric, status
//! reconciliation, and periodic maintenance. The HTTP/WebSocket surface
//! lives in the server crate; this crate has no opinion about transport.

pub mod admission;
pub mod broker;
pub mod context;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod maintenance;
pub mod redis;
pub mod runner;
pub mod storage;
pub mod watcher;

pub use context::{AppContext, RunnerConfig};
pub use error::{Result, RunnerError};
