//! Shared data model and configuration for switchboard.
//!
//! Everything here is plain data: the coordinator and worker binaries both
//! depend on this crate, so it must stay free of transport and runtime
//! concerns.

pub mod config;
pub mod limits;
pub mod text;
pub mod types;

pub use types::{
    Attachment, PermissionMode, Task, TaskSpec, TaskStatus, TokenUsage, ToolInvocation,
    ToolStatus, WorkerStatus,
};
