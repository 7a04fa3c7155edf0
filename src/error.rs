//! Small typed error surface for cases callers need to match on.
//!
//! Most internal plumbing still returns `anyhow::Result` with `.context(...)`
//! the way the rest of this crate does; these variants exist for the call
//! sites in `main.rs` that need to pick an exit behavior or a status-file
//! reason based on *what kind* of failure occurred, not just its message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("launcher executable '{0}' not found on PATH")]
    LauncherNotFound(String),

    #[error("pipeline '{0}' requires {1} node(s), exceeding max_nodes={2}")]
    NoFit(String, u32, u32),

    #[error("duplicate pipeline id: {0}")]
    DuplicatePipelineId(String),

    #[error("new pipelines are not allowed after stop() or kill_all()")]
    PipelinesClosed,

    #[error("malformed pipeline description: {0}")]
    MalformedDescription(String),
}
