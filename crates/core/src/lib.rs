// Core engine for devflow: pipelines, job scheduling and dependency ownership

pub mod collaborators;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod shell;
pub mod supervisor;
pub mod types;

#[cfg(test)]
mod testing;

pub use context::{ExecContext, OutputSink, Stream};
pub use error::{ClaimError, DispatchError, ExitStatus, GraphError, JobError, StoreError};
pub use supervisor::Supervisor;
pub use types::*;
