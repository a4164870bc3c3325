// Typed error taxonomy shared across the engine

use thiserror::Error;

/// Errors raised while turning a pipeline definition into a job graph
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("job {job} runs after unknown job {after}")]
    UnknownAfter { job: String, after: String },

    #[error("job {0} cannot run after itself")]
    SelfReference(String),

    #[error("cyclic dependency between jobs: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("job {0} has rerun enabled, but other jobs run after it")]
    RerunWithDependents(String),
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} is already running")]
    AlreadyRunning(String),

    #[error("job {0} has already run")]
    AlreadyFinished(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("{0}: not running inside a pipeline step")]
    NotInPipeline(String),

    #[error("invalid verb name {0:?}")]
    InvalidVerbName(String),

    #[error("verb {0} is registered twice")]
    DuplicateVerb(String),
}

/// Outcome of a failed write against the ownership store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ownership document already exists")]
    AlreadyExists,

    #[error("ownership document was modified concurrently")]
    Conflict,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("claiming dependencies {} failed: still conflicting after {attempts} attempts", .names.join(", "))]
    RetriesExhausted { names: Vec<String>, attempts: u32 },

    #[error("ownership store failure: {0:#}")]
    Store(anyhow::Error),

    #[error("encoding ownership record for {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A script-level exit code carried through `anyhow`
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("exit status {0}")]
pub struct ExitStatus(pub i32);

impl ExitStatus {
    /// Exit code if `err` is (or wraps) an `ExitStatus`
    pub fn of(err: &anyhow::Error) -> Option<i32> {
        err.downcast_ref::<ExitStatus>().map(|status| status.0)
    }
}
