// Execution context handed to every command of a running script

use crate::supervisor::Supervisor;
use crate::types::RunId;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Where a script's output lines go
#[derive(Debug, Clone)]
pub enum OutputSink {
    /// Forward lines to a receiver (job log forwarders, tests)
    Channel(mpsc::UnboundedSender<String>),
    /// Log lines directly under a label
    Log { label: Arc<str>, stream: Stream },
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl OutputSink {
    /// Sink paired with the receiving end of its channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OutputSink::Channel(tx), rx)
    }

    pub fn log(label: impl Into<Arc<str>>, stream: Stream) -> Self {
        OutputSink::Log {
            label: label.into(),
            stream,
        }
    }

    pub fn write_line(&self, line: impl Into<String>) {
        match self {
            OutputSink::Channel(tx) => {
                // A closed receiver means nobody listens anymore
                let _ = tx.send(line.into());
            }
            OutputSink::Log { label, stream } => {
                let line = line.into();
                match stream {
                    Stream::Stdout => tracing::info!(source = %label, "{}", line),
                    Stream::Stderr => tracing::warn!(source = %label, "{}", line),
                }
            }
            OutputSink::Discard => {}
        }
    }
}

/// Per-command execution context
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub run_id: RunId,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub flags: Arc<BTreeMap<String, String>>,
    pub supervisor: Supervisor,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
    /// Set while executing inside a dependency pipeline
    pub is_dependency: bool,
}

impl ExecContext {
    pub fn new(run_id: RunId, working_dir: impl Into<PathBuf>, supervisor: Supervisor) -> Self {
        Self {
            run_id,
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
            flags: Arc::new(BTreeMap::new()),
            supervisor,
            stdout: OutputSink::Discard,
            stderr: OutputSink::Discard,
            is_dependency: false,
        }
    }

    /// Context seeded with the current process environment
    pub fn from_process(run_id: RunId, working_dir: impl Into<PathBuf>, supervisor: Supervisor) -> Self {
        let mut ctx = Self::new(run_id, working_dir, supervisor);
        ctx.env = std::env::vars().collect();
        ctx
    }

    pub fn with_supervisor(&self, supervisor: Supervisor) -> Self {
        Self {
            supervisor,
            ..self.clone()
        }
    }

    pub fn with_output(&self, stdout: OutputSink, stderr: OutputSink) -> Self {
        Self {
            stdout,
            stderr,
            ..self.clone()
        }
    }

    pub fn with_flags(&self, flags: BTreeMap<String, String>) -> Self {
        Self {
            flags: Arc::new(flags),
            ..self.clone()
        }
    }

    /// Context for a dependency pipeline rooted at `dir`
    pub fn as_dependency(&self, dir: Option<&Path>) -> Self {
        let working_dir = match dir {
            Some(dir) if dir.is_absolute() => dir.to_path_buf(),
            Some(dir) => self.working_dir.join(dir),
            None => self.working_dir.clone(),
        };

        Self {
            working_dir,
            is_dependency: true,
            ..self.clone()
        }
    }

    pub fn flag(&self, name: &str) -> Option<&str> {
        self.flags.get(name).map(String::as_str)
    }

    pub fn is_cancelled(&self) -> bool {
        self.supervisor.is_cancelled()
    }
}
