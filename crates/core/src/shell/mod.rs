// Script interpretation: the interpreter drives a script, the exec handler runs commands

mod interpreter;
pub mod parse;

pub use interpreter::ShellInterpreter;
pub use parse::ParseError;

use crate::context::ExecContext;
use anyhow::Result;
use async_trait::async_trait;

/// Exit status used once a script's scope is cancelled
pub const CANCELLED_STATUS: i32 = 255;

/// Exit status for commands that cannot be resolved
pub const NOT_FOUND_STATUS: i32 = 127;

/// Runs a script body, handing each command to an [`ExecHandler`]
#[async_trait]
pub trait ScriptInterpreter: Send + Sync {
    /// Returns the script's exit status. `Err` means a hard failure that
    /// the script itself cannot recover from.
    async fn run(
        &self,
        script: &str,
        args: &[String],
        ctx: &ExecContext,
        handler: &dyn ExecHandler,
    ) -> Result<i32>;
}

/// Command-resolution hook consulted for every non-builtin command
#[async_trait]
pub trait ExecHandler: Send + Sync {
    async fn exec(&self, ctx: &ExecContext, argv: &[String]) -> Result<i32>;
}
