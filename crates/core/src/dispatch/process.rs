use crate::context::{ExecContext, OutputSink};
use crate::shell::CANCELLED_STATUS;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Locate `name` the way a shell would: relative paths against the
/// working directory, bare names on `PATH`
pub(crate) fn resolve_executable(name: &str, ctx: &ExecContext) -> Option<PathBuf> {
    if name.contains('/') {
        let path = ctx.working_dir.join(name);
        return is_executable(&path).then_some(path);
    }

    let search_path = ctx
        .env
        .get("PATH")
        .cloned()
        .or_else(|| std::env::var("PATH").ok())?;

    std::env::split_paths(&search_path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Run a program to completion, streaming its output line by line.
///
/// Cancelling the context's scope kills the process.
pub(crate) async fn run(program: &Path, args: &[String], ctx: &ExecContext) -> Result<i32> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(&ctx.working_dir)
        .envs(&ctx.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("start {}", program.display()))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let status = async {
        tokio::select! {
            status = child.wait() => {
                let status = status.with_context(|| format!("wait for {}", program.display()))?;
                Ok::<i32, anyhow::Error>(status.code().unwrap_or(1))
            }
            _ = ctx.supervisor.cancelled() => {
                if let Err(err) = child.kill().await {
                    tracing::debug!("Error killing {}: {}", program.display(), err);
                }
                Ok(CANCELLED_STATUS)
            }
        }
    };

    let (_, _, status) = tokio::join!(
        forward_lines(stdout, ctx, &ctx.stdout),
        forward_lines(stderr, ctx, &ctx.stderr),
        status
    );
    status
}

/// Forward lines until EOF. Stops early once the scope is cancelled,
/// since orphaned grandchildren may hold the pipe open.
async fn forward_lines<R>(reader: Option<R>, ctx: &ExecContext, sink: &OutputSink)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => sink.write_line(line),
                _ => return,
            },
            _ = ctx.supervisor.cancelled() => return,
        }
    }
}
