// Verbs that run other commands back through the dispatcher

use super::{parse_args, CommandVerb};
use crate::context::ExecContext;
use crate::error::ExitStatus;
use crate::shell::ExecHandler;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[derive(Debug, Parser)]
struct XArgsArgs {
    /// Read items from FILE; may be repeated
    #[arg(short = 'a', long = "arg-file")]
    arg_file: Vec<PathBuf>,

    /// Use at most N items per command line
    #[arg(short = 'n', long = "max-args", value_parser = clap::value_parser!(u64).range(1..))]
    max_args: Option<u64>,

    /// Do not run the command when there are no items
    #[arg(short = 'r', long = "no-run-if-empty")]
    no_run_if_empty: bool,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// Runs a command with whitespace separated items from files appended as
/// arguments. Stops at the first invocation that fails.
pub struct XArgs;

#[async_trait]
impl CommandVerb for XArgs {
    async fn run(&self, ctx: &ExecContext, handler: &dyn ExecHandler, args: &[String]) -> Result<()> {
        let args: XArgsArgs = parse_args("xargs", args)?;

        let mut items = Vec::new();
        for file in &args.arg_file {
            let path = ctx.working_dir.join(file);
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("read {}", path.display()))?;
            items.extend(content.split_whitespace().map(str::to_string));
        }

        if items.is_empty() && args.no_run_if_empty {
            return Ok(());
        }

        let command = if args.command.is_empty() {
            vec!["echo".to_string()]
        } else {
            args.command
        };
        let chunk = args.max_args.map_or(items.len().max(1), |n| n as usize);

        let batches: Vec<&[String]> = if items.is_empty() {
            vec![items.as_slice()]
        } else {
            items.chunks(chunk).collect()
        };
        for batch in batches {
            let argv: Vec<String> = command.iter().chain(batch).cloned().collect();
            let status = handler.exec(ctx, &argv).await?;
            if status != 0 {
                return Err(ExitStatus(status).into());
            }
        }

        Ok(())
    }
}

/// Time between two scans of the watched paths
const WATCH_INTERVAL: Duration = Duration::from_millis(1200);

#[derive(Debug, Parser)]
struct RunWatchArgs {
    /// Paths or glob patterns to watch; may be repeated
    #[arg(short = 'p', long = "path")]
    paths: Vec<String>,

    /// Paths or glob patterns to ignore; may be repeated
    #[arg(short = 'e', long = "exclude")]
    exclude: Vec<String>,

    /// Fail when the command fails instead of waiting for the next change
    #[arg(long)]
    fail_on_error: bool,

    /// Wait for the first change before running the command
    #[arg(long)]
    skip_initial: bool,

    /// Do not announce restarts
    #[arg(long)]
    silent: bool,

    /// Both `--skip-initial` and `--silent`
    #[arg(short = 's', long)]
    skip_and_silent: bool,

    #[arg(last = true)]
    command: Vec<String>,
}

/// Runs a command and restarts it whenever a watched file changes
pub struct RunWatch {
    interval: Duration,
}

impl RunWatch {
    pub fn new() -> Self {
        Self {
            interval: WATCH_INTERVAL,
        }
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for RunWatch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandVerb for RunWatch {
    async fn run(&self, ctx: &ExecContext, handler: &dyn ExecHandler, args: &[String]) -> Result<()> {
        let args: RunWatchArgs = parse_args("run_watch", args)?;
        if args.paths.is_empty() || args.command.is_empty() {
            return Err(anyhow!("usage: run_watch --path MY_PATH -- my_command"));
        }
        let silent = args.silent || args.skip_and_silent;
        let mut run_command = !(args.skip_initial || args.skip_and_silent);

        let watched = Arc::new(WatchSet::new(&ctx.working_dir, &args.paths, &args.exclude)?);
        let mut snapshot = watched.scan().await?;

        loop {
            let scope = ctx.supervisor.child();
            let command_ctx = ctx.with_supervisor(scope.clone());
            let argv = &args.command;
            let should_run = run_command;
            let command = async move {
                if should_run {
                    handler.exec(&command_ctx, argv).await
                } else {
                    futures::future::pending().await
                }
            };
            tokio::pin!(command);
            let mut finished = !should_run;

            let changed = loop {
                tokio::select! {
                    result = &mut command, if !finished => {
                        finished = true;
                        let status = result?;
                        if status != 0 {
                            if args.fail_on_error {
                                return Err(ExitStatus(status).into());
                            }
                            tracing::debug!("Watched command exited with status {}", status);
                        }
                    }
                    _ = ctx.supervisor.cancelled() => {
                        scope.cancel();
                        if !finished {
                            let _ = (&mut command).await;
                        }
                        return Ok(());
                    }
                    _ = tokio::time::sleep(self.interval) => {
                        let next = watched.scan().await?;
                        if let Some(path) = first_change(&snapshot, &next) {
                            snapshot = next;
                            break path;
                        }
                    }
                }
            };

            if !silent {
                ctx.stderr.write_line(format!(
                    "Restarting command because '{}' has changed...",
                    changed
                ));
            }
            scope.cancel();
            if !finished {
                // The command ends once it sees its scope cancelled
                let _ = (&mut command).await;
            }
            run_command = true;
        }
    }
}

/// Files selected by include patterns minus exclude patterns, relative to a base
struct WatchSet {
    base: PathBuf,
    include: Vec<String>,
    exclude: Vec<glob::Pattern>,
}

impl WatchSet {
    fn new(base: &Path, paths: &[String], exclude: &[String]) -> Result<Self> {
        let mut include = Vec::new();
        for path in paths {
            let pattern = normalize(path);
            if has_glob(&pattern) {
                include.push(pattern);
                continue;
            }

            let target = base.join(&pattern);
            if !target.exists() {
                return Err(anyhow!(
                    "cannot watch {} as the directory or file must exist",
                    target.display()
                ));
            }
            if !target.is_dir() {
                include.push(pattern);
            } else if pattern == "." {
                include.push("**/*".to_string());
            } else {
                include.push(format!("{}/**/*", pattern));
            }
        }

        let exclude = exclude
            .iter()
            .map(|pattern| {
                let pattern = normalize(pattern);
                glob::Pattern::new(&pattern).with_context(|| format!("bad exclude pattern {}", pattern))
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            base: base.to_path_buf(),
            include,
            exclude,
        })
    }

    fn excluded(&self, relative: &Path) -> bool {
        self.exclude.iter().any(|pattern| {
            pattern.matches_path(relative)
                || relative
                    .ancestors()
                    .skip(1)
                    .any(|parent| pattern.matches_path(parent))
        })
    }

    /// Modification time of every watched file
    fn snapshot(&self) -> Result<BTreeMap<PathBuf, SystemTime>> {
        let mut files = BTreeMap::new();
        let base = glob::Pattern::escape(&self.base.to_string_lossy());
        for pattern in &self.include {
            let full = format!("{}/{}", base.trim_end_matches('/'), pattern);
            let entries = glob::glob(&full)
                .with_context(|| format!("bad watch pattern {}", pattern))?;

            for path in entries.filter_map(|entry| entry.ok()) {
                let relative = path.strip_prefix(&self.base).unwrap_or(&path).to_path_buf();
                if self.excluded(&relative) {
                    continue;
                }
                // Directory mtimes move with every entry, excluded ones included
                let Ok(meta) = path.metadata() else { continue };
                if meta.is_dir() {
                    continue;
                }
                if let Ok(modified) = meta.modified() {
                    files.insert(relative, modified);
                }
            }
        }
        Ok(files)
    }

    async fn scan(self: &Arc<Self>) -> Result<BTreeMap<PathBuf, SystemTime>> {
        let watched = self.clone();
        tokio::task::spawn_blocking(move || watched.snapshot()).await?
    }
}

fn normalize(pattern: &str) -> String {
    let pattern = pattern.trim();
    let pattern = pattern.strip_prefix("./").unwrap_or(pattern);
    let pattern = pattern.strip_suffix('/').unwrap_or(pattern);
    if pattern.is_empty() {
        ".".to_string()
    } else {
        pattern.to_string()
    }
}

fn has_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// First path that appeared, disappeared or was modified
fn first_change(
    before: &BTreeMap<PathBuf, SystemTime>,
    after: &BTreeMap<PathBuf, SystemTime>,
) -> Option<String> {
    after
        .iter()
        .find(|(path, modified)| before.get(*path) != Some(*modified))
        .map(|(path, _)| path)
        .or_else(|| before.keys().find(|path| !after.contains_key(*path)))
        .map(|path| path.display().to_string())
}
