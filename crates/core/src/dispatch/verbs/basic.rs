use super::{parse_args, BasicVerb};
use crate::context::ExecContext;
use crate::error::ExitStatus;
use crate::shell::CANCELLED_STATUS;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Exit status 0 when `ok`, 1 otherwise
fn test_result(ok: bool) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(ExitStatus(1).into())
    }
}

#[derive(Debug, Parser)]
struct PairArgs {
    #[arg(allow_hyphen_values = true)]
    left: String,
    #[arg(allow_hyphen_values = true)]
    right: String,
}

pub struct IsEqual;

#[async_trait]
impl BasicVerb for IsEqual {
    async fn run(&self, _ctx: &ExecContext, args: &[String]) -> Result<()> {
        let args: PairArgs = parse_args("is_equal", args)?;
        test_result(args.left == args.right)
    }
}

#[derive(Debug, Parser)]
struct ValueArgs {
    #[arg(allow_hyphen_values = true, default_value = "")]
    value: String,
}

pub struct IsEmpty;

#[async_trait]
impl BasicVerb for IsEmpty {
    async fn run(&self, _ctx: &ExecContext, args: &[String]) -> Result<()> {
        let args: ValueArgs = parse_args("is_empty", args)?;
        test_result(args.value.is_empty())
    }
}

pub struct IsTrue;

#[async_trait]
impl BasicVerb for IsTrue {
    async fn run(&self, _ctx: &ExecContext, args: &[String]) -> Result<()> {
        let args: ValueArgs = parse_args("is_true", args)?;
        test_result(args.value == "true")
    }
}

#[derive(Debug, Parser)]
struct InArgs {
    #[arg(allow_hyphen_values = true)]
    value: String,
    /// Candidates; each argument may hold several whitespace separated values
    #[arg(allow_hyphen_values = true)]
    candidates: Vec<String>,
}

pub struct IsIn;

#[async_trait]
impl BasicVerb for IsIn {
    async fn run(&self, _ctx: &ExecContext, args: &[String]) -> Result<()> {
        let args: InArgs = parse_args("is_in", args)?;
        let found = args
            .candidates
            .iter()
            .flat_map(|candidate| candidate.split_whitespace())
            .any(|candidate| candidate == args.value);
        test_result(found)
    }
}

#[derive(Debug, Parser)]
struct OsArgs {
    /// `os` or `os/arch`, e.g. `linux` or `darwin/arm64`
    target: String,
}

pub struct IsOs;

#[async_trait]
impl BasicVerb for IsOs {
    async fn run(&self, _ctx: &ExecContext, args: &[String]) -> Result<()> {
        let args: OsArgs = parse_args("is_os", args)?;
        let (os, arch) = match args.target.split_once('/') {
            Some((os, arch)) => (os, Some(arch)),
            None => (args.target.as_str(), None),
        };

        let os_matches = normalize_os(os) == std::env::consts::OS;
        let arch_matches = arch.map_or(true, |arch| normalize_arch(arch) == std::env::consts::ARCH);
        test_result(os_matches && arch_matches)
    }
}

fn normalize_os(os: &str) -> &str {
    match os {
        "darwin" => "macos",
        other => other,
    }
}

fn normalize_arch(arch: &str) -> &str {
    match arch {
        "amd64" => "x86_64",
        "arm64" => "aarch64",
        "386" => "x86",
        other => other,
    }
}

#[derive(Debug, Parser)]
struct SleepArgs {
    seconds: f64,
}

/// Sleeps for the given seconds, ending early with status 255 on cancellation
pub struct Sleep;

#[async_trait]
impl BasicVerb for Sleep {
    async fn run(&self, ctx: &ExecContext, args: &[String]) -> Result<()> {
        let args: SleepArgs = parse_args("sleep", args)?;
        let duration = Duration::try_from_secs_f64(args.seconds)
            .map_err(|_| anyhow!("invalid duration {}", args.seconds))?;

        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = ctx.supervisor.cancelled() => Err(ExitStatus(CANCELLED_STATUS).into()),
        }
    }
}

#[derive(Debug, Parser)]
struct CatArgs {
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

/// Writes files to stdout line by line; paths are relative to the working directory
pub struct Cat;

#[async_trait]
impl BasicVerb for Cat {
    async fn run(&self, ctx: &ExecContext, args: &[String]) -> Result<()> {
        let args: CatArgs = parse_args("cat", args)?;
        for file in &args.files {
            let path = ctx.working_dir.join(file);
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("read {}", path.display()))?;
            for line in content.lines() {
                ctx.stdout.write_line(line);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::Supervisor;
    use crate::types::RunId;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn status(result: Result<()>) -> i32 {
        match result {
            Ok(()) => 0,
            Err(err) => ExitStatus::of(&err).unwrap_or(-1),
        }
    }

    fn create_test_context() -> ExecContext {
        ExecContext::new(RunId::new(), "/tmp", Supervisor::new())
    }

    #[tokio::test]
    async fn test_comparisons() {
        let ctx = create_test_context();

        assert_eq!(status(IsEqual.run(&ctx, &args(&["a", "a"])).await), 0);
        assert_eq!(status(IsEqual.run(&ctx, &args(&["a", "b"])).await), 1);
        assert_eq!(status(IsEmpty.run(&ctx, &args(&[""])).await), 0);
        assert_eq!(status(IsEmpty.run(&ctx, &[]).await), 0);
        assert_eq!(status(IsEmpty.run(&ctx, &args(&["x"])).await), 1);
        assert_eq!(status(IsTrue.run(&ctx, &args(&["true"])).await), 0);
        assert_eq!(status(IsTrue.run(&ctx, &args(&["yes"])).await), 1);
        assert_eq!(status(IsIn.run(&ctx, &args(&["b", "a b", "c"])).await), 0);
        assert_eq!(status(IsIn.run(&ctx, &args(&["d", "a b", "c"])).await), 1);
    }

    #[tokio::test]
    async fn test_is_os_matches_current_platform() {
        let ctx = create_test_context();
        let current = std::env::consts::OS.to_string();
        assert_eq!(status(IsOs.run(&ctx, &[current]).await), 0);
        assert_eq!(status(IsOs.run(&ctx, &args(&["plan9"])).await), 1);

        let both = format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH);
        assert_eq!(status(IsOs.run(&ctx, &[both]).await), 0);
    }

    #[tokio::test]
    async fn test_sleep_is_cancellable() {
        let ctx = create_test_context();
        ctx.supervisor.cancel();

        let result = Sleep.run(&ctx, &args(&["30"])).await;
        assert_eq!(status(result), CANCELLED_STATUS);

        let err = Sleep.run(&create_test_context(), &args(&["-1"])).await.unwrap_err();
        assert_eq!(ExitStatus::of(&err), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_waits() {
        let ctx = create_test_context();
        let started = tokio::time::Instant::now();
        Sleep.run(&ctx, &args(&["1.5"])).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_cat_writes_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "three").unwrap();

        let (stdout, mut lines) = crate::context::OutputSink::channel();
        let ctx = ExecContext::new(RunId::new(), dir.path(), Supervisor::new())
            .with_output(stdout, crate::context::OutputSink::Discard);

        Cat.run(&ctx, &args(&["a.txt", "b.txt"])).await.unwrap();
        drop(ctx);

        let mut seen = Vec::new();
        while let Some(line) = lines.recv().await {
            seen.push(line);
        }
        assert_eq!(seen, vec!["one", "two", "three"]);

        let ctx = create_test_context();
        let err = Cat.run(&ctx, &args(&["/nonexistent/devflow"])).await.unwrap_err();
        assert!(err.to_string().starts_with("read /nonexistent/devflow"));
        assert!(Cat.run(&ctx, &[]).await.is_err());
    }
}
