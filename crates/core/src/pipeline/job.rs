use crate::context::{ExecContext, OutputSink, Stream};
use crate::dispatch::ExecDispatcher;
use crate::error::JobError;
use crate::pipeline::Pipeline;
use crate::supervisor::Supervisor;
use crate::types::{JobConfig, JobStatus};
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Runtime execution unit of one graph node. Runs at most once.
pub struct Job {
    name: String,
    config: JobConfig,
    state: watch::Sender<JobStatus>,
    scope: Mutex<Option<Supervisor>>,
    error: Mutex<Option<String>>,
}

impl Job {
    pub fn new(name: impl Into<String>, config: JobConfig) -> Self {
        let (state, _) = watch::channel(JobStatus::Idle);
        Self {
            name: name.into(),
            config,
            state,
            scope: Mutex::new(None),
            error: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn status(&self) -> JobStatus {
        *self.state.borrow()
    }

    pub fn terminated(&self) -> bool {
        self.status().is_terminal()
    }

    /// Rendered error of a failed run
    pub fn error(&self) -> Option<String> {
        self.error.lock().unwrap().clone()
    }

    /// Resolves once the job reached a terminal state
    pub async fn done(&self) {
        let mut state = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = state.wait_for(JobStatus::is_terminal).await;
    }

    fn begin(&self) -> Result<(), JobError> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|status| match status {
            JobStatus::Idle => {
                *status = JobStatus::Running;
                true
            }
            JobStatus::Running => {
                outcome = Err(JobError::AlreadyRunning(self.name.clone()));
                false
            }
            JobStatus::Completed | JobStatus::Failed => {
                outcome = Err(JobError::AlreadyFinished(self.name.clone()));
                false
            }
        });
        outcome
    }

    /// Execute the job's script inside a private scope nested under `ctx`.
    ///
    /// Output lines are logged under the pipeline and job name. The call
    /// returns after the scope's forwarding tasks have drained.
    pub async fn run(&self, pipeline: &Arc<Pipeline>, ctx: &ExecContext, args: &[String]) -> Result<()> {
        self.begin()?;

        let scope = ctx.supervisor.child();
        *self.scope.lock().unwrap() = Some(scope.clone());
        tracing::debug!(pipeline = %pipeline.name(), job = %self.name, "Starting job");

        let mut result = self.execute(pipeline, ctx, &scope, args).await;
        // A task left running by the script can still fail the job
        if let Err(err) = scope.wait().await {
            if result.is_ok() {
                result = Err(err);
            } else {
                tracing::warn!(
                    pipeline = %pipeline.name(),
                    job = %self.name,
                    "Job scope ended with error: {:#}",
                    err
                );
            }
        }

        let status = match &result {
            Ok(()) => JobStatus::Completed,
            Err(err) => {
                *self.error.lock().unwrap() = Some(format!("{:#}", err));
                JobStatus::Failed
            }
        };
        self.state.send_replace(status);
        tracing::debug!(pipeline = %pipeline.name(), job = %self.name, "Job finished: {:?}", status);

        result.with_context(|| format!("job {}", self.name))
    }

    async fn execute(
        &self,
        pipeline: &Arc<Pipeline>,
        ctx: &ExecContext,
        scope: &Supervisor,
        args: &[String],
    ) -> Result<()> {
        let (stdout, stdout_lines) = OutputSink::channel();
        let (stderr, stderr_lines) = OutputSink::channel();
        for (lines, stream) in [(stdout_lines, Stream::Stdout), (stderr_lines, Stream::Stderr)] {
            scope.spawn(
                format!("{}:{:?}", self.name, stream),
                forward_output(lines, pipeline.name().to_string(), self.name.clone(), stream),
            );
        }

        let job_ctx = ctx.with_supervisor(scope.clone()).with_output(stdout, stderr);
        let dispatcher = ExecDispatcher::new(
            pipeline.runtime().clone(),
            pipeline.functions(),
            Some(pipeline.clone()),
        );

        let max_attempts = self
            .config
            .rerun
            .as_ref()
            .map_or(1, |rerun| rerun.max_attempts.max(1));
        let mut attempt = 1;

        loop {
            let result = match dispatcher.run_script(&self.config.run, args, &job_ctx).await {
                Ok(0) => Ok(()),
                Ok(status) => Err(dispatcher.failure(status)),
                Err(err) => Err(err),
            };

            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= max_attempts || scope.is_cancelled() => return Err(err),
                Err(err) => err,
            };

            let backoff_secs = self
                .config
                .rerun
                .as_ref()
                .map_or(0, |rerun| rerun.backoff_secs);
            let backoff = Duration::from_secs(backoff_secs.saturating_mul(1 << (attempt - 1).min(16)));
            tracing::warn!(
                pipeline = %pipeline.name(),
                job = %self.name,
                attempt,
                "Job failed, rerunning in {:?}: {:#}",
                backoff,
                err
            );

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = scope.cancelled() => return Err(err),
            }
            attempt += 1;
        }
    }

    /// Cancel the job and wait until it is no longer running
    pub async fn stop(&self) {
        let scope = self.scope.lock().unwrap().clone();
        if let Some(scope) = scope {
            scope.cancel();
        }

        let mut state = self.state.subscribe();
        let _ = state.wait_for(|status| *status != JobStatus::Running).await;
    }
}

async fn forward_output(
    mut lines: mpsc::UnboundedReceiver<String>,
    pipeline: String,
    job: String,
    stream: Stream,
) -> Result<()> {
    while let Some(line) = lines.recv().await {
        match stream {
            Stream::Stdout => tracing::info!(pipeline = %pipeline, job = %job, "{}", line),
            Stream::Stderr => tracing::warn!(pipeline = %pipeline, job = %job, "{}", line),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::VerbTable;
    use crate::error::ExitStatus;
    use crate::testing::{create_test_context, create_test_pipeline, RecordingVerb};
    use crate::types::RerunPolicy;

    fn create_test_job(run: &str) -> Job {
        Job::new(
            "migrate",
            JobConfig {
                run: run.to_string(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_job_runs_once() {
        let recording = RecordingVerb::default();
        let verbs = VerbTable::builder()
            .pipeline("record", recording.clone())
            .build()
            .unwrap();
        let (pipeline, _registry) = create_test_pipeline(verbs);
        let (ctx, _out, _err) = create_test_context();
        let job = create_test_job("record $1");

        assert_eq!(job.status(), JobStatus::Idle);
        job.run(&pipeline, &ctx, &["first".to_string()]).await.unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert!(job.terminated());

        let err = job.run(&pipeline, &ctx, &[]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::AlreadyFinished(name)) if name == "migrate"
        ));
        assert_eq!(recording.calls(), vec![vec!["first".to_string()]]);
    }

    #[tokio::test]
    async fn test_failed_job_keeps_error() {
        let (pipeline, _registry) = create_test_pipeline(VerbTable::standard().unwrap());
        let (ctx, _out, _err) = create_test_context();
        let job = create_test_job("exit 3");

        let err = job.run(&pipeline, &ctx, &[]).await.unwrap_err();

        assert_eq!(format!("{:#}", err), "job migrate: exit status 3");
        assert_eq!(ExitStatus::of(&err), Some(3));
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error().as_deref(), Some("exit status 3"));
    }

    /// Leaves a task behind in the job scope that fails after the script ends
    struct FailingBackgroundTask;

    #[async_trait::async_trait]
    impl crate::dispatch::PipelineVerb for FailingBackgroundTask {
        async fn run(&self, ctx: &ExecContext, _pipeline: &Arc<Pipeline>, _args: &[String]) -> Result<()> {
            ctx.supervisor.spawn("port-forward", async {
                tokio::task::yield_now().await;
                Err(anyhow::anyhow!("connection reset"))
            });
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_scope_task_fails_job() {
        let verbs = VerbTable::builder()
            .pipeline("forward_ports", FailingBackgroundTask)
            .build()
            .unwrap();
        let (pipeline, _registry) = create_test_pipeline(verbs);
        let (ctx, _out, _err) = create_test_context();
        let job = create_test_job("forward_ports");

        let err = job.run(&pipeline, &ctx, &[]).await.unwrap_err();

        assert_eq!(format!("{:#}", err), "job migrate: connection reset");
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error().as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn test_concurrent_run_is_rejected_and_stop_cancels() {
        let (pipeline, _registry) = create_test_pipeline(VerbTable::standard().unwrap());
        let (ctx, _out, _err) = create_test_context();
        let job = Arc::new(create_test_job("__sleep 30"));

        let running = {
            let job = job.clone();
            let pipeline = pipeline.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { job.run(&pipeline, &ctx, &[]).await })
        };

        let mut state = job.state.subscribe();
        state
            .wait_for(|status| *status == JobStatus::Running)
            .await
            .unwrap();

        let err = job.run(&pipeline, &ctx, &[]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::AlreadyRunning(_))
        ));

        job.stop().await;
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(running.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_retries_with_backoff() {
        let flaky = RecordingVerb::failing_times(2, "not ready");
        let verbs = VerbTable::builder()
            .pipeline("migrate_db", flaky.clone())
            .build()
            .unwrap();
        let (pipeline, _registry) = create_test_pipeline(verbs);
        let (ctx, _out, _err) = create_test_context();
        let job = Job::new(
            "migrate",
            JobConfig {
                run: "migrate_db".to_string(),
                rerun: Some(RerunPolicy {
                    max_attempts: 3,
                    backoff_secs: 1,
                }),
                ..Default::default()
            },
        );

        let started = tokio::time::Instant::now();
        job.run(&pipeline, &ctx, &[]).await.unwrap();

        assert_eq!(flaky.calls().len(), 3);
        // 1s after the first failure, 2s after the second
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_gives_up_after_max_attempts() {
        let failing = RecordingVerb::failing("still broken");
        let verbs = VerbTable::builder()
            .pipeline("migrate_db", failing.clone())
            .build()
            .unwrap();
        let (pipeline, _registry) = create_test_pipeline(verbs);
        let (ctx, _out, _err) = create_test_context();
        let job = Job::new(
            "migrate",
            JobConfig {
                run: "migrate_db".to_string(),
                rerun: Some(RerunPolicy {
                    max_attempts: 2,
                    backoff_secs: 1,
                }),
                ..Default::default()
            },
        );

        let err = job.run(&pipeline, &ctx, &[]).await.unwrap_err();
        assert_eq!(failing.calls().len(), 2);
        assert_eq!(
            format!("{:#}", err),
            "job migrate: migrate_db: still broken: exit status 1"
        );
    }
}
