//! The execution pipeline.
//!
//! An executor takes `{component, cache, job}` and applies the composable
//! middleware set: retry, then timeout, then the output-capture post-hook
//! that emits synthetic ARG follow-on jobs. This is the single place where
//! asynchrony and follow-on emission are handled; components themselves
//! are plain blocking functions.

use crate::{Component, TaskContext, TaskOutcome};
use directord_cache::Cache;
use directord_protocol::{get_uuid, job_sha3_224, JobItem, VerbPayload};
use directord_transport::Driver;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The synthesized stderr for a cancelled execution.
pub const TIMEOUT_MESSAGE: &str = "Timeout encountered";

pub struct Executor {
    runtime: tokio::runtime::Runtime,
}

impl Executor {
    pub fn new() -> anyhow::Result<Executor> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        Ok(Executor { runtime })
    }

    /// Run one job through a component.
    ///
    /// Returns the outcome and any follow-on jobs the execution produced.
    /// On deadline the pending future is cancelled and the result is the
    /// synthesized timeout failure; no partial result is reported.
    pub fn execute(
        &self,
        component: Arc<dyn Component>,
        cache: Arc<Cache>,
        driver: Arc<Driver>,
        job: &JobItem,
    ) -> (TaskOutcome, Vec<JobItem>) {
        debug!(
            "Job [ {} ] running, timeout set for {}.",
            job.job_id, job.timeout
        );

        let deadline = Duration::from_secs(job.timeout.max(1));
        let enforce = component.timeout_enforced();
        let attempts = job.retry.max(1);

        let body = async {
            let mut last = (TaskOutcome::failure("not executed"), Vec::new());
            for attempt in 1..=attempts {
                let component = Arc::clone(&component);
                let cache = Arc::clone(&cache);
                let driver = Arc::clone(&driver);
                let job_item = job.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let mut ctx = TaskContext::new(cache, driver);
                    let outcome = component.client(&mut ctx, &job_item);
                    (outcome, ctx.block_on_tasks)
                })
                .await;

                last = match result {
                    Ok(result) => result,
                    Err(e) => (
                        TaskOutcome::failure(format!("component execution failed: {e}")),
                        Vec::new(),
                    ),
                };
                if last.0.outcome {
                    break;
                }
                if attempt < attempts {
                    debug!(
                        "Job [ {} ] attempt {}/{} failed, retrying.",
                        job.job_id, attempt, attempts
                    );
                }
            }
            last
        };

        let (mut outcome, mut follow_on) = if enforce {
            match self
                .runtime
                .block_on(async { tokio::time::timeout(deadline, body).await })
            {
                Ok(result) => result,
                Err(_) => {
                    warn!("Job [ {} ] timeout after {}.", job.job_id, job.timeout);
                    (
                        TaskOutcome {
                            stdout: None,
                            stderr: Some(TIMEOUT_MESSAGE.to_string()),
                            outcome: false,
                            info: None,
                        },
                        Vec::new(),
                    )
                }
            }
        } else {
            self.runtime.block_on(body)
        };

        if let Some(arg_job) = capture_output_args(job, &outcome, driver.identity()) {
            follow_on.push(arg_job);
        }

        // RUN treats a requested-but-empty stdout capture as a failure.
        if job.verb() == "RUN"
            && job.stdout_arg.is_some()
            && outcome.outcome
            && outcome.stdout.as_deref().map_or(true, |s| s.trim().is_empty())
        {
            outcome.outcome = false;
        }

        (outcome, follow_on)
    }
}

/// Build the synthetic ARG job that stores captured output back into the
/// executing worker's cache.
fn capture_output_args(job: &JobItem, outcome: &TaskOutcome, identity: &str) -> Option<JobItem> {
    if job.stdout_arg.is_none() && job.stderr_arg.is_none() {
        return None;
    }

    let mut args = Map::new();
    if let Some(name) = &job.stdout_arg {
        let value = outcome.stdout.as_deref().unwrap_or("").trim().to_string();
        args.insert(name.clone(), Value::String(value));
    }
    if let Some(name) = &job.stderr_arg {
        let value = outcome.stderr.as_deref().unwrap_or("").trim().to_string();
        args.insert(name.clone(), Value::String(value));
    }
    if args.is_empty() {
        return None;
    }

    let mut arg_job = JobItem::new(VerbPayload::Arg { args });
    arg_job.skip_cache = true;
    arg_job.extend_args = true;
    arg_job.parent_async_bypass = true;
    arg_job.targets = vec![identity.to_string()];
    arg_job.job_id = get_uuid();
    arg_job.parent_id = get_uuid();
    arg_job.job_sha3_224 = job_sha3_224(&arg_job).ok()?;
    arg_job.parent_sha3_224 = arg_job.job_sha3_224.clone();
    Some(arg_job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParsedExec;

    struct SleepyComponent {
        sleep_ms: u64,
    }

    impl Component for SleepyComponent {
        fn verb(&self) -> &'static str {
            "RUN"
        }

        fn server(&self, _exec: &[String]) -> anyhow::Result<ParsedExec> {
            unreachable!()
        }

        fn client(&self, _ctx: &mut TaskContext, _job: &JobItem) -> TaskOutcome {
            std::thread::sleep(Duration::from_millis(self.sleep_ms));
            TaskOutcome::success(Some("done".to_string()), None)
        }
    }

    struct FlakyComponent {
        fail_times: std::sync::atomic::AtomicU32,
    }

    impl Component for FlakyComponent {
        fn verb(&self) -> &'static str {
            "DNF"
        }

        fn server(&self, _exec: &[String]) -> anyhow::Result<ParsedExec> {
            unreachable!()
        }

        fn client(&self, _ctx: &mut TaskContext, _job: &JobItem) -> TaskOutcome {
            use std::sync::atomic::Ordering;
            if self.fail_times.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            }) != Ok(0)
            {
                TaskOutcome::failure("transient")
            } else {
                TaskOutcome::success(Some("ok".to_string()), None)
            }
        }
    }

    fn harness() -> (tempfile::TempDir, Arc<Cache>, Arc<Driver>, Executor) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(Cache::open(dir.path().join("cache")).unwrap());
        let driver = Arc::new(Driver::new(directord_transport::DriverConfig::new(
            "inproc://executor-test",
            "w1",
        )));
        (dir, cache, driver, Executor::new().unwrap())
    }

    fn run_job() -> JobItem {
        let mut job = JobItem::new(VerbPayload::Run {
            command: "true".to_string(),
            no_block: false,
        });
        job.job_id = get_uuid();
        job
    }

    #[test]
    fn test_execute_success() {
        let (_dir, cache, driver, executor) = harness();
        let (outcome, follow_on) =
            executor.execute(Arc::new(SleepyComponent { sleep_ms: 0 }), cache, driver, &run_job());
        assert!(outcome.outcome);
        assert_eq!(outcome.stdout.as_deref(), Some("done"));
        assert!(follow_on.is_empty());
    }

    #[test]
    fn test_timeout_synthesizes_failure() {
        let (_dir, cache, driver, executor) = harness();
        let mut job = run_job();
        job.timeout = 1;
        let (outcome, follow_on) = executor.execute(
            Arc::new(SleepyComponent { sleep_ms: 2_500 }),
            cache,
            driver,
            &job,
        );
        assert!(!outcome.outcome);
        assert_eq!(outcome.stderr.as_deref(), Some(TIMEOUT_MESSAGE));
        assert!(outcome.stdout.is_none());
        assert!(follow_on.is_empty());
    }

    #[test]
    fn test_retry_until_success() {
        let (_dir, cache, driver, executor) = harness();
        let mut job = run_job();
        job.retry = 3;
        let component = Arc::new(FlakyComponent {
            fail_times: std::sync::atomic::AtomicU32::new(2),
        });
        let (outcome, _) = executor.execute(component, cache, driver, &job);
        assert!(outcome.outcome);
    }

    #[test]
    fn test_stdout_capture_emits_follow_on_arg() {
        let (_dir, cache, driver, executor) = harness();
        let mut job = run_job();
        job.stdout_arg = Some("captured".to_string());
        let (outcome, follow_on) =
            executor.execute(Arc::new(SleepyComponent { sleep_ms: 0 }), cache, driver, &job);
        assert!(outcome.outcome);
        assert_eq!(follow_on.len(), 1);

        let arg_job = &follow_on[0];
        assert_eq!(arg_job.verb(), "ARG");
        assert!(arg_job.skip_cache);
        assert!(arg_job.parent_async_bypass);
        assert_eq!(arg_job.targets, vec!["w1".to_string()]);
        match &arg_job.payload {
            VerbPayload::Arg { args } => {
                assert_eq!(args.get("captured"), Some(&Value::String("done".to_string())));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
