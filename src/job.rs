//! Job polling.
//!
//! Mutating driver calls either finish immediately or start a job. The
//! [`JobPoller`] turns both shapes into a single `Result`: it polls a started
//! job at a fixed interval until it reaches a terminal state, and gives up
//! with [`Error::JobTimedOut`] once the configured timeout has elapsed.

use crate::config::ShimConfig;
use crate::driver::{HypervisorDriver, JobHandle, JobState, Submission, RETURN_OK};
use crate::error::{Error, Result};
use std::fmt;
use std::time::{Duration, Instant};

/// Default delay between job polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default upper bound on how long a single job may run.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(600);

/// Human-readable outcome of a resolved submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic(String);

impl Diagnostic {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves driver submissions to success or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobPoller {
    interval: Duration,
    timeout: Option<Duration>,
}

impl Default for JobPoller {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, Some(DEFAULT_JOB_TIMEOUT))
    }
}

impl JobPoller {
    /// `timeout` of `None` polls until the job finishes.
    pub fn new(interval: Duration, timeout: Option<Duration>) -> Self {
        Self { interval, timeout }
    }

    pub fn from_config(config: &ShimConfig) -> Result<Self> {
        Ok(Self::new(config.poll_interval()?, config.job_timeout()?))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Resolve a submission.
    ///
    /// A started job is polled to completion. Any other non-zero return
    /// value is a failure carrying that code.
    pub fn resolve(
        &self,
        driver: &mut dyn HypervisorDriver,
        submission: Submission,
    ) -> Result<Diagnostic> {
        if submission.is_async() {
            let job = submission.job.ok_or_else(|| {
                Error::driver("job submission", "job started without a job handle")
            })?;
            return self.wait(driver, &job);
        }

        if submission.return_value == RETURN_OK {
            Ok(Diagnostic("completed synchronously".to_string()))
        } else {
            Err(Error::JobFailed(format!(
                "return value was {}",
                submission.return_value
            )))
        }
    }

    /// Poll `job` until it completes, fails or times out.
    pub fn wait(&self, driver: &mut dyn HypervisorDriver, job: &JobHandle) -> Result<Diagnostic> {
        let started = Instant::now();
        loop {
            let status = driver
                .poll_job(job)?
                .ok_or_else(|| Error::not_found("job", job.to_string()))?;

            match status.state {
                JobState::Completed => {
                    let diagnostic = format!(
                        "job succeeded: {}, elapsed={}",
                        status.description,
                        humantime::format_duration(status.elapsed)
                    );
                    tracing::debug!(job = %job, "{}", diagnostic);
                    return Ok(Diagnostic(diagnostic));
                }
                JobState::Failed(code) => {
                    let reason = status
                        .error_summary
                        .unwrap_or_else(|| format!("job ended in state {}", code));
                    tracing::warn!(job = %job, state = code, error = %reason, "job failed");
                    return Err(Error::JobFailed(reason));
                }
                JobState::Pending(_) => {}
            }

            if let Some(timeout) = self.timeout {
                let waited = started.elapsed();
                if waited >= timeout {
                    return Err(Error::JobTimedOut {
                        job: job.to_string(),
                        waited,
                    });
                }
            }
            std::thread::sleep(self.interval);
        }
    }
}
