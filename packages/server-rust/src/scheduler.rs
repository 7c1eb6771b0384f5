//! Periodic job scheduler.
//!
//! Submits workflows through the dispatcher on fixed intervals. A recurring
//! job is submitted once per interval. A job that runs until success (such as
//! `awaitReports`) is re-submitted an interval after each failure and dropped
//! once it succeeds; failed runs are never retried inside the task itself.

use std::time::Duration;

use async_trait::async_trait;
use colander_core::Priority;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::pipeline::{Dispatcher, Stage, TaskHandle, TaskStatus, Workflow};
use crate::service::worker::BackgroundRunnable;

/// Default interval between `awaitReports` checks.
pub const REPORT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// How a job is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    /// Submitted every interval, whatever the previous outcome.
    Recurring,
    /// Re-submitted an interval after each failure; finished after the
    /// first success.
    UntilSuccess,
}

/// A job registered with the scheduler.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub name: String,
    pub workflow: Workflow,
    pub priority: Option<Priority>,
    pub interval: Duration,
    pub mode: JobMode,
}

impl ScheduledJob {
    #[must_use]
    pub fn recurring(name: impl Into<String>, workflow: impl Into<Workflow>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            workflow: workflow.into(),
            priority: None,
            interval,
            mode: JobMode::Recurring,
        }
    }

    #[must_use]
    pub fn until_success(
        name: impl Into<String>,
        workflow: impl Into<Workflow>,
        interval: Duration,
    ) -> Self {
        Self {
            mode: JobMode::UntilSuccess,
            ..Self::recurring(name, workflow, interval)
        }
    }

    /// Polls the given report requests until all have finished.
    #[must_use]
    pub fn await_reports(request_ids: &[&str], interval: Duration) -> Self {
        let stage = request_ids
            .iter()
            .fold(Stage::new("awaitReports"), |stage, id| stage.arg(*id));
        Self::until_success(
            format!("awaitReports[{}]", request_ids.join(",")),
            stage,
            interval,
        )
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

struct JobState {
    job: ScheduledJob,
    next_due: Instant,
    in_flight: Option<TaskHandle>,
    finished: bool,
}

/// Background runnable driving scheduled jobs.
///
/// New jobs arrive as tasks; due jobs are submitted on each tick, so the
/// tick interval bounds scheduling precision.
pub struct Scheduler {
    dispatcher: Dispatcher,
    jobs: Vec<JobState>,
}

impl Scheduler {
    #[must_use]
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            jobs: Vec::new(),
        }
    }

    /// Adds a job, due immediately.
    pub fn add(&mut self, job: ScheduledJob) {
        info!(job = %job.name, interval_secs = job.interval.as_secs(), mode = ?job.mode, "job scheduled");
        self.jobs.push(JobState {
            job,
            next_due: Instant::now(),
            in_flight: None,
            finished: false,
        });
    }

    /// Number of jobs that have not finished.
    #[must_use]
    pub fn active_jobs(&self) -> usize {
        self.jobs.iter().filter(|j| !j.finished).count()
    }

    /// Collects outcomes of submitted runs and submits every due job.
    pub fn poll(&mut self) {
        let now = Instant::now();
        for state in &mut self.jobs {
            if let Some(handle) = &state.in_flight {
                match handle.status() {
                    TaskStatus::Pending => continue,
                    TaskStatus::Succeeded { .. } => {
                        debug!(job = %state.job.name, "job run succeeded");
                        if state.job.mode == JobMode::UntilSuccess {
                            state.finished = true;
                        }
                    }
                    TaskStatus::Failed { error } => {
                        warn!(
                            job = %state.job.name,
                            error = %error,
                            retry_in_secs = state.job.interval.as_secs(),
                            "job run failed, will re-submit"
                        );
                        state.next_due = now + state.job.interval;
                    }
                }
                state.in_flight = None;
            }

            if state.finished || now < state.next_due {
                continue;
            }
            let handle = self
                .dispatcher
                .run(state.job.workflow.clone(), state.job.priority);
            debug!(job = %state.job.name, task = %handle.id(), "job submitted");
            state.in_flight = Some(handle);
            if state.job.mode == JobMode::Recurring {
                state.next_due = now + state.job.interval;
            }
        }
        self.jobs.retain(|j| !j.finished);
    }
}

#[async_trait]
impl BackgroundRunnable for Scheduler {
    type Task = ScheduledJob;

    async fn run(&mut self, job: ScheduledJob) {
        self.add(job);
        self.poll();
    }

    async fn on_tick(&mut self) {
        self.poll();
    }
}
