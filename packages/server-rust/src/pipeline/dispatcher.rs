//! Lane dispatcher: bounded queues, per-lane worker pools and workflow drivers.
//!
//! Every stage travels as an [`Envelope`] on the lane of its effective
//! priority. Each lane's workers share one receiver and run envelopes through
//! the task service inside a [`CURRENT_PRIORITY`] scope, so work submitted
//! from within a stage inherits that stage's priority.
//!
//! A stage that calls another operation and waits on it already holds a lane
//! worker, so [`Dispatcher::call`] runs such nested calls inline on the
//! caller's task instead of queueing them behind itself.

use std::fmt;
use std::sync::{Arc, Weak};

use colander_core::{Priority, Value};
use futures_util::future::{join_all, BoxFuture};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tower::ServiceExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handle::{TaskHandle, TaskStatus, TaskTable};
use super::stage::{Stage, Workflow};
use super::{current_or_baseline, current_priority, CURRENT_PRIORITY};
use crate::service::config::WorkerConfig;
use crate::service::middleware::TaskService;
use crate::service::operation::{OperationError, TaskRequest};

/// Failure of a submitted workflow.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A stage failed; the rest of its sequence was abandoned.
    #[error("stage {operation} failed: {source}")]
    StageFailed {
        operation: String,
        #[source]
        source: OperationError,
    },

    #[error("dispatcher is shut down")]
    Closed,
}

struct Envelope {
    request: TaskRequest,
    reply: oneshot::Sender<Result<Value, OperationError>>,
}

struct DispatcherInner {
    /// Indexed by [`Priority::lane`].
    lanes: [mpsc::Sender<Envelope>; 3],
    /// Runs nested calls inline.
    service: TaskService,
    tasks: TaskTable,
    shutdown: watch::Sender<bool>,
    config: WorkerConfig,
}

/// Entry point for submitting stages and workflows.
///
/// Cheap to clone. Lane workers stop once [`Dispatcher::shutdown`] is called
/// or every clone has been dropped.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Starts lane workers serving `service`.
    #[must_use]
    pub fn start(service: TaskService, config: &WorkerConfig) -> Self {
        Self::with_task_table(service, config, TaskTable::new())
    }

    /// Starts lane workers recording submissions in `tasks`.
    #[must_use]
    pub fn with_task_table(service: TaskService, config: &WorkerConfig, tasks: TaskTable) -> Self {
        let capacity = config.lanes.queue_capacity.max(1);
        let [(low_tx, low_rx), (medium_tx, medium_rx), (high_tx, high_rx)] =
            Priority::ALL.map(|_| mpsc::channel::<Envelope>(capacity));
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(DispatcherInner {
            lanes: [low_tx, medium_tx, high_tx],
            service: service.clone(),
            tasks,
            shutdown,
            config: config.clone(),
        });

        for (priority, rx) in Priority::ALL.into_iter().zip([low_rx, medium_rx, high_rx]) {
            let rx = Arc::new(Mutex::new(rx));
            for worker in 0..config.lanes.workers(priority) {
                let lane = LaneWorker {
                    priority,
                    worker,
                    rx: Arc::clone(&rx),
                    service: service.clone(),
                    dispatcher: Arc::downgrade(&inner),
                    shutdown: inner.shutdown.subscribe(),
                };
                tokio::spawn(lane.run());
            }
        }

        info!(
            low = config.lanes.workers(Priority::Low),
            medium = config.lanes.workers(Priority::Medium),
            high = config.lanes.workers(Priority::High),
            "dispatcher started"
        );
        Self { inner }
    }

    /// Submits a single stage.
    ///
    /// With `priority` unset, the stage inherits the priority of the stage
    /// currently executing on this task, or the baseline tier.
    #[must_use]
    pub fn submit(&self, stage: Stage, priority: Option<Priority>) -> TaskHandle {
        self.run(Workflow::Stage(stage), priority)
    }

    /// Submits stages that run strictly in order, each receiving the previous
    /// one's output as its first argument.
    #[must_use]
    pub fn sequence(&self, stages: Vec<Stage>, priority: Option<Priority>) -> TaskHandle {
        self.run(Workflow::sequence(stages), priority)
    }

    /// Submits concurrent branches followed by a continuation that receives
    /// all branch outputs once every branch has succeeded.
    #[must_use]
    pub fn fan_out(
        &self,
        branches: Vec<Stage>,
        continuation: Stage,
        priority: Option<Priority>,
    ) -> TaskHandle {
        self.run(Workflow::fan_out(branches, continuation), priority)
    }

    /// Submits an arbitrary workflow. Every stage without its own priority is
    /// stamped with the submission's effective priority.
    #[must_use]
    pub fn run(&self, mut workflow: Workflow, priority: Option<Priority>) -> TaskHandle {
        if self.is_shutdown() {
            return self.closed_handle();
        }
        let priority = priority
            .or_else(current_priority)
            .unwrap_or(Priority::BASELINE);
        workflow.stamp(priority);

        let handle = self.inner.tasks.register();
        let id = handle.id();
        debug!(task = %id, priority = %priority, stages = workflow.stages().len(), "workflow submitted");

        let dispatcher = self.clone();
        tokio::spawn(async move {
            let outcome = dispatcher.clone().drive(workflow, None).await;
            dispatcher.finish(id, outcome);
        });
        handle
    }

    /// Submits a fully built request as a task of its own.
    #[must_use]
    pub fn submit_task(&self, mut request: TaskRequest) -> TaskHandle {
        if self.is_shutdown() {
            return self.closed_handle();
        }
        request.priority = Some(request.priority.unwrap_or_else(current_or_baseline));

        let handle = self.inner.tasks.register();
        let id = handle.id();
        debug!(task = %id, operation = %request.operation, "task submitted");

        let dispatcher = self.clone();
        tokio::spawn(async move {
            let outcome = dispatcher.call(request).await;
            dispatcher.finish(id, outcome);
        });
        handle
    }

    /// Runs `request` and waits for the result.
    ///
    /// Outside any stage the request is queued on its lane. Inside a running
    /// stage it executes inline under the stage's priority scope: the stage
    /// keeps its lane worker while waiting, and queueing would let a full
    /// set of waiting stages starve their own lane.
    ///
    /// # Errors
    ///
    /// [`PipelineError::StageFailed`] with the executor's error, or
    /// [`PipelineError::Closed`] once the dispatcher has shut down.
    pub async fn call(&self, mut request: TaskRequest) -> Result<Value, PipelineError> {
        if self.is_shutdown() {
            return Err(PipelineError::Closed);
        }
        let priority = request.priority.unwrap_or_else(current_or_baseline);
        request.priority = Some(priority);
        let operation = request.operation.clone();

        if current_priority().is_some() {
            request.submitter = Some(self.clone());
            return CURRENT_PRIORITY
                .scope(priority, self.inner.service.clone().oneshot(request))
                .await
                .map_err(|source| PipelineError::StageFailed { operation, source });
        }

        let (reply, rx) = oneshot::channel();
        self.inner.lanes[priority.lane()]
            .send(Envelope { request, reply })
            .await
            .map_err(|_| PipelineError::Closed)?;

        rx.await
            .map_err(|_| PipelineError::Closed)?
            .map_err(|source| PipelineError::StageFailed { operation, source })
    }

    #[must_use]
    pub fn status(&self, id: Uuid) -> Option<TaskStatus> {
        self.inner.tasks.status(id)
    }

    #[must_use]
    pub fn handle(&self, id: Uuid) -> Option<TaskHandle> {
        self.inner.tasks.handle(id)
    }

    #[must_use]
    pub fn tasks(&self) -> &TaskTable {
        &self.inner.tasks
    }

    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// Stops accepting submissions. Workers finish the envelope they are
    /// running, then exit; queued envelopes are dropped and their callers
    /// see [`PipelineError::Closed`].
    pub fn shutdown(&self) {
        if !self.inner.shutdown.send_replace(true) {
            info!("dispatcher shutting down");
        }
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    fn closed_handle(&self) -> TaskHandle {
        self.inner.tasks.register_with(TaskStatus::Failed {
            error: PipelineError::Closed.to_string(),
        })
    }

    fn finish(&self, id: Uuid, outcome: Result<Value, PipelineError>) {
        let status = match outcome {
            Ok(result) => TaskStatus::Succeeded { result },
            Err(e) => {
                warn!(task = %id, error = %e, "task failed");
                TaskStatus::Failed {
                    error: e.to_string(),
                }
            }
        };
        self.inner.tasks.finish(id, status);
    }

    fn drive(self, workflow: Workflow, input: Option<Value>) -> BoxFuture<'static, Result<Value, PipelineError>> {
        Box::pin(async move {
            match workflow {
                Workflow::Stage(stage) => self.run_stage(stage, input).await,
                Workflow::Sequence(steps) => {
                    let mut carry = input;
                    for step in steps {
                        carry = Some(self.clone().drive(step, carry).await?);
                    }
                    Ok(carry.unwrap_or_default())
                }
                Workflow::FanOut {
                    branches,
                    continuation,
                } => {
                    let outputs = join_all(
                        branches
                            .into_iter()
                            .map(|branch| self.clone().drive(branch, input.clone())),
                    )
                    .await
                    .into_iter()
                    .collect::<Result<Vec<_>, _>>()?;
                    self.run_stage(continuation, Some(Value::Array(outputs)))
                        .await
                }
            }
        })
    }

    async fn run_stage(&self, stage: Stage, input: Option<Value>) -> Result<Value, PipelineError> {
        let Stage {
            operation,
            mut args,
            kwargs,
            priority,
            use_cache,
        } = stage;
        if let Some(input) = input {
            args.insert(0, input);
        }
        let mut request = TaskRequest::new(operation)
            .args(args)
            .use_cache(use_cache)
            .timeout(self.inner.config.default_task_timeout);
        request.kwargs = kwargs;
        request.priority = priority;
        self.call(request).await
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("shutdown", &self.is_shutdown())
            .field("tasks", &self.inner.tasks.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// LaneWorker
// ---------------------------------------------------------------------------

struct LaneWorker {
    priority: Priority,
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    service: TaskService,
    dispatcher: Weak<DispatcherInner>,
    shutdown: watch::Receiver<bool>,
}

impl LaneWorker {
    async fn run(mut self) {
        debug!(lane = %self.priority, worker = self.worker, "lane worker started");
        while let Some(envelope) = self.next().await {
            self.deliver(envelope).await;
        }
        debug!(lane = %self.priority, worker = self.worker, "lane worker stopped");
    }

    async fn next(&mut self) -> Option<Envelope> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            () = stopped(&mut self.shutdown) => None,
            envelope = rx.recv() => envelope,
        }
    }

    async fn deliver(&mut self, envelope: Envelope) {
        let Envelope { mut request, reply } = envelope;
        if reply.is_closed() {
            debug!(operation = %request.operation, "caller gone before start, skipping");
            return;
        }
        let Some(inner) = self.dispatcher.upgrade() else {
            return;
        };
        let priority = request.priority.unwrap_or(self.priority);
        request.priority = Some(priority);
        request.submitter = Some(Dispatcher { inner });

        let service = self.service.clone();
        let result = CURRENT_PRIORITY
            .scope(priority, service.oneshot(request))
            .await;
        let _ = reply.send(result);
    }
}

/// Resolves once shutdown is signalled or the dispatcher is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
