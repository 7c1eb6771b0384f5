//! Task requests, per-attempt call context, and executor errors.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use colander_core::{Kwargs, Priority, StoreError, Value};

use crate::adapter::CallError;
use crate::pipeline::Dispatcher;

/// Default soft time limit for one task.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

fn next_call_id() -> u64 {
    NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// TaskRequest
// ---------------------------------------------------------------------------

/// A request to execute one named operation.
#[derive(Clone)]
pub struct TaskRequest {
    pub call_id: u64,
    pub operation: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    /// `None` inherits the priority of the currently executing stage.
    pub priority: Option<Priority>,
    pub use_cache: bool,
    /// Soft time limit enforced by the timeout middleware.
    pub timeout: Duration,
    /// Handle for submitting follow-up work, set when running inside the
    /// pipeline.
    pub submitter: Option<Dispatcher>,
}

impl TaskRequest {
    #[must_use]
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            call_id: next_call_id(),
            operation: operation.into(),
            args: Vec::new(),
            kwargs: Kwargs::new(),
            priority: None,
            use_cache: true,
            timeout: DEFAULT_TASK_TIMEOUT,
            submitter: None,
        }
    }

    /// Builds a request from raw submission parts, lifting the `priority`
    /// and `use_cache` control kwargs out of `kwargs`.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::InvalidArgument`] if `priority` is not an
    /// integer or `use_cache` is not a boolean.
    pub fn from_parts(
        operation: impl Into<String>,
        args: Vec<Value>,
        mut kwargs: Kwargs,
    ) -> Result<Self, OperationError> {
        let mut request = Self::new(operation).args(args);
        if let Some(raw) = kwargs.remove("priority") {
            request.priority = Some(parse_priority(&raw)?);
        }
        if let Some(raw) = kwargs.remove("use_cache") {
            match raw {
                Value::Bool(b) => request.use_cache = b,
                Value::Null => {}
                other => {
                    return Err(OperationError::InvalidArgument(format!(
                        "use_cache must be a boolean, got {other}"
                    )))
                }
            }
        }
        request.kwargs = kwargs;
        Ok(request)
    }

    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    #[must_use]
    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRequest")
            .field("call_id", &self.call_id)
            .field("operation", &self.operation)
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .field("priority", &self.priority)
            .field("use_cache", &self.use_cache)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Parses a submitted priority. Integers outside 0..=2 are clamped; numeric
/// strings are accepted.
///
/// # Errors
///
/// Returns [`OperationError::InvalidArgument`] for anything else.
pub fn parse_priority(raw: &Value) -> Result<Priority, OperationError> {
    match raw {
        Value::Int(level) => Ok(Priority::clamped(*level)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Priority::clamped)
            .map_err(|_| OperationError::InvalidArgument(format!("invalid priority: {s}"))),
        other => Err(OperationError::InvalidArgument(format!(
            "invalid priority: {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// OperationContext
// ---------------------------------------------------------------------------

/// Everything a handler may use during one attempt. Built fresh for every
/// attempt and dropped afterwards.
#[derive(Clone)]
pub struct OperationContext {
    pub call_id: u64,
    pub operation: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    pub priority: Priority,
    /// 0-based retry attempt.
    pub attempt: u32,
    pub submitter: Option<Dispatcher>,
}

impl OperationContext {
    /// Positional argument `index`, or a [`CallError::Rejected`] naming it.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Rejected`] when the argument is missing or null.
    pub fn require_arg(&self, index: usize, name: &str) -> Result<&Value, CallError> {
        self.args
            .get(index)
            .filter(|v| !v.is_null())
            .ok_or_else(|| {
                CallError::Rejected(format!("{}: missing argument {name}", self.operation))
            })
    }

    /// The submitter, required by handlers that enqueue follow-up work.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Rejected`] when called outside the pipeline.
    pub fn require_submitter(&self) -> Result<&Dispatcher, CallError> {
        self.submitter.as_ref().ok_or_else(|| {
            CallError::Rejected(format!("{} must run inside the pipeline", self.operation))
        })
    }

    #[cfg(test)]
    pub(crate) fn for_test(operation: &str, args: Vec<Value>) -> Self {
        Self {
            call_id: 0,
            operation: operation.to_string(),
            args,
            kwargs: Kwargs::new(),
            priority: Priority::BASELINE,
            attempt: 0,
            submitter: None,
        }
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("call_id", &self.call_id)
            .field("operation", &self.operation)
            .field("priority", &self.priority)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// OperationError
// ---------------------------------------------------------------------------

/// Errors returned by the task executor.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("unknown operation: {name}")]
    UnknownOperation { name: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The external call failed; carries the last attempt's error.
    #[error("{operation} failed: {source}")]
    Call {
        operation: String,
        #[source]
        source: CallError,
    },

    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("worker overloaded, try again later")]
    Overloaded,

    /// The caller stopped waiting before the external call started.
    #[error("{operation} abandoned before the call was made")]
    Abandoned { operation: String },

    #[error("quota store error: {0}")]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
