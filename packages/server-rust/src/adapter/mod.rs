//! External-call adapters.
//!
//! An [`OperationHandler`] performs one attempt of a named operation. The
//! executor resolves handlers by name through the operation registry and
//! wraps every attempt in the retry policy; handlers themselves never retry.

pub mod http;

use std::future::Future;

use async_trait::async_trait;
use colander_core::Value;

use crate::retry::{Classify, ErrorClass};
use crate::service::operation::OperationContext;

pub use http::{HttpAdapter, HttpAdapterConfig, HttpOperation};

/// Failure of a single call attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    /// The call was refused before reaching upstream (bad arguments,
    /// unsupported input).
    #[error("rejected: {0}")]
    Rejected(String),

    /// A task this call submitted and waited on failed. That task has
    /// already been through its own retries.
    #[error("dependent task failed: {0}")]
    Dependency(String),
}

impl Classify for CallError {
    fn class(&self) -> ErrorClass {
        match self {
            CallError::Timeout(_) | CallError::Connection(_) => ErrorClass::Transient,
            CallError::Status { status, .. } if *status >= 500 || *status == 429 => {
                ErrorClass::Transient
            }
            _ => ErrorClass::Fatal,
        }
    }
}

/// One attempt of a named operation.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Performs the call described by `ctx`.
    ///
    /// # Errors
    ///
    /// Returns a [`CallError`] classified by the retry policy.
    async fn call(&self, ctx: &OperationContext) -> Result<Value, CallError>;
}

/// Adapts an async closure into an [`OperationHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> OperationHandler for FnHandler<F>
where
    F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
{
    async fn call(&self, ctx: &OperationContext) -> Result<Value, CallError> {
        (self.0)(ctx.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(
            CallError::Timeout("read".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            CallError::Connection("reset".into()).class(),
            ErrorClass::Transient
        );
        for status in [500, 502, 503, 429] {
            assert_eq!(
                CallError::Status {
                    status,
                    body: String::new()
                }
                .class(),
                ErrorClass::Transient
            );
        }
        for status in [400, 403, 404] {
            assert_eq!(
                CallError::Status {
                    status,
                    body: String::new()
                }
                .class(),
                ErrorClass::Fatal
            );
        }
        assert_eq!(
            CallError::Malformed("not xml".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(CallError::Rejected("no sku".into()).class(), ErrorClass::Fatal);
        assert_eq!(
            CallError::Dependency("GetMyFeesEstimate".into()).class(),
            ErrorClass::Fatal
        );
    }

    #[tokio::test]
    async fn fn_handler_sees_context() {
        let handler = FnHandler(|ctx: OperationContext| async move {
            Ok(Value::from(format!("{}:{}", ctx.operation, ctx.args.len())))
        });
        let ctx = OperationContext::for_test("ItemLookup", vec![Value::from("B01")]);
        assert_eq!(
            handler.call(&ctx).await.unwrap(),
            Value::from("ItemLookup:1")
        );
    }
}
