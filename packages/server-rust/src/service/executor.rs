//! Task executor: cache, admission, retried call, release, cache write.
//!
//! One logical call holds exactly one quota reservation, however many retry
//! attempts it takes. The reserved part of the call runs in its own tokio task
//! so that the reservation is released even if the caller stops waiting
//! (for example when the timeout middleware fires). A caller that gives up
//! during the quota wait abandons the call: the handler never runs and the
//! reservation is released at once.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use colander_core::{CacheKey, Priority, ResponseCache, Value};
use futures_util::FutureExt;
use tokio::sync::oneshot;
use tower::Service;
use tracing::{debug, warn};

use super::operation::{OperationContext, OperationError, TaskRequest};
use super::registry::{OperationRegistry, OperationSpec};
use crate::limiter::RateLimiter;
use crate::pipeline::{current_or_baseline, CURRENT_PRIORITY};
use crate::retry::RetryPolicy;

struct ExecutorInner {
    registry: Arc<OperationRegistry>,
    limiter: Arc<RateLimiter>,
    cache: Arc<dyn ResponseCache>,
    retry: RetryPolicy,
}

/// Executes named operations against the shared quota and cache stores.
///
/// Cheap to clone; all clones share the same stores.
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
}

impl TaskExecutor {
    #[must_use]
    pub fn new(
        registry: Arc<OperationRegistry>,
        limiter: Arc<RateLimiter>,
        cache: Arc<dyn ResponseCache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                registry,
                limiter,
                cache,
                retry,
            }),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.inner.registry
    }

    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    /// Runs `request` to completion.
    ///
    /// 1. On a cache hit, returns the cached value without touching the
    ///    limiter or the handler.
    /// 2. Otherwise reserves quota and sleeps for the computed wait.
    /// 3. Calls the handler under the retry policy.
    /// 4. Releases the reservation, whatever the outcome.
    /// 5. Caches a successful result.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::UnknownOperation`] for unregistered names,
    /// [`OperationError::Store`] when no reservation could be made, and
    /// [`OperationError::Call`] carrying the last attempt's error once the
    /// retry policy gives up.
    pub async fn execute(&self, request: TaskRequest) -> Result<Value, OperationError> {
        let priority = request.priority.unwrap_or_else(current_or_baseline);
        let spec = self.inner.registry.get(&request.operation).ok_or_else(|| {
            OperationError::UnknownOperation {
                name: request.operation.clone(),
            }
        })?;

        let key = if request.use_cache && !spec.cache_ttl.is_zero() {
            Some(CacheKey::for_call(
                &request.operation,
                &request.args,
                &request.kwargs,
            )?)
        } else {
            None
        };

        if let Some(key) = &key {
            if let Some(value) = self.inner.cached(key).await {
                return Ok(value);
            }
        }

        // Dropped with this future; the reserved task sees the channel close.
        let (_caller, abandoned) = oneshot::channel::<()>();
        let inner = Arc::clone(&self.inner);
        let work = CURRENT_PRIORITY.scope(priority, async move {
            inner
                .run_reserved(request, spec, priority, key, abandoned)
                .await
        });
        tokio::spawn(work)
            .await
            .map_err(|e| OperationError::Internal(anyhow::anyhow!("executor task failed: {e}")))?
    }
}

impl ExecutorInner {
    async fn cached(&self, key: &CacheKey) -> Option<Value> {
        let operation = key.operation().to_string();
        match self.cache.get(key).await {
            Ok(Some(bytes)) => match rmp_serde::from_slice::<Value>(&bytes) {
                Ok(value) => {
                    metrics::counter!("colander.cache.hits", "operation" => operation.clone())
                        .increment(1);
                    debug!(operation = %operation, "cache hit");
                    return Some(value);
                }
                Err(e) => warn!(operation = %operation, error = %e, "undecodable cache entry"),
            },
            Ok(None) => {}
            Err(e) => warn!(operation = %operation, error = %e, "cache read failed"),
        }
        metrics::counter!("colander.cache.misses", "operation" => operation).increment(1);
        None
    }

    async fn run_reserved(
        &self,
        request: TaskRequest,
        spec: OperationSpec,
        priority: Priority,
        key: Option<CacheKey>,
        mut abandoned: oneshot::Receiver<()>,
    ) -> Result<Value, OperationError> {
        let operation = request.operation.clone();
        let reservation = self.limiter.wait_for(&operation, priority).await?;
        if !reservation.wait.is_zero() {
            debug!(operation = %operation, wait_ms = u64::try_from(reservation.wait.as_millis()).unwrap_or(u64::MAX), "waiting for quota");
            tokio::select! {
                () = tokio::time::sleep(reservation.wait) => {}
                _ = &mut abandoned => {}
            }
        }
        if !matches!(abandoned.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
            debug!(operation = %operation, "caller gone before the call, releasing");
            let _ = self.limiter.release(&reservation, false).await;
            return Err(OperationError::Abandoned { operation });
        }

        let attempts = self.retry.run(&operation, |attempt| {
            let ctx = OperationContext {
                call_id: request.call_id,
                operation: request.operation.clone(),
                args: request.args.clone(),
                kwargs: request.kwargs.clone(),
                priority,
                attempt,
                submitter: request.submitter.clone(),
            };
            let handler = Arc::clone(&spec.handler);
            async move { handler.call(&ctx).await }
        });
        let outcome = AssertUnwindSafe(attempts).catch_unwind().await;

        let success = matches!(outcome, Ok(Ok(_)));
        // Failure is logged by the limiter; the slot stays pending until expiry.
        let _ = self.limiter.release(&reservation, success).await;

        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(source)) => return Err(OperationError::Call { operation, source }),
            Err(_) => {
                return Err(OperationError::Internal(anyhow::anyhow!(
                    "handler for {operation} panicked"
                )))
            }
        };

        if let Some(key) = key {
            match rmp_serde::to_vec(&value) {
                Ok(bytes) => {
                    if let Err(e) = self.cache.put(&key, bytes, spec.cache_ttl).await {
                        warn!(operation = %operation, error = %e, "cache write failed");
                    }
                }
                Err(e) => warn!(operation = %operation, error = %e, "result not cacheable"),
            }
        }
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// tower::Service
// ---------------------------------------------------------------------------

impl Service<TaskRequest> for TaskExecutor {
    type Response = Value;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<Value, OperationError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: TaskRequest) -> Self::Future {
        let executor = self.clone();
        Box::pin(async move { executor.execute(request).await })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use colander_core::{
        Limits, LimitsTable, ManualClock, QuotaStore, ReserveSnapshot, StoreError, UsageRecord,
    };

    use super::*;
    use crate::adapter::{CallError, OperationHandler};
    use crate::cache::{MemoryCacheConfig, MemoryResponseCache};
    use crate::quota::MemoryQuotaStore;

    /// Quota store that counts calls and delegates to memory.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryQuotaStore,
        reserves: AtomicU32,
        releases: AtomicU32,
    }

    #[async_trait]
    impl QuotaStore for CountingStore {
        async fn reserve(&self, op: &str, rate: f64) -> Result<ReserveSnapshot, StoreError> {
            self.reserves.fetch_add(1, Ordering::SeqCst);
            self.inner.reserve(op, rate).await
        }
        async fn release(&self, op: &str, rate: f64, success: bool) -> Result<(), StoreError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.inner.release(op, rate, success).await
        }
        async fn usage(&self, op: &str) -> Result<Option<UsageRecord>, StoreError> {
            self.inner.usage(op).await
        }
    }

    /// Handler that fails with timeouts a fixed number of times.
    struct Flaky {
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl OperationHandler for Flaky {
        async fn call(&self, ctx: &OperationContext) -> Result<Value, CallError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(CallError::Timeout(format!("attempt {}", ctx.attempt)))
            } else {
                Ok(Value::from(format!("{}:{}", ctx.operation, ctx.priority)))
            }
        }
    }

    struct Harness {
        executor: TaskExecutor,
        store: Arc<CountingStore>,
        calls: Arc<AtomicU32>,
    }

    fn harness(failures: u32, ttl: Duration) -> Harness {
        let store = Arc::new(CountingStore::default());
        let calls = Arc::new(AtomicU32::new(0));
        let registry = Arc::new(OperationRegistry::new());
        registry.register(
            "ItemLookup",
            Flaky {
                failures,
                calls: calls.clone(),
            },
            ttl,
        );
        let limits = LimitsTable::new().with_operation("ItemLookup", &[Limits::new(10.0, 1.0)]);
        let limiter = Arc::new(RateLimiter::new(store.clone(), Arc::new(limits)));
        let cache = Arc::new(MemoryResponseCache::new(
            &MemoryCacheConfig::default(),
            Arc::new(ManualClock::new(1_000)),
        ));
        let retry = RetryPolicy {
            base_delay: Duration::from_millis(10),
            ..RetryPolicy::default()
        };
        Harness {
            executor: TaskExecutor::new(registry, limiter, cache, retry),
            store,
            calls,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cache_hit_skips_limiter_and_handler() {
        let h = harness(0, Duration::from_secs(300));
        let first = h
            .executor
            .execute(TaskRequest::new("ItemLookup").arg("B01"))
            .await
            .unwrap();
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.reserves.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        let second = h
            .executor
            .execute(TaskRequest::new("ItemLookup").arg("B01").priority(Priority::High))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.reserves.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_share_one_reservation() {
        let h = harness(2, Duration::ZERO);
        let value = h
            .executor
            .execute(TaskRequest::new("ItemLookup").arg("B02"))
            .await
            .unwrap();
        assert_eq!(value, Value::from("ItemLookup:low"));
        assert_eq!(h.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.store.reserves.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_the_cause_and_release() {
        let h = harness(u32::MAX, Duration::from_secs(300));
        let err = h
            .executor
            .execute(TaskRequest::new("ItemLookup").arg("B03"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OperationError::Call {
                source: CallError::Timeout(_),
                ..
            }
        ));
        assert_eq!(h.calls.load(Ordering::SeqCst), 7);
        assert_eq!(h.store.releases.load(Ordering::SeqCst), 1);
        let rec = h.store.usage("ItemLookup").await.unwrap().unwrap();
        assert_eq!(rec.pending, 0);
    }

    #[tokio::test]
    async fn use_cache_false_always_calls() {
        let h = harness(0, Duration::from_secs(300));
        for _ in 0..2 {
            h.executor
                .execute(TaskRequest::new("ItemLookup").arg("B04").use_cache(false))
                .await
                .unwrap();
        }
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_ttl_disables_caching() {
        let h = harness(0, Duration::ZERO);
        for _ in 0..2 {
            h.executor
                .execute(TaskRequest::new("ItemLookup").arg("B05"))
                .await
                .unwrap();
        }
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_operation_is_rejected_without_reserving() {
        let h = harness(0, Duration::ZERO);
        let err = h
            .executor
            .execute(TaskRequest::new("NoSuchCall"))
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::UnknownOperation { .. }));
        assert_eq!(h.store.reserves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn inherits_priority_from_enclosing_stage() {
        let h = harness(0, Duration::ZERO);
        let value = CURRENT_PRIORITY
            .scope(
                Priority::Medium,
                h.executor.execute(TaskRequest::new("ItemLookup").arg("B06")),
            )
            .await
            .unwrap();
        assert_eq!(value, Value::from("ItemLookup:medium"));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_caller_still_releases() {
        let h = harness(1, Duration::ZERO);
        let fut = h.executor.execute(TaskRequest::new("ItemLookup").arg("B07"));
        let _ = tokio::time::timeout(Duration::from_millis(1), fut).await;
        // Let the detached work finish its retry and release.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.store.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_timing_out_during_wait_skips_the_call() {
        let h = harness(0, Duration::ZERO);
        // Drain the bucket so the next reservation has to wait.
        for i in 0..10 {
            h.executor
                .execute(TaskRequest::new("ItemLookup").arg(format!("X{i}")))
                .await
                .unwrap();
        }
        assert_eq!(h.calls.load(Ordering::SeqCst), 10);

        let fut = h.executor.execute(TaskRequest::new("ItemLookup").arg("B09"));
        assert!(tokio::time::timeout(Duration::from_millis(100), fut)
            .await
            .is_err());
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(h.calls.load(Ordering::SeqCst), 10);
        assert_eq!(h.store.releases.load(Ordering::SeqCst), 11);
        let rec = h.store.usage("ItemLookup").await.unwrap().unwrap();
        assert_eq!(rec.pending, 0);
    }

    #[tokio::test]
    async fn works_as_a_tower_service() {
        use tower::ServiceExt;

        let h = harness(0, Duration::ZERO);
        let value = h
            .executor
            .clone()
            .oneshot(TaskRequest::new("ItemLookup").arg("B08"))
            .await
            .unwrap();
        assert_eq!(value, Value::from("ItemLookup:low"));
    }
}
