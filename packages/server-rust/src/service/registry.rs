//! Operation registry: explicit map from operation name to handler.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::adapter::OperationHandler;

// ---------------------------------------------------------------------------
// OperationSpec
// ---------------------------------------------------------------------------

/// A registered operation.
#[derive(Clone)]
pub struct OperationSpec {
    pub handler: Arc<dyn OperationHandler>,
    /// How long results stay cached. Zero disables caching.
    pub cache_ttl: Duration,
}

// ---------------------------------------------------------------------------
// OperationRegistry
// ---------------------------------------------------------------------------

/// Registry of every operation the executor can run.
///
/// Populated once at process start. Lookups by an unregistered name fail
/// with `OperationError::UnknownOperation` in the executor.
pub struct OperationRegistry {
    operations: DashMap<String, OperationSpec>,
}

impl OperationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            operations: DashMap::new(),
        }
    }

    /// Registers `handler` under `name`, replacing any previous registration.
    pub fn register<H: OperationHandler + 'static>(
        &self,
        name: impl Into<String>,
        handler: H,
        cache_ttl: Duration,
    ) {
        self.operations.insert(
            name.into(),
            OperationSpec {
                handler: Arc::new(handler),
                cache_ttl,
            },
        );
    }

    /// Retrieve an operation by name.
    pub fn get(&self, name: &str) -> Option<OperationSpec> {
        self.operations.get(name).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use colander_core::Value;

    use super::*;
    use crate::adapter::{CallError, FnHandler};
    use crate::service::operation::OperationContext;

    fn echo() -> FnHandler<impl Fn(OperationContext) -> std::future::Ready<Result<Value, CallError>>>
    {
        FnHandler(|ctx: OperationContext| std::future::ready(Ok(Value::from(ctx.operation))))
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = OperationRegistry::new();
        registry.register("ItemLookup", echo(), Duration::from_secs(300));

        let spec = registry.get("ItemLookup").unwrap();
        assert_eq!(spec.cache_ttl, Duration::from_secs(300));
        let out = spec
            .handler
            .call(&OperationContext::for_test("ItemLookup", vec![]))
            .await
            .unwrap();
        assert_eq!(out, Value::from("ItemLookup"));
    }

    #[test]
    fn unknown_name_is_none() {
        let registry = OperationRegistry::new();
        assert!(registry.get("Nope").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn re_registration_replaces() {
        let registry = OperationRegistry::new();
        registry.register("GetReport", echo(), Duration::ZERO);
        registry.register("GetReport", echo(), Duration::from_secs(1800));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("GetReport").unwrap().cache_ttl,
            Duration::from_secs(1800)
        );
    }

    #[test]
    fn names_are_sorted() {
        let registry = OperationRegistry::new();
        registry.register("b", echo(), Duration::ZERO);
        registry.register("a", echo(), Duration::ZERO);
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        assert!(registry.contains("a"));
    }
}
