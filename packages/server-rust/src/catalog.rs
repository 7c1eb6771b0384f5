//! Built-in catalog of external API operations.
//!
//! Each entry names the API action, the query parameters its positional
//! arguments bind to, how long results stay cached, and its per-tier
//! throttling limits. Operations without limits fall back to
//! [`Limits::DEFAULT`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use colander_core::{Limits, LimitsTable};
use tracing::info;

use crate::adapter::HttpAdapter;
use crate::service::registry::OperationRegistry;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// One catalog operation.
#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    pub action: &'static str,
    pub params: &'static [&'static str],
    /// Zero disables caching.
    pub cache_ttl: Duration,
    /// Limits for tiers 0, 1, 2. Empty means default limits.
    pub tiers: &'static [Limits],
}

const fn entry(
    action: &'static str,
    params: &'static [&'static str],
    cache_secs: u64,
    tiers: &'static [Limits],
) -> CatalogEntry {
    CatalogEntry {
        action,
        params,
        cache_ttl: Duration::from_secs(cache_secs),
        tiers,
    }
}

/// The built-in catalog.
pub const CATALOG: &[CatalogEntry] = &[
    // Products
    entry(
        "GetServiceStatus",
        &[],
        5 * MINUTE,
        &[
            Limits::new(1.0, 300.0),
            Limits::new(1.0, 300.0),
            Limits::new(2.0, 300.0),
        ],
    ),
    entry(
        "ListMatchingProducts",
        &["Query"],
        24 * HOUR,
        &[
            Limits::new(10.0, 5.0),
            Limits::new(15.0, 5.0),
            Limits::new(20.0, 5.0),
        ],
    ),
    entry(
        "GetMyFeesEstimate",
        &["ASIN", "ListingPrice"],
        30 * MINUTE,
        &[
            Limits::new(10.0, 0.1),
            Limits::new(15.0, 0.1),
            Limits::new(20.0, 0.1),
        ],
    ),
    entry(
        "GetCompetitivePricingForASIN",
        &["ASINList.ASIN.1"],
        5 * MINUTE,
        &[
            Limits::new(10.0, 0.1),
            Limits::new(15.0, 0.1),
            Limits::new(20.0, 0.1),
        ],
    ),
    // Inventory
    entry(
        "ListInventorySupply",
        &["SellerSkus"],
        0,
        &[
            Limits::new(20.0, 0.5),
            Limits::new(25.0, 0.5),
            Limits::new(30.0, 0.5),
        ],
    ),
    // Product advertising: one request per second.
    entry("ItemLookup", &["ItemId"], 5 * MINUTE, &[Limits::new(1.0, 1.0)]),
    entry("ItemSearch", &["Keywords"], 24 * HOUR, &[Limits::new(1.0, 1.0)]),
    entry(
        "BrowseNodeLookup",
        &["BrowseNodeId"],
        24 * HOUR,
        &[Limits::new(1.0, 1.0)],
    ),
    entry(
        "SimilarityLookup",
        &["ItemId"],
        24 * HOUR,
        &[Limits::new(1.0, 1.0)],
    ),
    // Reports
    entry(
        "RequestReport",
        &["ReportType"],
        0,
        &[Limits::new(15.0, 60.0)],
    ),
    entry(
        "GetReportRequestList",
        &["ReportRequestIdList"],
        0,
        &[Limits::new(10.0, 45.0)],
    ),
    entry("GetReportList", &[], 0, &[Limits::new(10.0, 60.0)]),
    entry("GetReportRequestCount", &[], 0, &[Limits::new(10.0, 45.0)]),
    entry(
        "GetReport",
        &["ReportId"],
        30 * MINUTE,
        &[Limits::new(15.0, 60.0)],
    ),
];

/// Looks up a catalog entry by action name.
#[must_use]
pub fn find(action: &str) -> Option<&'static CatalogEntry> {
    CATALOG.iter().find(|e| e.action == action)
}

/// Limits table for every catalog operation with explicit limits.
#[must_use]
pub fn default_limits() -> LimitsTable {
    CATALOG
        .iter()
        .filter(|e| !e.tiers.is_empty())
        .fold(LimitsTable::new(), |table, e| {
            table.with_operation(e.action, e.tiers)
        })
}

/// Built-in limits, overlaid with the JSON limits file at `path` if given.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the merged
/// table is invalid.
pub fn load_limits(path: Option<&Path>) -> anyhow::Result<LimitsTable> {
    let mut limits = default_limits();
    if let Some(path) = path {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading limits file {}", path.display()))?;
        let overrides = LimitsTable::from_json(&text)
            .with_context(|| format!("parsing limits file {}", path.display()))?;
        limits.merge(overrides);
        limits.validate()?;
        info!(path = %path.display(), "limits overrides loaded");
    }
    Ok(limits)
}

/// Registers every catalog operation as an HTTP call through `adapter`.
pub fn register_catalog(registry: &OperationRegistry, adapter: &HttpAdapter) {
    for e in CATALOG {
        registry.register(e.action, adapter.operation(e.action, e.params), e.cache_ttl);
    }
}

/// Convenience: a registry holding just the catalog.
#[must_use]
pub fn catalog_registry(adapter: &HttpAdapter) -> Arc<OperationRegistry> {
    let registry = OperationRegistry::new();
    register_catalog(&registry, adapter);
    Arc::new(registry)
}

#[cfg(test)]
mod tests {
    use colander_core::Priority;

    use super::*;
    use crate::adapter::HttpAdapterConfig;

    #[test]
    fn limits_are_valid_and_ordered() {
        let table = default_limits();
        table.validate().unwrap();
        assert_eq!(
            table.resolve("GetServiceStatus", Priority::High),
            Limits::new(2.0, 300.0)
        );
        assert_eq!(
            table.resolve("ListInventorySupply", Priority::Medium),
            Limits::new(25.0, 0.5)
        );
    }

    #[test]
    fn single_tier_operations_fall_back_to_tier_zero() {
        let table = default_limits();
        assert_eq!(
            table.resolve("ItemLookup", Priority::High),
            Limits::new(1.0, 1.0)
        );
    }

    #[test]
    fn cache_ttls() {
        assert_eq!(
            find("ListMatchingProducts").unwrap().cache_ttl,
            Duration::from_secs(86_400)
        );
        assert_eq!(
            find("GetReport").unwrap().cache_ttl,
            Duration::from_secs(1_800)
        );
        assert!(find("ListInventorySupply").unwrap().cache_ttl.is_zero());
        assert!(find("RequestReport").unwrap().cache_ttl.is_zero());
        assert!(find("NoSuchAction").is_none());
    }

    #[test]
    fn limits_file_overrides_catalog() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{"ItemLookup": {"0": {"quota_max": 5, "restore_rate": 2}}, "CustomOp": {"1": {"quota_max": 3, "restore_rate": 1}}}"#,
        )
        .unwrap();

        let table = load_limits(Some(file.path())).unwrap();
        assert_eq!(
            table.resolve("ItemLookup", Priority::Low),
            Limits::new(5.0, 2.0)
        );
        assert_eq!(
            table.resolve("GetServiceStatus", Priority::High),
            Limits::new(2.0, 300.0)
        );
        assert!(table.contains("CustomOp"));
    }

    #[test]
    fn unreadable_limits_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_limits(Some(&dir.path().join("missing.json"))).unwrap_err();
        assert!(err.to_string().contains("reading limits file"));

        assert!(load_limits(None).is_ok());
    }

    #[test]
    fn registers_every_entry() {
        let adapter = HttpAdapter::new(&HttpAdapterConfig::default()).unwrap();
        let registry = catalog_registry(&adapter);
        assert_eq!(registry.len(), CATALOG.len());
        assert_eq!(
            registry.get("GetMyFeesEstimate").unwrap().cache_ttl,
            Duration::from_secs(1_800)
        );
    }
}
