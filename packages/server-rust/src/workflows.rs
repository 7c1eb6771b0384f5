//! Built-in workflow operations.
//!
//! These run inside the pipeline like any other operation but do their work
//! by composing catalog calls:
//!
//! - `importAndEnrich(record)`: cleans an ingested product record and submits
//!   its enrichment workflow, returning the cleaned record and the id of the
//!   enrichment task.
//! - `updateListing(sources, record)`: merges API results into a record.
//! - `updateFbaFees(record)`: fetches a fee estimate for the record's price
//!   and merges it.
//! - `decodeReport(report_type, body)`: decodes a downloaded report.
//! - `awaitReports(request_ids...)`: succeeds once every report request has
//!   finished; fails while any is still in progress so the scheduler tries
//!   again later.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use colander_core::{ReportKind, Value};
use tracing::{debug, warn};

use crate::adapter::{CallError, OperationHandler};
use crate::pipeline::{Stage, Workflow};
use crate::service::operation::{OperationContext, TaskRequest};
use crate::service::registry::OperationRegistry;

type Record = BTreeMap<String, Value>;

/// Registers every workflow operation. None of them are cached.
pub fn register_workflows(registry: &OperationRegistry) {
    registry.register("importAndEnrich", ImportAndEnrich, Duration::ZERO);
    registry.register("updateListing", UpdateListing, Duration::ZERO);
    registry.register("updateFbaFees", UpdateFbaFees, Duration::ZERO);
    registry.register("decodeReport", DecodeReport, Duration::ZERO);
    registry.register("awaitReports", AwaitReports, Duration::ZERO);
}

fn record_arg(ctx: &OperationContext, index: usize) -> Result<Record, CallError> {
    ctx.require_arg(index, "record")?
        .as_map()
        .cloned()
        .ok_or_else(|| CallError::Rejected(format!("{}: record must be a map", ctx.operation)))
}

fn non_empty_str<'a>(record: &'a Record, key: &str) -> Option<&'a str> {
    record
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// importAndEnrich
// ---------------------------------------------------------------------------

/// Trims string fields and checks that the record identifies its product.
///
/// # Errors
///
/// Returns [`CallError::Rejected`] when `sku` is missing or when neither
/// `vendor` nor `vendor_id` is present.
pub fn clean_record(mut record: Record) -> Result<Record, CallError> {
    for value in record.values_mut() {
        if let Value::String(s) = value {
            let trimmed = s.trim();
            if trimmed.len() != s.len() {
                *s = trimmed.to_string();
            }
        }
    }
    if non_empty_str(&record, "sku").is_none() {
        return Err(CallError::Rejected("record has no sku".into()));
    }
    let has_vendor = non_empty_str(&record, "vendor").is_some()
        || record.get("vendor_id").is_some_and(|v| !v.is_null());
    if !has_vendor {
        return Err(CallError::Rejected(
            "either 'vendor' or 'vendor_id' is required".into(),
        ));
    }
    Ok(record)
}

/// The enrichment workflow for a cleaned record.
///
/// Pricing and catalog lookups run concurrently, their results are merged
/// into the record, then fees are estimated for the merged price.
#[must_use]
pub fn enrichment_workflow(record: &Record) -> Workflow {
    let asin = non_empty_str(record, "asin")
        .or_else(|| non_empty_str(record, "sku"))
        .unwrap_or_default()
        .to_string();
    let sources = Value::Array(vec![
        Value::from("GetCompetitivePricingForASIN"),
        Value::from("ItemLookup"),
    ]);
    Workflow::Sequence(vec![
        Workflow::fan_out(
            [
                Stage::new("GetCompetitivePricingForASIN").arg(asin.clone()),
                Stage::new("ItemLookup").arg(asin),
            ],
            Stage::new("updateListing")
                .arg(Value::Map(record.clone()))
                .kwarg("sources", sources),
        ),
        Stage::new("updateFbaFees").into(),
    ])
}

pub struct ImportAndEnrich;

#[async_trait]
impl OperationHandler for ImportAndEnrich {
    async fn call(&self, ctx: &OperationContext) -> Result<Value, CallError> {
        let record = clean_record(record_arg(ctx, 0)?)?;
        let submitter = ctx.require_submitter()?;
        // No explicit priority: the enrichment inherits this stage's.
        let handle = submitter.run(enrichment_workflow(&record), None);
        debug!(
            sku = non_empty_str(&record, "sku").unwrap_or_default(),
            task = %handle.id(),
            "enrichment submitted"
        );

        let mut out = Record::new();
        out.insert("record".into(), Value::Map(record));
        out.insert("task_id".into(), Value::from(handle.id().to_string()));
        Ok(Value::Map(out))
    }
}

// ---------------------------------------------------------------------------
// updateListing
// ---------------------------------------------------------------------------

/// Merges `sources` into `record`.
///
/// A source shaped `{"action", "results": {sku: {...}}}` is applied
/// according to its action. Any other map is merged field by field. Raw
/// payloads are kept under `raw.<source name>`, where the name comes from
/// `names` by position.
///
/// # Errors
///
/// Returns [`CallError::Rejected`] for a structured source with an unknown
/// action.
pub fn merge_sources(
    mut record: Record,
    sources: &[Value],
    names: &[Value],
) -> Result<Record, CallError> {
    let sku = non_empty_str(&record, "sku").unwrap_or_default().to_string();
    for (index, source) in sources.iter().enumerate() {
        let name = names
            .get(index)
            .and_then(Value::as_str)
            .map_or_else(|| format!("source{index}"), str::to_string);

        match source {
            Value::Map(fields) if fields.contains_key("action") && fields.contains_key("results") => {
                let action = fields
                    .get("action")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let Some(results) = fields.get("results").and_then(|r| r.get(&sku)) else {
                    debug!(action, sku = %sku, "no results for record, ignoring");
                    continue;
                };
                apply_api_results(&mut record, action, results)?;
            }
            Value::Map(fields) => {
                record.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Value::Null => {}
            raw => {
                let entry = record
                    .entry("raw".to_string())
                    .or_insert_with(|| Value::Map(Record::new()));
                if let Value::Map(raw_sources) = entry {
                    raw_sources.insert(name, raw.clone());
                }
            }
        }
    }
    Ok(record)
}

fn apply_api_results(record: &mut Record, action: &str, results: &Value) -> Result<(), CallError> {
    match action {
        "ItemLookup" => {
            if let Some(fields) = results.as_map() {
                record.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        "GetCompetitivePricingForASIN" => {
            let landed = results.get("landed_price").and_then(Value::as_f64);
            let listing = results.get("listing_price").and_then(Value::as_f64);
            let shipping = results.get("shipping").and_then(Value::as_f64);
            let price = landed.or_else(|| Some(listing? + shipping.unwrap_or(0.0)));
            if let Some(price) = price {
                record.insert("price".into(), Value::Float(price));
            }
            let offers = results.get("offers").cloned().unwrap_or_default();
            let data = record
                .entry("data".to_string())
                .or_insert_with(|| Value::Map(Record::new()));
            if let Value::Map(data) = data {
                data.insert("offers".into(), offers);
            }
        }
        "GetMyFeesEstimate" => {
            if let Some(price) = results.get("price") {
                record.insert("price".into(), price.clone());
            }
            if let Some(fees) = results.get("total_fees_estimate") {
                record.insert("market_fees".into(), fees.clone());
            }
        }
        other => {
            return Err(CallError::Rejected(format!("unrecognized API call: {other}")));
        }
    }
    Ok(())
}

pub struct UpdateListing;

#[async_trait]
impl OperationHandler for UpdateListing {
    async fn call(&self, ctx: &OperationContext) -> Result<Value, CallError> {
        let sources = match ctx.require_arg(0, "sources")? {
            Value::Array(items) => items.clone(),
            single => vec![single.clone()],
        };
        let record = record_arg(ctx, 1)?;
        let names = ctx
            .kwargs
            .get("sources")
            .and_then(Value::as_array)
            .unwrap_or_default();
        merge_sources(record, &sources, names).map(Value::Map)
    }
}

// ---------------------------------------------------------------------------
// updateFbaFees
// ---------------------------------------------------------------------------

pub struct UpdateFbaFees;

#[async_trait]
impl OperationHandler for UpdateFbaFees {
    async fn call(&self, ctx: &OperationContext) -> Result<Value, CallError> {
        let record = record_arg(ctx, 0)?;
        let asin = non_empty_str(&record, "asin")
            .or_else(|| non_empty_str(&record, "sku"))
            .map(str::to_string);
        let price = record.get("price").and_then(Value::as_f64);
        let (Some(asin), Some(price)) = (asin, price) else {
            warn!("record has no asin or price, skipping fee estimate");
            return Ok(Value::Map(record));
        };

        let request = TaskRequest::new("GetMyFeesEstimate")
            .arg(asin)
            .arg(price.to_string());
        let estimate = ctx
            .require_submitter()?
            .call(request)
            .await
            .map_err(|e| CallError::Dependency(e.to_string()))?;

        let names = [Value::from("GetMyFeesEstimate")];
        merge_sources(record, &[estimate], &names).map(Value::Map)
    }
}

// ---------------------------------------------------------------------------
// decodeReport
// ---------------------------------------------------------------------------

pub struct DecodeReport;

#[async_trait]
impl OperationHandler for DecodeReport {
    async fn call(&self, ctx: &OperationContext) -> Result<Value, CallError> {
        let tag = ctx
            .require_arg(0, "report_type")?
            .as_str()
            .ok_or_else(|| CallError::Rejected("report_type must be a string".into()))?;
        let body = ctx
            .require_arg(1, "body")?
            .as_str()
            .ok_or_else(|| CallError::Rejected("report body must be a string".into()))?;

        let kind = ReportKind::from_tag(tag).map_err(|e| CallError::Rejected(e.to_string()))?;
        let lines = kind
            .decode(body)
            .map_err(|e| CallError::Malformed(e.to_string()))?;
        debug!(report = %kind, lines = lines.len(), "report decoded");
        Ok(Value::Array(lines))
    }
}

// ---------------------------------------------------------------------------
// awaitReports
// ---------------------------------------------------------------------------

const REPORT_FINISHED: &[&str] = &["_DONE_", "_DONE_NO_DATA_"];
const REPORT_CANCELLED: &str = "_CANCELLED_";

pub struct AwaitReports;

#[async_trait]
impl OperationHandler for AwaitReports {
    async fn call(&self, ctx: &OperationContext) -> Result<Value, CallError> {
        if ctx.args.is_empty() {
            return Ok(Value::Array(Vec::new()));
        }
        let request = TaskRequest::new("GetReportRequestList")
            .arg(Value::Array(ctx.args.clone()))
            .use_cache(false);
        let response = ctx
            .require_submitter()?
            .call(request)
            .await
            .map_err(|e| CallError::Dependency(e.to_string()))?;

        let results = response
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| CallError::Malformed("report request list has no results".into()))?;

        let status_of = |r: &Value| r.get("status").and_then(Value::as_str).unwrap_or_default().to_string();
        let cancelled: Vec<String> = results
            .iter()
            .filter(|r| status_of(r) == REPORT_CANCELLED)
            .filter_map(|r| r.get("request_id").map(Value::to_param_string))
            .collect();
        if !cancelled.is_empty() {
            return Err(CallError::Rejected(format!(
                "reports cancelled: {}",
                cancelled.join(", ")
            )));
        }

        let unfinished = ctx.args.len().saturating_sub(
            results
                .iter()
                .filter(|r| REPORT_FINISHED.contains(&status_of(r).as_str()))
                .count(),
        );
        if unfinished > 0 {
            return Err(CallError::Dependency(format!(
                "{unfinished} report(s) still in progress"
            )));
        }
        Ok(Value::Array(results.to_vec()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
