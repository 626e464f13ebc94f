use super::{descriptor, unwrap_nested_agg, wrap_nested_agg, AggregationRequest, StatBucket};
use crate::context::QueryContext;
use crate::error::{QueryError, QueryResult};
use crate::filter::{all_of, range, wrap_nested};
use crate::schema::{FieldDescriptor, FieldKind};
use serde_json::{json, Value};

const STATS_AGG: &str = "field_stats";
const HISTOGRAM_AGG: &str = "field_histogram";
const BIN_STATS_AGG: &str = "bin_stats";

/// Bin layout of a numeric aggregation, fixed before any bucket is computed
/// so a second run under another filter yields the same bucket keys.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericPlan {
    Stats,
    Histogram { start: Option<f64>, step: f64 },
    /// Bin count requested over a range with no data.
    Empty,
}

pub async fn numeric_aggregation(
    ctx: &QueryContext,
    index: &str,
    req: &AggregationRequest,
) -> QueryResult<Vec<StatBucket>> {
    let plan = plan_numeric(ctx, index, req).await?;
    run_numeric(ctx, index, req, plan).await
}

pub(crate) async fn plan_numeric(
    ctx: &QueryContext,
    index: &str,
    req: &AggregationRequest,
) -> QueryResult<NumericPlan> {
    req.validate()?;
    match (req.range_step, req.bin_count) {
        (Some(step), _) => Ok(NumericPlan::Histogram {
            start: req.range_start,
            step,
        }),
        (None, Some(bins)) => {
            let global = stats(ctx, index, req).await?;
            let start = match req.range_start.or(global.min) {
                Some(start) => start,
                None => return Ok(NumericPlan::Empty),
            };
            let end = match req.range_end.or(global.max.map(|max| max + 1.0)) {
                Some(end) => end,
                None => return Ok(NumericPlan::Empty),
            };
            let step = (end - start) / bins as f64;
            if step <= 0.0 {
                return Ok(NumericPlan::Empty);
            }
            tracing::debug!(
                "Derived histogram step {} from [{}, {}) over {} bins",
                step,
                start,
                end,
                bins
            );
            Ok(NumericPlan::Histogram {
                start: Some(start),
                step,
            })
        }
        (None, None) => Ok(NumericPlan::Stats),
    }
}

pub(crate) async fn run_numeric(
    ctx: &QueryContext,
    index: &str,
    req: &AggregationRequest,
    plan: NumericPlan,
) -> QueryResult<Vec<StatBucket>> {
    match plan {
        NumericPlan::Stats => Ok(vec![stats(ctx, index, req).await?]),
        NumericPlan::Histogram { start, step } => {
            histogram(ctx, index, req, start, step).await
        }
        NumericPlan::Empty => Ok(Vec::new()),
    }
}

/// Global statistics; the key echoes caller bounds and falls back to the
/// observed min/max.
pub async fn stats(
    ctx: &QueryContext,
    index: &str,
    req: &AggregationRequest,
) -> QueryResult<StatBucket> {
    req.validate()?;
    let schema = ctx.schema(index)?;
    let field = numeric_descriptor(descriptor(&schema, &req.field)?)?;
    let query = bounded_query(ctx, index, req, field, req.range_start)?;

    let mut body = json!({
        "size": 0,
        "aggs": wrap_nested_agg(
            &field.nested_path,
            STATS_AGG,
            json!({ "stats": { "field": field.name } }),
        ),
    });
    if let Some(query) = query {
        body["query"] = query;
    }

    let response = ctx.search(index, body).await?;
    let raw = unwrap_nested_agg(&response, &field.nested_path, STATS_AGG)?;
    let mut bucket = stat_bucket(raw)?;
    bucket.key = (req.range_start.or(bucket.min), req.range_end.or(bucket.max));
    Ok(bucket)
}

pub async fn histogram_by_step(
    ctx: &QueryContext,
    index: &str,
    req: &AggregationRequest,
    step: f64,
) -> QueryResult<Vec<StatBucket>> {
    let req = AggregationRequest {
        range_step: Some(step),
        bin_count: None,
        ..req.clone()
    };
    numeric_aggregation(ctx, index, &req).await
}

pub async fn histogram_by_count(
    ctx: &QueryContext,
    index: &str,
    req: &AggregationRequest,
    bins: i64,
) -> QueryResult<Vec<StatBucket>> {
    let req = AggregationRequest {
        range_step: None,
        bin_count: Some(bins),
        ..req.clone()
    };
    numeric_aggregation(ctx, index, &req).await
}

async fn histogram(
    ctx: &QueryContext,
    index: &str,
    req: &AggregationRequest,
    start: Option<f64>,
    step: f64,
) -> QueryResult<Vec<StatBucket>> {
    let schema = ctx.schema(index)?;
    let field = numeric_descriptor(descriptor(&schema, &req.field)?)?;
    let query = bounded_query(ctx, index, req, field, start)?;

    let mut histogram = json!({ "field": field.name, "interval": step });
    if let Some(start) = start {
        histogram["offset"] = json!(start.rem_euclid(step));
    }
    let agg = json!({
        "histogram": histogram,
        "aggs": { BIN_STATS_AGG: { "stats": { "field": field.name } } },
    });

    let mut body = json!({
        "size": 0,
        "aggs": wrap_nested_agg(&field.nested_path, HISTOGRAM_AGG, agg),
    });
    if let Some(query) = query {
        body["query"] = query;
    }

    let response = ctx.search(index, body).await?;
    let raw = unwrap_nested_agg(&response, &field.nested_path, HISTOGRAM_AGG)?;
    let buckets = raw
        .get("buckets")
        .and_then(Value::as_array)
        .ok_or_else(|| QueryError::malformed("histogram without buckets"))?;

    buckets
        .iter()
        .map(|bucket| {
            let key = bucket
                .get("key")
                .and_then(Value::as_f64)
                .ok_or_else(|| QueryError::malformed("histogram bucket without key"))?;
            let mut stat = match bucket.get(BIN_STATS_AGG) {
                Some(sub) => stat_bucket(sub)?,
                None => return Err(QueryError::malformed("histogram bucket without stats")),
            };
            stat.key = (Some(key), Some(key + step));
            stat.count = doc_count(bucket)?;
            Ok(stat)
        })
        .collect()
}

fn numeric_descriptor(field: &FieldDescriptor) -> QueryResult<&FieldDescriptor> {
    match field.kind {
        FieldKind::Numeric => Ok(field),
        FieldKind::Text => Err(QueryError::InvalidAggregationArgs(format!(
            "Numeric aggregation needs a numeric field, {} is text",
            field.name
        ))),
    }
}

/// Compiled filter plus independent `gte start` / `lt end` sibling clauses.
fn bounded_query(
    ctx: &QueryContext,
    index: &str,
    req: &AggregationRequest,
    field: &FieldDescriptor,
    start: Option<f64>,
) -> QueryResult<Option<Value>> {
    let base = ctx.compile_filter(
        index,
        req.filter.as_ref(),
        Some(&req.field),
        req.filter_self,
        req.default_auth_filter.as_ref(),
    )?;

    let mut bounds = Vec::new();
    if let Some(start) = start {
        bounds.push(range(&field.name, "gte", json!(start)));
    }
    if let Some(end) = req.range_end {
        bounds.push(range(&field.name, "lt", json!(end)));
    }

    let mut clauses: Vec<Value> = base.into_iter().collect();
    if field.nested_path.is_empty() {
        clauses.extend(bounds);
    } else if !bounds.is_empty() {
        // Both bounds must hold for the same nested element.
        let bounded = if bounds.len() == 1 {
            bounds.remove(0)
        } else {
            all_of(bounds)
        };
        clauses.push(wrap_nested(&field.nested_path, bounded));
    }

    Ok(match clauses.len() {
        0 => None,
        1 => clauses.pop(),
        _ => Some(all_of(clauses)),
    })
}

fn stat_bucket(raw: &Value) -> QueryResult<StatBucket> {
    let value = |name: &str| raw.get(name).and_then(Value::as_f64);
    let count = raw
        .get("count")
        .and_then(Value::as_i64)
        .ok_or_else(|| QueryError::malformed("stats without count"))?;
    Ok(StatBucket {
        key: (value("min"), value("max")),
        min: value("min"),
        max: value("max"),
        avg: value("avg"),
        sum: if count == 0 { None } else { value("sum") },
        count,
    })
}

fn doc_count(bucket: &Value) -> QueryResult<i64> {
    bucket
        .get("doc_count")
        .and_then(Value::as_i64)
        .ok_or_else(|| QueryError::malformed("bucket without doc_count"))
}
