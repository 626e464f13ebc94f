use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tierscope::aggregation::AggregationRequest;
use tierscope::auth::{ArboristClient, ResourceScope, ScopeBuilder};
use tierscope::backend::{EsClient, SearchBackend};
use tierscope::config::Config;
use tierscope::filter::FilterExpr;
use tierscope::schema::SchemaRegistry;
use tierscope::tier::{Accessibility, TieredAccessMediator};
use tierscope::QueryContext;
use tracing::{info, warn};

pub async fn connect(config: &Config) -> Result<QueryContext> {
    let backend = Arc::new(EsClient::new(
        &config.backend.endpoint,
        Duration::from_secs(config.backend.timeout_seconds),
    )?);
    backend
        .ping()
        .await
        .context("Search backend is not reachable")?;

    let registry = Arc::new(SchemaRegistry::new(
        config.indices.clone(),
        &config.aggregation.analyzed_suffix,
    ));
    let rebuilt = registry.refresh(backend.as_ref()).await?;
    info!("Loaded {} index schemas from {}", rebuilt, config.backend.endpoint);

    Ok(QueryContext::new(backend, registry, config))
}

async fn resolve_scope(ctx: &QueryContext, token: &str) -> Result<ResourceScope> {
    let policy = &ctx.config().policy;
    let oracle = ArboristClient::new(&policy.endpoint, Duration::from_secs(policy.timeout_seconds))?;
    let scope = ScopeBuilder::new(token).initialize(&oracle, ctx).await;
    if let Some(cause) = scope.degradation() {
        warn!("Continuing without access to any resource: {}", cause);
    }
    Ok(scope)
}

pub fn parse_filter(raw: Option<&str>) -> Result<Option<FilterExpr>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw).context("Filter is not valid JSON")?;
    Ok(FilterExpr::from_json(&value)?)
}

pub fn aggregation_request(
    field: &str,
    filter: Option<&str>,
    filter_self: bool,
) -> Result<AggregationRequest> {
    Ok(AggregationRequest {
        filter_self,
        ..AggregationRequest::new(field).with_filter(parse_filter(filter)?)
    })
}

pub fn fields(ctx: &QueryContext, index: &str) -> Result<Value> {
    let schema = ctx.schema(index)?;
    Ok(json!({
        "index": schema.index,
        "content_hash": schema.content_hash,
        "fields": schema.fields(),
    }))
}

pub fn compile(ctx: &QueryContext, index: &str, filter: &str, sort: Option<&str>) -> Result<Value> {
    let expr = parse_filter(Some(filter))?;
    let query = ctx.compile_filter(index, expr.as_ref(), None, true, None)?;
    let sort = match sort {
        Some(raw) => {
            let sorting: Value = serde_json::from_str(raw).context("Sort is not valid JSON")?;
            ctx.compile_sort(index, &sorting)?
        }
        None => None,
    };
    Ok(json!({ "query": query, "sort": sort }))
}

pub async fn numeric(
    ctx: &QueryContext,
    token: &str,
    index: &str,
    req: &AggregationRequest,
    accessibility: Accessibility,
) -> Result<Value> {
    let scope = resolve_scope(ctx, token).await?;
    let buckets = TieredAccessMediator::new(ctx, &scope)
        .numeric_aggregation(index, req, accessibility)
        .await?;
    Ok(json!(buckets))
}

pub async fn text(
    ctx: &QueryContext,
    token: &str,
    index: &str,
    req: &AggregationRequest,
    accessibility: Accessibility,
) -> Result<Value> {
    let scope = resolve_scope(ctx, token).await?;
    let buckets = TieredAccessMediator::new(ctx, &scope)
        .text_aggregation(index, req, accessibility)
        .await?;
    Ok(json!(buckets))
}

pub async fn count(
    ctx: &QueryContext,
    token: &str,
    index: &str,
    filter: Option<&str>,
    accessibility: Accessibility,
) -> Result<Value> {
    let filter = parse_filter(filter)?;
    let scope = resolve_scope(ctx, token).await?;
    let total = TieredAccessMediator::new(ctx, &scope)
        .total_count(index, filter.as_ref(), accessibility)
        .await?;
    Ok(json!({ "index": index, "count": total }))
}

/// Fails instead of printing empty sets when the scope could not be resolved.
pub async fn scope(ctx: &QueryContext, token: &str) -> Result<Value> {
    let scope = resolve_scope(ctx, token).await?;
    if let Some(cause) = scope.degradation() {
        return Err(cause.clone().into());
    }
    Ok(json!({
        "accessible": scope.accessible(),
        "unaccessible": scope.unaccessible(),
    }))
}
