use super::{descriptor, unwrap_nested_agg, wrap_nested_agg, AggregationRequest, TermBucket};
use crate::context::QueryContext;
use crate::error::{QueryError, QueryResult};
use crate::filter::FilterExpr;
use serde_json::{json, Value};
use tokio::time::timeout;

const TERMS_AGG: &str = "field_terms";
const TERMS_SOURCE: &str = "term";

/// One composite-terms enumeration over `field`.
pub(crate) struct TermsQuery<'a> {
    pub field: &'a str,
    pub filter: Option<&'a FilterExpr>,
    pub exclude_field: Option<&'a str>,
    pub filter_self: bool,
    pub extra: Option<&'a FilterExpr>,
    /// Key reporting documents that lack the field; `None` drops them.
    pub missing_key: Option<&'a str>,
}

/// Term counts sorted by descending count, with the missing-data bucket last.
pub async fn text_aggregation(
    ctx: &QueryContext,
    index: &str,
    req: &AggregationRequest,
) -> QueryResult<Vec<TermBucket>> {
    let query = TermsQuery {
        field: &req.field,
        filter: req.filter.as_ref(),
        exclude_field: Some(&req.field),
        filter_self: req.filter_self,
        extra: req.default_auth_filter.as_ref(),
        missing_key: ctx.missing_alias(),
    };
    collect_terms(ctx, index, &query).await
}

pub(crate) async fn collect_terms(
    ctx: &QueryContext,
    index: &str,
    query: &TermsQuery<'_>,
) -> QueryResult<Vec<TermBucket>> {
    let limit = ctx.timeout();
    match timeout(limit, paginate(ctx, index, query)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(
                "Text aggregation on {}.{} timed out after {:?}",
                index,
                query.field,
                limit
            );
            Err(QueryError::BackendUnavailable(format!(
                "Text aggregation on {} timed out",
                query.field
            )))
        }
    }
}

async fn paginate(
    ctx: &QueryContext,
    index: &str,
    query: &TermsQuery<'_>,
) -> QueryResult<Vec<TermBucket>> {
    let schema = ctx.schema(index)?;
    let field = descriptor(&schema, query.field)?;
    let compiled = ctx.compile_filter(
        index,
        query.filter,
        query.exclude_field,
        query.filter_self,
        query.extra,
    )?;
    let page_size = ctx.page_size();
    let alias = query.missing_key;

    let mut buckets = Vec::new();
    let mut missing: Option<i64> = None;
    let mut after: Option<Value> = None;
    let mut pages = 0;

    loop {
        let mut composite = json!({
            "size": page_size,
            "sources": [{
                TERMS_SOURCE: { "terms": { "field": field.name, "missing_bucket": true } }
            }],
        });
        if let Some(after) = &after {
            composite["after"] = after.clone();
        }
        let mut body = json!({
            "size": 0,
            "aggs": wrap_nested_agg(
                &field.nested_path,
                TERMS_AGG,
                json!({ "composite": composite }),
            ),
        });
        if let Some(compiled) = &compiled {
            body["query"] = compiled.clone();
        }

        let response = ctx.search(index, body).await?;
        let raw = unwrap_nested_agg(&response, &field.nested_path, TERMS_AGG)?;
        let page = raw
            .get("buckets")
            .and_then(Value::as_array)
            .ok_or_else(|| QueryError::malformed("composite aggregation without buckets"))?;
        pages += 1;

        for bucket in page {
            let count = bucket
                .get("doc_count")
                .and_then(Value::as_i64)
                .ok_or_else(|| QueryError::malformed("bucket without doc_count"))?;
            let key = match bucket.get("key").and_then(|k| k.get(TERMS_SOURCE)) {
                Some(Value::Null) | None => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
            };
            match (key, alias) {
                (None, Some(_)) => *missing.get_or_insert(0) += count,
                (None, None) => {}
                (Some(key), Some(alias)) if key == alias => *missing.get_or_insert(0) += count,
                (Some(key), _) => buckets.push(TermBucket::new(key, count)),
            }
        }

        if page.len() < page_size {
            break;
        }
        match raw.get("after_key") {
            Some(next) if !next.is_null() => after = Some(next.clone()),
            _ => break,
        }
    }

    tracing::debug!(
        "Collected {} terms for {}.{} in {} pages",
        buckets.len(),
        index,
        field.name,
        pages
    );

    // Stable: equal counts keep backend order.
    buckets.sort_by(|a, b| b.count.cmp(&a.count));
    if let (Some(count), Some(alias)) = (missing, alias) {
        buckets.push(TermBucket::new(alias, count));
    }
    Ok(buckets)
}
