//! Raw document retrieval and total counts.

use crate::context::QueryContext;
use crate::error::{QueryError, QueryResult};
use crate::filter::FilterExpr;
use serde_json::{json, Value};

const DEFAULT_PAGE: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct RawDataRequest {
    pub filter: Option<FilterExpr>,
    /// `_source` fields to return; empty returns whole documents.
    pub fields: Vec<String>,
    pub sort: Value,
    pub offset: usize,
    pub size: Option<usize>,
    /// Scope restriction ANDed at the top level.
    pub scope: Option<FilterExpr>,
}

pub async fn raw_data(
    ctx: &QueryContext,
    index: &str,
    req: &RawDataRequest,
) -> QueryResult<Vec<Value>> {
    let query = ctx.compile_filter(index, req.filter.as_ref(), None, true, req.scope.as_ref())?;
    let sort = ctx.compile_sort(index, &req.sort)?;

    let mut body = json!({
        "from": req.offset,
        "size": req.size.unwrap_or(DEFAULT_PAGE),
    });
    if let Some(query) = query {
        body["query"] = query;
    }
    if let Some(sort) = sort {
        body["sort"] = json!(sort);
    }
    if !req.fields.is_empty() {
        body["_source"] = json!(req.fields);
    }

    let response = ctx.search(index, body).await?;
    let hits = response
        .get("hits")
        .and_then(|h| h.get("hits"))
        .and_then(Value::as_array)
        .ok_or_else(|| QueryError::malformed("search response without hits"))?;

    Ok(hits
        .iter()
        .map(|hit| hit.get("_source").cloned().unwrap_or(Value::Null))
        .collect())
}

pub async fn total_count(
    ctx: &QueryContext,
    index: &str,
    filter: Option<&FilterExpr>,
    scope: Option<&FilterExpr>,
) -> QueryResult<i64> {
    let query = ctx.compile_filter(index, filter, None, true, scope)?;
    let mut body = json!({ "size": 0, "track_total_hits": true });
    if let Some(query) = query {
        body["query"] = query;
    }

    let response = ctx.search(index, body).await?;
    let total = response
        .get("hits")
        .and_then(|h| h.get("total"))
        .ok_or_else(|| QueryError::malformed("search response without total"))?;
    // Older clusters report a bare number.
    total
        .get("value")
        .unwrap_or(total)
        .as_i64()
        .ok_or_else(|| QueryError::malformed("non-numeric total"))
}
