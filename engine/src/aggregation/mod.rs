//! Numeric statistics/histograms and paginated text term counts.

mod numeric;
mod text;

pub use numeric::{histogram_by_count, histogram_by_step, numeric_aggregation, stats, NumericPlan};
pub(crate) use numeric::{plan_numeric, run_numeric};
pub use text::text_aggregation;
pub(crate) use text::{collect_terms, TermsQuery};

use crate::error::{QueryError, QueryResult};
use crate::filter::FilterExpr;
use crate::schema::{FieldDescriptor, IndexSchema};
use serde::Serialize;
use serde_json::{json, Value};

const NESTED_AGG: &str = "nested_scope";

#[derive(Debug, Clone, Default)]
pub struct AggregationRequest {
    pub field: String,
    pub filter: Option<FilterExpr>,
    pub filter_self: bool,
    pub range_start: Option<f64>,
    pub range_end: Option<f64>,
    pub range_step: Option<f64>,
    pub bin_count: Option<i64>,
    /// Scope restriction ANDed at the top level; never dropped by `filter_self`.
    pub default_auth_filter: Option<FilterExpr>,
}

impl AggregationRequest {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
            filter_self: true,
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: Option<FilterExpr>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_range(mut self, start: Option<f64>, end: Option<f64>) -> Self {
        self.range_start = start;
        self.range_end = end;
        self
    }

    pub fn validate(&self) -> QueryResult<()> {
        if self.range_step.is_some() && self.bin_count.is_some() {
            return Err(QueryError::InvalidAggregationArgs(
                "rangeStep and binCount cannot be used together".to_string(),
            ));
        }
        if let Some(step) = self.range_step {
            if !(step > 0.0) {
                return Err(QueryError::InvalidAggregationArgs(format!(
                    "rangeStep must be positive, got {}",
                    step
                )));
            }
        }
        if let Some(bins) = self.bin_count {
            if bins <= 0 {
                return Err(QueryError::InvalidAggregationArgs(format!(
                    "binCount must be positive, got {}",
                    bins
                )));
            }
        }
        if let (Some(start), Some(end)) = (self.range_start, self.range_end) {
            if start > end {
                return Err(QueryError::InvalidAggregationArgs(format!(
                    "rangeStart {} is greater than rangeEnd {}",
                    start, end
                )));
            }
        }
        Ok(())
    }
}

/// Global statistics or one histogram bin; `key` is `[lower, upper]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatBucket {
    pub key: (Option<f64>, Option<f64>),
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub sum: Option<f64>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TermBucket {
    pub key: String,
    pub count: i64,
}

impl TermBucket {
    pub fn new(key: impl Into<String>, count: i64) -> Self {
        Self {
            key: key.into(),
            count,
        }
    }
}

fn descriptor<'s>(schema: &'s IndexSchema, field: &str) -> QueryResult<&'s FieldDescriptor> {
    schema.field(field).ok_or_else(|| {
        QueryError::InvalidAggregationArgs(format!(
            "Unknown field {} for index {}",
            field, schema.index
        ))
    })
}

/// Wraps a named aggregation in one nested scope per enclosing path,
/// outermost first.
fn wrap_nested_agg(nested_path: &[String], name: &str, agg: Value) -> Value {
    nested_path
        .iter()
        .rev()
        .fold(json!({ name: agg }), |inner, path| {
            json!({ NESTED_AGG: { "nested": { "path": path }, "aggs": inner } })
        })
}

fn unwrap_nested_agg<'r>(
    response: &'r Value,
    nested_path: &[String],
    name: &str,
) -> QueryResult<&'r Value> {
    let mut current = response
        .get("aggregations")
        .ok_or_else(|| QueryError::malformed("missing aggregations"))?;
    for _ in nested_path {
        current = current
            .get(NESTED_AGG)
            .ok_or_else(|| QueryError::malformed("missing nested aggregation scope"))?;
    }
    current
        .get(name)
        .ok_or_else(|| QueryError::malformed(&format!("missing aggregation {}", name)))
}
