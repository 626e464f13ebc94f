//! Explicit per-process query context handed to every operation.

use crate::backend::SearchBackend;
use crate::config::Config;
use crate::error::{QueryError, QueryResult};
use crate::filter::{FilterCompiler, FilterExpr};
use crate::schema::{IndexSchema, SchemaRegistry};
use crate::sort::SortCompiler;
use crate::tier::AccessLevel;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct QueryContext {
    backend: Arc<dyn SearchBackend>,
    schemas: Arc<SchemaRegistry>,
    config: Arc<Config>,
}

impl QueryContext {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        schemas: Arc<SchemaRegistry>,
        config: &Config,
    ) -> Self {
        Self {
            backend,
            schemas,
            config: Arc::new(config.clone()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn schema(&self, index: &str) -> QueryResult<Arc<IndexSchema>> {
        if self.config.index(index).is_none() {
            return Err(QueryError::InvalidFilter(format!("Unknown index {}", index)));
        }
        self.schemas.get(index).ok_or_else(|| {
            tracing::error!("Index {} is configured but its mapping is not loaded", index);
            QueryError::Internal(format!("Mapping for index {} is not loaded", index))
        })
    }

    pub fn level(&self, index: &str) -> Option<AccessLevel> {
        self.config.effective_level(index)
    }

    pub fn auth_field(&self) -> &str {
        &self.config.aggregation.auth_field
    }

    /// Term standing in for documents that lack a field, when aliasing is on.
    pub fn missing_alias(&self) -> Option<&str> {
        let agg = &self.config.aggregation;
        agg.include_missing.then_some(agg.missing_data_alias.as_str())
    }

    pub fn page_size(&self) -> usize {
        self.config.aggregation.page_size
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.aggregation.timeout_seconds)
    }

    pub fn compile_filter(
        &self,
        index: &str,
        expr: Option<&FilterExpr>,
        exclude_field: Option<&str>,
        filter_self: bool,
        extra: Option<&FilterExpr>,
    ) -> QueryResult<Option<Value>> {
        let schema = self.schema(index)?;
        let compiled = FilterCompiler::new(
            &schema,
            self.missing_alias(),
            &self.config.aggregation.analyzed_suffix,
        )
        .compile(expr, exclude_field, filter_self, extra)?;
        tracing::debug!(
            "Compiled filter for {}: {}",
            index,
            compiled.as_ref().map(|v| v.to_string()).unwrap_or_default()
        );
        Ok(compiled)
    }

    pub fn compile_sort(&self, index: &str, sorting: &Value) -> QueryResult<Option<Vec<Value>>> {
        let schema = self.schema(index)?;
        SortCompiler::new(&schema).compile(sorting)
    }

    pub(crate) async fn search(&self, index: &str, body: Value) -> QueryResult<Value> {
        self.backend
            .search(index, body)
            .await
            .map_err(QueryError::backend)
    }
}
