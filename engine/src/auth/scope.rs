use super::{accessible_resources, PolicyOracle};
use crate::aggregation::{collect_terms, TermsQuery};
use crate::context::QueryContext;
use crate::error::{QueryError, QueryResult};
use crate::filter::FilterExpr;
use crate::tier::Accessibility;
use futures::future::join_all;
use std::collections::BTreeSet;

/// Resource key standing for documents without a resource path. Nobody can
/// be granted it, so those documents are always out of scope.
pub const UNOWNED: &str = "__unowned__";

/// Uninitialized scope for one caller credential.
pub struct ScopeBuilder {
    token: String,
}

impl std::fmt::Debug for ScopeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeBuilder").finish_non_exhaustive()
    }
}

impl ScopeBuilder {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Resolves the caller's grants and every resource path present in the
    /// configured indices. Any failure yields a degraded scope with no access.
    pub async fn initialize(self, oracle: &dyn PolicyOracle, ctx: &QueryContext) -> ResourceScope {
        let auth_field = ctx.auth_field().to_string();

        let mapping = match oracle.auth_mapping(&self.token).await {
            Ok(mapping) => mapping,
            Err(e) => {
                tracing::warn!("Policy lookup failed, caller gets no access: {:#}", e);
                let cause = QueryError::OracleUnavailable(format!("{:#}", e));
                return ResourceScope::degraded(auth_field, cause);
            }
        };
        let mut accessible = accessible_resources(&mapping, &ctx.config().policy.service);
        accessible.remove(UNOWNED);

        let indices = ctx.config().index_names();
        let field = auth_field.as_str();
        let lookups = indices.iter().map(|index| async move {
            let query = TermsQuery {
                field,
                filter: None,
                exclude_field: None,
                filter_self: true,
                extra: None,
                missing_key: Some(UNOWNED),
            };
            collect_terms(ctx, index, &query).await
        });
        let results = join_all(lookups).await;

        let mut unaccessible = BTreeSet::new();
        for (index, result) in indices.iter().zip(results) {
            match result {
                Ok(buckets) => unaccessible.extend(
                    buckets
                        .into_iter()
                        .map(|b| b.key)
                        .filter(|key| !accessible.contains(key)),
                ),
                Err(e) => {
                    tracing::warn!(
                        "Failed to list resources of {}, caller gets no access: {}",
                        index,
                        e
                    );
                    return ResourceScope::degraded(auth_field, e);
                }
            }
        }

        tracing::info!(
            "Resolved scope: {} accessible, {} unaccessible resources",
            accessible.len(),
            unaccessible.len()
        );
        ResourceScope {
            accessible,
            unaccessible,
            auth_field,
            degraded: None,
        }
    }
}

/// Request-scoped view of what the caller may read.
#[derive(Debug, Clone)]
pub struct ResourceScope {
    accessible: BTreeSet<String>,
    unaccessible: BTreeSet<String>,
    auth_field: String,
    degraded: Option<QueryError>,
}

impl ResourceScope {
    fn degraded(auth_field: String, cause: QueryError) -> Self {
        Self {
            accessible: BTreeSet::new(),
            unaccessible: BTreeSet::new(),
            auth_field,
            degraded: Some(cause),
        }
    }

    pub fn accessible(&self) -> &BTreeSet<String> {
        &self.accessible
    }

    pub fn unaccessible(&self) -> &BTreeSet<String> {
        &self.unaccessible
    }

    /// True when initialization failed and both sets are empty.
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    /// Why initialization failed, if it did.
    pub fn degradation(&self) -> Option<&QueryError> {
        self.degraded.as_ref()
    }

    /// Resource paths matched by `filter` that the caller cannot read.
    pub async fn out_of_scope_resources(
        &self,
        ctx: &QueryContext,
        index: &str,
        filter: Option<&FilterExpr>,
        exclude_field: Option<&str>,
        filter_self: bool,
    ) -> QueryResult<Vec<String>> {
        let query = TermsQuery {
            field: &self.auth_field,
            filter,
            exclude_field,
            filter_self,
            extra: None,
            missing_key: Some(UNOWNED),
        };
        let buckets = collect_terms(ctx, index, &query).await?;
        Ok(buckets
            .into_iter()
            .map(|b| b.key)
            .filter(|key| !self.accessible.contains(key))
            .collect())
    }

    pub fn accessible_membership(&self) -> FilterExpr {
        self.membership(&self.accessible)
    }

    pub fn unaccessible_membership(&self) -> FilterExpr {
        self.membership(&self.unaccessible)
    }

    fn membership(&self, resources: &BTreeSet<String>) -> FilterExpr {
        let listed = FilterExpr::in_list(
            &self.auth_field,
            resources.iter().filter(|r| r.as_str() != UNOWNED).cloned(),
        );
        if resources.contains(UNOWNED) {
            FilterExpr::Or(vec![listed, FilterExpr::missing(&self.auth_field)])
        } else {
            listed
        }
    }

    pub fn apply_accessible_filter(&self, filter: Option<FilterExpr>) -> FilterExpr {
        FilterExpr::and_optional(filter, self.accessible_membership())
    }

    pub fn apply_unaccessible_filter(&self, filter: Option<FilterExpr>) -> FilterExpr {
        FilterExpr::and_optional(filter, self.unaccessible_membership())
    }

    /// `None` means unrestricted.
    pub fn default_filter(&self, accessibility: Accessibility) -> Option<FilterExpr> {
        match accessibility {
            Accessibility::All => None,
            Accessibility::Accessible => Some(self.apply_accessible_filter(None)),
            Accessibility::Unaccessible => Some(self.apply_unaccessible_filter(None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Grant;
    use crate::testing::{context, doc, test_config, MemoryBackend, StaticOracle};
    use crate::tier::AccessLevel;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn seeded() -> (Arc<MemoryBackend>, QueryContext) {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_docs(
            "subject",
            vec![
                doc("/programs/a", Some("female"), 30.0),
                doc("/programs/b", Some("male"), 20.0),
                doc("/programs/c", Some("female"), 40.0),
                json!({"gender": "male", "age": 50.0}),
            ],
        );
        let ctx = context(backend.clone(), &test_config(AccessLevel::Regular));
        (backend, ctx)
    }

    #[tokio::test]
    async fn test_initialize_splits_resources() {
        let (_, ctx) = seeded();
        let oracle = StaticOracle::granting(&["/programs/a", "/programs/z"]);
        let scope = ScopeBuilder::new("token").initialize(&oracle, &ctx).await;

        assert!(!scope.is_degraded());
        assert_eq!(oracle.calls(), 1);
        assert_eq!(
            scope.accessible().iter().collect::<Vec<_>>(),
            vec!["/programs/a", "/programs/z"]
        );
        assert_eq!(
            scope.unaccessible().iter().collect::<Vec<_>>(),
            vec!["/programs/b", "/programs/c", UNOWNED]
        );
    }

    #[tokio::test]
    async fn test_only_read_grants_on_the_service_count() {
        let (_, ctx) = seeded();
        let grant = |service: &str, method: &str| Grant {
            service: service.to_string(),
            method: method.to_string(),
        };
        let oracle = StaticOracle::with_grants(HashMap::from([
            ("/programs/a".to_string(), vec![grant("guppy", "create")]),
            ("/programs/b".to_string(), vec![grant("other", "read")]),
            ("/programs/c".to_string(), vec![grant("*", "*")]),
        ]));
        let scope = ScopeBuilder::new("token").initialize(&oracle, &ctx).await;
        assert_eq!(
            scope.accessible().iter().collect::<Vec<_>>(),
            vec!["/programs/c"]
        );
        assert_eq!(
            scope.unaccessible().iter().collect::<Vec<_>>(),
            vec!["/programs/a", "/programs/b", UNOWNED]
        );
    }

    #[tokio::test]
    async fn test_unowned_resource_cannot_be_granted() {
        let (_, ctx) = seeded();
        let oracle = StaticOracle::granting(&["/programs/a", UNOWNED]);
        let scope = ScopeBuilder::new("token").initialize(&oracle, &ctx).await;
        assert!(!scope.accessible().contains(UNOWNED));
        assert!(scope.unaccessible().contains(UNOWNED));
    }

    #[tokio::test]
    async fn test_oracle_failure_degrades_to_no_access() {
        let (_, ctx) = seeded();
        let scope = ScopeBuilder::new("token")
            .initialize(&StaticOracle::failing(), &ctx)
            .await;
        assert!(scope.is_degraded());
        assert!(scope.accessible().is_empty());
        assert!(scope.unaccessible().is_empty());
        let cause = scope.degradation().unwrap();
        assert!(matches!(cause, QueryError::OracleUnavailable(_)));
        assert_eq!(cause.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        assert!(cause.to_string().contains("policy service timed out"));
    }

    #[tokio::test]
    async fn test_backend_failure_degrades_to_no_access() {
        let (backend, ctx) = seeded();
        backend.fail_searches(true);
        let scope = ScopeBuilder::new("token")
            .initialize(&StaticOracle::granting(&["/programs/a"]), &ctx)
            .await;
        assert!(scope.is_degraded());
        assert!(scope.accessible().is_empty());
        assert!(matches!(
            scope.degradation(),
            Some(QueryError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_out_of_scope_reflects_filter() {
        let (_, ctx) = seeded();
        let scope = ScopeBuilder::new("token")
            .initialize(&StaticOracle::granting(&["/programs/a"]), &ctx)
            .await;

        let female = FilterExpr::from_json(&json!({"=": {"gender": "female"}})).unwrap();
        let out = scope
            .out_of_scope_resources(&ctx, "subject", female.as_ref(), None, true)
            .await
            .unwrap();
        assert_eq!(out, vec!["/programs/c"]);

        let male = FilterExpr::from_json(&json!({"=": {"gender": "male"}})).unwrap();
        let out = scope
            .out_of_scope_resources(&ctx, "subject", male.as_ref(), None, true)
            .await
            .unwrap();
        assert_eq!(out, vec!["/programs/b".to_string(), UNOWNED.to_string()]);

        let only_a = FilterExpr::from_json(&json!({"in": {"auth_resource_path": ["/programs/a"]}}))
            .unwrap();
        let out = scope
            .out_of_scope_resources(&ctx, "subject", only_a.as_ref(), None, true)
            .await
            .unwrap();
        assert!(out.is_empty());

        // Dropping the field's own leaf widens the view back to every resource.
        let out = scope
            .out_of_scope_resources(
                &ctx,
                "subject",
                only_a.as_ref(),
                Some("auth_resource_path"),
                false,
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 3);
    }

    #[tokio::test]
    async fn test_default_filter() {
        let (_, ctx) = seeded();
        let scope = ScopeBuilder::new("nobody")
            .initialize(&StaticOracle::granting(&[]), &ctx)
            .await;

        assert_eq!(scope.default_filter(Accessibility::All), None);
        let accessible = scope.default_filter(Accessibility::Accessible).unwrap();
        assert_eq!(
            ctx.compile_filter("subject", Some(&accessible), None, true, None)
                .unwrap(),
            Some(json!({"terms": {"auth_resource_path": []}}))
        );
        let unaccessible = scope.default_filter(Accessibility::Unaccessible).unwrap();
        assert_eq!(
            unaccessible,
            FilterExpr::Or(vec![
                FilterExpr::in_list(
                    "auth_resource_path",
                    ["/programs/a", "/programs/b", "/programs/c"]
                ),
                FilterExpr::missing("auth_resource_path"),
            ])
        );
    }

    #[test]
    fn test_apply_filters_and_with_base() {
        let scope = ResourceScope {
            accessible: BTreeSet::from(["/programs/a".to_string()]),
            unaccessible: BTreeSet::from(["/programs/b".to_string()]),
            auth_field: "auth_resource_path".to_string(),
            degraded: None,
        };
        let base = FilterExpr::eq("gender", "female");
        assert_eq!(
            scope.apply_accessible_filter(Some(base.clone())),
            FilterExpr::And(vec![
                base,
                FilterExpr::in_list("auth_resource_path", ["/programs/a"])
            ])
        );
        assert_eq!(
            scope.apply_unaccessible_filter(None),
            FilterExpr::in_list("auth_resource_path", ["/programs/b"])
        );
    }
}
