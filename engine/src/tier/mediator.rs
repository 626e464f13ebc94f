use super::{AccessLevel, Accessibility, RedactionPolicy};
use crate::aggregation::{
    self, plan_numeric, run_numeric, AggregationRequest, StatBucket, TermBucket,
};
use crate::auth::ResourceScope;
use crate::context::QueryContext;
use crate::error::{QueryError, QueryResult};
use crate::filter::FilterExpr;
use crate::search::{self, RawDataRequest};
use futures::future::try_join;
use serde_json::Value;
use std::future::Future;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    PassThrough,
    AccessibleOnly,
    UnaccessibleOnly,
    AllWithRedaction,
}

/// What to run for one request: the scope restriction ANDed at the top
/// level, and the filter of the shadow run when counts need redaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub outcome: Outcome,
    pub scope_filter: Option<FilterExpr>,
    pub shadow_filter: Option<FilterExpr>,
}

impl Decision {
    fn pass_through() -> Self {
        Self {
            outcome: Outcome::PassThrough,
            scope_filter: None,
            shadow_filter: None,
        }
    }

    pub fn redacts(&self) -> bool {
        self.shadow_filter.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TierRequest<'a> {
    pub filter: Option<&'a FilterExpr>,
    /// Field whose own leaf is dropped when `filter_self` is false.
    pub exclude_field: Option<&'a str>,
    pub filter_self: bool,
    pub accessibility: Accessibility,
    pub raw_data: bool,
}

/// Wraps every query operation with the access strategy of the target
/// index's effective level.
pub struct TieredAccessMediator<'a> {
    ctx: &'a QueryContext,
    scope: &'a ResourceScope,
    policy: RedactionPolicy,
}

impl<'a> TieredAccessMediator<'a> {
    pub fn new(ctx: &'a QueryContext, scope: &'a ResourceScope) -> Self {
        Self {
            ctx,
            scope,
            policy: RedactionPolicy::from_config(ctx.config()),
        }
    }

    pub async fn evaluate(&self, index: &str, req: &TierRequest<'_>) -> QueryResult<Decision> {
        self.ctx.schema(index)?;
        let level = self
            .ctx
            .level(index)
            .ok_or_else(|| QueryError::Internal(format!("No access level for {}", index)))?;

        let decision = match level {
            AccessLevel::Libre => Decision::pass_through(),
            AccessLevel::Private => Decision {
                outcome: Outcome::AccessibleOnly,
                scope_filter: Some(self.scope.accessible_membership()),
                shadow_filter: None,
            },
            // Granular never survives config validation as an effective level.
            AccessLevel::Regular | AccessLevel::Granular => self.decide(index, req).await?,
        };
        tracing::debug!(
            "Tier decision for {} ({}, accessibility {}): {:?}, redact {}",
            index,
            level,
            req.accessibility,
            decision.outcome,
            decision.redacts()
        );
        Ok(decision)
    }

    async fn decide(&self, index: &str, req: &TierRequest<'_>) -> QueryResult<Decision> {
        let out_of_scope = self
            .scope
            .out_of_scope_resources(self.ctx, index, req.filter, req.exclude_field, req.filter_self)
            .await?;

        if out_of_scope.is_empty() {
            return Ok(match req.accessibility {
                Accessibility::Accessible => Decision::pass_through(),
                Accessibility::Unaccessible => self.unaccessible_only(),
                Accessibility::All => self.all_with_redaction(),
            });
        }

        if req.raw_data {
            return match req.accessibility {
                Accessibility::Accessible => Ok(self.accessible_only()),
                _ => {
                    tracing::info!(
                        "Rejected raw data query on {} touching {} out-of-scope resources",
                        index,
                        out_of_scope.len()
                    );
                    Err(QueryError::Forbidden(
                        "You don't have access to all the data you are querying. \
                         Try using 'accessibility: accessible' in your query"
                            .to_string(),
                    ))
                }
            };
        }

        if self.scope.is_degraded() {
            return Ok(self.accessible_only());
        }
        Ok(match req.accessibility {
            Accessibility::All => self.all_with_redaction(),
            Accessibility::Accessible => self.accessible_only(),
            Accessibility::Unaccessible => self.unaccessible_only(),
        })
    }

    fn accessible_only(&self) -> Decision {
        Decision {
            outcome: Outcome::AccessibleOnly,
            scope_filter: Some(self.scope.accessible_membership()),
            shadow_filter: None,
        }
    }

    fn unaccessible_only(&self) -> Decision {
        let filter = FilterExpr::and_optional(
            self.sensitive_exclusion(),
            self.scope.unaccessible_membership(),
        );
        Decision {
            outcome: Outcome::UnaccessibleOnly,
            scope_filter: Some(filter.clone()),
            shadow_filter: Some(filter),
        }
    }

    fn all_with_redaction(&self) -> Decision {
        let scope_filter = self.sensitive_exclusion();
        let shadow_filter =
            FilterExpr::and_optional(scope_filter.clone(), self.scope.unaccessible_membership());
        Decision {
            outcome: Outcome::AllWithRedaction,
            scope_filter,
            shadow_filter: Some(shadow_filter),
        }
    }

    /// Hides sensitive-flagged records outside the accessible set.
    fn sensitive_exclusion(&self) -> Option<FilterExpr> {
        let field = self.ctx.config().tier.sensitive_record_exclusion_field.as_deref()?;
        Some(FilterExpr::Or(vec![
            self.scope.accessible_membership(),
            FilterExpr::ne(field, "true"),
        ]))
    }

    /// Runs the primary and, when redacting, the shadow computation together
    /// under the aggregation timeout.
    async fn run_pair<T, F, Fut>(&self, decision: &Decision, run: F) -> QueryResult<(T, Option<T>)>
    where
        F: Fn(Option<FilterExpr>) -> Fut,
        Fut: Future<Output = QueryResult<T>>,
    {
        self.bounded(pair(decision, run)).await
    }

    /// Fails with `BackendUnavailable` once the aggregation timeout elapses,
    /// dropping whatever `work` had fetched.
    async fn bounded<T>(&self, work: impl Future<Output = QueryResult<T>>) -> QueryResult<T> {
        let limit = self.ctx.timeout();
        match timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!("Mediated query timed out after {:?}", limit);
                Err(QueryError::BackendUnavailable(
                    "Mediated query timed out".to_string(),
                ))
            }
        }
    }

    pub async fn text_aggregation(
        &self,
        index: &str,
        req: &AggregationRequest,
        accessibility: Accessibility,
    ) -> QueryResult<Vec<TermBucket>> {
        let decision = self
            .evaluate(index, &aggregate_request(req, accessibility))
            .await?;
        let (primary, shadow) = self
            .run_pair(&decision, |scope| {
                let req = with_scope(req, scope);
                async move { aggregation::text_aggregation(self.ctx, index, &req).await }
            })
            .await?;
        Ok(match shadow {
            Some(shadow) => self.policy.redact_terms(primary, &shadow),
            None => primary,
        })
    }

    pub async fn numeric_aggregation(
        &self,
        index: &str,
        req: &AggregationRequest,
        accessibility: Accessibility,
    ) -> QueryResult<Vec<StatBucket>> {
        req.validate()?;
        let decision = self
            .evaluate(index, &aggregate_request(req, accessibility))
            .await?;
        let work = async {
            // The shadow run reuses the primary's bin layout.
            let primary_req = with_scope(req, decision.scope_filter.clone());
            let plan = plan_numeric(self.ctx, index, &primary_req).await?;
            pair(&decision, |scope| {
                let req = with_scope(req, scope);
                async move { run_numeric(self.ctx, index, &req, plan).await }
            })
            .await
        };
        let (primary, shadow) = self.bounded(work).await?;
        Ok(match shadow {
            Some(shadow) => self.policy.redact_stats(primary, &shadow),
            None => primary,
        })
    }

    pub async fn total_count(
        &self,
        index: &str,
        filter: Option<&FilterExpr>,
        accessibility: Accessibility,
    ) -> QueryResult<i64> {
        let tier_req = TierRequest {
            filter,
            exclude_field: None,
            filter_self: true,
            accessibility,
            raw_data: false,
        };
        let decision = self.evaluate(index, &tier_req).await?;
        let (primary, shadow) = self
            .run_pair(&decision, |scope| async move {
                search::total_count(self.ctx, index, filter, scope.as_ref()).await
            })
            .await?;
        Ok(match shadow {
            Some(shadow) => self.policy.redact_count(primary, shadow),
            None => primary,
        })
    }

    /// Rows are never partially disclosed: out-of-scope matches are rejected
    /// unless the caller asks for accessible data only.
    pub async fn raw_data(
        &self,
        index: &str,
        req: &RawDataRequest,
        accessibility: Accessibility,
    ) -> QueryResult<Vec<Value>> {
        let tier_req = TierRequest {
            filter: req.filter.as_ref(),
            exclude_field: None,
            filter_self: true,
            accessibility,
            raw_data: true,
        };
        let decision = self.evaluate(index, &tier_req).await?;
        let req = RawDataRequest {
            scope: combine(req.scope.clone(), decision.scope_filter),
            ..req.clone()
        };
        search::raw_data(self.ctx, index, &req).await
    }
}

async fn pair<T, F, Fut>(decision: &Decision, run: F) -> QueryResult<(T, Option<T>)>
where
    F: Fn(Option<FilterExpr>) -> Fut,
    Fut: Future<Output = QueryResult<T>>,
{
    let primary = run(decision.scope_filter.clone());
    match &decision.shadow_filter {
        Some(shadow) => try_join(primary, run(Some(shadow.clone())))
            .await
            .map(|(primary, shadow)| (primary, Some(shadow))),
        None => primary.await.map(|primary| (primary, None)),
    }
}

fn aggregate_request(req: &AggregationRequest, accessibility: Accessibility) -> TierRequest<'_> {
    TierRequest {
        filter: req.filter.as_ref(),
        exclude_field: Some(&req.field),
        filter_self: req.filter_self,
        accessibility,
        raw_data: false,
    }
}

fn with_scope(req: &AggregationRequest, scope: Option<FilterExpr>) -> AggregationRequest {
    AggregationRequest {
        default_auth_filter: combine(req.default_auth_filter.clone(), scope),
        ..req.clone()
    }
}

fn combine(left: Option<FilterExpr>, right: Option<FilterExpr>) -> Option<FilterExpr> {
    match (left, right) {
        (Some(left), Some(right)) => Some(FilterExpr::And(vec![left, right])),
        (left, right) => left.or(right),
    }
}
