use crate::aggregation::{StatBucket, TermBucket};
use crate::config::Config;
use std::collections::{HashMap, HashSet};

/// Sentinel replacing a suppressed count; distinct from a true zero.
pub const REDACTED: i64 = -1;

#[derive(Debug, Clone)]
pub struct RedactionPolicy {
    limit: i64,
    whitelist: HashSet<String>,
}

impl RedactionPolicy {
    pub fn new(limit: i64, whitelist: impl IntoIterator<Item = String>) -> Self {
        Self {
            limit,
            whitelist: whitelist.into_iter().collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut whitelist = config.tier.whitelist.clone();
        if config.aggregation.include_missing {
            whitelist.push(config.aggregation.missing_data_alias.clone());
        }
        Self::new(config.tier.limit.unwrap_or(0), whitelist)
    }

    fn suppresses(&self, shadow: i64) -> bool {
        shadow > 0 && shadow < self.limit
    }

    pub fn is_whitelisted(&self, key: &str) -> bool {
        self.whitelist.contains(key)
    }

    pub fn redact_count(&self, count: i64, shadow: i64) -> i64 {
        if self.suppresses(shadow) {
            REDACTED
        } else {
            count
        }
    }

    pub fn redact_terms(&self, buckets: Vec<TermBucket>, shadow: &[TermBucket]) -> Vec<TermBucket> {
        let shadow: HashMap<&str, i64> = shadow.iter().map(|b| (b.key.as_str(), b.count)).collect();
        buckets
            .into_iter()
            .map(|mut bucket| {
                if !self.is_whitelisted(&bucket.key)
                    && shadow
                        .get(bucket.key.as_str())
                        .is_some_and(|count| self.suppresses(*count))
                {
                    bucket.count = REDACTED;
                }
                bucket
            })
            .collect()
    }

    /// Matches bins by their lower bound; both sides must share one bin layout.
    pub fn redact_stats(&self, buckets: Vec<StatBucket>, shadow: &[StatBucket]) -> Vec<StatBucket> {
        buckets
            .into_iter()
            .map(|mut bucket| {
                let hidden = shadow
                    .iter()
                    .find(|s| s.key.0 == bucket.key.0)
                    .is_some_and(|s| self.suppresses(s.count));
                if hidden {
                    bucket.count = REDACTED;
                }
                bucket
            })
            .collect()
    }
}
