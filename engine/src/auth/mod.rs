//! Caller authorization: policy oracle seam and request-scoped resource scope.

mod arborist;
mod scope;

pub use arborist::ArboristClient;
pub use scope::{ResourceScope, ScopeBuilder, UNOWNED};

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};

/// One permission on a resource path.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Grant {
    pub service: String,
    pub method: String,
}

impl Grant {
    fn allows_read(&self, service: &str) -> bool {
        (self.method == "read" || self.method == "*")
            && (self.service == service || self.service == "*")
    }
}

#[async_trait]
pub trait PolicyOracle: Send + Sync {
    /// Resource path to grants for the caller holding `token`.
    async fn auth_mapping(&self, token: &str) -> anyhow::Result<HashMap<String, Vec<Grant>>>;
}

pub fn accessible_resources(
    mapping: &HashMap<String, Vec<Grant>>,
    service: &str,
) -> BTreeSet<String> {
    mapping
        .iter()
        .filter(|(_, grants)| grants.iter().any(|g| g.allows_read(service)))
        .map(|(path, _)| path.clone())
        .collect()
}
