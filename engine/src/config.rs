use crate::tier::AccessLevel;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub backend: BackendConfig,
    pub policy: PolicyConfig,
    #[serde(default)]
    pub tier: TierConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    pub indices: Vec<IndexConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub endpoint: String,
    #[serde(default = "default_backend_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    pub endpoint: String,
    /// Service name matched against oracle grants, besides `*`.
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_policy_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TierConfig {
    /// Site-wide level. Unset behaves like `granular`.
    pub level: Option<AccessLevel>,
    pub limit: Option<i64>,
    pub sensitive_record_exclusion_field: Option<String>,
    #[serde(default = "default_whitelist")]
    pub whitelist: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_auth_field")]
    pub auth_field: String,
    #[serde(default = "default_include_missing")]
    pub include_missing: bool,
    #[serde(default = "default_missing_alias")]
    pub missing_data_alias: String,
    #[serde(default = "default_analyzed_suffix")]
    pub analyzed_suffix: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_aggregation_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    pub index: String,
    /// Mapping type name for clusters that still use typed mappings.
    pub doc_type: Option<String>,
    pub tier_access_level: Option<AccessLevel>,
    #[serde(default)]
    pub array_fields: Vec<String>,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            level: None,
            limit: None,
            sensitive_record_exclusion_field: None,
            whitelist: default_whitelist(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            auth_field: default_auth_field(),
            include_missing: default_include_missing(),
            missing_data_alias: default_missing_alias(),
            analyzed_suffix: default_analyzed_suffix(),
            page_size: default_page_size(),
            timeout_seconds: default_aggregation_timeout(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.indices.is_empty() {
            anyhow::bail!("At least one [[indices]] entry is required");
        }
        if self.aggregation.page_size == 0 {
            anyhow::bail!("aggregation.page_size must be positive");
        }

        let site_wide = self.tier.level.filter(|l| *l != AccessLevel::Granular);
        let mut needs_limit = site_wide == Some(AccessLevel::Regular);

        for index in &self.indices {
            match (site_wide, index.tier_access_level) {
                (Some(level), Some(own)) => {
                    tracing::warn!(
                        "Ignoring tier_access_level {} on index {}: site-wide level {} applies",
                        own,
                        index.index,
                        level
                    );
                }
                (Some(_), None) => {}
                (None, None) => anyhow::bail!(
                    "Index {} needs tier_access_level when the site-wide level is granular or unset",
                    index.index
                ),
                (None, Some(AccessLevel::Granular)) => anyhow::bail!(
                    "Index {} cannot use tier_access_level granular",
                    index.index
                ),
                (None, Some(own)) => needs_limit |= own == AccessLevel::Regular,
            }
        }

        if needs_limit && self.tier.limit.is_none() {
            anyhow::bail!("tier.limit is required when any index uses the regular level");
        }
        if let Some(limit) = self.tier.limit {
            if limit < 0 {
                anyhow::bail!("tier.limit must not be negative, got {}", limit);
            }
        }
        Ok(())
    }

    pub fn index(&self, name: &str) -> Option<&IndexConfig> {
        self.indices.iter().find(|i| i.index == name)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.indices.iter().map(|i| i.index.clone()).collect()
    }

    /// Level that decides which access strategy wraps `index`.
    pub fn effective_level(&self, index: &str) -> Option<AccessLevel> {
        match self.tier.level {
            Some(level) if level != AccessLevel::Granular => Some(level),
            _ => self.index(index).and_then(|i| i.tier_access_level),
        }
    }
}

fn default_backend_timeout() -> u64 {
    30
}

fn default_service() -> String {
    "guppy".to_string()
}

fn default_policy_timeout() -> u64 {
    10
}

fn default_whitelist() -> Vec<String> {
    ["__missing__", "unknown", "not reported", "no data"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_auth_field() -> String {
    "auth_resource_path".to_string()
}

fn default_include_missing() -> bool {
    true
}

fn default_missing_alias() -> String {
    "no data".to_string()
}

fn default_analyzed_suffix() -> String {
    "analyzed".to_string()
}

fn default_page_size() -> usize {
    10_000
}

fn default_aggregation_timeout() -> u64 {
    60
}
