//! Per-index field registry shared across requests.
//!
//! Readers take a cloned `Arc<IndexSchema>` and never observe a half-built
//! table; `refresh` swaps whole schemas under the write lock.

mod mapping;

pub use mapping::{content_hash, FieldDescriptor, FieldKind, IndexSchema};

use crate::backend::SearchBackend;
use crate::config::IndexConfig;
use anyhow::Result;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<IndexSchema>>>,
    indices: Vec<IndexConfig>,
    analyzed_suffix: String,
}

impl SchemaRegistry {
    pub fn new(indices: Vec<IndexConfig>, analyzed_suffix: &str) -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
            indices,
            analyzed_suffix: analyzed_suffix.to_string(),
        }
    }

    pub fn get(&self, index: &str) -> Option<Arc<IndexSchema>> {
        match self.schemas.read() {
            Ok(schemas) => schemas.get(index).cloned(),
            Err(_) => {
                tracing::error!("Schema registry lock poisoned");
                None
            }
        }
    }

    pub fn insert(&self, schema: IndexSchema) -> Result<()> {
        let mut schemas = self
            .schemas
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire schema lock - possible poisoning"))?;
        schemas.insert(schema.index.clone(), Arc::new(schema));
        Ok(())
    }

    /// Re-fetches every configured mapping and rebuilds the ones whose content
    /// hash changed. Returns how many schemas were rebuilt.
    pub async fn refresh(&self, backend: &dyn SearchBackend) -> Result<usize> {
        let fetches = self.indices.iter().map(|cfg| async move {
            let mapping = backend.mapping(&cfg.index).await?;
            Ok::<_, anyhow::Error>((cfg, mapping))
        });
        let results = join_all(fetches).await;

        let mut rebuilt = 0;
        let mut failures = Vec::new();
        for (cfg, result) in self.indices.iter().zip(results) {
            let mapping = match result {
                Ok((_, mapping)) => mapping,
                Err(e) => {
                    tracing::error!("Failed to fetch mapping for {}: {:#}", cfg.index, e);
                    failures.push(cfg.index.clone());
                    continue;
                }
            };

            let hash = content_hash(&mapping);
            if self
                .get(&cfg.index)
                .is_some_and(|current| current.content_hash == hash)
            {
                tracing::debug!("Mapping for {} unchanged", cfg.index);
                continue;
            }

            match IndexSchema::build(
                &cfg.index,
                cfg.doc_type.as_deref(),
                &mapping,
                &cfg.array_fields,
                &self.analyzed_suffix,
            ) {
                Ok(schema) => {
                    tracing::info!(
                        "Loaded {} fields for index {}",
                        schema.fields().len(),
                        cfg.index
                    );
                    self.insert(schema)?;
                    rebuilt += 1;
                }
                Err(e) => {
                    tracing::error!("Failed to walk mapping for {}: {:#}", cfg.index, e);
                    failures.push(cfg.index.clone());
                }
            }
        }

        if !failures.is_empty() {
            anyhow::bail!("Schema refresh failed for: {}", failures.join(", "));
        }
        Ok(rebuilt)
    }
}
