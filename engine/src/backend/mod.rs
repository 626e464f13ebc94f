//! Search backend abstraction.
//!
//! The engine only speaks the native query document format; the backend is a
//! black box that executes it.

use async_trait::async_trait;
use serde_json::Value;

pub mod es;

pub use es::EsClient;

#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Liveness check used at startup.
    async fn ping(&self) -> anyhow::Result<()>;

    /// Raw mapping document for `index`.
    async fn mapping(&self, index: &str) -> anyhow::Result<Value>;

    /// Executes a search/aggregation request body against `index`.
    async fn search(&self, index: &str, body: Value) -> anyhow::Result<Value>;
}
