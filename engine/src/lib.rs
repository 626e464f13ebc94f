//! Query compilation, aggregation and tiered access mediation over an
//! Elasticsearch-compatible search backend.

pub mod aggregation;
pub mod auth;
pub mod backend;
pub mod config;
mod context;
pub mod error;
pub mod filter;
pub mod schema;
pub mod search;
pub mod sort;
pub mod tier;

#[cfg(test)]
mod testing;

pub use context::QueryContext;
pub use error::{QueryError, QueryResult};
