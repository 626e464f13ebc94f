use reqwest::StatusCode;
use std::fmt;

/// Errors surfaced by query compilation, aggregation and tiered access checks.
#[derive(Debug, Clone)]
pub enum QueryError {
    InvalidFilter(String),
    InvalidSort(String),
    InvalidAggregationArgs(String),
    Forbidden(String),
    BackendUnavailable(String),
    OracleUnavailable(String),
    Internal(String),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueryError::InvalidFilter(msg) => write!(f, "Invalid filter: {}", msg),
            QueryError::InvalidSort(msg) => write!(f, "Invalid sort: {}", msg),
            QueryError::InvalidAggregationArgs(msg) => {
                write!(f, "Invalid aggregation arguments: {}", msg)
            }
            QueryError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            QueryError::BackendUnavailable(msg) => write!(f, "Search backend unavailable: {}", msg),
            QueryError::OracleUnavailable(msg) => write!(f, "Policy service unavailable: {}", msg),
            QueryError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for QueryError {}

impl QueryError {
    /// HTTP-equivalent status for the transport layer.
    pub fn status(&self) -> StatusCode {
        match self {
            QueryError::InvalidFilter(_)
            | QueryError::InvalidSort(_)
            | QueryError::InvalidAggregationArgs(_) => StatusCode::BAD_REQUEST,
            QueryError::Forbidden(_) => StatusCode::FORBIDDEN,
            QueryError::BackendUnavailable(_) | QueryError::OracleUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            QueryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for errors caused by the caller's input; these are never retried.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            QueryError::InvalidFilter(_)
                | QueryError::InvalidSort(_)
                | QueryError::InvalidAggregationArgs(_)
        )
    }

    pub(crate) fn backend(err: anyhow::Error) -> Self {
        tracing::error!("Search backend request failed: {:#}", err);
        QueryError::BackendUnavailable(format!("{:#}", err))
    }

    pub(crate) fn malformed(what: &str) -> Self {
        tracing::error!("Malformed search backend response: {}", what);
        QueryError::Internal(format!("Malformed search backend response: {}", what))
    }
}

pub type QueryResult<T> = Result<T, QueryError>;
