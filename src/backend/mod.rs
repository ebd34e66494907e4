//! Contracts consumed from the log analytics backend.
//!
//! The orchestrator only talks to the backend through [`Backend`]; the HTTP
//! implementation lives in [`http`] and the incremental event decoding used by
//! the streaming analysis endpoint in [`sse`].

#[cfg(test)]
pub(crate) mod fake;
mod http;
pub(crate) mod sse;

use crate::model::{
    Analytics, Health, JobRecord, LogPage, LogQuery, QueryRequest, StreamEvent, UploadReceipt,
    UploadRequest,
};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;

pub(crate) use http::HttpBackend;

/// Ordered analysis events for a single query. Ends after the first terminal item.
pub(crate) type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ApiError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("invalid backend URL: {0}")]
    InvalidUrl(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode backend response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

#[async_trait]
pub(crate) trait Backend: Send + Sync {
    async fn create_job(&self, upload: UploadRequest) -> Result<UploadReceipt, ApiError>;

    async fn get_job(&self, job_id: &str) -> Result<JobRecord, ApiError>;

    /// Open the incremental analysis channel for `request`.
    async fn open_analysis(&self, request: &QueryRequest) -> Result<EventStream, ApiError>;

    async fn query_logs(&self, query: &LogQuery) -> Result<LogPage, ApiError>;

    async fn analytics(&self) -> Result<Analytics, ApiError>;

    async fn health(&self) -> Result<Health, ApiError>;
}
