use super::{sse, ApiError, Backend, EventStream};
use crate::model::{
    Analytics, ClientConfig, Health, JobRecord, LogPage, LogQuery, QueryRequest, UploadReceipt,
    UploadRequest,
};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::ACCEPT;
use reqwest::multipart::{Form, Part};
use reqwest::{Response, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// reqwest client for the log analytics REST API.
#[derive(Clone)]
pub(crate) struct HttpBackend {
    http: reqwest::Client,
    base_url: Url,
    request_timeout: Duration,
}

impl HttpBackend {
    pub fn new(cfg: &ClientConfig) -> Result<Self, ApiError> {
        let base_url = Url::parse(&cfg.base_url)
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {e}", cfg.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(cfg.base_url.clone()));
        }
        // No client-wide timeout: analysis streams stay open far longer than a plain request.
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(cfg.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url,
            request_timeout: cfg.request_timeout,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        debug!(%url, "GET");
        let resp = self
            .http
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await?;
        Ok(ensure_success(resp).await?.json::<T>().await?)
    }
}

async fn ensure_success(resp: Response) -> Result<Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl Backend for HttpBackend {
    async fn create_job(&self, upload: UploadRequest) -> Result<UploadReceipt, ApiError> {
        let url = self.endpoint(&["upload"])?;
        let part = Part::bytes(upload.content.to_vec()).file_name(upload.filename.clone());
        let form = Form::new().part("file", part);
        debug!(%url, filename = %upload.filename, "POST upload");
        let resp = self
            .http
            .post(url)
            .multipart(form)
            .timeout(self.request_timeout)
            .send()
            .await?;
        Ok(ensure_success(resp).await?.json::<UploadReceipt>().await?)
    }

    async fn get_job(&self, job_id: &str) -> Result<JobRecord, ApiError> {
        self.get_json(self.endpoint(&["jobs", job_id])?).await
    }

    async fn open_analysis(&self, request: &QueryRequest) -> Result<EventStream, ApiError> {
        let url = self.endpoint(&["ask-ai", "stream"])?;
        debug!(
            %url,
            query_chars = request.text().chars().count(),
            refs = request.referenced_ids().len(),
            model = request.model_hint().unwrap_or("default"),
            "opening analysis stream"
        );
        let resp = self
            .http
            .post(url)
            .header(ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await?;
        let resp = ensure_success(resp).await?;
        Ok(sse::decode_stream(
            resp.bytes_stream().map_err(ApiError::from),
        ))
    }

    async fn query_logs(&self, query: &LogQuery) -> Result<LogPage, ApiError> {
        let url = self.endpoint(&["logs"])?;
        debug!(%url, page = query.page, "GET logs");
        let resp = self
            .http
            .get(url)
            .query(query)
            .timeout(self.request_timeout)
            .send()
            .await?;
        Ok(ensure_success(resp).await?.json::<LogPage>().await?)
    }

    async fn analytics(&self) -> Result<Analytics, ApiError> {
        self.get_json(self.endpoint(&["analytics"])?).await
    }

    async fn health(&self) -> Result<Health, ApiError> {
        let body: serde_json::Value = self.get_json(self.endpoint(&["health"])?).await?;
        Ok(Health::from_value(&body))
    }
}
