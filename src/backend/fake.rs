//! Scripted in-memory [`Backend`] for orchestrator tests.

use super::{ApiError, Backend, EventStream};
use crate::model::{
    Analytics, Health, JobRecord, JobStatus, LogPage, LogQuery, QueryRequest, StreamEvent,
    UploadReceipt, UploadRequest,
};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub(crate) type EventFeed = mpsc::UnboundedSender<Result<StreamEvent, ApiError>>;

#[derive(Default)]
pub(crate) struct FakeBackend {
    jobs: Mutex<HashMap<String, VecDeque<Result<JobRecord, ApiError>>>>,
    polls: Mutex<Vec<String>>,
    poll_delays: Mutex<HashMap<String, Duration>>,
    streams: Mutex<VecDeque<Result<EventStream, ApiError>>>,
    opened: Mutex<Vec<QueryRequest>>,
    pages: Mutex<VecDeque<(Duration, Result<LogPage, ApiError>)>>,
    log_queries: Mutex<Vec<LogQuery>>,
    blocking_pages: Mutex<Option<Duration>>,
    analytics_calls: AtomicUsize,
    health_calls: AtomicUsize,
    unhealthy: AtomicBool,
}

pub(crate) fn record(job_id: &str, status: JobStatus, processed_count: u64) -> JobRecord {
    JobRecord {
        id: job_id.to_string(),
        status,
        processed_count,
        error: None,
    }
}

/// A stream the test drives by hand, for cancellation and supersession cases.
pub(crate) fn event_channel() -> (EventFeed, EventStream) {
    let (tx, rx) = mpsc::unbounded();
    (tx, Box::pin(rx))
}

impl FakeBackend {
    /// Responses for successive polls of `job_id`. Once exhausted, polls fail with a transport error.
    pub fn script_job(&self, job_id: &str, responses: Vec<Result<JobRecord, ApiError>>) {
        self.jobs
            .lock()
            .unwrap()
            .insert(job_id.to_string(), responses.into());
    }

    /// Hold every status response for `job_id` back by `delay`.
    pub fn delay_polls(&self, job_id: &str, delay: Duration) {
        self.poll_delays
            .lock()
            .unwrap()
            .insert(job_id.to_string(), delay);
    }

    pub fn polls_of(&self, job_id: &str) -> usize {
        self.polls.lock().unwrap().iter().filter(|id| *id == job_id).count()
    }

    pub fn push_stream(&self, stream: EventStream) {
        self.streams.lock().unwrap().push_back(Ok(stream));
    }

    pub fn push_events(&self, events: Vec<Result<StreamEvent, ApiError>>) {
        self.push_stream(Box::pin(stream::iter(events)));
    }

    pub fn push_open_error(&self, err: ApiError) {
        self.streams.lock().unwrap().push_back(Err(err));
    }

    pub fn opened(&self) -> Vec<QueryRequest> {
        self.opened.lock().unwrap().clone()
    }

    /// Next log page response, resolved after `delay`.
    pub fn push_page(&self, delay: Duration, page: Result<LogPage, ApiError>) {
        self.pages.lock().unwrap().push_back((delay, page));
    }

    /// Make log fetches block their worker thread for `duration`, so abort cannot interrupt them.
    pub fn block_pages_for(&self, duration: Duration) {
        *self.blocking_pages.lock().unwrap() = Some(duration);
    }

    pub fn log_queries(&self) -> Vec<LogQuery> {
        self.log_queries.lock().unwrap().clone()
    }

    pub fn analytics_calls(&self) -> usize {
        self.analytics_calls.load(Ordering::SeqCst)
    }

    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.unhealthy.store(unhealthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn create_job(&self, upload: UploadRequest) -> Result<UploadReceipt, ApiError> {
        Ok(UploadReceipt {
            job_id: format!("job-{}", upload.filename),
            filename: upload.filename,
            status: "success".into(),
            message: "queued".into(),
        })
    }

    async fn get_job(&self, job_id: &str) -> Result<JobRecord, ApiError> {
        self.polls.lock().unwrap().push(job_id.to_string());
        let delay = self.poll_delays.lock().unwrap().get(job_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.jobs
            .lock()
            .unwrap()
            .get_mut(job_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(ApiError::Transport("connection refused".into())))
    }

    async fn open_analysis(&self, request: &QueryRequest) -> Result<EventStream, ApiError> {
        self.opened.lock().unwrap().push(request.clone());
        self.streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::Transport("no scripted stream".into())))
    }

    async fn query_logs(&self, query: &LogQuery) -> Result<LogPage, ApiError> {
        self.log_queries.lock().unwrap().push(query.clone());
        let blocking = *self.blocking_pages.lock().unwrap();
        if let Some(duration) = blocking {
            std::thread::sleep(duration);
        }
        let scripted = self.pages.lock().unwrap().pop_front();
        match scripted {
            Some((delay, page)) => {
                tokio::time::sleep(delay).await;
                page
            }
            // Unscripted: ten pages, with `total` echoing the requested page.
            None => Ok(LogPage {
                logs: Vec::new(),
                total: u64::from(query.page),
                pages: 10,
            }),
        }
    }

    async fn analytics(&self) -> Result<Analytics, ApiError> {
        let n = self.analytics_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Analytics {
            total_logs: n as u64,
            ..Default::default()
        })
    }

    async fn health(&self) -> Result<Health, ApiError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        if self.unhealthy.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok(Health { alive: true })
    }
}
