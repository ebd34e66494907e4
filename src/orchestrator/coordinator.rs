//! Filter, pagination and background summary refresh for log browsing.
//!
//! The coordinator is the only owner of [`FilterState`]. User operations
//! (`apply_filter`, `change_page`) each issue exactly one log fetch; a separate
//! timer refreshes analytics and liveness without touching filters or the
//! displayed page. Fetches are not deduplicated: whichever response resolves
//! last is what the view shows.
//!
//! Every task spawned here publishes through the coordinator's current
//! [`RunTicket`], so nothing reaches the view or the event channel once
//! `shutdown` has returned.

use super::{lock, RunGate, RunTicket};
use crate::backend::Backend;
use crate::model::{
    Analytics, CoordinatorEvent, FetchKind, FilterPatch, FilterState, LogPage, LogQuery,
    ValidationError,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// What the presentation layer currently shows.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PageView {
    pub query: Option<LogQuery>,
    pub page: Option<LogPage>,
    pub analytics: Option<Analytics>,
    pub alive: Option<bool>,
}

pub(crate) struct QueryStateCoordinator {
    backend: Arc<dyn Backend>,
    filters: FilterState,
    view: Arc<Mutex<PageView>>,
    event_tx: UnboundedSender<CoordinatorEvent>,
    refresh_interval: Duration,
    gate: RunGate,
    ticket: RunTicket,
    refresh: Option<JoinHandle<()>>,
    fetches: JoinSet<()>,
}

/// Shared state a spawned fetch or refresh publishes into.
#[derive(Clone)]
struct Sink {
    view: Arc<Mutex<PageView>>,
    event_tx: UnboundedSender<CoordinatorEvent>,
    ticket: RunTicket,
}

impl QueryStateCoordinator {
    pub fn new(
        backend: Arc<dyn Backend>,
        filters: FilterState,
        refresh_interval: Duration,
        event_tx: UnboundedSender<CoordinatorEvent>,
    ) -> Self {
        let gate = RunGate::default();
        let ticket = gate.issue();
        Self {
            backend,
            filters,
            view: Arc::new(Mutex::new(PageView::default())),
            event_tx,
            refresh_interval,
            gate,
            ticket,
            refresh: None,
            fetches: JoinSet::new(),
        }
    }

    pub fn filters(&self) -> &FilterState {
        &self.filters
    }

    pub fn view(&self) -> PageView {
        lock(&self.view).clone()
    }

    /// Merge `patch` into the filters, go back to page 1 and fetch.
    pub fn apply_filter(&mut self, patch: FilterPatch) -> Result<LogQuery, ValidationError> {
        self.filters.merge(patch)?;
        self.filters.page = 1;
        Ok(self.fetch_page())
    }

    /// Fetch page `page` with the current filters.
    pub fn change_page(&mut self, page: u32) -> Result<LogQuery, ValidationError> {
        if page == 0 {
            return Err(ValidationError::InvalidPage(page));
        }
        self.filters.page = page;
        Ok(self.fetch_page())
    }

    fn sink(&self) -> Sink {
        Sink {
            view: self.view.clone(),
            event_tx: self.event_tx.clone(),
            ticket: self.ticket.clone(),
        }
    }

    fn fetch_page(&mut self) -> LogQuery {
        while self.fetches.try_join_next().is_some() {}

        let query = self.filters.to_query();
        let backend = self.backend.clone();
        let sink = self.sink();
        let issued = query.clone();
        debug!(page = query.page, "fetching logs");
        self.fetches.spawn(async move {
            let result = backend.query_logs(&issued).await;
            sink.ticket.publish(|| match result {
                Ok(page) => {
                    {
                        let mut view = lock(&sink.view);
                        view.query = Some(issued.clone());
                        view.page = Some(page.clone());
                    }
                    let _ = sink.event_tx.send(CoordinatorEvent::PageLoaded {
                        query: issued,
                        page,
                    });
                }
                Err(err) => {
                    warn!(page = issued.page, error = %err, "log fetch failed");
                    let _ = sink.event_tx.send(CoordinatorEvent::FetchFailed {
                        what: FetchKind::Logs,
                        message: format!("could not load logs: {err}"),
                    });
                }
            });
        });
        query
    }

    /// Start the periodic analytics/liveness refresh. Calling it again is a no-op.
    pub fn start_refresh(&mut self) {
        if self.refresh.is_some() {
            return;
        }
        let backend = self.backend.clone();
        let sink = self.sink();
        let period = self.refresh_interval;
        debug!(?period, "background refresh started");
        self.refresh = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !sink.ticket.is_current() {
                    return;
                }
                refresh_summary(backend.as_ref(), &sink).await;
            }
        }));
    }

    /// One out-of-band summary refresh, e.g. at startup.
    pub fn refresh_now(&mut self) {
        let backend = self.backend.clone();
        let sink = self.sink();
        self.fetches.spawn(async move {
            refresh_summary(backend.as_ref(), &sink).await;
        });
    }

    #[cfg(test)]
    pub fn is_refreshing(&self) -> bool {
        self.refresh.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the refresh timer and abort in-flight fetches. Operations issued
    /// afterwards run under a fresh ticket.
    pub fn shutdown(&mut self) {
        // Retire before aborting so a task mid-request cannot publish afterwards.
        self.gate.retire();
        if let Some(handle) = self.refresh.take() {
            handle.abort();
            debug!("background refresh stopped");
        }
        self.fetches.abort_all();
        self.ticket = self.gate.issue();
    }
}

impl Drop for QueryStateCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn refresh_summary(backend: &dyn Backend, sink: &Sink) {
    let (analytics, health) = futures::join!(backend.analytics(), backend.health());

    let alive = match &health {
        Ok(health) => health.alive,
        Err(err) => {
            debug!(error = %err, "liveness check failed");
            false
        }
    };
    sink.ticket.publish(|| {
        match analytics {
            Ok(analytics) => {
                lock(&sink.view).analytics = Some(analytics.clone());
                let _ = sink.event_tx.send(CoordinatorEvent::Summary { analytics });
            }
            Err(err) => {
                warn!(error = %err, "analytics refresh failed");
                let _ = sink.event_tx.send(CoordinatorEvent::FetchFailed {
                    what: FetchKind::Analytics,
                    message: format!("could not refresh analytics: {err}"),
                });
            }
        }
        lock(&sink.view).alive = Some(alive);
        let _ = sink.event_tx.send(CoordinatorEvent::Liveness { alive });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::backend::ApiError;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    const PERIOD: Duration = Duration::from_secs(30);

    fn coordinator(
        backend: &Arc<FakeBackend>,
        filters: FilterState,
    ) -> (QueryStateCoordinator, mpsc::UnboundedReceiver<CoordinatorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            QueryStateCoordinator::new(backend.clone(), filters, PERIOD, tx),
            rx,
        )
    }

    async fn next_page(rx: &mut mpsc::UnboundedReceiver<CoordinatorEvent>) -> (LogQuery, LogPage) {
        loop {
            match rx.recv().await {
                Some(CoordinatorEvent::PageLoaded { query, page }) => return (query, page),
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn apply_filter_merges_resets_page_and_fetches_once() {
        let backend = Arc::new(FakeBackend::default());
        let existing = FilterState {
            anomaly_threshold: 0.5,
            page: 4,
            ..Default::default()
        };
        let (mut coordinator, mut rx) = coordinator(&backend, existing);

        let issued = coordinator
            .apply_filter(FilterPatch {
                service: Some("payment-svc".into()),
                level: Some("ERROR".into()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(issued.page, 1);
        assert_eq!(issued.service.as_deref(), Some("payment-svc"));
        assert_eq!(issued.level.as_deref(), Some("ERROR"));
        assert_eq!(issued.min_anomaly_score, Some(0.5));

        let (query, _) = next_page(&mut rx).await;
        assert_eq!(query, issued);
        assert_eq!(backend.log_queries(), vec![issued]);
        assert_eq!(coordinator.filters().page, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn change_page_keeps_filters_and_rejects_page_zero() {
        let backend = Arc::new(FakeBackend::default());
        let filters = FilterState {
            service: Some("auth".into()),
            ..Default::default()
        };
        let (mut coordinator, mut rx) = coordinator(&backend, filters);

        assert_eq!(
            coordinator.change_page(0),
            Err(ValidationError::InvalidPage(0))
        );
        let issued = coordinator.change_page(3).unwrap();
        assert_eq!(issued.page, 3);
        assert_eq!(issued.service.as_deref(), Some("auth"));

        let (_, page) = next_page(&mut rx).await;
        assert_eq!(page.total, 3);
        assert_eq!(backend.log_queries().len(), 1);
        assert_eq!(coordinator.view().page, Some(page));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_patch_issues_no_fetch() {
        let backend = Arc::new(FakeBackend::default());
        let (mut coordinator, _rx) = coordinator(&backend, FilterState::default());

        let err = coordinator
            .apply_filter(FilterPatch {
                anomaly_threshold: Some(-0.1),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, ValidationError::ThresholdOutOfRange(-0.1));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(backend.log_queries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn last_resolved_response_wins() {
        let backend = Arc::new(FakeBackend::default());
        let slow = LogPage {
            total: 200,
            ..Default::default()
        };
        let fast = LogPage {
            total: 300,
            ..Default::default()
        };
        backend.push_page(Duration::from_secs(5), Ok(slow.clone()));
        backend.push_page(Duration::from_secs(1), Ok(fast.clone()));
        let (mut coordinator, mut rx) = coordinator(&backend, FilterState::default());

        coordinator.change_page(2).unwrap();
        coordinator.change_page(3).unwrap();

        assert_eq!(next_page(&mut rx).await.1, fast);
        assert_eq!(next_page(&mut rx).await.1, slow);
        let view = coordinator.view();
        assert_eq!(view.page, Some(slow));
        assert_eq!(view.query.map(|q| q.page), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_leaves_view_untouched() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_page(
            Duration::ZERO,
            Err(ApiError::Transport("connection reset".into())),
        );
        let (mut coordinator, mut rx) = coordinator(&backend, FilterState::default());

        coordinator.change_page(1).unwrap();
        assert_eq!(
            rx.recv().await,
            Some(CoordinatorEvent::FetchFailed {
                what: FetchKind::Logs,
                message: "could not load logs: transport error: connection reset".into()
            })
        );
        assert_eq!(coordinator.view().page, None);
    }

    #[tokio::test(start_paused = true)]
    async fn background_refresh_runs_on_its_own_timer() {
        let backend = Arc::new(FakeBackend::default());
        let filters = FilterState {
            level: Some("WARN".into()),
            ..Default::default()
        };
        let (mut coordinator, mut rx) = coordinator(&backend, filters.clone());

        coordinator.change_page(2).unwrap();
        let (_, shown) = next_page(&mut rx).await;

        coordinator.start_refresh();
        coordinator.start_refresh();
        assert!(coordinator.is_refreshing());
        tokio::time::sleep(PERIOD * 3 + Duration::from_millis(10)).await;

        assert_eq!(backend.analytics_calls(), 3, "a single timer is running");
        assert_eq!(backend.health_calls(), 3);
        assert_eq!(backend.log_queries().len(), 1, "refresh never refetches logs");
        assert_eq!(coordinator.filters(), &FilterState { page: 2, ..filters });
        let view = coordinator.view();
        assert_eq!(view.page, Some(shown));
        assert_eq!(view.analytics.map(|a| a.total_logs), Some(3));
        assert_eq!(view.alive, Some(true));

        coordinator.shutdown();
        assert!(!coordinator.is_refreshing());
        tokio::time::sleep(PERIOD * 3).await;
        assert_eq!(backend.analytics_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_health_check_reports_not_alive() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_unhealthy(true);
        let (mut coordinator, mut rx) = coordinator(&backend, FilterState::default());

        coordinator.refresh_now();
        let mut events = Vec::new();
        while events.len() < 2 {
            events.push(rx.recv().await.unwrap());
        }
        assert_eq!(
            events,
            vec![
                CoordinatorEvent::Summary {
                    analytics: Analytics {
                        total_logs: 1,
                        ..Default::default()
                    }
                },
                CoordinatorEvent::Liveness { alive: false },
            ]
        );
        assert_eq!(coordinator.view().alive, Some(false));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_silences_a_fetch_already_running() {
        let backend = Arc::new(FakeBackend::default());
        backend.block_pages_for(Duration::from_millis(300));
        let (mut coordinator, mut rx) = coordinator(&backend, FilterState::default());

        coordinator.change_page(1).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.log_queries().len(), 1, "fetch should be running");
        coordinator.shutdown();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(coordinator.view().page, None);
        assert!(rx.try_recv().is_err(), "no event after shutdown");

        coordinator.change_page(2).unwrap();
        let (query, _) = tokio::time::timeout(Duration::from_secs(5), next_page(&mut rx))
            .await
            .unwrap();
        assert_eq!(query.page, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_tears_down_refresh_timer() {
        let backend = Arc::new(FakeBackend::default());
        let (mut coordinator, _rx) = coordinator(&backend, FilterState::default());
        coordinator.start_refresh();
        drop(coordinator);
        tokio::time::sleep(PERIOD * 3).await;
        assert_eq!(backend.analytics_calls(), 0);
    }
}
