//! Ingestion job polling.
//!
//! A [`JobTracker`] owns at most one poll loop. Starting a new job retires the
//! previous loop first; a terminal status ends the loop after exactly one
//! completion or failure event.

use super::{RunGate, RunTicket};
use crate::backend::{ApiError, Backend};
use crate::model::{JobEvent, JobId, JobRecord, PollPolicy, Transition, UploadRequest};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Internal handle for a running poll loop.
struct PollCtx {
    job_id: JobId,
    handle: JoinHandle<()>,
}

pub(crate) struct JobTracker {
    backend: Arc<dyn Backend>,
    policy: PollPolicy,
    event_tx: UnboundedSender<JobEvent>,
    gate: RunGate,
    record_tx: watch::Sender<Option<JobRecord>>,
    active: Option<PollCtx>,
}

impl JobTracker {
    pub fn new(
        backend: Arc<dyn Backend>,
        policy: PollPolicy,
        event_tx: UnboundedSender<JobEvent>,
    ) -> Self {
        let (record_tx, _) = watch::channel(None);
        Self {
            backend,
            policy,
            event_tx,
            gate: RunGate::default(),
            record_tx,
            active: None,
        }
    }

    /// Upload a file, then start tracking the job the backend created for it.
    pub async fn submit(&mut self, upload: UploadRequest) -> Result<JobId, ApiError> {
        let receipt = self.backend.create_job(upload).await?;
        info!(job_id = %receipt.job_id, filename = %receipt.filename, "ingestion job created");
        self.start(receipt.job_id.clone());
        Ok(receipt.job_id)
    }

    /// Begin polling `job_id`, superseding any loop already running.
    pub fn start(&mut self, job_id: JobId) {
        self.stop();
        let ticket = self.gate.issue();
        self.record_tx
            .send_replace(Some(JobRecord::queued(job_id.clone())));
        let poller = Poller {
            backend: self.backend.clone(),
            policy: self.policy,
            job_id: job_id.clone(),
            event_tx: self.event_tx.clone(),
            record_tx: self.record_tx.clone(),
            ticket,
        };
        debug!(job_id = %job_id, interval = ?self.policy.interval, "job polling started");
        let handle = tokio::spawn(poller.run());
        self.active = Some(PollCtx { job_id, handle });
    }

    pub fn stop(&mut self) {
        // Retire before aborting so a loop mid-request cannot publish afterwards.
        self.gate.retire();
        if let Some(ctx) = self.active.take() {
            ctx.handle.abort();
            debug!(job_id = %ctx.job_id, "job polling stopped");
        }
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|ctx| !ctx.handle.is_finished())
    }

    /// Latest known record of the tracked job.
    pub fn record(&self) -> Option<JobRecord> {
        self.record_tx.borrow().clone()
    }
}

impl Drop for JobTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Poller {
    backend: Arc<dyn Backend>,
    policy: PollPolicy,
    job_id: JobId,
    event_tx: UnboundedSender<JobEvent>,
    record_tx: watch::Sender<Option<JobRecord>>,
    ticket: RunTicket,
}

impl Poller {
    async fn run(self) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.policy.interval, self.policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_errors = 0u32;

        loop {
            ticker.tick().await;
            if !self.ticket.is_current() {
                return;
            }
            match self.backend.get_job(&self.job_id).await {
                Ok(polled) => {
                    consecutive_errors = 0;
                    if self.apply(polled).is_break() {
                        return;
                    }
                }
                Err(err) => {
                    consecutive_errors += 1;
                    warn!(
                        job_id = %self.job_id,
                        attempt = consecutive_errors,
                        error = %err,
                        "job status poll failed"
                    );
                    if self
                        .policy
                        .max_consecutive_errors
                        .is_some_and(|cap| consecutive_errors >= cap)
                    {
                        self.abandon(&err, consecutive_errors);
                        return;
                    }
                }
            }
        }
    }

    fn apply(&self, polled: JobRecord) -> ControlFlow<()> {
        let flow = self.ticket.publish(|| {
            let mut record = self
                .record_tx
                .borrow()
                .clone()
                .unwrap_or_else(|| JobRecord::queued(self.job_id.clone()));
            if record.advance(&polled) == Transition::Rejected {
                debug!(
                    job_id = %self.job_id,
                    current = %record.status,
                    reported = %polled.status,
                    "ignoring out-of-order job status"
                );
                return ControlFlow::Continue(());
            }

            let event = JobEvent::from_record(&self.job_id, &record);
            let terminal = record.status.is_terminal();
            if terminal {
                info!(
                    job_id = %self.job_id,
                    status = %record.status,
                    processed = record.processed_count,
                    "ingestion job finished"
                );
            }
            self.record_tx.send_replace(Some(record));
            let _ = self.event_tx.send(event);
            if terminal {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        flow.unwrap_or(ControlFlow::Break(()))
    }

    fn abandon(&self, err: &ApiError, attempts: u32) {
        self.ticket.publish(|| {
            warn!(job_id = %self.job_id, attempts, "giving up on job status polling");
            let _ = self.event_tx.send(JobEvent::Abandoned {
                job_id: self.job_id.clone(),
                error: err.to_string(),
                attempts,
            });
        });
    }
}
