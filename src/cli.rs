use crate::backend::{Backend, HttpBackend};
use crate::model::{
    ClientConfig, CoordinatorEvent, FilterPatch, FilterState, JobEvent, PollPolicy, QueryEvent,
    QueryRequest, TimeWindow, UploadRequest,
};
use crate::orchestrator::{
    parse_command, run_watch, JobTracker, QueryStateCoordinator, StreamingQueryClient,
    WatchCommand, WATCH_HELP,
};
use crate::text_summary;
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::debug;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    /// Streamed text without a trailing newline.
    Fragment(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Fragment(msg) => {
                    let _ = write!(out, "{}", msg);
                    let _ = out.flush();
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "loglens",
    version,
    about = "Upload logs, track ingestion, browse logs and ask for root-cause analysis"
)]
pub struct Cli {
    /// Base URL of the log analysis backend
    #[arg(
        long,
        global = true,
        env = "LOGLENS_BASE_URL",
        default_value = "http://localhost:8000"
    )]
    pub base_url: String,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Delay between job status polls
    #[arg(long, global = true, default_value = "2s")]
    pub poll_interval: humantime::Duration,

    /// Give up tracking a job after this many consecutive failed polls (default: never)
    #[arg(long, global = true)]
    pub max_poll_errors: Option<u32>,

    /// Period of the analytics/liveness refresh while watching
    #[arg(long, global = true, default_value = "30s")]
    pub refresh_interval: humantime::Duration,

    /// Timeout for individual (non-streaming) requests
    #[arg(long, global = true, default_value = "30s")]
    pub request_timeout: humantime::Duration,

    /// Log records per page
    #[arg(long, global = true, default_value_t = crate::model::DEFAULT_PAGE_SIZE)]
    pub page_size: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Upload a log file and follow its ingestion job
    Upload { file: PathBuf },
    /// Follow an existing ingestion job
    Status { job_id: String },
    /// Ask a question about the logs and stream the analysis
    Ask {
        query: String,
        /// Log record the analysis should focus on (repeatable)
        #[arg(long = "log-id")]
        log_ids: Vec<String>,
        /// Model to request from the backend
        #[arg(long)]
        model: Option<String>,
    },
    /// Print one page of logs
    Logs {
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    /// Browse logs interactively, with a periodic summary refresh
    Watch {
        #[command(flatten)]
        filters: FilterArgs,
    },
}

#[derive(Debug, Args, Clone, Default)]
pub struct FilterArgs {
    #[arg(long)]
    pub service: Option<String>,
    /// Log level, e.g. ERROR
    #[arg(long)]
    pub level: Option<String>,
    /// Minimum anomaly score in [0, 1]
    #[arg(long, alias = "threshold")]
    pub min_anomaly: Option<f64>,
    /// Free-text search
    #[arg(long)]
    pub search: Option<String>,
    /// Only logs newer than this, e.g. 15m or 2h
    #[arg(long)]
    pub since: Option<humantime::Duration>,
}

impl FilterArgs {
    fn to_patch(&self, now: OffsetDateTime) -> Result<FilterPatch> {
        let window = match self.since {
            Some(since) => {
                let start = time::Duration::try_from(Duration::from(since))
                    .ok()
                    .and_then(|since| now.checked_sub(since))
                    .with_context(|| format!("--since {since} reaches too far back"))?;
                Some(TimeWindow {
                    start: Some(start),
                    end: None,
                })
            }
            None => None,
        };
        Ok(FilterPatch {
            service: self.service.clone(),
            level: self.level.clone(),
            anomaly_threshold: self.min_anomaly,
            search_text: self.search.clone(),
            window,
        })
    }
}

/// Build a `ClientConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> ClientConfig {
    ClientConfig {
        request_timeout: Duration::from(args.request_timeout),
        poll: PollPolicy {
            interval: Duration::from(args.poll_interval),
            max_consecutive_errors: args.max_poll_errors,
        },
        refresh_interval: Duration::from(args.refresh_interval),
        page_size: args.page_size,
        ..ClientConfig::new(args.base_url.clone())
    }
}

fn initial_filters(cfg: &ClientConfig, filters: &FilterArgs) -> Result<FilterState> {
    let mut state = FilterState::default().with_page_size(cfg.page_size);
    state
        .merge(filters.to_patch(OffsetDateTime::now_utc())?)
        .context("invalid filter")?;
    Ok(state)
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let backend: Arc<dyn Backend> =
        Arc::new(HttpBackend::new(&cfg).context("failed to build HTTP client")?);
    debug!(base_url = %cfg.base_url, "backend configured");

    let (out_tx, out_handle) = spawn_output_writer();
    let res = match &args.command {
        Command::Upload { file } => run_upload(backend, &cfg, file, &out_tx, args.json).await,
        Command::Status { job_id } => {
            run_status(backend, &cfg, job_id.clone(), &out_tx, args.json).await
        }
        Command::Ask {
            query,
            log_ids,
            model,
        } => {
            let request = QueryRequest::new(query.clone(), log_ids.clone(), model.clone())
                .context("invalid query")?;
            run_ask(backend, request, &out_tx, args.json).await
        }
        Command::Logs { filters, page } => {
            run_logs(backend, &cfg, filters, *page, &out_tx, args.json).await
        }
        Command::Watch { filters } => run_watch_cmd(backend, &cfg, filters, &out_tx, args.json).await,
    };
    drop(out_tx);
    let _ = out_handle.await;
    res
}

async fn run_upload(
    backend: Arc<dyn Backend>,
    cfg: &ClientConfig,
    file: &Path,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
    json: bool,
) -> Result<()> {
    let content = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.log".to_string());
    let upload = UploadRequest {
        filename,
        content: content.into(),
    };

    let (evt_tx, evt_rx) = mpsc::unbounded_channel::<JobEvent>();
    let mut tracker = JobTracker::new(backend, cfg.poll, evt_tx);
    let job_id = tokio::select! {
        res = tracker.submit(upload) => res.context("upload failed")?,
        _ = tokio::signal::ctrl_c() => bail!("upload cancelled"),
    };
    if !json {
        let _ = out_tx.send(OutputLine::Stderr(format!("Uploaded, tracking job {job_id}")));
    }
    follow_job(&mut tracker, evt_rx, out_tx, json).await
}

async fn run_status(
    backend: Arc<dyn Backend>,
    cfg: &ClientConfig,
    job_id: String,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
    json: bool,
) -> Result<()> {
    let (evt_tx, evt_rx) = mpsc::unbounded_channel::<JobEvent>();
    let mut tracker = JobTracker::new(backend, cfg.poll, evt_tx);
    tracker.start(job_id);
    follow_job(&mut tracker, evt_rx, out_tx, json).await
}

/// Print job events until the job reaches a terminal state or the user hits Ctrl-C.
async fn follow_job(
    tracker: &mut JobTracker,
    mut evt_rx: mpsc::UnboundedReceiver<JobEvent>,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
    json: bool,
) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            ev = evt_rx.recv() => {
                let Some(ev) = ev else {
                    bail!("job tracking ended unexpectedly");
                };
                if json {
                    let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string(&ev)?));
                } else if ev.is_terminal() {
                    let _ = out_tx.send(OutputLine::Stdout(text_summary::job_event_line(&ev)));
                } else {
                    let _ = out_tx.send(OutputLine::Stderr(text_summary::job_event_line(&ev)));
                }
                match ev {
                    JobEvent::Progress { .. } => {}
                    JobEvent::Completed { .. } => return Ok(()),
                    JobEvent::Failed { job_id, error } => bail!("job {job_id} failed: {error}"),
                    JobEvent::Abandoned { job_id, .. } => {
                        report_last_seen(tracker, out_tx);
                        bail!("stopped tracking job {job_id}: backend unreachable")
                    }
                }
            }
            _ = &mut ctrl_c => {
                tracker.stop();
                report_last_seen(tracker, out_tx);
                bail!("tracking cancelled");
            }
        }
    }
}

fn report_last_seen(tracker: &JobTracker, out_tx: &mpsc::UnboundedSender<OutputLine>) {
    if let Some(record) = tracker.record() {
        let _ = out_tx.send(OutputLine::Stderr(format!(
            "Last seen: job {} {} with {} records processed",
            record.id, record.status, record.processed_count
        )));
    }
}

async fn run_ask(
    backend: Arc<dyn Backend>,
    request: QueryRequest,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
    json: bool,
) -> Result<()> {
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<QueryEvent>();
    let mut client = StreamingQueryClient::new(backend, evt_tx);
    client.start(request);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    // Bytes of the accumulated text already echoed.
    let mut printed = 0usize;

    loop {
        tokio::select! {
            ev = evt_rx.recv() => {
                let Some(ev) = ev else {
                    bail!("analysis ended unexpectedly");
                };
                match ev {
                    QueryEvent::Partial { text } => {
                        if !json {
                            if let Some(delta) = text.get(printed..).filter(|d| !d.is_empty()) {
                                let _ = out_tx.send(OutputLine::Fragment(delta.to_string()));
                            }
                        }
                        printed = text.len();
                    }
                    QueryEvent::Completed { outcome } => {
                        if json {
                            let out = serde_json::to_string_pretty(&outcome)?;
                            let _ = out_tx.send(OutputLine::Stdout(out));
                        } else {
                            if printed > 0 {
                                let _ = out_tx.send(OutputLine::Stdout(String::new()));
                            }
                            for line in text_summary::build_analysis_summary(&outcome).lines {
                                let _ = out_tx.send(OutputLine::Stdout(line));
                            }
                        }
                        return Ok(());
                    }
                    QueryEvent::Errored { message } => {
                        if printed > 0 && !json {
                            let _ = out_tx.send(OutputLine::Stdout(String::new()));
                        }
                        bail!("analysis failed: {message}");
                    }
                }
            }
            _ = &mut ctrl_c => {
                client.cancel();
                let received = client.buffer();
                if !received.is_empty() && !json {
                    let _ = out_tx.send(OutputLine::Stdout(String::new()));
                }
                bail!(
                    "analysis cancelled after {} characters of output",
                    received.chars().count()
                );
            }
        }
    }
}

async fn run_logs(
    backend: Arc<dyn Backend>,
    cfg: &ClientConfig,
    filters: &FilterArgs,
    page: u32,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
    json: bool,
) -> Result<()> {
    let state = initial_filters(cfg, filters)?;
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<CoordinatorEvent>();
    let mut coordinator = QueryStateCoordinator::new(backend, state, cfg.refresh_interval, evt_tx);
    coordinator.change_page(page).context("invalid page")?;

    while let Some(ev) = evt_rx.recv().await {
        match ev {
            CoordinatorEvent::PageLoaded { query, page } => {
                if json {
                    let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(&page)?));
                } else {
                    for line in text_summary::build_page_summary(&query, &page).lines {
                        let _ = out_tx.send(OutputLine::Stdout(line));
                    }
                }
                return Ok(());
            }
            CoordinatorEvent::FetchFailed { message, .. } => bail!(message),
            _ => {}
        }
    }
    bail!("log fetch ended unexpectedly")
}

async fn run_watch_cmd(
    backend: Arc<dyn Backend>,
    cfg: &ClientConfig,
    filters: &FilterArgs,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
    json: bool,
) -> Result<()> {
    let state = initial_filters(cfg, filters)?;
    let (evt_tx, evt_rx) = mpsc::unbounded_channel::<CoordinatorEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<WatchCommand>();
    let (notice_tx, notice_rx) = mpsc::unbounded_channel::<String>();
    let mut coordinator = QueryStateCoordinator::new(backend, state, cfg.refresh_interval, evt_tx);

    let _ = out_tx.send(OutputLine::Stderr(WATCH_HELP.to_string()));
    let printer = tokio::spawn(print_watch_events(evt_rx, notice_rx, out_tx.clone(), json));
    let reader = tokio::spawn(read_commands(cmd_tx.clone(), notice_tx.clone()));
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cmd_tx.send(WatchCommand::Quit);
        }
    });

    let res = run_watch(&mut coordinator, cmd_rx, notice_tx).await;
    drop(coordinator);
    reader.abort();
    interrupt.abort();
    // Let the printer drain what the last fetches produced.
    let _ = tokio::time::timeout(Duration::from_millis(250), printer).await;
    res
}

async fn read_commands(
    cmd_tx: mpsc::UnboundedSender<WatchCommand>,
    notice_tx: mpsc::UnboundedSender<String>,
) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                let _ = notice_tx.send(format!("failed to read input: {err}"));
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("help") {
            let _ = notice_tx.send(WATCH_HELP.to_string());
            continue;
        }
        match parse_command(line) {
            Ok(cmd) => {
                if cmd_tx.send(cmd).is_err() {
                    return;
                }
            }
            Err(msg) => {
                let _ = notice_tx.send(msg);
            }
        }
    }
    let _ = cmd_tx.send(WatchCommand::Quit);
}

async fn print_watch_events(
    mut evt_rx: mpsc::UnboundedReceiver<CoordinatorEvent>,
    mut notice_rx: mpsc::UnboundedReceiver<String>,
    out_tx: mpsc::UnboundedSender<OutputLine>,
    json: bool,
) {
    loop {
        tokio::select! {
            Some(ev) = evt_rx.recv() => {
                if json {
                    if let Ok(line) = serde_json::to_string(&ev) {
                        let _ = out_tx.send(OutputLine::Stdout(line));
                    }
                    continue;
                }
                match ev {
                    CoordinatorEvent::PageLoaded { query, page } => {
                        for line in text_summary::build_page_summary(&query, &page).lines {
                            let _ = out_tx.send(OutputLine::Stdout(line));
                        }
                    }
                    CoordinatorEvent::Summary { analytics } => {
                        let _ = out_tx.send(OutputLine::Stderr(text_summary::analytics_line(&analytics)));
                    }
                    CoordinatorEvent::Liveness { alive } => {
                        let _ = out_tx.send(OutputLine::Stderr(text_summary::liveness_line(alive)));
                    }
                    CoordinatorEvent::FetchFailed { message, .. } => {
                        let _ = out_tx.send(OutputLine::Stderr(message));
                    }
                }
            }
            Some(notice) = notice_rx.recv() => {
                let _ = out_tx.send(OutputLine::Stderr(notice));
            }
            else => break,
        }
    }
}
