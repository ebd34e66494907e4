//! Text summary builder for CLI output.
//!
//! Formats human-readable lines for text mode. JSON mode serializes the model
//! types directly and never comes through here.

use crate::model::{AnalysisOutcome, Analytics, JobEvent, LogPage, LogQuery};
use serde::Serialize;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

pub(crate) fn job_event_line(event: &JobEvent) -> String {
    match event {
        JobEvent::Progress {
            job_id,
            status,
            processed_count,
        } => format!("[{job_id}] {status}: {processed_count} records processed"),
        JobEvent::Completed {
            job_id,
            processed_count,
        } => format!("[{job_id}] completed: {processed_count} records processed"),
        JobEvent::Failed { job_id, error } => format!("[{job_id}] failed: {error}"),
        JobEvent::Abandoned {
            job_id,
            error,
            attempts,
        } => format!("[{job_id}] gave up polling after {attempts} failed attempts: {error}"),
    }
}

/// Render a finished analysis. Structured results get one labelled line per field.
pub(crate) fn build_analysis_summary(outcome: &AnalysisOutcome) -> TextSummary {
    let mut lines = Vec::new();
    match outcome {
        AnalysisOutcome::Structured(result) => {
            lines.push(format!("Cause: {}", result.cause));
            if let Some(severity) = result.severity.as_ref().and_then(label) {
                lines.push(format!("Severity: {severity}"));
            }
            if let Some(confidence) = result.confidence.as_ref().and_then(label) {
                lines.push(format!("Confidence: {confidence}"));
            }
            if !result.affected_services.is_empty() {
                lines.push(format!(
                    "Affected services: {}",
                    result.affected_services.join(", ")
                ));
            }
            if let Some(impact) = result.impact.as_deref() {
                lines.push(format!("Impact: {impact}"));
            }
            if let Some(solution) = result.solution.as_deref() {
                lines.push(format!("Solution: {solution}"));
            }
            if let Some(recommendation) = result.recommendation.as_deref() {
                lines.push(format!("Recommendation: {recommendation}"));
            }
        }
        AnalysisOutcome::Fallback(raw) => {
            lines.push("Analysis (unstructured):".to_string());
            lines.extend(raw.lines().map(str::to_string));
        }
    }
    TextSummary { lines }
}

pub(crate) fn build_page_summary(query: &LogQuery, page: &LogPage) -> TextSummary {
    let mut lines = Vec::new();
    let mut filters = Vec::new();
    if let Some(service) = query.service.as_deref() {
        filters.push(format!("service={service}"));
    }
    if let Some(level) = query.level.as_deref() {
        filters.push(format!("level={level}"));
    }
    if let Some(score) = query.min_anomaly_score {
        filters.push(format!("anomaly>={score:.2}"));
    }
    if let Some(search) = query.search.as_deref() {
        filters.push(format!("search={search:?}"));
    }
    if let Some(start) = query.start_time.as_deref() {
        filters.push(format!("since={start}"));
    }
    let filters = if filters.is_empty() {
        "no filters".to_string()
    } else {
        filters.join(" ")
    };
    lines.push(format!(
        "Page {}/{} ({} matching, {filters})",
        query.page,
        page.pages.max(1),
        page.total
    ));

    if page.logs.is_empty() {
        lines.push("  (no logs)".to_string());
    }
    for log in &page.logs {
        let mut line = format!(
            "  {} {:<5} {:<16} {}",
            log.timestamp, log.level, log.service, log.message
        );
        if log.anomaly_score > 0.0 {
            line.push_str(&format!(" [anomaly {:.2}]", log.anomaly_score));
        }
        lines.push(line);
    }
    TextSummary { lines }
}

pub(crate) fn analytics_line(analytics: &Analytics) -> String {
    let mut line = format!(
        "Summary: {} logs, {} errors, {} warnings, error rate {:.1}%, {} anomalies",
        analytics.total_logs,
        analytics.error_count,
        analytics.warn_count,
        analytics.error_rate,
        analytics.anomaly_count
    );
    if !analytics.top_services.is_empty() {
        line.push_str(&format!(" (top: {})", analytics.top_services.join(", ")));
    }
    line
}

pub(crate) fn liveness_line(alive: bool) -> String {
    if alive {
        "Backend: up".to_string()
    } else {
        "Backend: unreachable".to_string()
    }
}

/// Wire name of a unit enum variant, e.g. `HIGH`.
fn label<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_value(value).ok()? {
        serde_json::Value::String(s) => Some(s),
        _ => None,
    }
}
