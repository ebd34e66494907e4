//! Interactive browsing controller.
//!
//! Maps line commands from the presentation layer onto [`QueryStateCoordinator`]
//! operations. Page results and summaries reach the presentation layer through
//! the coordinator's own event channel; this loop only reports notices.

use super::QueryStateCoordinator;
use crate::model::FilterPatch;
use anyhow::Result;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Commands emitted by UI layers while browsing logs.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WatchCommand {
    Next,
    Prev,
    Page(u32),
    Filter(FilterPatch),
    Clear,
    Refresh,
    Quit,
}

pub(crate) const WATCH_HELP: &str = "commands: next | prev | page N | service X | level X | \
threshold X | search X | clear | refresh | quit";

/// Parse one input line. A filter command without an argument clears that filter.
pub(crate) fn parse_command(line: &str) -> Result<WatchCommand, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let cmd = match word.to_ascii_lowercase().as_str() {
        "n" | "next" => WatchCommand::Next,
        "p" | "prev" => WatchCommand::Prev,
        "page" => {
            let page = rest
                .parse::<u32>()
                .map_err(|_| format!("not a page number: {rest:?}"))?;
            WatchCommand::Page(page)
        }
        "service" => WatchCommand::Filter(FilterPatch {
            service: Some(rest.to_string()),
            ..Default::default()
        }),
        "level" => WatchCommand::Filter(FilterPatch {
            level: Some(rest.to_string()),
            ..Default::default()
        }),
        "threshold" => {
            let threshold = if rest.is_empty() {
                0.0
            } else {
                rest.parse::<f64>()
                    .map_err(|_| format!("not a number: {rest:?}"))?
            };
            WatchCommand::Filter(FilterPatch {
                anomaly_threshold: Some(threshold),
                ..Default::default()
            })
        }
        "search" => WatchCommand::Filter(FilterPatch {
            search_text: Some(rest.to_string()),
            ..Default::default()
        }),
        "clear" => WatchCommand::Clear,
        "r" | "refresh" => WatchCommand::Refresh,
        "q" | "quit" | "exit" => WatchCommand::Quit,
        "" => return Err("empty command".into()),
        other => return Err(format!("unknown command {other:?}; {WATCH_HELP}")),
    };
    Ok(cmd)
}

/// Drive `coordinator` from `cmd_rx` until `Quit` or the channel closes.
pub(crate) async fn run_watch(
    coordinator: &mut QueryStateCoordinator,
    mut cmd_rx: UnboundedReceiver<WatchCommand>,
    notice_tx: UnboundedSender<String>,
) -> Result<()> {
    coordinator.refresh_now();
    coordinator.start_refresh();
    let current = coordinator.filters().page;
    coordinator.change_page(current)?;

    while let Some(cmd) = cmd_rx.recv().await {
        debug!(?cmd, "watch command");
        let page = coordinator.filters().page;
        let outcome = match cmd {
            WatchCommand::Next => {
                let known_pages = coordinator.view().page.map(|p| p.pages);
                match following_page(page, known_pages) {
                    Some(next) => coordinator.change_page(next).map(drop),
                    None => {
                        let _ = notice_tx.send("already on the last page".into());
                        Ok(())
                    }
                }
            }
            WatchCommand::Prev => {
                if page <= 1 {
                    let _ = notice_tx.send("already on the first page".into());
                    Ok(())
                } else {
                    coordinator.change_page(page - 1).map(drop)
                }
            }
            WatchCommand::Page(n) => coordinator.change_page(n).map(drop),
            WatchCommand::Filter(patch) => coordinator.apply_filter(patch).map(drop),
            WatchCommand::Clear => coordinator.apply_filter(FilterPatch::cleared()).map(drop),
            WatchCommand::Refresh => {
                coordinator.refresh_now();
                coordinator.change_page(page).map(drop)
            }
            WatchCommand::Quit => break,
        };
        if let Err(err) = outcome {
            let _ = notice_tx.send(err.to_string());
        }
    }

    coordinator.shutdown();
    Ok(())
}

/// Page after `page`, or `None` when `page` is already the last one.
fn following_page(page: u32, known_pages: Option<u32>) -> Option<u32> {
    match known_pages {
        Some(pages) if page >= pages => None,
        _ => page.checked_add(1),
    }
}
