use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::core::Core;

/// Watch the repository tree and reload on changes. Events are
/// debounced: after the first event we wait briefly, drain whatever
/// else queued up, and reload once. A failed reload keeps the previous
/// snapshot (handled inside `Core::reload`).
pub async fn watch_repository(core: Arc<Core>, path: PathBuf) -> Result<()> {
    tracing::info!(path = %path.display(), "starting repository watcher");

    let (tx, mut rx) = mpsc::channel(100);

    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                let _ = tx.blocking_send(event);
            }
        }
    })
    .context("create filesystem watcher")?;

    watcher
        .watch(&path, RecursiveMode::Recursive)
        .with_context(|| format!("watch {}", path.display()))?;

    loop {
        if rx.recv().await.is_some() {
            tokio::time::sleep(Duration::from_millis(100)).await;
            while rx.try_recv().is_ok() {}

            core.reload();
        }
    }
}
