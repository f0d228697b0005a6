//! Wake watcher for out-of-band history appends.
//!
//! A second process (e.g. `showrunner approve`) may append an
//! `EventRaised` line to an instance's history file. The hosting runtime
//! watches its state root and wakes the touched instance for a replay
//! pass. Wakes triggered by the runtime's own appends are harmless:
//! replaying an unchanged decision state produces nothing new.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::runtime::Runtime;

/// Handle keeping the filesystem watcher alive; dropping it stops the
/// wake loop.
pub struct WakeWatcher {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl WakeWatcher {
    /// Watch the runtime's state root and wake instances whose history
    /// files change.
    pub fn spawn(runtime: &Runtime) -> Result<Self> {
        let root = runtime.root().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create state root: {}", root.display()))?;

        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let runtime = runtime.clone();
        let handle = tokio::runtime::Handle::current();

        let task = tokio::task::spawn_blocking(move || {
            if let Err(e) = watch_loop(&root, runtime, handle, stop_rx) {
                error!(error = %e, "Wake watcher stopped");
            }
        });

        Ok(Self { stop_tx, task })
    }

    /// Stop watching.
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(()).await;
        self.task.await?;
        Ok(())
    }
}

fn watch_loop(
    root: &Path,
    runtime: Runtime,
    handle: tokio::runtime::Handle,
    mut stop_rx: mpsc::Receiver<()>,
) -> Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();

    let mut debouncer = new_debouncer(Duration::from_millis(200), tx)
        .context("Failed to create filesystem watcher")?;

    debouncer
        .watcher()
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch state root: {}", root.display()))?;

    info!(root = %root.display(), "Watching for out-of-band history appends");

    loop {
        if stop_rx.try_recv().is_ok() {
            info!("Wake watcher stopping");
            break;
        }

        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(Ok(events)) => {
                for event in events {
                    let Some(instance) = instance_for_path(root, &event.path) else {
                        continue;
                    };

                    debug!(%instance, "History change detected, waking instance");
                    let runtime = runtime.clone();
                    handle.spawn(async move {
                        runtime.wake(&instance).await;
                    });
                }
            }
            Ok(Err(e)) => {
                error!(error = %e, "Filesystem watcher error");
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    Ok(())
}

/// Map a changed path back to the instance id it belongs to.
fn instance_for_path(root: &Path, path: &PathBuf) -> Option<String> {
    if path.file_name()?.to_str()? != "history.jsonl" {
        return None;
    }

    let parent = path.parent()?;
    if parent.parent()? != root {
        return None;
    }

    Some(parent.file_name()?.to_str()?.to_string())
}
