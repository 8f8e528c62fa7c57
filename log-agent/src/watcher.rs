use anyhow::{Context, Result};
use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// File-change wake-up for the tailer.
///
/// The tailer still polls; this only shortens the wait after an append. A
/// notification that arrives while nobody is waiting is kept as a permit, so
/// an append between two reads is never missed.
pub struct FileWake {
    wakeup: Arc<Notify>,
    // Dropping the watcher stops notifications.
    _watcher: RecommendedWatcher,
}

impl FileWake {
    pub fn watch(path: &Path) -> Result<Self> {
        let wakeup = Arc::new(Notify::new());
        let handler_wakeup = wakeup.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => handle_event(&handler_wakeup, event),
                Err(err) => error!(error = %err, "file watcher error"),
            },
            NotifyConfig::default(),
        )
        .context("failed to create notify watcher")?;

        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch path {}", path.display()))?;

        info!(path = %path.display(), "file change notifications enabled");

        Ok(Self {
            wakeup,
            _watcher: watcher,
        })
    }

    /// Shared handle the tailer waits on.
    pub(crate) fn handle(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }
}

fn handle_event(wakeup: &Notify, event: Event) {
    if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
        debug!(kind = ?event.kind, "detected file change");
        wakeup.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn wakes_on_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "").unwrap();

        let wake = FileWake::watch(&path).expect("watch should start");

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        file.write_all(b"line\n").unwrap();
        file.flush().unwrap();

        let wakeup = wake.handle();
        timeout(Duration::from_secs(5), wakeup.notified())
            .await
            .expect("append should produce a notification");
    }

    #[test]
    fn watch_fails_for_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileWake::watch(&dir.path().join("missing.log")).is_err());
    }
}
