use crate::event::RawLine;
use crate::metrics::LINES_READ_TOTAL;
use crate::watcher::FileWake;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::sleep;
use tracing::{debug, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(500);
const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Produces lines for the parser stage.
///
/// `Ok(None)` means the source is exhausted. A file tailer never returns it;
/// finite sources (fixtures, replays) use it to end the pipeline cleanly.
#[async_trait]
pub trait LineSource: Send {
    async fn next_line(&mut self) -> Result<Option<RawLine>>;
}

/// Follows a single growing file from its end at open time.
pub struct FileTailer {
    path: PathBuf,
    file: File,
    chunk: Vec<u8>,
    buffer: Vec<u8>,
    pending: VecDeque<RawLine>,
    poll_interval: Duration,
    wake: Option<FileWake>,
}

impl FileTailer {
    /// Opens `path` and positions the cursor at its current end, so content
    /// written before this call is never replayed.
    pub async fn open(path: impl AsRef<Path>, poll_interval: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let offset = file
            .seek(SeekFrom::End(0))
            .await
            .with_context(|| format!("failed to seek {} to end", path.display()))?;

        let poll_interval = if poll_interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            poll_interval
        };

        info!(path = %path.display(), offset, "starting tailer at end of file");

        Ok(Self {
            path,
            file,
            chunk: vec![0u8; READ_CHUNK_BYTES],
            buffer: Vec::new(),
            pending: VecDeque::new(),
            poll_interval,
            wake: None,
        })
    }

    /// Wake up early on file-change notifications instead of waiting out the
    /// full poll interval.
    pub fn with_wake(mut self, wake: FileWake) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Reads whatever is available and queues every completed line. Returns
    /// the number of bytes read; zero means no new data yet.
    async fn fill(&mut self) -> Result<usize> {
        let bytes_read = self
            .file
            .read(&mut self.chunk)
            .await
            .with_context(|| format!("failed to read from {}", self.path.display()))?;
        if bytes_read == 0 {
            return Ok(0);
        }

        self.buffer.extend_from_slice(&self.chunk[..bytes_read]);
        for line in drain_complete_lines(&mut self.buffer) {
            self.pending.push_back(RawLine::new(strip_carriage_return(line)));
        }
        debug!(
            path = %self.path.display(),
            bytes_read,
            queued = self.pending.len(),
            partial = self.buffer.len(),
            "read appended bytes"
        );
        Ok(bytes_read)
    }

    async fn wait_for_data(&mut self) {
        match self.wake.as_ref().map(FileWake::handle) {
            Some(wakeup) => {
                tokio::select! {
                    _ = sleep(self.poll_interval) => {}
                    _ = wakeup.notified() => {}
                }
            }
            None => sleep(self.poll_interval).await,
        }
    }
}

#[async_trait]
impl LineSource for FileTailer {
    async fn next_line(&mut self) -> Result<Option<RawLine>> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                LINES_READ_TOTAL.inc();
                return Ok(Some(line));
            }
            // A partial trailing line stays in `buffer` until its terminator arrives.
            if self.fill().await? == 0 {
                self.wait_for_data().await;
            }
        }
    }
}

/// Removes every `\n`-terminated line from the front of `buffer`, leaving any
/// unterminated tail in place.
pub(crate) fn drain_complete_lines(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    let mut start = 0usize;

    for (idx, byte) in buffer.iter().enumerate() {
        if *byte == b'\n' {
            lines.push(buffer[start..idx].to_vec());
            start = idx + 1;
        }
    }

    if start > 0 {
        buffer.drain(0..start);
    }

    lines
}

fn strip_carriage_return(mut line: Vec<u8>) -> Vec<u8> {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    line
}
