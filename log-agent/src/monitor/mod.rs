//! Self-monitoring for the running pipeline.
//!
//! Stage tasks report through a [`MonitorHandle`]. A single accumulation task
//! owns the counters, a sampling task feeds the throughput window, and
//! [`Monitor::snapshot`] copies everything into a [`SystemStats`] for the
//! query surface in [`server`].

pub mod server;
pub mod window;

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use window::ThroughputWindow;

pub const SIGNAL_CHANNEL_CAPACITY: usize = 200;
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorSignal {
    LineHandled,
    ParseError,
}

/// Sending side of the monitor signal channel.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    signals: mpsc::Sender<MonitorSignal>,
}

impl MonitorHandle {
    /// Returns `false` once the monitor has stopped listening.
    pub async fn record(&self, signal: MonitorSignal) -> bool {
        self.signals.send(signal).await.is_ok()
    }
}

/// Current backlog of a hand-off channel.
pub trait QueueGauge: Send + Sync {
    fn depth(&self) -> usize;
}

impl<T: Send> QueueGauge for mpsc::WeakSender<T> {
    fn depth(&self) -> usize {
        self.upgrade()
            .map(|sender| sender.max_capacity() - sender.capacity())
            .unwrap_or(0)
    }
}

#[derive(Clone)]
pub struct QueueDepths {
    read: Arc<dyn QueueGauge>,
    write: Arc<dyn QueueGauge>,
}

impl QueueDepths {
    pub fn new(read: impl QueueGauge + 'static, write: impl QueueGauge + 'static) -> Self {
        Self {
            read: Arc::new(read),
            write: Arc::new(write),
        }
    }
}

/// Point-in-time copy of the monitor state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStats {
    #[serde(rename = "handleLine")]
    pub handled_line_count: u64,
    pub tps: f64,
    #[serde(rename = "readChanLen")]
    pub read_queue_depth: usize,
    #[serde(rename = "writeChanLen")]
    pub write_queue_depth: usize,
    #[serde(rename = "runTime")]
    pub run_time: String,
    #[serde(rename = "errNum")]
    pub error_count: u64,
}

impl SystemStats {
    /// Tab-indented JSON body served at `/monitor`.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let formatter = PrettyFormatter::with_indent(b"\t");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        self.serialize(&mut serializer)?;
        Ok(buffer)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    handled: u64,
    errors: u64,
}

struct MonitorState {
    started_at: Instant,
    counters: Mutex<Counters>,
    window: Mutex<ThroughputWindow>,
    queues: QueueDepths,
}

/// Cheaply cloneable view of the monitor state.
#[derive(Clone)]
pub struct Monitor {
    state: Arc<MonitorState>,
}

impl Monitor {
    /// Spawns the accumulation and sampling tasks. Both stop when `cancel`
    /// fires; the accumulator also stops once every handle is dropped.
    pub fn start(
        queues: QueueDepths,
        sample_interval: Duration,
        cancel: CancellationToken,
    ) -> (Monitor, MonitorHandle) {
        let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let state = Arc::new(MonitorState {
            started_at: Instant::now(),
            counters: Mutex::new(Counters::default()),
            window: Mutex::new(ThroughputWindow::new()),
            queues,
        });

        tokio::spawn(accumulate(state.clone(), rx, cancel.clone()));
        tokio::spawn(sample(state.clone(), sample_interval, cancel));

        (Monitor { state }, MonitorHandle { signals: tx })
    }

    pub fn snapshot(&self) -> SystemStats {
        let counters = *lock(&self.state.counters);
        let tps = lock(&self.state.window).rate();

        SystemStats {
            handled_line_count: counters.handled,
            tps,
            read_queue_depth: self.state.queues.read.depth(),
            write_queue_depth: self.state.queues.write.depth(),
            run_time: format_run_time(self.state.started_at.elapsed()),
            error_count: counters.errors,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn accumulate(
    state: Arc<MonitorState>,
    mut signals: mpsc::Receiver<MonitorSignal>,
    cancel: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };

        let mut counters = lock(&state.counters);
        match signal {
            MonitorSignal::LineHandled => counters.handled += 1,
            MonitorSignal::ParseError => counters.errors += 1,
        }
    }
    debug!("monitor accumulator stopped");
}

async fn sample(state: Arc<MonitorState>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let handled = lock(&state.counters).handled;
                lock(&state.window).push(Instant::now(), handled);
            }
        }
    }
    debug!("monitor sampler stopped");
}

/// Renders a duration the way `1h2m3.5s`, `2m0s` or `250ms` read.
pub fn format_run_time(elapsed: Duration) -> String {
    let nanos = elapsed.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return format!("{}µs", decimal(nanos / 1_000, nanos % 1_000, 3));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", decimal(nanos / 1_000_000, nanos % 1_000_000, 6));
    }

    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = decimal(
        u128::from(total_secs % 60),
        u128::from(elapsed.subsec_nanos()),
        9,
    );

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

fn decimal(whole: u128, fraction: u128, width: usize) -> String {
    if fraction == 0 {
        return whole.to_string();
    }
    let digits = format!("{fraction:0width$}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}
