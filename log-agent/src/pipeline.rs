//! Stage wiring: Tailer -> Parser -> Sink Writer.
//!
//! This module handles:
//! - Owning the two bounded hand-off channels
//! - Spawning one task per stage
//! - Reporting parse outcomes to the monitor
//! - Escalating the first fatal stage error and cancelling the rest

use crate::error::FatalError;
use crate::event::{LogEvent, RawLine};
use crate::metrics::{PARSE_DURATION, PARSE_ERRORS_TOTAL, POINTS_WRITTEN_TOTAL};
use crate::monitor::{MonitorHandle, MonitorSignal, QueueDepths};
use crate::output_writer::PointSink;
use crate::parsers::{line_preview, LineParser};
use crate::point::Point;
use crate::tailer::LineSource;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const PREVIEW_CHARS: usize = 256;

pub struct Pipeline {
    read_tx: mpsc::Sender<RawLine>,
    read_rx: mpsc::Receiver<RawLine>,
    write_tx: mpsc::Sender<LogEvent>,
    write_rx: mpsc::Receiver<LogEvent>,
}

impl Pipeline {
    /// Capacities below one are raised to one.
    pub fn new(read_capacity: usize, write_capacity: usize) -> Self {
        let (read_tx, read_rx) = mpsc::channel(read_capacity.max(1));
        let (write_tx, write_rx) = mpsc::channel(write_capacity.max(1));
        Self {
            read_tx,
            read_rx,
            write_tx,
            write_rx,
        }
    }

    /// Gauges over both hand-off channels. They hold weak senders only.
    pub fn queue_depths(&self) -> QueueDepths {
        QueueDepths::new(self.read_tx.downgrade(), self.write_tx.downgrade())
    }

    /// Runs the three stages until they all finish or one fails.
    ///
    /// The first fatal error cancels `cancel` and is returned once every
    /// stage has stopped. Lines still queued at that point are dropped.
    pub async fn run(
        self,
        source: Box<dyn LineSource>,
        parser: Arc<dyn LineParser>,
        sink: Arc<dyn PointSink>,
        monitor: MonitorHandle,
        cancel: CancellationToken,
    ) -> Result<(), FatalError> {
        let Pipeline {
            read_tx,
            read_rx,
            write_tx,
            write_rx,
        } = self;

        let mut tasks = JoinSet::new();
        tasks.spawn(run_tailer(source, read_tx, cancel.clone()));
        tasks.spawn(run_parser(parser, read_rx, write_tx, monitor, cancel.clone()));
        tasks.spawn(run_writer(sink, write_rx, cancel.clone()));

        let mut first_error: Option<FatalError> = None;
        while let Some(joined) = tasks.join_next().await {
            let Err(err) = joined.map_err(FatalError::from).and_then(|outcome| outcome) else {
                continue;
            };
            if first_error.is_some() {
                debug!(stage = err.stage(), error = %err, "additional stage failure after shutdown");
                continue;
            }
            error!(stage = err.stage(), error = %err, "pipeline stage failed; stopping");
            cancel.cancel();
            first_error = Some(err);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn run_tailer(
    mut source: Box<dyn LineSource>,
    lines: mpsc::Sender<RawLine>,
    cancel: CancellationToken,
) -> Result<(), FatalError> {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            next = source.next_line() => next.map_err(FatalError::Tailer)?,
        };
        let Some(line) = next else {
            info!("line source exhausted");
            return Ok(());
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            sent = lines.send(line) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

async fn run_parser(
    parser: Arc<dyn LineParser>,
    mut lines: mpsc::Receiver<RawLine>,
    events: mpsc::Sender<LogEvent>,
    monitor: MonitorHandle,
    cancel: CancellationToken,
) -> Result<(), FatalError> {
    let mut reporter = Reporter {
        handle: monitor,
        alive: true,
    };

    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            line = lines.recv() => match line {
                Some(line) => line,
                None => return Ok(()),
            },
        };
        reporter.report(MonitorSignal::LineHandled).await;

        let timer = PARSE_DURATION.start_timer();
        let parsed = parser.parse_line(line.as_bytes());
        timer.observe_duration();

        match parsed {
            Ok(event) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    sent = events.send(event) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
            Err(err) => {
                PARSE_ERRORS_TOTAL.with_label_values(&[err.kind()]).inc();
                warn!(
                    error = %err,
                    error_type = err.kind(),
                    line = %line_preview(line.as_bytes(), PREVIEW_CHARS),
                    "discarding unparseable line"
                );
                reporter.report(MonitorSignal::ParseError).await;
            }
        }
    }
}

async fn run_writer(
    sink: Arc<dyn PointSink>,
    mut events: mpsc::Receiver<LogEvent>,
    cancel: CancellationToken,
) -> Result<(), FatalError> {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            event = events.recv() => match event {
                Some(event) => event,
                None => return Ok(()),
            },
        };

        let point = Point::from_event(&event);
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            written = sink.write_point(&point) => written,
        };
        written.map_err(FatalError::Sink)?;

        POINTS_WRITTEN_TOTAL.inc();
        info!(
            path = %event.path,
            method = %event.method,
            status = %event.status,
            "write success"
        );
    }
}

/// Forwards signals until the monitor goes away, then warns once.
struct Reporter {
    handle: MonitorHandle,
    alive: bool,
}

impl Reporter {
    async fn report(&mut self, signal: MonitorSignal) {
        if self.alive && !self.handle.record(signal).await {
            warn!("monitor stopped accepting signals; continuing without monitoring");
            self.alive = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{Monitor, DEFAULT_SAMPLE_INTERVAL};
    use crate::output_writer::FileWriter;
    use crate::parsers::AccessLogParser;
    use crate::point::Precision;
    use crate::tailer::FileTailer;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const LINE: &str = r#"172.0.0.2 - - [04/Mar/2018:13:49:52 +0000] http "GET /foo?query=t HTTP/1.0" 200 2133 "-" "KeepAliveClient" "-" 1.005 1.854"#;

    struct VecSource {
        lines: VecDeque<RawLine>,
        consumed: Arc<AtomicUsize>,
    }

    impl VecSource {
        fn new(lines: Vec<String>) -> (Self, Arc<AtomicUsize>) {
            let consumed = Arc::new(AtomicUsize::new(0));
            let source = Self {
                lines: lines.into_iter().map(|l| RawLine::from(l.as_str())).collect(),
                consumed: consumed.clone(),
            };
            (source, consumed)
        }
    }

    #[async_trait]
    impl LineSource for VecSource {
        async fn next_line(&mut self) -> Result<Option<RawLine>> {
            let line = self.lines.pop_front();
            if line.is_some() {
                self.consumed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(line)
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl LineSource for BrokenSource {
        async fn next_line(&mut self) -> Result<Option<RawLine>> {
            Err(anyhow!("disk went away"))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        points: Mutex<Vec<Point>>,
    }

    #[async_trait]
    impl PointSink for RecordingSink {
        async fn write_point(&self, point: &Point) -> Result<()> {
            self.points.lock().unwrap().push(point.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FailingSink {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl PointSink for FailingSink {
        async fn write_point(&self, _point: &Point) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("influx write rejected with status 500"))
        }
    }

    struct PanickingSink;

    #[async_trait]
    impl PointSink for PanickingSink {
        async fn write_point(&self, _point: &Point) -> Result<()> {
            panic!("sink exploded");
        }
    }

    fn line_with_path(path: &str) -> String {
        LINE.replace("/foo?query=t", path)
    }

    fn start(pipeline: &Pipeline, cancel: &CancellationToken) -> (Monitor, MonitorHandle) {
        Monitor::start(
            pipeline.queue_depths(),
            DEFAULT_SAMPLE_INTERVAL,
            cancel.clone(),
        )
    }

    async fn settle(monitor: &Monitor, handled: u64, errors: u64) {
        for _ in 0..5_000 {
            let stats = monitor.snapshot();
            if stats.handled_line_count == handled && stats.error_count == errors {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!(
            "monitor stuck at {:?}, expected {handled} handled / {errors} errors",
            monitor.snapshot()
        );
    }

    #[tokio::test]
    async fn delivers_parsed_lines_in_order_and_counts_errors() {
        let cancel = CancellationToken::new();
        let pipeline = Pipeline::new(1, 1);
        let (monitor, handle) = start(&pipeline, &cancel);
        let (source, _) = VecSource::new(vec![
            line_with_path("/a"),
            "not an access log line".to_string(),
            line_with_path("/b?x=1"),
            line_with_path("/c"),
        ]);
        let sink = Arc::new(RecordingSink::default());

        pipeline
            .run(
                Box::new(source),
                Arc::new(AccessLogParser::default()),
                sink.clone(),
                handle,
                cancel.clone(),
            )
            .await
            .unwrap();

        let paths: Vec<String> = sink
            .points
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.tags["Path"].clone())
            .collect();
        assert_eq!(paths, vec!["/a", "/b", "/c"]);

        settle(&monitor, 4, 1).await;
        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sink_failure_stops_ingestion() {
        let cancel = CancellationToken::new();
        let pipeline = Pipeline::new(1, 1);
        let (_monitor, handle) = start(&pipeline, &cancel);
        let (source, consumed) = VecSource::new((0..10).map(|_| LINE.to_string()).collect());
        let sink = Arc::new(FailingSink::default());

        let err = pipeline
            .run(
                Box::new(source),
                Arc::new(AccessLogParser::default()),
                sink.clone(),
                handle,
                cancel.clone(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FatalError::Sink(_)));
        assert!(err.to_string().contains("status 500"));
        assert!(cancel.is_cancelled());
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 1);
        assert!(consumed.load(Ordering::SeqCst) < 10);
    }

    #[tokio::test]
    async fn tailer_failure_is_fatal() {
        let cancel = CancellationToken::new();
        let pipeline = Pipeline::new(1, 1);
        let (_monitor, handle) = start(&pipeline, &cancel);

        let err = pipeline
            .run(
                Box::new(BrokenSource),
                Arc::new(AccessLogParser::default()),
                Arc::new(RecordingSink::default()),
                handle,
                cancel.clone(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.stage(), "tailer");
        assert!(err.to_string().contains("disk went away"));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn panicking_stage_is_reported() {
        let cancel = CancellationToken::new();
        let pipeline = Pipeline::new(1, 1);
        let (_monitor, handle) = start(&pipeline, &cancel);
        let (source, _) = VecSource::new(vec![LINE.to_string()]);

        let err = pipeline
            .run(
                Box::new(source),
                Arc::new(AccessLogParser::default()),
                Arc::new(PanickingSink),
                handle,
                cancel.clone(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FatalError::TaskPanicked(_)));
    }

    #[tokio::test]
    async fn keeps_parsing_after_monitor_stops() {
        let monitor_cancel = CancellationToken::new();
        let pipeline = Pipeline::new(1, 1);
        let (_monitor, handle) = start(&pipeline, &monitor_cancel);
        monitor_cancel.cancel();
        let (source, _) = VecSource::new((0..5).map(|_| LINE.to_string()).collect());
        let sink = Arc::new(RecordingSink::default());

        pipeline
            .run(
                Box::new(source),
                Arc::new(AccessLogParser::default()),
                sink.clone(),
                handle,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(sink.points.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn queue_depths_track_backlog() {
        let pipeline = Pipeline::new(4, 4);
        let depths = pipeline.queue_depths();
        pipeline.read_tx.try_send(RawLine::from("a")).unwrap();
        pipeline.read_tx.try_send(RawLine::from("b")).unwrap();

        let cancel = CancellationToken::new();
        let (monitor, _handle) = Monitor::start(depths, DEFAULT_SAMPLE_INTERVAL, cancel.clone());
        let stats = monitor.snapshot();
        assert_eq!(stats.read_queue_depth, 2);
        assert_eq!(stats.write_queue_depth, 0);
        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tails_file_into_line_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("access.log");
        let out_path = dir.path().join("points.lp");
        let mut log = std::fs::File::create(&log_path).unwrap();
        writeln!(log, "{}", line_with_path("/before-start")).unwrap();

        let cancel = CancellationToken::new();
        let pipeline = Pipeline::new(1, 1);
        let (monitor, handle) = start(&pipeline, &cancel);
        let source = FileTailer::open(&log_path, Duration::from_millis(1))
            .await
            .unwrap();
        let sink = FileWriter::create(&out_path, Precision::Seconds)
            .await
            .unwrap();
        let running = tokio::spawn(pipeline.run(
            Box::new(source),
            Arc::new(AccessLogParser::default()),
            Arc::new(sink),
            handle,
            cancel.clone(),
        ));

        for path in ["/one", "/two", "/three"] {
            writeln!(log, "{}", line_with_path(path)).unwrap();
        }
        writeln!(log, "garbage").unwrap();
        log.flush().unwrap();

        settle(&monitor, 4, 1).await;
        let mut written = String::new();
        for _ in 0..5_000 {
            written = tokio::fs::read_to_string(&out_path).await.unwrap();
            if written.lines().count() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("Path=/one"));
        assert!(lines[2].contains("Path=/three"));
        assert!(!written.contains("/before-start"));

        cancel.cancel();
        running.await.unwrap().unwrap();
    }
}
