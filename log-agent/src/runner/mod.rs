//! Application runner for the log-agent.
//!
//! Builds every stage from configuration, starts the monitor and its HTTP
//! server, and drives the pipeline until it fails or a shutdown signal
//! arrives.

use crate::config::{Config, SinkTarget};
use crate::error::FatalError;
use crate::monitor::{server, Monitor};
use crate::output_writer::{FileWriter, InfluxWriter, PointSink};
use crate::parsers::{AccessLogParser, LineParser};
use crate::pipeline::Pipeline;
use crate::point::Precision;
use crate::tailer::{FileTailer, LineSource};
use crate::watcher::FileWake;
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Timestamp precision of the local file sink.
pub const FILE_SINK_PRECISION: Precision = Precision::Seconds;

const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the appropriate point sink based on configuration.
///
/// Returns either an InfluxWriter (HTTP line protocol) or FileWriter (for local output).
pub async fn build_point_sink(config: &Config) -> Result<Arc<dyn PointSink>> {
    match config.sink_target()? {
        SinkTarget::Influx(dsn) => {
            info!(
                endpoint = %dsn.endpoint,
                database = %dsn.database,
                precision = dsn.precision.as_query(),
                "configured influx sink"
            );
            let writer = InfluxWriter::new(dsn, config.sink_timeout())
                .context("failed to build influx writer")?;
            Ok(Arc::new(writer))
        }
        SinkTarget::File(path) => {
            let writer = FileWriter::create(&path, FILE_SINK_PRECISION).await?;
            Ok(Arc::new(writer))
        }
    }
}

/// Opens the tailed file, attaching a filesystem watcher when enabled.
pub async fn build_line_source(config: &Config) -> Result<Box<dyn LineSource>> {
    let path = config.source_path();
    let tailer = FileTailer::open(&path, config.poll_interval()).await?;
    if !config.source.use_notify {
        return Ok(Box::new(tailer));
    }

    match FileWake::watch(&path) {
        Ok(wake) => Ok(Box::new(tailer.with_wake(wake))),
        Err(err) => {
            warn!(
                error = %format!("{err:#}"),
                path = %path.display(),
                "file watcher unavailable; falling back to polling"
            );
            Ok(Box::new(tailer))
        }
    }
}

pub fn build_parser(config: &Config) -> Result<Arc<dyn LineParser>> {
    let parser = AccessLogParser::new(config.timezone()?)
        .with_strict_numeric_fields(config.parser.strict_numeric_fields);
    Ok(Arc::new(parser))
}

/// Run the agent until the pipeline fails or Ctrl-C is received.
pub async fn run(config: &Config) -> Result<()> {
    run_until(config, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed while waiting for shutdown signal");
        }
        info!("shutdown signal received");
    })
    .await
}

pub async fn run_until(config: &Config, shutdown: impl Future<Output = ()>) -> Result<()> {
    info!("log-agent starting");

    let sink = build_point_sink(config).await?;
    let parser = build_parser(config)?;
    let source = build_line_source(config)
        .await
        .map_err(FatalError::Tailer)?;
    let monitor_addr = config.monitor_addr()?;

    let cancel = CancellationToken::new();
    let pipeline = Pipeline::new(
        config.pipeline.read_channel_capacity,
        config.pipeline.write_channel_capacity,
    );
    let (monitor, handle) = Monitor::start(
        pipeline.queue_depths(),
        config.sample_interval(),
        cancel.clone(),
    );
    let mut server_handle = tokio::spawn(server::serve(
        monitor_addr,
        monitor.clone(),
        cancel.clone(),
    ));

    info!(
        path = %config.source_path().display(),
        "log-agent started; tailing"
    );

    let run = pipeline.run(source, parser, sink, handle, cancel.clone());
    tokio::pin!(run);
    tokio::pin!(shutdown);

    let outcome = tokio::select! {
        outcome = &mut run => outcome,
        _ = &mut shutdown => {
            info!("initiating shutdown");
            cancel.cancel();
            run.await
        }
    };
    cancel.cancel();

    let stats = monitor.snapshot();
    info!(
        handled = stats.handled_line_count,
        errors = stats.error_count,
        run_time = %stats.run_time,
        "pipeline stopped"
    );

    let server_timeout = tokio::time::sleep(SERVER_SHUTDOWN_TIMEOUT);
    tokio::pin!(server_timeout);
    tokio::select! {
        res = &mut server_handle => {
            if let Err(err) = res {
                warn!(error = %err, "monitor server exited with error during shutdown");
            }
        }
        _ = &mut server_timeout => {
            warn!("monitor server did not stop within timeout; aborting");
            server_handle.abort();
        }
    }

    outcome.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    fn file_config(source: &Path, output: &Path) -> Config {
        let mut config = Config::default();
        config.source.path = source.to_string_lossy().into_owned();
        config.source.poll_interval_us = 1_000;
        config.sink.output_file = Some(output.to_string_lossy().into_owned());
        config.monitor.listen_addr = "127.0.0.1:0".to_string();
        config
    }

    #[tokio::test]
    async fn builds_file_sink_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(&dir.path().join("access.log"), &dir.path().join("out.lp"));

        build_point_sink(&config).await.unwrap();
        assert!(dir.path().join("out.lp").exists());
    }

    #[tokio::test]
    async fn builds_default_influx_sink() {
        let config = Config::default();
        assert!(build_point_sink(&config).await.is_ok());
    }

    #[tokio::test]
    async fn builds_source_with_file_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("access.log");
        std::fs::File::create(&log).unwrap();
        let mut config = file_config(&log, &dir.path().join("out.lp"));
        config.source.use_notify = true;

        assert!(build_line_source(&config).await.is_ok());
    }

    #[tokio::test]
    async fn missing_source_is_a_tailer_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(&dir.path().join("absent.log"), &dir.path().join("out.lp"));

        let err = run_until(&config, std::future::pending()).await.unwrap_err();
        let fatal = err.downcast_ref::<FatalError>().unwrap();
        assert_eq!(fatal.stage(), "tailer");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("access.log");
        let out_path = dir.path().join("out.lp");
        let mut log = std::fs::File::create(&log_path).unwrap();
        let config = file_config(&log_path, &out_path);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let running = tokio::spawn(async move {
            run_until(&config, async {
                let _ = stop_rx.await;
            })
            .await
        });

        let line = r#"172.0.0.2 - - [04/Mar/2018:13:49:52 +0000] http "GET /foo?query=t HTTP/1.0" 200 2133 "-" "KeepAliveClient" "-" 1.005 1.854"#;
        let mut written = String::new();
        for _ in 0..5_000 {
            // the tailer may open after the first writes; keep appending until one lands
            if written.is_empty() {
                writeln!(log, "{line}").unwrap();
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
            written = tokio::fs::read_to_string(&out_path).await.unwrap_or_default();
            if !written.is_empty() {
                break;
            }
        }
        assert!(written.starts_with("nginx_log,Method=GET,Path=/foo"));

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
