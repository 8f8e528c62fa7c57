use crate::metrics::SINK_WRITE_DURATION;
use crate::point::{Point, Precision};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Destination for parsed points. A returned error is fatal for the pipeline.
#[async_trait]
pub trait PointSink: Send + Sync {
    async fn write_point(&self, point: &Point) -> Result<()>;
}

/// Connection settings in the `endpoint@username@password@database@precision`
/// form.
#[derive(Clone, PartialEq, Eq)]
pub struct InfluxDsn {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub database: String,
    pub precision: Precision,
}

impl FromStr for InfluxDsn {
    type Err = anyhow::Error;

    fn from_str(dsn: &str) -> Result<Self> {
        let parts: Vec<&str> = dsn.trim().split('@').collect();
        let [endpoint, username, password, database, precision] = parts.as_slice() else {
            bail!(
                "invalid influx dsn: expected endpoint@username@password@database@precision, got {} field(s)",
                parts.len()
            );
        };
        if endpoint.is_empty() {
            bail!("invalid influx dsn: endpoint is empty");
        }
        if database.is_empty() {
            bail!("invalid influx dsn: database is empty");
        }
        let precision = precision
            .parse()
            .context("invalid influx dsn precision")?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            database: database.to_string(),
            precision,
        })
    }
}

impl fmt::Debug for InfluxDsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfluxDsn")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("precision", &self.precision)
            .finish()
    }
}

/// Writes each point as a one-line batch to an InfluxDB 1.x `/write` endpoint.
#[derive(Debug, Clone)]
pub struct InfluxWriter {
    client: Client,
    write_url: Url,
    dsn: InfluxDsn,
}

impl InfluxWriter {
    pub fn new(dsn: InfluxDsn, timeout: Duration) -> Result<Self> {
        let write_url = Url::parse(&format!("{}/write", dsn.endpoint))
            .with_context(|| format!("invalid influx endpoint {}", dsn.endpoint))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build influx http client")?;

        Ok(Self {
            client,
            write_url,
            dsn,
        })
    }
}

#[async_trait]
impl PointSink for InfluxWriter {
    async fn write_point(&self, point: &Point) -> Result<()> {
        let body = point
            .to_line_protocol(self.dsn.precision)
            .context("failed to encode point")?;

        let mut request = self
            .client
            .post(self.write_url.clone())
            .query(&[
                ("db", self.dsn.database.as_str()),
                ("precision", self.dsn.precision.as_query()),
            ])
            .body(body);
        if !self.dsn.username.is_empty() {
            request = request.basic_auth(&self.dsn.username, Some(&self.dsn.password));
        }

        let timer = SINK_WRITE_DURATION.start_timer();
        let response = request
            .send()
            .await
            .with_context(|| format!("failed to send point to {}", self.write_url))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "influx write rejected with status {status}: {}",
                detail.trim()
            ));
        }
        timer.observe_duration();

        debug!(status = %status, database = %self.dsn.database, "influx acknowledged point");
        Ok(())
    }
}

/// Appends line protocol to a local file instead of a database.
#[derive(Debug)]
pub struct FileWriter {
    path: PathBuf,
    precision: Precision,
    file: Mutex<File>,
}

impl FileWriter {
    pub async fn create(path: impl AsRef<Path>, precision: Precision) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;

        info!(output = %path.display(), "configured local file output sink");

        Ok(Self {
            path,
            precision,
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl PointSink for FileWriter {
    async fn write_point(&self, point: &Point) -> Result<()> {
        let mut line = point
            .to_line_protocol(self.precision)
            .context("failed to encode point")?;
        line.push('\n');

        let timer = SINK_WRITE_DURATION.start_timer();
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        timer.observe_duration();

        Ok(())
    }
}
