//! Time-series points and their InfluxDB line protocol encoding.

use crate::event::LogEvent;
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, FixedOffset};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;

pub const MEASUREMENT: &str = "nginx_log";

/// Unit of the timestamp written with each point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
}

impl Precision {
    /// Value of the `precision` query parameter of the write endpoint.
    pub fn as_query(self) -> &'static str {
        match self {
            Precision::Nanoseconds => "ns",
            Precision::Microseconds => "u",
            Precision::Milliseconds => "ms",
            Precision::Seconds => "s",
            Precision::Minutes => "m",
            Precision::Hours => "h",
        }
    }

    fn nanos_per_unit(self) -> i64 {
        match self {
            Precision::Nanoseconds => 1,
            Precision::Microseconds => 1_000,
            Precision::Milliseconds => 1_000_000,
            Precision::Seconds => 1_000_000_000,
            Precision::Minutes => 60 * 1_000_000_000,
            Precision::Hours => 3_600 * 1_000_000_000,
        }
    }

    /// Unix timestamp of `at` expressed in this precision, truncated toward
    /// the past.
    pub fn timestamp(self, at: &DateTime<FixedOffset>) -> Result<i64> {
        let nanos = at
            .timestamp_nanos_opt()
            .ok_or_else(|| anyhow!("timestamp {at} is outside the representable range"))?;
        Ok(nanos.div_euclid(self.nanos_per_unit()))
    }
}

impl FromStr for Precision {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim() {
            "n" | "ns" => Ok(Precision::Nanoseconds),
            "u" | "us" => Ok(Precision::Microseconds),
            "ms" => Ok(Precision::Milliseconds),
            "s" => Ok(Precision::Seconds),
            "m" => Ok(Precision::Minutes),
            "h" => Ok(Precision::Hours),
            other => Err(anyhow!(
                "unsupported precision {other:?} (expected one of ns, u, ms, s, m, h)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
}

/// One timestamped record: a measurement with indexed tags and recorded fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<FixedOffset>,
}

impl Point {
    pub fn from_event(event: &LogEvent) -> Self {
        let tags = BTreeMap::from([
            ("Path".to_string(), event.path.clone()),
            ("Method".to_string(), event.method.clone()),
            ("Scheme".to_string(), event.scheme.clone()),
            ("Status".to_string(), event.status.clone()),
        ]);
        let fields = BTreeMap::from([
            (
                "UpstreamTime".to_string(),
                FieldValue::Float(event.upstream_time),
            ),
            (
                "RequestTime".to_string(),
                FieldValue::Float(event.request_time),
            ),
            (
                "BytesSent".to_string(),
                FieldValue::Integer(i64::try_from(event.bytes_sent).unwrap_or(i64::MAX)),
            ),
        ]);

        Self {
            measurement: MEASUREMENT.to_string(),
            tags,
            fields,
            timestamp: event.timestamp,
        }
    }

    /// Encodes the point as a single line of line protocol (no trailing newline).
    ///
    /// Tags with empty values are left out since line protocol cannot carry
    /// them.
    pub fn to_line_protocol(&self, precision: Precision) -> Result<String> {
        if self.fields.is_empty() {
            bail!("point for {} has no fields", self.measurement);
        }

        let mut line = escape(&self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            if value.is_empty() {
                continue;
            }
            let _ = write!(
                line,
                ",{}={}",
                escape(key, &[',', '=', ' ']),
                escape(value, &[',', '=', ' '])
            );
        }

        let mut separator = ' ';
        for (key, value) in &self.fields {
            line.push(separator);
            separator = ',';
            line.push_str(&escape(key, &[',', '=', ' ']));
            line.push('=');
            match value {
                FieldValue::Float(v) if !v.is_finite() => {
                    bail!("field {key} has unsupported value {v}");
                }
                FieldValue::Float(v) => {
                    let _ = write!(line, "{v}");
                }
                FieldValue::Integer(v) => {
                    let _ = write!(line, "{v}i");
                }
            }
        }

        let _ = write!(line, " {}", precision.timestamp(&self.timestamp)?);
        Ok(line)
    }
}

fn escape(value: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch == '\\' || special.contains(&ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
