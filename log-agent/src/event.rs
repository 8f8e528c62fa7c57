//! Values handed between pipeline stages.

use chrono::{DateTime, FixedOffset};

/// One line read from the source with its terminator removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine(Vec<u8>);

impl RawLine {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for RawLine {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for RawLine {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

/// A fully parsed access log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub timestamp: DateTime<FixedOffset>,
    pub bytes_sent: u64,
    pub path: String,
    pub method: String,
    pub scheme: String,
    pub status: String,
    pub upstream_time: f64,
    pub request_time: f64,
}
