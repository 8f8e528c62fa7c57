//! nginx access log grammar.
//!
//! Expected layout (13 capture groups):
//!
//! ```text
//! <client> - - [<timestamp>] <scheme> "<METHOD> <target> <protocol>" <status> <bytes> "<referrer>" "<agent>" "<xff>" <upstream_time> <request_time>
//! ```
//!
//! The bracketed timestamp must carry the literal `+0000` zone token; the
//! wall-clock time is read in the configured offset. The request target
//! yields its percent-decoded path, with the query dropped.
//!
//! Structural problems (grammar, timestamp, request line, target) reject the
//! line. Numeric fields are coerced silently unless strict mode is on: bytes
//! fall back to a best-effort value and the two latencies to `0.0`.

use crate::error::ParseError;
use crate::event::LogEvent;
use crate::parsers::LineParser;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use lazy_static::lazy_static;
use percent_encoding::percent_decode_str;
use regex::Regex;
use url::Url;

/// Layout of the bracketed timestamp without its zone token.
const TIMESTAMP_LAYOUT: &str = "%d/%b/%Y:%H:%M:%S";
/// The only zone token the layout accepts.
const TIMESTAMP_ZONE: &str = "+0000";
/// Timestamps are read in UTC+8 unless configured otherwise.
pub const DEFAULT_TIMEZONE_OFFSET_SECS: i32 = 8 * 3600;

const GROUP_COUNT: usize = 13;
const GROUP_TIMESTAMP: usize = 4;
const GROUP_SCHEME: usize = 5;
const GROUP_REQUEST: usize = 6;
const GROUP_STATUS: usize = 7;
const GROUP_BYTES: usize = 8;
const GROUP_UPSTREAM_TIME: usize = 12;
const GROUP_REQUEST_TIME: usize = 13;

lazy_static! {
    static ref ACCESS_LINE: Regex = Regex::new(concat!(
        r#"^(\S+)\s+([^ \[]+)\s+([^ \[]+)\s+\[([^\]]+)\]\s+([a-z]+)\s+"([^"]+)"\s+"#,
        r#"(\d{3})\s+(\d+)\s+"([^"]*)"\s+"(.*?)"\s+"([^"]*)"\s+([\d.-]+)\s+([\d.-]+)\s*$"#,
    ))
    .expect("access log grammar is a valid regex");
    // chrono accepts short fields that the layout does not: `4/Mar`, `18`.
    static ref TIMESTAMP_CLOCK: Regex =
        Regex::new(r"^\d{2}/[A-Za-z]{3}/\d{4}:\d{1,2}:\d{2}:\d{2}$")
            .expect("timestamp shape is a valid regex");
    // Base for scheme-relative (`//host/path`) targets.
    static ref TARGET_BASE: Url =
        Url::parse("http://localhost/").expect("target base is a valid url");
}

#[derive(Debug, Clone)]
pub struct AccessLogParser {
    timezone: FixedOffset,
    strict_numeric_fields: bool,
}

impl Default for AccessLogParser {
    fn default() -> Self {
        let timezone = FixedOffset::east_opt(DEFAULT_TIMEZONE_OFFSET_SECS)
            .expect("default timezone offset is in range");
        Self::new(timezone)
    }
}

impl AccessLogParser {
    pub fn new(timezone: FixedOffset) -> Self {
        Self {
            timezone,
            strict_numeric_fields: false,
        }
    }

    /// Reject lines whose byte count or latencies fail to parse instead of
    /// defaulting them.
    pub fn with_strict_numeric_fields(mut self, strict: bool) -> Self {
        self.strict_numeric_fields = strict;
        self
    }

    fn parse_timestamp(&self, value: &str) -> Result<DateTime<FixedOffset>, ParseError> {
        let invalid = |reason: &str| ParseError::Timestamp {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let (clock, zone) = value
            .rsplit_once(' ')
            .ok_or_else(|| invalid("missing zone token"))?;
        if zone != TIMESTAMP_ZONE {
            return Err(invalid("zone token is not +0000"));
        }
        if !TIMESTAMP_CLOCK.is_match(clock) {
            return Err(invalid("expected dd/Mon/yyyy:hh:mm:ss"));
        }

        let naive = NaiveDateTime::parse_from_str(clock, TIMESTAMP_LAYOUT)
            .map_err(|err| invalid(&err.to_string()))?;

        // The fixed `+0000` token is layout text; the configured offset wins.
        self.timezone
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| invalid("timestamp out of range"))
    }

    fn parse_bytes_sent(&self, value: &str) -> Result<u64, ParseError> {
        match value.parse::<u64>() {
            Ok(bytes) => Ok(bytes),
            Err(_) if self.strict_numeric_fields => Err(ParseError::Numeric {
                field: "bytes_sent",
                value: value.to_string(),
            }),
            // All digits but too large: saturate like a best-effort conversion would.
            Err(_) if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => {
                Ok(u64::MAX)
            }
            Err(_) => Ok(0),
        }
    }

    fn parse_seconds(&self, field: &'static str, value: &str) -> Result<f64, ParseError> {
        match value.parse::<f64>() {
            Ok(seconds) => Ok(seconds),
            Err(_) if self.strict_numeric_fields => Err(ParseError::Numeric {
                field,
                value: value.to_string(),
            }),
            Err(_) => Ok(0.0),
        }
    }
}

impl LineParser for AccessLogParser {
    fn parse_line(&self, line: &[u8]) -> Result<LogEvent, ParseError> {
        let text = String::from_utf8_lossy(line);
        let captures = ACCESS_LINE.captures(&text).ok_or(ParseError::Grammar)?;

        let mut groups = [""; GROUP_COUNT + 1];
        for (idx, slot) in groups.iter_mut().enumerate().skip(1) {
            *slot = captures
                .get(idx)
                .map(|m| m.as_str())
                .ok_or(ParseError::Grammar)?;
        }

        let timestamp = self.parse_timestamp(groups[GROUP_TIMESTAMP])?;
        let bytes_sent = self.parse_bytes_sent(groups[GROUP_BYTES])?;

        let request = groups[GROUP_REQUEST];
        let tokens: Vec<&str> = request.split_whitespace().collect();
        let [method, target, _protocol] = tokens[..] else {
            return Err(ParseError::RequestLine(request.to_string()));
        };

        let path = request_path(target)?;
        let upstream_time = self.parse_seconds("upstream_time", groups[GROUP_UPSTREAM_TIME])?;
        let request_time = self.parse_seconds("request_time", groups[GROUP_REQUEST_TIME])?;

        Ok(LogEvent {
            timestamp,
            bytes_sent,
            path,
            method: method.to_string(),
            scheme: groups[GROUP_SCHEME].to_string(),
            status: groups[GROUP_STATUS].to_string(),
            upstream_time,
            request_time,
        })
    }
}

/// Decoded path of an origin-form (`/foo?x=1`), relative (`foo`) or
/// absolute-form target.
///
/// Origin-form and relative paths are taken verbatim, without dot-segment
/// normalization. Control characters, malformed `%` escapes and escapes
/// that decode to invalid UTF-8 reject the target.
fn request_path(target: &str) -> Result<String, ParseError> {
    let invalid = |reason: &str| ParseError::Target {
        value: target.to_string(),
        reason: reason.to_string(),
    };

    if target.bytes().any(|b| b < 0x20 || b == 0x7f) {
        return Err(invalid("control character in target"));
    }

    let raw_path = match Url::parse(target) {
        Ok(url) if url.cannot_be_a_base() => String::new(),
        Ok(url) => url.path().to_string(),
        Err(url::ParseError::RelativeUrlWithoutBase) if target.starts_with("//") => {
            Url::options()
                .base_url(Some(&*TARGET_BASE))
                .parse(target)
                .map_err(|err| invalid(&err.to_string()))?
                .path()
                .to_string()
        }
        Err(url::ParseError::RelativeUrlWithoutBase) => target
            .split(|c| c == '?' || c == '#')
            .next()
            .unwrap_or_default()
            .to_string(),
        Err(err) => return Err(invalid(&err.to_string())),
    };

    if !has_valid_escapes(&raw_path) {
        return Err(invalid("malformed percent escape"));
    }
    percent_decode_str(&raw_path)
        .decode_utf8()
        .map(|path| path.into_owned())
        .map_err(|_| invalid("path is not valid UTF-8 once decoded"))
}

fn has_valid_escapes(path: &str) -> bool {
    let bytes = path.as_bytes();
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' {
            let escape = bytes.get(idx + 1..idx + 3);
            if !escape.is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit)) {
                return false;
            }
            idx += 3;
        } else {
            idx += 1;
        }
    }
    true
}
