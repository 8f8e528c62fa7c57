use crate::error::ParseError;
use crate::event::LogEvent;

pub mod access_log;

pub use access_log::AccessLogParser;

/// Turns one complete line into a `LogEvent`.
///
/// Parsers are stateless per line: the tailer has already split the input and
/// stripped the terminator, and the pipeline owns every side effect (counters,
/// logging, hand-off). Returning `Err` discards the line and nothing else.
///
/// # Examples
///
/// ```
/// use log_agent::parsers::{AccessLogParser, LineParser};
///
/// let parser = AccessLogParser::default();
/// let line = br#"172.0.0.2 - - [04/Mar/2018:13:49:52 +0000] http "GET /foo?query=t HTTP/1.0" 200 2133 "-" "KeepAliveClient" "-" 1.005 1.854"#;
/// let event = parser.parse_line(line).unwrap();
/// assert_eq!(event.path, "/foo");
/// assert!(parser.parse_line(b"").is_err());
/// ```
pub trait LineParser: Send + Sync {
    fn parse_line(&self, line: &[u8]) -> Result<LogEvent, ParseError>;
}

/// Creates a preview string from a byte slice, truncating at `limit` characters with ellipsis.
/// Used for logging rejected lines without overwhelming the logs.
pub(crate) fn line_preview(line: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(line);
    let mut preview = String::new();
    for (idx, ch) in text.chars().enumerate() {
        if idx >= limit {
            preview.push('…');
            return preview;
        }
        preview.push(ch);
    }
    preview
}
