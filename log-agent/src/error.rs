//! Error taxonomy for the pipeline.
//!
//! `ParseError` covers a single line and is always recoverable: the parser
//! stage counts it, logs it and moves on. `FatalError` stops the whole
//! pipeline and names the stage that failed.

use thiserror::Error;
use tokio::task::JoinError;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line does not match the access log grammar")]
    Grammar,

    #[error("invalid timestamp {value:?}: {reason}")]
    Timestamp { value: String, reason: String },

    #[error("request line {0:?} is not `METHOD TARGET PROTOCOL`")]
    RequestLine(String),

    #[error("invalid request target {value:?}: {reason}")]
    Target { value: String, reason: String },

    /// Only produced when strict numeric fields are enabled.
    #[error("invalid {field} value {value:?}")]
    Numeric { field: &'static str, value: String },
}

impl ParseError {
    /// Stable label used for the `error_type` metric and log field.
    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::Grammar => "grammar",
            ParseError::Timestamp { .. } => "timestamp",
            ParseError::RequestLine(_) => "request_line",
            ParseError::Target { .. } => "target",
            ParseError::Numeric { .. } => "numeric",
        }
    }
}

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("tailer failed: {0:#}")]
    Tailer(anyhow::Error),

    #[error("sink writer failed: {0:#}")]
    Sink(anyhow::Error),

    #[error("pipeline task aborted: {0}")]
    TaskPanicked(#[from] JoinError),
}

impl FatalError {
    pub fn stage(&self) -> &'static str {
        match self {
            FatalError::Tailer(_) => "tailer",
            FatalError::Sink(_) => "sink_writer",
            FatalError::TaskPanicked(_) => "task",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn fatal_errors_name_their_stage() {
        let err = FatalError::Sink(anyhow!("connection refused").context("failed to send point"));
        assert_eq!(err.stage(), "sink_writer");
        assert_eq!(
            err.to_string(),
            "sink writer failed: failed to send point: connection refused"
        );

        let err = FatalError::Tailer(anyhow!("permission denied"));
        assert_eq!(err.stage(), "tailer");
        assert!(err.to_string().starts_with("tailer failed"));
    }

    #[test]
    fn parse_error_kinds_are_distinct() {
        let kinds = [
            ParseError::Grammar.kind(),
            ParseError::RequestLine(String::new()).kind(),
            ParseError::Timestamp {
                value: String::new(),
                reason: String::new(),
            }
            .kind(),
            ParseError::Target {
                value: String::new(),
                reason: String::new(),
            }
            .kind(),
            ParseError::Numeric {
                field: "bytes_sent",
                value: String::new(),
            }
            .kind(),
        ];
        let mut unique = kinds.to_vec();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), kinds.len());
    }
}
