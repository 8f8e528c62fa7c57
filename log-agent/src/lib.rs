//! Tails an nginx-style access log, turns each appended line into a point and
//! writes it to InfluxDB, while reporting its own throughput over HTTP.

pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod monitor;
pub mod output_writer;
pub mod parsers;
pub mod pipeline;
pub mod point;
pub mod runner;
pub mod tailer;
pub mod watcher;
