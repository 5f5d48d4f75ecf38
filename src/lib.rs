pub mod aggregator;
pub mod catalog;
pub mod config;
pub mod database;
pub mod error;
pub mod evaluator;
pub mod leaderboard;
pub mod queue;
pub mod routes;
pub mod sandbox;
pub mod scheduler;
pub mod submission;
pub mod toolchain;
pub mod web_server;
pub mod worker;

/// Current UTC time as RFC 3339 with millisecond precision
pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
