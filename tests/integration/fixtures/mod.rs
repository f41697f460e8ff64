//! Shared helpers for pull-session integration tests.

use std::time::Duration;

use seabed::config::{PullMode, PullOptions};
use seabed::core::{Limits, RemoteSequence};

/// Generous deadline for polling waits; tests finish far sooner.
pub const WAIT: Duration = Duration::from_secs(5);

/// Defaults with a short insert-batch latency so commits land quickly.
pub fn fast_limits() -> Limits {
    Limits {
        insert_batch_latency_ms: 10,
        ..Limits::default()
    }
}

pub fn continuous_options() -> PullOptions {
    PullOptions {
        mode: PullMode::Continuous,
        ..PullOptions::default()
    }
}

pub fn seq(token: &str) -> RemoteSequence {
    RemoteSequence::new(token.to_string())
}
