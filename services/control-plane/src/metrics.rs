//! Process-wide gauges.
//!
//! The dispatch paths update plain atomics; a metrics collaborator reads
//! [`snapshot`] without taking any lock the hot path contends on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;

use crate::config::Config;

/// Starter workers currently creating runners.
pub static COUNT_RUNNING: AtomicI64 = AtomicI64::new(0);

/// Jobs observed in the last starter snapshot that are not being worked on.
pub static COUNT_WAITING: AtomicI64 = AtomicI64::new(0);

/// Decommission workers currently in flight.
pub static CONCURRENCY_DELETING: AtomicI64 = AtomicI64::new(0);

/// Point-in-time view of every gauge, joined with the configured maxima.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub starter_max_running: i64,
    pub starter_queue_running: i64,
    pub starter_queue_waiting: i64,
    pub runner_max_concurrency_deleting: i64,
    pub runner_queue_concurrency_deleting: i64,
    pub github_rate_limit_remaining: HashMap<String, i64>,
    pub github_rate_limit_limit: HashMap<String, i64>,
}

pub fn snapshot(config: &Config) -> MetricsSnapshot {
    MetricsSnapshot {
        starter_max_running: config.max_connections_to_backend as i64,
        starter_queue_running: COUNT_RUNNING.load(Ordering::SeqCst),
        starter_queue_waiting: COUNT_WAITING.load(Ordering::SeqCst),
        runner_max_concurrency_deleting: config.max_concurrency_deleting as i64,
        runner_queue_concurrency_deleting: CONCURRENCY_DELETING.load(Ordering::SeqCst),
        github_rate_limit_remaining: myshoes_github::rate_limit_remaining(),
        github_rate_limit_limit: myshoes_github::rate_limit_limit(),
    }
}
