//! Activity snapshot for the media fetch daemon
//!
//! A read-only projection of the orchestrator's state plus host load,
//! serialized as JSON for the activity endpoint and the snapshot file.

use crate::jobs::{current_timestamp_ms, JobView};
use crate::orchestrator::Orchestrator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Host load figures
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// A host currently waiting out a rate-limit cooldown
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CooldownView {
    pub host: String,
    pub remaining_secs: u64,
}

/// Everything the activity endpoint reports
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActivitySnapshot {
    pub timestamp_unix_ms: i64,
    pub pending: usize,
    pub active: usize,
    pub jobs: Vec<JobView>,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub pending_selections: usize,
    pub cooldowns: Vec<CooldownView>,
    pub system: SystemMetrics,
}

impl ActivitySnapshot {
    /// Capture the orchestrator's current state.
    pub fn capture(orchestrator: &Orchestrator, system: SystemMetrics) -> Self {
        let outcomes = orchestrator.outcome_counts();
        let cooldowns = orchestrator
            .pipeline()
            .deps()
            .cooldown
            .active()
            .into_iter()
            .map(|(host, remaining)| CooldownView {
                host,
                remaining_secs: remaining.as_secs(),
            })
            .collect();
        Self {
            timestamp_unix_ms: current_timestamp_ms(),
            pending: orchestrator.pending_count(),
            active: orchestrator.active_count(),
            jobs: orchestrator.jobs(),
            completed: outcomes.completed,
            failed: outcomes.failed,
            cancelled: outcomes.cancelled,
            pending_selections: orchestrator.pending_selections(),
            cooldowns,
            system,
        }
    }
}

/// Snapshot shared between the refresher and its readers
pub type SharedActivity = Arc<RwLock<ActivitySnapshot>>;

pub fn new_shared_activity() -> SharedActivity {
    Arc::new(RwLock::new(ActivitySnapshot::default()))
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let mem_usage = if total_memory > 0 {
        (sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };
    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: sys.global_cpu_usage(),
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}
