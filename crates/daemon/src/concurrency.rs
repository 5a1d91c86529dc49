//! Concurrency planning for the media fetch daemon
//!
//! Derives the effective queue width and admission ceilings from configuration.

use crate::config::Config;

/// Effective limits derived from configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConcurrencyPlan {
    /// Pending + active jobs allowed in the registry
    pub max_global_tasks: usize,
    /// Distinct URLs one user may hold locks on
    pub max_user_urls: usize,
    /// Number of queue workers running jobs at once
    pub queue_concurrency: usize,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Every limit is at least 1
    /// - `queue_concurrency = 0` means "same as max_global_tasks"
    /// - Queue concurrency is clamped to the global ceiling; wider would only
    ///   ever run slots the registry refuses to fill
    pub fn derive(cfg: &Config) -> Self {
        let max_global_tasks = cfg.limits.max_global_tasks.max(1) as usize;
        let max_user_urls = cfg.limits.max_user_urls.max(1) as usize;

        let queue_concurrency = if cfg.limits.queue_concurrency > 0 {
            (cfg.limits.queue_concurrency as usize).min(max_global_tasks)
        } else {
            max_global_tasks
        };

        Self {
            max_global_tasks,
            max_user_urls,
            queue_concurrency,
        }
    }
}

impl Default for ConcurrencyPlan {
    fn default() -> Self {
        Self::derive(&Config::default())
    }
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
