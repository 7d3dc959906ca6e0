//! Concurrency planning for the background task queue
//!
//! Derives how many cache generations may run at once from the core count and configuration.

use crate::config::Config;

/// Upper bound for the auto-derived task limit; each task is a whole ffmpeg process.
const AUTO_MAX_TASKS: u32 = 4;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of background tasks running at once (always >= 1)
    pub max_concurrent_tasks: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// - An explicit non-zero `queue.max_concurrent_tasks` is used unchanged
    /// - Otherwise half the logical cores, clamped to `[1, 4]`
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let max_concurrent_tasks = if cfg.queue.max_concurrent_tasks > 0 {
            cfg.queue.max_concurrent_tasks
        } else {
            derive_max_tasks(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_tasks,
        }
    }
}

fn derive_max_tasks(cores: u32) -> u32 {
    (cores / 2).clamp(1, AUTO_MAX_TASKS)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use proptest::prelude::*;

    // *For any* core count with no explicit limit, the derived limit is half the
    // cores clamped to [1, 4].
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_task_limit_derivation(cores in 0u32..256) {
            let cfg = Config::default();
            let plan = ConcurrencyPlan::derive_with_cores(&cfg, cores);

            prop_assert_eq!(plan.total_cores, cores);
            prop_assert!(plan.max_concurrent_tasks >= 1);
            prop_assert!(plan.max_concurrent_tasks <= AUTO_MAX_TASKS);
            prop_assert_eq!(plan.max_concurrent_tasks, (cores / 2).clamp(1, 4));
        }

        #[test]
        fn prop_explicit_limit_override(cores in 1u32..256, explicit in 1u32..64) {
            let cfg = Config {
                queue: QueueConfig { max_concurrent_tasks: explicit },
                ..Config::default()
            };
            let plan = ConcurrencyPlan::derive_with_cores(&cfg, cores);
            prop_assert_eq!(plan.max_concurrent_tasks, explicit);
        }
    }

    #[test]
    fn test_derive_plan_uses_detected_cores() {
        let plan = derive_plan(&Config::default());
        assert!(plan.total_cores >= 1);
        assert!(plan.max_concurrent_tasks >= 1);
    }
}
