//! Runtime-configurable limits and tuning for the transfer engine.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `STROM_`) or by constructing a custom `StromConfig`.

use std::path::PathBuf;
use std::time::Duration;

/// Limits and tuning parameters for the engine.
#[derive(Debug, Clone)]
pub struct StromConfig {
    /// Maximum number of simultaneously registered regions.
    pub max_regions: usize,

    /// Outstanding (submitted but not yet collected) task limit. New
    /// submissions beyond it fail with `TooManyOutstanding`.
    pub max_outstanding_tasks: usize,

    /// Largest single NUMA DMA buffer the allocator hands out.
    pub max_dma_buffer_bytes: usize,

    /// Upper bound on the bytes coalesced into one DMA submission.
    pub max_submit_bytes: usize,

    /// Blocking threads available to transfer jobs on an engine-owned runtime.
    pub worker_threads: usize,

    /// Completed tasks nobody waited on are reclaimed after this long.
    pub task_reclaim_after: Duration,

    /// Width of the hashed wait-queue table.
    pub wait_slots: usize,

    /// Root of the sysfs tree used for device and NUMA probing.
    pub sysfs_root: PathBuf,

    /// Route chunks that are already resident in the page cache through the
    /// writeback buffer instead of the direct path.
    pub route_cached_to_writeback: bool,
}

impl Default for StromConfig {
    fn default() -> Self {
        Self {
            max_regions: 4096,
            max_outstanding_tasks: 1024,
            max_dma_buffer_bytes: 1 << 30,  // 1 GiB
            max_submit_bytes: 128 * 1024,   // 128 KiB, typical NVMe MDTS
            worker_threads: 4,
            task_reclaim_after: Duration::from_secs(60),
            wait_slots: 37,
            sysfs_root: PathBuf::from("/sys"),
            route_cached_to_writeback: false,
        }
    }
}

impl StromConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `STROM_MAX_REGIONS`
    /// - `STROM_MAX_OUTSTANDING_TASKS`
    /// - `STROM_MAX_DMA_BUFFER_BYTES`
    /// - `STROM_MAX_SUBMIT_BYTES`
    /// - `STROM_WORKER_THREADS`
    /// - `STROM_TASK_RECLAIM_SECS`
    /// - `STROM_WAIT_SLOTS`
    /// - `STROM_SYSFS_ROOT`
    /// - `STROM_ROUTE_CACHED_TO_WRITEBACK` (`1`/`true`)
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(n) = env_parse::<usize>("STROM_MAX_REGIONS") {
            cfg.max_regions = n;
        }
        if let Some(n) = env_parse::<usize>("STROM_MAX_OUTSTANDING_TASKS") {
            cfg.max_outstanding_tasks = n;
        }
        if let Some(n) = env_parse::<usize>("STROM_MAX_DMA_BUFFER_BYTES") {
            cfg.max_dma_buffer_bytes = n;
        }
        if let Some(n) = env_parse::<usize>("STROM_MAX_SUBMIT_BYTES") {
            cfg.max_submit_bytes = n;
        }
        if let Some(n) = env_parse::<usize>("STROM_WORKER_THREADS") {
            cfg.worker_threads = n.max(1);
        }
        if let Some(s) = env_parse::<u64>("STROM_TASK_RECLAIM_SECS") {
            cfg.task_reclaim_after = Duration::from_secs(s);
        }
        if let Some(n) = env_parse::<usize>("STROM_WAIT_SLOTS") {
            cfg.wait_slots = n.max(1);
        }
        if let Ok(v) = std::env::var("STROM_SYSFS_ROOT") {
            cfg.sysfs_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("STROM_ROUTE_CACHED_TO_WRITEBACK") {
            cfg.route_cached_to_writeback = matches!(v.trim(), "1" | "true" | "yes");
        }

        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
