use crate::kmod::ioctl::STROM_STAT_INFO_VERSION;
use crate::utils::cycles;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pipeline stages with an operation count and a cycle sum each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// A whole submit call.
    Ssd2Gpu,
    /// Routing and descriptor construction.
    SetupPrps,
    /// Handing submissions to the workers.
    SubmitDma,
    /// Blocking in wait.
    WaitDtask,
}

#[derive(Debug, Default)]
struct StageCounter {
    nr: AtomicU64,
    clk: AtomicU64,
}

impl StageCounter {
    fn add(&self, clk: u64) {
        self.nr.fetch_add(1, Ordering::Relaxed);
        self.clk.fetch_add(clk, Ordering::Relaxed);
    }

    fn load(&self) -> (u64, u64) {
        (self.nr.load(Ordering::Relaxed), self.clk.load(Ordering::Relaxed))
    }
}

/// Process-wide counters. Every field is monotonic except `cur_dma_count`.
#[derive(Debug, Default)]
pub struct Stats {
    ssd2gpu: StageCounter,
    setup_prps: StageCounter,
    submit_dma: StageCounter,
    wait_dtask: StageCounter,
    nr_wrong_wakeup: AtomicU64,
    /// `cur << 32 | max` so both are read together.
    dma_count: AtomicU64,
}

/// A point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub version: u32,
    pub tsc: u64,
    pub nr_ssd2gpu: u64,
    pub clk_ssd2gpu: u64,
    pub nr_setup_prps: u64,
    pub clk_setup_prps: u64,
    pub nr_submit_dma: u64,
    pub clk_submit_dma: u64,
    pub nr_wait_dtask: u64,
    pub clk_wait_dtask: u64,
    pub nr_wrong_wakeup: u64,
    pub cur_dma_count: u64,
    pub max_dma_count: u64,
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    const fn counter(&self, stage: Stage) -> &StageCounter {
        match stage {
            Stage::Ssd2Gpu => &self.ssd2gpu,
            Stage::SetupPrps => &self.setup_prps,
            Stage::SubmitDma => &self.submit_dma,
            Stage::WaitDtask => &self.wait_dtask,
        }
    }

    pub fn record(&self, stage: Stage, clk: u64) {
        self.counter(stage).add(clk);
    }

    /// Start timing `stage`; the elapsed cycles are recorded when the guard drops.
    #[must_use]
    pub fn time(&self, stage: Stage) -> StageTimer<'_> {
        StageTimer {
            stats: self,
            stage,
            start: cycles(),
        }
    }

    pub fn wrong_wakeup(&self) {
        self.nr_wrong_wakeup.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a new outstanding task unless `limit` are already outstanding.
    pub fn try_begin_task(&self, limit: usize) -> bool {
        let limit = limit.min(u32::MAX as usize) as u64;
        self.dma_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                let (cur, max) = (v >> 32, v & 0xffff_ffff);
                if cur >= limit {
                    return None;
                }
                let cur = cur + 1;
                Some((cur << 32) | max.max(cur))
            })
            .is_ok()
    }

    pub fn end_task(&self) {
        let _ = self
            .dma_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                let cur = v >> 32;
                (cur > 0).then(|| ((cur - 1) << 32) | (v & 0xffff_ffff))
            });
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let (nr_ssd2gpu, clk_ssd2gpu) = self.ssd2gpu.load();
        let (nr_setup_prps, clk_setup_prps) = self.setup_prps.load();
        let (nr_submit_dma, clk_submit_dma) = self.submit_dma.load();
        let (nr_wait_dtask, clk_wait_dtask) = self.wait_dtask.load();
        let dma = self.dma_count.load(Ordering::Acquire);
        StatsSnapshot {
            version: STROM_STAT_INFO_VERSION,
            tsc: cycles(),
            nr_ssd2gpu,
            clk_ssd2gpu,
            nr_setup_prps,
            clk_setup_prps,
            nr_submit_dma,
            clk_submit_dma,
            nr_wait_dtask,
            clk_wait_dtask,
            nr_wrong_wakeup: self.nr_wrong_wakeup.load(Ordering::Relaxed),
            cur_dma_count: dma >> 32,
            max_dma_count: dma & 0xffff_ffff,
        }
    }
}

/// Records the cycles spent in a stage when dropped.
#[derive(Debug)]
pub struct StageTimer<'a> {
    stats: &'a Stats,
    stage: Stage,
    start: u64,
}

impl Drop for StageTimer<'_> {
    fn drop(&mut self) {
        self.stats
            .record(self.stage, cycles().saturating_sub(self.start));
    }
}
