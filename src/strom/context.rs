use crate::config::StromConfig;
use crate::error::StromResult;
use crate::strom::accel::AcceleratorMemory;
use crate::strom::buffer::{BufferAllocator, DmaBuffer};
use crate::strom::orchestrator::{
    DirectRequest, DirectSubmitted, HostRequest, HostSubmitted, Orchestrator,
};
use crate::strom::region::{RegionInfo, RegionList, RegionMapping, RegionRegistry};
use crate::strom::stats::{Stats, StatsSnapshot};
use crate::strom::task::{TaskId, TaskStatus};
use crate::strom::topology::{Capability, CapabilityProber};
use std::fs::File;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

// ===============================================================================================
// Engine
// ===============================================================================================

/// All engine state: the registries, the task table and the counters.
#[derive(Debug)]
pub struct Engine {
    config: StromConfig,
    prober: Arc<CapabilityProber>,
    regions: Arc<RegionRegistry>,
    buffers: Arc<BufferAllocator>,
    stats: Arc<Stats>,
    orchestrator: Orchestrator,
}

impl Engine {
    /// Build an engine on top of an accelerator driver.
    ///
    /// # Errors
    /// Fails if the transfer workers cannot be started.
    pub fn new(config: StromConfig, accel: Arc<dyn AcceleratorMemory>) -> StromResult<Arc<Self>> {
        let prober = Arc::new(CapabilityProber::new(&config.sysfs_root));
        let regions = Arc::new(RegionRegistry::new(Arc::clone(&accel), config.max_regions));
        let buffers = Arc::new(BufferAllocator::new(
            &config.sysfs_root,
            config.max_dma_buffer_bytes,
        ));
        let stats = Arc::new(Stats::new());
        let orchestrator = Orchestrator::new(
            &config,
            Arc::clone(&regions),
            Arc::clone(&buffers),
            Arc::clone(&prober),
            accel,
            Arc::clone(&stats),
        )?;

        tracing::info!(
            workers = config.worker_threads,
            max_outstanding = config.max_outstanding_tasks,
            sysfs = %config.sysfs_root.display(),
            "transfer engine started"
        );

        Ok(Arc::new(Self {
            config,
            prober,
            regions,
            buffers,
            stats,
            orchestrator,
        }))
    }

    #[must_use]
    pub const fn config(&self) -> &StromConfig {
        &self.config
    }

    /// Open a session for the calling process's effective uid.
    #[must_use]
    pub fn open_session(self: &Arc<Self>) -> Session {
        self.session_as(unsafe { libc::geteuid() })
    }

    /// Open a session on behalf of `uid`.
    #[must_use]
    pub fn session_as(self: &Arc<Self>, uid: u32) -> Session {
        Session {
            engine: Arc::clone(self),
            uid,
            regions: Mutex::new(Vec::new()),
            buffers: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn stat_info(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of tasks submitted but not yet collected.
    #[must_use]
    pub fn outstanding_tasks(&self) -> usize {
        self.orchestrator.tasks().outstanding()
    }
}

// ===============================================================================================
// Global Engine
// ===============================================================================================

static GLOBAL_ENGINE: Mutex<Option<Arc<Engine>>> = Mutex::new(None);

/// Return the process-wide engine, creating it from `StromConfig::from_env()`
/// on first use.
///
/// # Errors
/// Fails if the engine cannot be started.
pub fn acquire(accel: Arc<dyn AcceleratorMemory>) -> StromResult<Arc<Engine>> {
    let mut guard = GLOBAL_ENGINE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(engine) = guard.as_ref() {
        return Ok(Arc::clone(engine));
    }
    let engine = Engine::new(StromConfig::from_env(), accel)?;
    *guard = Some(Arc::clone(&engine));
    Ok(engine)
}

/// Drop the process-wide engine. Sessions still holding it keep it alive.
pub fn release() {
    GLOBAL_ENGINE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
}

// ===============================================================================================
// Session
// ===============================================================================================

/// An open control handle. Regions and buffers created through a session are
/// torn down when it is dropped.
#[derive(Debug)]
pub struct Session {
    engine: Arc<Engine>,
    uid: u32,
    regions: Mutex<Vec<u64>>,
    buffers: Mutex<Vec<u64>>,
}

fn lock(list: &Mutex<Vec<u64>>) -> MutexGuard<'_, Vec<u64>> {
    list.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    #[must_use]
    pub const fn uid(&self) -> u32 {
        self.uid
    }

    #[must_use]
    pub const fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// # Errors
    /// `NotBlockBacked` or `PermissionDenied`.
    pub fn check_file(&self, file: &File) -> StromResult<Capability> {
        self.engine.prober.probe(file)
    }

    /// # Errors
    /// `InvalidArgument`, `InvalidRange` or `OutOfHandles`.
    pub fn map_gpu_memory(&self, vaddr: u64, length: u64) -> StromResult<RegionMapping> {
        let mapping = self.engine.regions.register(vaddr, length, self.uid)?;
        lock(&self.regions).push(mapping.handle);
        Ok(mapping)
    }

    /// Unregister a region. Finished tasks nobody waited on past the reclaim
    /// window no longer keep it busy.
    ///
    /// # Errors
    /// `UnknownHandle`, `PermissionDenied` or `RegionBusy`.
    pub fn unmap_gpu_memory(&self, handle: u64) -> StromResult<()> {
        self.engine.orchestrator.tasks().reclaim_expired();
        self.engine.regions.unregister(handle, self.uid)?;
        lock(&self.regions).retain(|&h| h != handle);
        Ok(())
    }

    #[must_use]
    pub fn list_gpu_memory(&self, room: usize) -> RegionList {
        self.engine.regions.list(room)
    }

    /// # Errors
    /// `UnknownHandle` or `PermissionDenied`.
    pub fn info_gpu_memory(&self, handle: u64, room: usize) -> StromResult<RegionInfo> {
        self.engine.regions.info(handle, room, self.uid)
    }

    /// Re-resolve a region's physical pages, returning the new version.
    ///
    /// # Errors
    /// `UnknownHandle`, `PermissionDenied` or `InvalidRange`.
    pub fn rebuild_region(&self, handle: u64) -> StromResult<u32> {
        let region = self.engine.regions.get(handle, self.uid)?;
        Ok(region.rebuild()?.version)
    }

    /// # Errors
    /// See [`Orchestrator::submit_direct`].
    pub fn memcpy_ssd2gpu(&self, req: &DirectRequest<'_>) -> StromResult<DirectSubmitted> {
        self.engine.orchestrator.submit_direct(req, self.uid)
    }

    /// # Errors
    /// See [`Orchestrator::submit_to_host`].
    pub fn memcpy_ssd2ram(&self, req: &HostRequest<'_>) -> StromResult<HostSubmitted> {
        self.engine.orchestrator.submit_to_host(req, self.uid)
    }

    /// Block until a task completes and collect its status.
    ///
    /// # Errors
    /// `UnknownTask` for an unknown, foreign or already collected id.
    pub fn wait(&self, task_id: TaskId) -> StromResult<TaskStatus> {
        self.engine.orchestrator.tasks().wait(task_id, self.uid)
    }

    /// # Errors
    /// `UnknownTask`.
    pub fn try_wait(&self, task_id: TaskId) -> StromResult<Option<TaskStatus>> {
        self.engine.orchestrator.tasks().try_wait(task_id, self.uid)
    }

    /// # Errors
    /// `UnknownTask` or `WaitTimeout`.
    pub fn wait_timeout(&self, task_id: TaskId, timeout: Duration) -> StromResult<TaskStatus> {
        self.engine
            .orchestrator
            .tasks()
            .wait_timeout(task_id, self.uid, timeout)
    }

    /// # Errors
    /// `InvalidArgument`, `OutOfMemory` or `InvalidNode`.
    pub fn allocate_dma_buffer(
        &self,
        length: usize,
        node: i32,
    ) -> StromResult<(u64, Arc<DmaBuffer>)> {
        let (handle, buf) = self.engine.buffers.allocate(length, node, self.uid)?;
        lock(&self.buffers).push(handle);
        Ok((handle, buf))
    }

    /// # Errors
    /// `UnknownHandle` or `PermissionDenied`.
    pub fn release_dma_buffer(&self, handle: u64) -> StromResult<()> {
        self.engine.buffers.release(handle, self.uid)?;
        lock(&self.buffers).retain(|&h| h != handle);
        Ok(())
    }

    /// # Errors
    /// `UnknownHandle` or `PermissionDenied`.
    pub fn dma_buffer(&self, handle: u64) -> StromResult<Arc<DmaBuffer>> {
        self.engine.buffers.get(handle, self.uid)
    }

    #[must_use]
    pub fn stat_info(&self) -> StatsSnapshot {
        self.engine.stat_info()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let regions = std::mem::take(&mut *lock(&self.regions));
        let buffers = std::mem::take(&mut *lock(&self.buffers));
        if regions.is_empty() && buffers.is_empty() {
            return;
        }
        tracing::debug!(
            uid = self.uid,
            regions = regions.len(),
            buffers = buffers.len(),
            "closing session"
        );
        for handle in regions {
            // In-flight tasks hold their own reference and finish normally.
            self.engine.regions.forget(handle);
        }
        for handle in buffers {
            let _ = self.engine.buffers.release(handle, self.uid);
        }
    }
}
