//! Submission of transfer tasks and the workers that run them.

use crate::config::StromConfig;
use crate::error::{StromError, StromResult};
use crate::strom::accel::AcceleratorMemory;
use crate::strom::buffer::{BufferAllocator, DmaBuffer};
use crate::strom::descriptor::{
    self, ChunkGeometry, DirectPlan, DirectTarget, DmaSubmission, HostPlan, StagedChunk,
};
use crate::strom::region::{PageTable, Region, RegionRegistry};
use crate::strom::residency;
use crate::strom::stats::{Stage, Stats};
use crate::strom::task::{FailedStage, JobFailure, TaskHolds, TaskId, TaskTable};
use crate::strom::topology::CapabilityProber;
use crate::utils::host_page_size;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Expired tasks are swept once every this many submissions.
const RECLAIM_INTERVAL: u64 = 64;

/// Re-plan attempts when the page table keeps changing during planning.
const MAX_REPLAN: usize = 4;

// ===============================================================================================
// Transfer runtime
// ===============================================================================================

/// Where transfer jobs run: the caller's tokio runtime when there is one,
/// otherwise a runtime owned by the engine.
#[derive(Debug, Clone)]
pub(crate) enum TransferRuntime {
    Handle(tokio::runtime::Handle),
    Shared(Arc<tokio::runtime::Runtime>),
}

impl TransferRuntime {
    /// # Errors
    /// Fails if an owned runtime cannot be started.
    pub(crate) fn new(blocking_threads: usize) -> io::Result<Self> {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            return Ok(Self::Handle(handle));
        }
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(blocking_threads.max(1))
            .thread_name("strom-dma")
            .build()?;
        Ok(Self::Shared(Arc::new(rt)))
    }

    pub(crate) fn handle(&self) -> &tokio::runtime::Handle {
        match self {
            Self::Handle(handle) => handle,
            Self::Shared(runtime) => runtime.handle(),
        }
    }
}

/// Blocking work that delivers one job result to its task.
trait TransferJob: Send + 'static {
    fn run(self) -> Result<(), JobFailure>;
}

/// A job handed to the runtime. Dropped without running, it fails its task
/// at the submit stage.
struct Dispatched<J> {
    tasks: Arc<TaskTable>,
    task_id: TaskId,
    chunks: u32,
    job: Option<J>,
}

impl<J: TransferJob> Dispatched<J> {
    fn run(mut self) {
        if let Some(job) = self.job.take() {
            self.tasks.complete(self.task_id, job.run());
        }
    }
}

impl<J> Drop for Dispatched<J> {
    fn drop(&mut self) {
        if self.job.take().is_some() {
            tracing::error!(task = self.task_id, "transfer job dropped before running");
            self.tasks.complete(
                self.task_id,
                Err(JobFailure {
                    stage: FailedStage::SubmitDma,
                    error: StromError::DeviceIo("transfer workers unavailable".into()),
                    chunks: self.chunks,
                }),
            );
        }
    }
}

// ===============================================================================================
// Requests and results
// ===============================================================================================

/// Storage-to-accelerator transfer with a writeback buffer.
#[derive(Debug, Clone, Copy)]
pub struct DirectRequest<'a> {
    pub handle: u64,
    /// Byte offset from the start of the registered range.
    pub offset: u64,
    pub file: &'a File,
    pub chunk_ids: &'a [u32],
    pub chunk_sz: u32,
    pub relseg_sz: u32,
    /// DMA buffer of at least `chunk_sz * chunk_ids.len()` bytes, filled from the tail.
    pub wb_buffer: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectSubmitted {
    pub task_id: TaskId,
    pub nr_ram2gpu: u32,
    pub nr_ssd2gpu: u32,
    pub nr_dma_submit: u32,
    pub nr_dma_blocks: u32,
    /// Chunk ids in destination-slot order; the first `nr_ssd2gpu` land in
    /// accelerator memory, the rest are in the writeback buffer at the same slot.
    pub placement: Vec<u32>,
}

/// Storage-to-host transfer into a DMA buffer.
#[derive(Debug, Clone, Copy)]
pub struct HostRequest<'a> {
    pub dest_buffer: u64,
    pub dest_offset: u64,
    pub file: &'a File,
    pub chunk_ids: &'a [u32],
    pub chunk_sz: u32,
    pub relseg_sz: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostSubmitted {
    pub task_id: TaskId,
    pub nr_ram2ram: u32,
    pub nr_ssd2ram: u32,
    pub nr_dma_submit: u32,
    pub nr_dma_blocks: u32,
}

// ===============================================================================================
// Orchestrator
// ===============================================================================================

/// Routes chunks, builds descriptors and runs transfers.
#[derive(Debug)]
pub struct Orchestrator {
    regions: Arc<RegionRegistry>,
    buffers: Arc<BufferAllocator>,
    prober: Arc<CapabilityProber>,
    accel: Arc<dyn AcceleratorMemory>,
    tasks: Arc<TaskTable>,
    stats: Arc<Stats>,
    max_submit_bytes: u64,
    route_cached_to_writeback: bool,
    submits: AtomicU64,
    runtime: TransferRuntime,
}

impl Orchestrator {
    /// # Errors
    /// Fails if the transfer runtime cannot be started.
    pub fn new(
        config: &StromConfig,
        regions: Arc<RegionRegistry>,
        buffers: Arc<BufferAllocator>,
        prober: Arc<CapabilityProber>,
        accel: Arc<dyn AcceleratorMemory>,
        stats: Arc<Stats>,
    ) -> StromResult<Self> {
        let tasks = Arc::new(TaskTable::new(
            Arc::clone(&stats),
            config.wait_slots,
            config.max_outstanding_tasks,
            config.task_reclaim_after,
        ));
        Ok(Self {
            regions,
            buffers,
            prober,
            accel,
            tasks,
            stats,
            max_submit_bytes: config.max_submit_bytes as u64,
            route_cached_to_writeback: config.route_cached_to_writeback,
            submits: AtomicU64::new(0),
            runtime: TransferRuntime::new(config.worker_threads)?,
        })
    }

    #[must_use]
    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    fn maybe_reclaim(&self) {
        let n = self.submits.fetch_add(1, Ordering::Relaxed);
        if n % RECLAIM_INTERVAL == RECLAIM_INTERVAL - 1 {
            self.tasks.reclaim_expired();
        }
    }

    /// Start a storage-to-accelerator transfer.
    ///
    /// # Errors
    /// Structural problems only: `InvalidArgument`, `UnknownHandle`,
    /// `PermissionDenied`, `BufferBusy`, `TooManyOutstanding`. Transfer errors
    /// surface at wait.
    pub fn submit_direct(
        &self,
        req: &DirectRequest<'_>,
        caller: u32,
    ) -> StromResult<DirectSubmitted> {
        let nr_chunks = chunk_count(req.chunk_ids)?;
        let geom = ChunkGeometry::new(req.chunk_sz, req.relseg_sz)?;
        let total = u64::from(req.chunk_sz) * u64::from(nr_chunks);

        let pin = self.regions.acquire(req.handle, caller)?;
        let region = pin.region();
        match req.offset.checked_add(total) {
            Some(end) if end <= region.length() => {}
            _ => {
                return Err(StromError::InvalidArgument(format!(
                    "transfer of {total} bytes at offset {} overruns region of {} bytes",
                    req.offset,
                    region.length()
                )));
            }
        }

        let lease = self.buffers.lease(req.wb_buffer, caller)?;
        let wb = Arc::clone(lease.buffer());
        if (wb.len() as u64) < total {
            return Err(StromError::InvalidArgument(format!(
                "writeback buffer holds {} bytes, need {total}",
                wb.len()
            )));
        }

        let direct_capable = match self.prober.probe(req.file) {
            Ok(_) => true,
            Err(StromError::NotBlockBacked) => false,
            Err(e) => return Err(e),
        };
        let file = Arc::new(req.file.try_clone()?);

        self.maybe_reclaim();
        let holds = TaskHolds {
            region: Some(pin),
            buffer: Some(lease),
        };
        let task_id = self.tasks.begin(nr_chunks, caller, holds)?;
        let _timer = self.stats.time(Stage::Ssd2Gpu);

        let (table, plan) = {
            let _setup = self.stats.time(Stage::SetupPrps);
            self.plan_direct(&region, req, geom, &file, direct_capable)
        };

        tracing::debug!(
            task = task_id,
            handle = format_args!("{:#x}", req.handle),
            version = table.version,
            nr_ssd2gpu = plan.nr_ssd2gpu,
            nr_ram2gpu = plan.nr_ram2gpu,
            nr_dma_submit = plan.nr_dma_submit,
            "submitting direct task"
        );

        let result = DirectSubmitted {
            task_id,
            nr_ram2gpu: plan.nr_ram2gpu,
            nr_ssd2gpu: plan.nr_ssd2gpu,
            nr_dma_submit: plan.nr_dma_submit,
            nr_dma_blocks: plan.nr_dma_blocks,
            placement: plan.placement,
        };

        let _submit = self.stats.time(Stage::SubmitDma);
        let staged_jobs = usize::from(!plan.staged.is_empty());
        self.tasks
            .mark_submitted(task_id, plan.submissions.len() + staged_jobs);

        for sub in plan.submissions {
            let chunks = sub.chunk_ids.len() as u32;
            let job = DirectJob {
                accel: Arc::clone(&self.accel),
                region: Arc::clone(&region),
                table: Arc::clone(&table),
                file: Arc::clone(&file),
                chunk_sz: u64::from(req.chunk_sz),
                sub,
            };
            self.dispatch(task_id, chunks, job);
        }
        if staged_jobs > 0 {
            let chunks = plan.staged.len() as u32;
            let job = StagedJob {
                file: Arc::clone(&file),
                buf: wb,
                chunk_sz: u64::from(req.chunk_sz),
                chunks: plan.staged,
            };
            self.dispatch(task_id, chunks, job);
        }

        Ok(result)
    }

    /// Route against the current page table, rebuilding it when the target
    /// range is not covered and re-planning if it changes underneath.
    fn plan_direct(
        &self,
        region: &Region,
        req: &DirectRequest<'_>,
        geom: ChunkGeometry,
        file: &File,
        direct_capable: bool,
    ) -> (Arc<PageTable>, DirectPlan) {
        let dest_base = region.head_offset() + req.offset;
        let total = u64::from(req.chunk_sz) * req.chunk_ids.len() as u64;

        let mut table = region.snapshot();
        if direct_capable && !table.covers(dest_base, total) {
            match region.rebuild() {
                Ok(t) => table = t,
                Err(e) => tracing::debug!(
                    handle = format_args!("{:#x}", region.handle()),
                    error = %e,
                    "page table rebuild failed, staging uncovered chunks"
                ),
            }
        }

        let mut attempts = 0;
        loop {
            let target = DirectTarget {
                table: &table,
                dest_base,
                direct_capable,
                max_submit_bytes: self.max_submit_bytes,
            };
            let plan = descriptor::plan_direct(geom, req.chunk_ids, target, |off, len| {
                self.route_cached_to_writeback
                    && residency::is_resident(file, off, len).unwrap_or(false)
            });

            let current = region.snapshot();
            attempts += 1;
            if current.version == table.version || attempts >= MAX_REPLAN {
                return (table, plan);
            }
            tracing::debug!(
                handle = format_args!("{:#x}", region.handle()),
                from = table.version,
                to = current.version,
                "page table changed while planning, re-deriving"
            );
            table = current;
        }
    }

    /// Start a storage-to-host transfer into `dest_buffer`.
    ///
    /// # Errors
    /// `InvalidArgument`, `UnknownHandle`, `PermissionDenied`, `BufferBusy` or
    /// `TooManyOutstanding`.
    pub fn submit_to_host(
        &self,
        req: &HostRequest<'_>,
        caller: u32,
    ) -> StromResult<HostSubmitted> {
        let nr_chunks = chunk_count(req.chunk_ids)?;
        let geom = ChunkGeometry::new(req.chunk_sz, req.relseg_sz)?;
        let total = u64::from(req.chunk_sz) * u64::from(nr_chunks);

        let lease = self.buffers.lease(req.dest_buffer, caller)?;
        let dest = Arc::clone(lease.buffer());
        match req.dest_offset.checked_add(total) {
            Some(end) if end <= dest.len() as u64 => {}
            _ => {
                return Err(StromError::InvalidArgument(format!(
                    "transfer of {total} bytes at offset {} overruns buffer of {} bytes",
                    req.dest_offset,
                    dest.len()
                )));
            }
        }
        let file = Arc::new(req.file.try_clone()?);

        self.maybe_reclaim();
        let holds = TaskHolds {
            region: None,
            buffer: Some(lease),
        };
        let task_id = self.tasks.begin(nr_chunks, caller, holds)?;

        let plan: HostPlan = {
            let _setup = self.stats.time(Stage::SetupPrps);
            descriptor::plan_host(
                geom,
                req.chunk_ids,
                self.max_submit_bytes,
                host_page_size() as u64,
                |off, len| residency::is_resident(&file, off, len).unwrap_or(false),
            )
        };

        tracing::debug!(
            task = task_id,
            nr_ram2ram = plan.nr_ram2ram,
            nr_ssd2ram = plan.nr_ssd2ram,
            nr_dma_submit = plan.nr_dma_submit,
            "submitting host task"
        );

        let result = HostSubmitted {
            task_id,
            nr_ram2ram: plan.nr_ram2ram,
            nr_ssd2ram: plan.nr_ssd2ram,
            nr_dma_submit: plan.nr_dma_submit,
            nr_dma_blocks: plan.nr_dma_blocks,
        };

        let _submit = self.stats.time(Stage::SubmitDma);
        let copy_jobs = usize::from(!plan.copies.is_empty());
        self.tasks.mark_submitted(task_id, plan.reads.len() + copy_jobs);

        let chunk_sz = u64::from(req.chunk_sz);
        for read in plan.reads {
            let chunks = read.chunk_ids.len() as u32;
            let buf_base = req.dest_offset + read.buf_offset;
            let job = StagedJob {
                file: Arc::clone(&file),
                buf: Arc::clone(&dest),
                chunk_sz: u64::from(req.chunk_sz),
                chunks: read
                    .chunk_ids
                    .iter()
                    .enumerate()
                    .map(|(i, &chunk_id)| StagedChunk {
                        chunk_id,
                        file_offset: read.file_offset + i as u64 * chunk_sz,
                        buf_offset: buf_base + i as u64 * chunk_sz,
                    })
                    .collect(),
            };
            self.dispatch(task_id, chunks, job);
        }
        if copy_jobs > 0 {
            let chunks = plan.copies.len() as u32;
            let job = StagedJob {
                file: Arc::clone(&file),
                buf: dest,
                chunk_sz: u64::from(req.chunk_sz),
                chunks: plan
                    .copies
                    .into_iter()
                    .map(|c| StagedChunk {
                        buf_offset: req.dest_offset + c.buf_offset,
                        ..c
                    })
                    .collect(),
            };
            self.dispatch(task_id, chunks, job);
        }

        Ok(result)
    }

    fn dispatch<J: TransferJob>(&self, task_id: TaskId, chunks: u32, job: J) {
        let job = Dispatched {
            tasks: Arc::clone(&self.tasks),
            task_id,
            chunks,
            job: Some(job),
        };
        // A runtime that is shutting down drops the closure, failing the task.
        drop(self.runtime.handle().spawn_blocking(move || job.run()));
    }
}

fn chunk_count(chunk_ids: &[u32]) -> StromResult<u32> {
    if chunk_ids.is_empty() {
        return Err(StromError::InvalidArgument("empty chunk list".into()));
    }
    u32::try_from(chunk_ids.len())
        .map_err(|_| StromError::InvalidArgument("too many chunks".into()))
}

// ===============================================================================================
// Jobs
// ===============================================================================================

/// One coalesced storage-to-accelerator submission.
struct DirectJob {
    accel: Arc<dyn AcceleratorMemory>,
    region: Arc<Region>,
    /// The table the submission was planned against.
    table: Arc<PageTable>,
    file: Arc<File>,
    chunk_sz: u64,
    sub: DmaSubmission,
}

impl TransferJob for DirectJob {
    fn run(self) -> Result<(), JobFailure> {
        let chunks = self.sub.chunk_ids.len() as u32;
        let fail = |error: StromError, chunks: u32| JobFailure {
            stage: FailedStage::Completion,
            error,
            chunks,
        };

        let mut data = vec![0u8; self.sub.len as usize];
        let got = read_full(&self.file, &mut data, self.sub.file_offset)
            .map_err(|e| fail(StromError::DeviceIo(e.to_string()), chunks))?;

        self.verify().map_err(|e| fail(e, chunks))?;

        let mut pos = 0usize;
        for block in &self.sub.blocks {
            if pos >= got {
                break;
            }
            let n = (block.len as usize).min(got - pos);
            self.accel
                .write_phys(block.paddr, &data[pos..pos + n])
                .map_err(|e| fail(StromError::DeviceIo(e.to_string()), chunks))?;
            pos += n;
        }

        self.verify().map_err(|e| fail(e, chunks))?;

        if (got as u64) < self.sub.len {
            let landed = (got as u64 / self.chunk_sz) as u32;
            return Err(fail(
                StromError::DeviceIo(format!(
                    "short read at file offset {}: {got} of {} bytes",
                    self.sub.file_offset, self.sub.len
                )),
                chunks - landed,
            ));
        }
        Ok(())
    }
}

impl DirectJob {
    /// The pages this submission targets must still be the ones it was planned against.
    fn verify(&self) -> StromResult<()> {
        let current = self.region.snapshot();
        let pages = self.table.page_range(self.sub.dest_pos, self.sub.len);
        if current.still_maps(&self.table, pages) {
            Ok(())
        } else {
            Err(StromError::StaleRegion {
                handle: self.region.handle(),
                version: self.table.version,
            })
        }
    }
}

/// Chunks read through host memory into a DMA buffer.
struct StagedJob {
    file: Arc<File>,
    buf: Arc<DmaBuffer>,
    chunk_sz: u64,
    chunks: Vec<StagedChunk>,
}

impl TransferJob for StagedJob {
    fn run(self) -> Result<(), JobFailure> {
        let mut failed = 0u32;
        let mut first_error = None;

        for chunk in &self.chunks {
            let res = self.buf.fill_from(
                &self.file,
                chunk.file_offset,
                chunk.buf_offset as usize,
                self.chunk_sz as usize,
            );
            let error = match res {
                Ok(n) if n as u64 == self.chunk_sz => continue,
                Ok(n) => StromError::DeviceIo(format!(
                    "short read of chunk {} at file offset {}: {n} of {} bytes",
                    chunk.chunk_id, chunk.file_offset, self.chunk_sz
                )),
                Err(e) => StromError::DeviceIo(e.to_string()),
            };
            failed += 1;
            first_error.get_or_insert(error);
        }

        match first_error {
            None => Ok(()),
            Some(error) => Err(JobFailure {
                stage: FailedStage::Completion,
                error,
                chunks: failed,
            }),
        }
    }
}

/// `pread` until `buf` is full or end of file; returns bytes read.
fn read_full(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}
