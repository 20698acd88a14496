//! The fixed request set of the control entrypoint.
//!
//! Fixed-size requests carry their `#[repr(C)]` payload in and out, the way an
//! ioctl would; variable-length ones (list, info, memcpy) use owned types.

use crate::error::{StromError, StromResult};
use crate::kmod::ioctl::{
    AllocateDmaBufferArgs, CheckFileArgs, MapGpuMemoryArgs, MemcpyWaitArgs, StatInfoArgs,
    StromIoctl, UnmapGpuMemoryArgs,
};
use crate::strom::buffer::DmaBuffer;
use crate::strom::context::Session;
use crate::strom::orchestrator::{DirectRequest, DirectSubmitted, HostRequest, HostSubmitted};
use crate::strom::region::{RegionInfo, RegionList};
use crate::strom::stats::StatsSnapshot;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub enum Request<'a> {
    CheckFile(&'a File),
    MapGpuMemory(MapGpuMemoryArgs),
    UnmapGpuMemory(UnmapGpuMemoryArgs),
    ListGpuMemory { room: usize },
    InfoGpuMemory { handle: u64, room: usize },
    MemcpySsd2GpuWriteback(DirectRequest<'a>),
    MemcpySsd2GpuWait(MemcpyWaitArgs),
    MemcpySsd2RamAsync(HostRequest<'a>),
    MemcpySsd2RamWait(MemcpyWaitArgs),
    AllocateDmaBuffer(AllocateDmaBufferArgs),
    ReleaseDmaBuffer { handle: u64 },
    StatInfo,
}

impl Request<'_> {
    #[must_use]
    pub const fn ioctl(&self) -> StromIoctl {
        match self {
            Self::CheckFile(_) => StromIoctl::CheckFile,
            Self::MapGpuMemory(_) => StromIoctl::MapGpuMemory,
            Self::UnmapGpuMemory(_) => StromIoctl::UnmapGpuMemory,
            Self::ListGpuMemory { .. } => StromIoctl::ListGpuMemory,
            Self::InfoGpuMemory { .. } => StromIoctl::InfoGpuMemory,
            Self::MemcpySsd2GpuWriteback(_) => StromIoctl::MemcpySsd2GpuWriteback,
            Self::MemcpySsd2GpuWait(_) => StromIoctl::MemcpySsd2GpuWait,
            Self::MemcpySsd2RamAsync(_) => StromIoctl::MemcpySsd2RamAsync,
            Self::MemcpySsd2RamWait(_) => StromIoctl::MemcpySsd2RamWait,
            Self::AllocateDmaBuffer(_) => StromIoctl::AllocateDmaBuffer,
            Self::ReleaseDmaBuffer { .. } => StromIoctl::ReleaseDmaBuffer,
            Self::StatInfo => StromIoctl::StatInfo,
        }
    }
}

#[derive(Debug)]
pub enum Response {
    CheckFile(CheckFileArgs),
    MapGpuMemory(MapGpuMemoryArgs),
    UnmapGpuMemory,
    ListGpuMemory(RegionList),
    InfoGpuMemory(RegionInfo),
    MemcpySsd2GpuWriteback(DirectSubmitted),
    MemcpySsd2GpuWait(MemcpyWaitArgs),
    MemcpySsd2RamAsync(HostSubmitted),
    MemcpySsd2RamWait(MemcpyWaitArgs),
    AllocateDmaBuffer {
        args: AllocateDmaBufferArgs,
        handle: u64,
        buffer: Arc<DmaBuffer>,
    },
    ReleaseDmaBuffer,
    StatInfo(StatInfoArgs),
}

impl From<StatsSnapshot> for StatInfoArgs {
    fn from(s: StatsSnapshot) -> Self {
        Self {
            version: s.version,
            tsc: s.tsc,
            nr_ssd2gpu: s.nr_ssd2gpu,
            clk_ssd2gpu: s.clk_ssd2gpu,
            nr_setup_prps: s.nr_setup_prps,
            clk_setup_prps: s.clk_setup_prps,
            nr_submit_dma: s.nr_submit_dma,
            clk_submit_dma: s.clk_submit_dma,
            nr_wait_dtask: s.nr_wait_dtask,
            clk_wait_dtask: s.clk_wait_dtask,
            nr_wrong_wakeup: s.nr_wrong_wakeup,
            cur_dma_count: s.cur_dma_count,
            max_dma_count: s.max_dma_count,
        }
    }
}

impl Session {
    /// Execute one control request.
    ///
    /// Wait requests report a failed transfer through `status`; only an
    /// unknown task id is an error of the call itself.
    ///
    /// # Errors
    /// Whatever the underlying operation returns synchronously.
    pub fn dispatch(&self, req: Request<'_>) -> StromResult<Response> {
        tracing::trace!(cmd = ?req.ioctl(), uid = self.uid(), "control request");
        Ok(match req {
            Request::CheckFile(file) => {
                let cap = self.check_file(file)?;
                Response::CheckFile(CheckFileArgs {
                    fdesc: file.as_raw_fd(),
                    numa_node_id: cap.numa_node.as_raw(),
                    support_dma64: i32::from(cap.support_dma64),
                })
            }
            Request::MapGpuMemory(mut args) => {
                let m = self.map_gpu_memory(args.vaddress, args.length)?;
                args.handle = m.handle;
                args.gpu_page_sz = m.page_size;
                args.gpu_npages = m.npages;
                Response::MapGpuMemory(args)
            }
            Request::UnmapGpuMemory(args) => {
                self.unmap_gpu_memory(args.handle)?;
                Response::UnmapGpuMemory
            }
            Request::ListGpuMemory { room } => Response::ListGpuMemory(self.list_gpu_memory(room)),
            Request::InfoGpuMemory { handle, room } => {
                Response::InfoGpuMemory(self.info_gpu_memory(handle, room)?)
            }
            Request::MemcpySsd2GpuWriteback(direct) => {
                Response::MemcpySsd2GpuWriteback(self.memcpy_ssd2gpu(&direct)?)
            }
            Request::MemcpySsd2GpuWait(mut args) => {
                args.status = self.wait(args.dma_task_id)?.as_raw();
                Response::MemcpySsd2GpuWait(args)
            }
            Request::MemcpySsd2RamAsync(host) => {
                Response::MemcpySsd2RamAsync(self.memcpy_ssd2ram(&host)?)
            }
            Request::MemcpySsd2RamWait(mut args) => {
                args.status = self.wait(args.dma_task_id)?.as_raw();
                Response::MemcpySsd2RamWait(args)
            }
            Request::AllocateDmaBuffer(mut args) => {
                let length = usize::try_from(args.length).map_err(|_| StromError::OutOfMemory)?;
                let (handle, buffer) = self.allocate_dma_buffer(length, args.node_id)?;
                args.dmabuf_fdesc = buffer.as_fd().as_raw_fd();
                Response::AllocateDmaBuffer {
                    args,
                    handle,
                    buffer,
                }
            }
            Request::ReleaseDmaBuffer { handle } => {
                self.release_dma_buffer(handle)?;
                Response::ReleaseDmaBuffer
            }
            Request::StatInfo => Response::StatInfo(self.stat_info().into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StromConfig;
    use crate::strom::accel::SimulatedAccelerator;
    use crate::strom::context::Engine;

    fn session() -> (tempfile::TempDir, Arc<SimulatedAccelerator>, Session) {
        let sysfs = tempfile::tempdir().unwrap();
        let dev = Arc::new(SimulatedAccelerator::new(4096));
        let config = StromConfig {
            sysfs_root: sysfs.path().to_path_buf(),
            worker_threads: 1,
            ..StromConfig::default()
        };
        let engine = Engine::new(config, dev.clone()).unwrap();
        (sysfs, dev, engine.session_as(1000))
    }

    #[test]
    fn request_codes() {
        assert_eq!(Request::StatInfo.ioctl().code(), 0x5399);
        assert_eq!(
            Request::ListGpuMemory { room: 0 }.ioctl(),
            StromIoctl::ListGpuMemory
        );
    }

    #[test]
    fn map_and_unmap_through_payloads() {
        let (_sysfs, dev, s) = session();
        let va = dev.allocate(16 * 4096, 1000);
        let resp = s
            .dispatch(Request::MapGpuMemory(MapGpuMemoryArgs {
                vaddress: va,
                length: 16 * 4096,
                ..MapGpuMemoryArgs::default()
            }))
            .unwrap();
        let Response::MapGpuMemory(args) = resp else {
            panic!("unexpected response {resp:?}");
        };
        assert_eq!(args.gpu_page_sz, 4096);
        assert_eq!(args.gpu_npages, 16);

        let Response::ListGpuMemory(list) = s.dispatch(Request::ListGpuMemory { room: 4 }).unwrap()
        else {
            panic!("unexpected response");
        };
        assert_eq!(list.handles, vec![args.handle]);

        s.dispatch(Request::UnmapGpuMemory(UnmapGpuMemoryArgs {
            handle: args.handle,
        }))
        .unwrap();
        assert!(matches!(
            s.dispatch(Request::UnmapGpuMemory(UnmapGpuMemoryArgs {
                handle: args.handle
            })),
            Err(StromError::UnknownHandle(_))
        ));
    }

    #[test]
    fn wait_on_unknown_task_fails_the_call() {
        let (_sysfs, _dev, s) = session();
        assert!(matches!(
            s.dispatch(Request::MemcpySsd2GpuWait(MemcpyWaitArgs {
                dma_task_id: 12345,
                status: 0,
            })),
            Err(StromError::UnknownTask(12345))
        ));
    }

    #[test]
    fn dma_buffer_payload_carries_fd() {
        let (_sysfs, _dev, s) = session();
        let resp = s
            .dispatch(Request::AllocateDmaBuffer(AllocateDmaBufferArgs {
                length: 8192,
                node_id: -1,
                dmabuf_fdesc: -1,
            }))
            .unwrap();
        let Response::AllocateDmaBuffer { args, handle, buffer } = resp else {
            panic!("unexpected response");
        };
        assert!(args.dmabuf_fdesc >= 0);
        assert_eq!(buffer.len(), 8192);
        s.dispatch(Request::ReleaseDmaBuffer { handle }).unwrap();
        assert!(matches!(
            s.dispatch(Request::ReleaseDmaBuffer { handle }),
            Err(StromError::UnknownHandle(_))
        ));
    }

    #[test]
    fn stat_info_payload() {
        let (_sysfs, _dev, s) = session();
        let Response::StatInfo(info) = s.dispatch(Request::StatInfo).unwrap() else {
            panic!("unexpected response");
        };
        assert_eq!(info.version, 1);
        assert_eq!(info.cur_dma_count, 0);
        assert!(info.tsc > 0);
    }
}
