use crate::utils::io;

// ===============================================================================================
// Constants and Versioning
// ===============================================================================================

pub const STROM_IOCTL_BASE: u32 = 0x53; // 'S'

/// Path of the control entrypoint exposed by the kernel-module flavour of the engine.
pub const NVME_STROM_IOCTL_PATHNAME: &str = "/proc/nvme-strom";

/// `StatInfoArgs::version` is always this value.
pub const STROM_STAT_INFO_VERSION: u32 = 1;

/// Sentinel NUMA node id meaning "spans multiple nodes" (md-raid0 striping).
pub const NUMA_NODE_SPANS: i32 = -1;

/// The fixed set of request kinds accepted by the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StromIoctl {
    CheckFile = 0x80,
    MapGpuMemory = 0x81,
    UnmapGpuMemory = 0x82,
    ListGpuMemory = 0x83,
    InfoGpuMemory = 0x84,
    MemcpySsd2GpuWriteback = 0x90,
    MemcpySsd2GpuWait = 0x91,
    MemcpySsd2RamAsync = 0x94,
    MemcpySsd2RamWait = 0x95,
    AllocateDmaBuffer = 0x97,
    ReleaseDmaBuffer = 0x98,
    StatInfo = 0x99,
}

impl StromIoctl {
    pub const ALL: [Self; 12] = [
        Self::CheckFile,
        Self::MapGpuMemory,
        Self::UnmapGpuMemory,
        Self::ListGpuMemory,
        Self::InfoGpuMemory,
        Self::MemcpySsd2GpuWriteback,
        Self::MemcpySsd2GpuWait,
        Self::MemcpySsd2RamAsync,
        Self::MemcpySsd2RamWait,
        Self::AllocateDmaBuffer,
        Self::ReleaseDmaBuffer,
        Self::StatInfo,
    ];

    /// The `_IO('S', nr)` command number.
    #[must_use]
    pub const fn code(self) -> u32 {
        io(STROM_IOCTL_BASE, self as u32)
    }

    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }
}

// ===============================================================================================
// Fixed-size payloads
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CheckFileArgs {
    pub fdesc: i32,
    pub numa_node_id: i32,
    pub support_dma64: i32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct MapGpuMemoryArgs {
    pub handle: u64,
    pub gpu_page_sz: u32,
    pub gpu_npages: u32,
    pub vaddress: u64,
    pub length: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct UnmapGpuMemoryArgs {
    pub handle: u64,
}

/// Shared by `MemcpySsd2GpuWait` and `MemcpySsd2RamWait`.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct MemcpyWaitArgs {
    pub dma_task_id: u64,
    pub status: i64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct AllocateDmaBufferArgs {
    pub length: u64,
    pub node_id: i32,
    pub dmabuf_fdesc: i32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct StatInfoArgs {
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

const _: () = assert!(std::mem::size_of::<CheckFileArgs>() == 12);
const _: () = assert!(std::mem::size_of::<MapGpuMemoryArgs>() == 32);
const _: () = assert!(std::mem::size_of::<MemcpyWaitArgs>() == 16);
const _: () = assert!(std::mem::size_of::<AllocateDmaBufferArgs>() == 16);
const _: () = assert!(std::mem::size_of::<StatInfoArgs>() == 104);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes() {
        assert_eq!(StromIoctl::CheckFile.code(), 0x5380);
        assert_eq!(StromIoctl::MemcpySsd2GpuWriteback.code(), 0x5390);
        assert_eq!(StromIoctl::StatInfo.code(), 0x5399);
    }

    #[test]
    fn codes_round_trip_and_are_distinct() {
        for cmd in StromIoctl::ALL {
            assert_eq!(StromIoctl::from_code(cmd.code()), Some(cmd));
        }
        assert_eq!(StromIoctl::from_code(0x5385), None);
    }
}
