use crate::error::{StromError, StromResult};
use crate::kmod::ioctl::NUMA_NODE_SPANS;
use crate::kmod::sysfs::{self, BlockDevice};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

/// Where the storage device behind a file lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumaPlacement {
    Node(u32),
    /// Striped over devices on several nodes, or locality unknown.
    Spans,
}

impl NumaPlacement {
    #[must_use]
    pub fn from_raw(node: i32) -> Self {
        u32::try_from(node).map_or(Self::Spans, Self::Node)
    }

    /// ABI form: node id or `-1`.
    #[must_use]
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Node(n) => i32::try_from(n).unwrap_or(NUMA_NODE_SPANS),
            Self::Spans => NUMA_NODE_SPANS,
        }
    }
}

/// Result of probing a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub numa_node: NumaPlacement,
    /// The device can DMA to any 64-bit address, which also makes
    /// NUMA-aware storage-to-host transfers possible.
    pub support_dma64: bool,
}

/// Determines the hardware placement of the device backing a file.
///
/// Results are cached per device number; topology is not expected to change
/// while the engine runs.
#[derive(Debug)]
pub struct CapabilityProber {
    sysfs_root: PathBuf,
    cache: Mutex<HashMap<u64, Capability>>,
}

impl CapabilityProber {
    #[must_use]
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Probe the device backing `file`.
    ///
    /// # Errors
    /// `NotBlockBacked` if the file is not a regular file on an NVMe (or
    /// NVMe-striped md) device, `PermissionDenied` if sysfs refuses access.
    pub fn probe(&self, file: &File) -> StromResult<Capability> {
        let meta = file.metadata()?;
        if !meta.file_type().is_file() {
            return Err(StromError::NotBlockBacked);
        }
        let dev = meta.dev();

        if let Some(cap) = self.lock_cache().get(&dev) {
            return Ok(*cap);
        }

        let device = match BlockDevice::from_dev(&self.sysfs_root, dev) {
            Ok(Some(d)) => d,
            Ok(None) => return Err(StromError::NotBlockBacked),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(StromError::PermissionDenied);
            }
            Err(e) => return Err(e.into()),
        };

        if !device.is_p2p_capable() {
            tracing::debug!(device = %device.name, "source device is not p2p capable");
            return Err(StromError::NotBlockBacked);
        }

        let cap = Capability {
            numa_node: NumaPlacement::from_raw(device.numa_node),
            support_dma64: device.dma_mask_bits >= 64,
        };
        tracing::debug!(
            device = %device.name,
            dev = format_args!("{}:{}", sysfs::dev_major(dev), sysfs::dev_minor(dev)),
            numa = cap.numa_node.as_raw(),
            dma64 = cap.support_dma64,
            "probed source device"
        );

        self.lock_cache().insert(dev, cap);
        Ok(cap)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Capability>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_raw_round_trip() {
        assert_eq!(NumaPlacement::from_raw(-1), NumaPlacement::Spans);
        assert_eq!(NumaPlacement::from_raw(2), NumaPlacement::Node(2));
        assert_eq!(NumaPlacement::Node(3).as_raw(), 3);
        assert_eq!(NumaPlacement::Spans.as_raw(), -1);
    }

    #[test]
    fn unknown_device_is_not_block_backed() {
        let sysfs = tempfile::tempdir().unwrap();
        let file = tempfile::tempfile().unwrap();
        let prober = CapabilityProber::new(sysfs.path());
        assert!(matches!(
            prober.probe(&file),
            Err(StromError::NotBlockBacked)
        ));
    }

    #[test]
    fn directory_is_not_block_backed() {
        let dir = tempfile::tempdir().unwrap();
        let handle = File::open(dir.path()).unwrap();
        let prober = CapabilityProber::new("/sys");
        assert!(matches!(
            prober.probe(&handle),
            Err(StromError::NotBlockBacked)
        ));
    }
}
