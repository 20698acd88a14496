#![allow(clippy::cast_possible_truncation)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

// ===============================================================================================
// Device number helpers
// ===============================================================================================

/// glibc `major()` for a 64-bit `dev_t`.
#[must_use]
pub const fn dev_major(dev: u64) -> u32 {
    (((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff)) as u32
}

/// glibc `minor()` for a 64-bit `dev_t`.
#[must_use]
pub const fn dev_minor(dev: u64) -> u32 {
    ((dev & 0xff) | ((dev >> 12) & !0xff)) as u32
}

// ===============================================================================================
// Data Structures
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// An NVMe namespace; capable of peer-to-peer DMA.
    Nvme,
    /// A software RAID volume striped over member devices.
    MdRaid,
    /// Anything else (SATA, virtio, loop, ...).
    Other,
}

/// A whole-disk block device as described by sysfs.
#[derive(Debug, Clone)]
pub struct BlockDevice {
    pub name: String,
    pub sysfs_path: PathBuf,
    pub kind: BlockKind,
    /// `-1` when the kernel does not know the locality.
    pub numa_node: i32,
    pub dma_mask_bits: u32,
    /// Members of an md volume; empty for plain devices.
    pub members: Vec<BlockDevice>,
}

// ===============================================================================================
// Sysfs Traversal
// ===============================================================================================

impl BlockDevice {
    /// Resolve the whole-disk device that holds device number `dev`.
    ///
    /// Returns `Ok(None)` when sysfs has no block entry for `dev` (tmpfs, NFS, ...).
    pub fn from_dev(sysfs_root: &Path, dev: u64) -> io::Result<Option<Self>> {
        let link = sysfs_root
            .join("dev/block")
            .join(format!("{}:{}", dev_major(dev), dev_minor(dev)));

        let path = match fs::canonicalize(&link) {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        // A partition sits one level below its disk and carries a `partition` attribute.
        let disk = if path.join("partition").exists() {
            path.parent().map(Path::to_path_buf).unwrap_or(path)
        } else {
            path
        };

        Self::from_sysfs(sysfs_root, &disk).map(Some)
    }

    fn from_sysfs(sysfs_root: &Path, path: &Path) -> io::Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        if path.join("md").is_dir() {
            let mut members = Vec::new();
            for entry in fs::read_dir(path.join("slaves"))? {
                let member_name = entry?.file_name();
                let member_path = fs::canonicalize(
                    sysfs_root.join("class/block").join(&member_name),
                )?;
                let member_disk = if member_path.join("partition").exists() {
                    member_path
                        .parent()
                        .map(Path::to_path_buf)
                        .unwrap_or(member_path)
                } else {
                    member_path
                };
                members.push(Self::from_sysfs(sysfs_root, &member_disk)?);
            }
            members.sort_by(|a, b| a.name.cmp(&b.name));

            let numa_node = match members.split_first() {
                Some((first, rest)) if rest.iter().all(|m| m.numa_node == first.numa_node) => {
                    first.numa_node
                }
                _ => -1,
            };
            let dma_mask_bits = members.iter().map(|m| m.dma_mask_bits).min().unwrap_or(0);

            return Ok(Self {
                name,
                sysfs_path: path.to_path_buf(),
                kind: BlockKind::MdRaid,
                numa_node,
                dma_mask_bits,
                members,
            });
        }

        let kind = if name.starts_with("nvme") {
            BlockKind::Nvme
        } else {
            BlockKind::Other
        };

        Ok(Self {
            name,
            sysfs_path: path.to_path_buf(),
            kind,
            numa_node: read_device_attr(path, "numa_node")?.unwrap_or(-1),
            dma_mask_bits: read_device_attr(path, "dma_mask_bits")?.unwrap_or(32),
            members: Vec::new(),
        })
    }

    /// True when every underlying device can take part in peer-to-peer DMA.
    #[must_use]
    pub fn is_p2p_capable(&self) -> bool {
        match self.kind {
            BlockKind::Nvme => true,
            BlockKind::MdRaid => {
                !self.members.is_empty() && self.members.iter().all(Self::is_p2p_capable)
            }
            BlockKind::Other => false,
        }
    }
}

/// Reads `attr` from the first of `device/` or `device/device/` that has it.
/// The NVMe controller and its PCI function expose different subsets.
fn read_device_attr<T: std::str::FromStr>(disk: &Path, attr: &str) -> io::Result<Option<T>> {
    for dir in ["device", "device/device"] {
        match fs::read_to_string(disk.join(dir).join(attr)) {
            Ok(txt) => return Ok(txt.trim().parse::<T>().ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Whether `node` is an online NUMA node according to sysfs.
#[must_use]
pub fn numa_node_exists(sysfs_root: &Path, node: u32) -> bool {
    sysfs_root
        .join("devices/system/node")
        .join(format!("node{node}"))
        .is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_number_split() {
        // 259:3 (blkext major, typical for nvme partitions)
        let dev = (259u64 << 8) | 3;
        assert_eq!(dev_major(dev), 259);
        assert_eq!(dev_minor(dev), 3);

        let big_minor = (8u64 << 8) | (0x12u64 << 12) | 0x34;
        assert_eq!(dev_major(big_minor), 8);
        assert_eq!(dev_minor(big_minor), 0x1234);
    }

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn resolves_partition_to_disk() {
        let root = tempfile::tempdir().unwrap();
        let disk = root.path().join("devices/pci0000:00/nvme/nvme0n1");
        write(&disk.join("device/numa_node"), "1\n");
        write(&disk.join("device/device/dma_mask_bits"), "64\n");
        write(&disk.join("nvme0n1p1/partition"), "1\n");

        fs::create_dir_all(root.path().join("dev/block")).unwrap();
        std::os::unix::fs::symlink(
            disk.join("nvme0n1p1"),
            root.path().join("dev/block/259:1"),
        )
        .unwrap();

        let dev = BlockDevice::from_dev(root.path(), (259 << 8) | 1)
            .unwrap()
            .unwrap();
        assert_eq!(dev.name, "nvme0n1");
        assert_eq!(dev.kind, BlockKind::Nvme);
        assert_eq!(dev.numa_node, 1);
        assert_eq!(dev.dma_mask_bits, 64);
        assert!(dev.is_p2p_capable());
    }

    #[test]
    fn md_raid_spanning_nodes() {
        let root = tempfile::tempdir().unwrap();
        let devices = root.path().join("devices/virtual/block");
        for (name, node) in [("nvme0n1", "0"), ("nvme1n1", "1")] {
            write(&devices.join(name).join("device/numa_node"), node);
            write(&devices.join(name).join("device/dma_mask_bits"), "64");
            fs::create_dir_all(root.path().join("class/block")).unwrap();
            std::os::unix::fs::symlink(
                devices.join(name),
                root.path().join("class/block").join(name),
            )
            .unwrap();
        }
        let md = devices.join("md0");
        fs::create_dir_all(md.join("md")).unwrap();
        fs::create_dir_all(md.join("slaves/nvme0n1")).unwrap();
        fs::create_dir_all(md.join("slaves/nvme1n1")).unwrap();
        fs::create_dir_all(root.path().join("dev/block")).unwrap();
        std::os::unix::fs::symlink(&md, root.path().join("dev/block/9:0")).unwrap();

        let dev = BlockDevice::from_dev(root.path(), 9 << 8).unwrap().unwrap();
        assert_eq!(dev.kind, BlockKind::MdRaid);
        assert_eq!(dev.members.len(), 2);
        assert_eq!(dev.numa_node, -1);
        assert!(dev.is_p2p_capable());
    }

    #[test]
    fn missing_entry_is_none() {
        let root = tempfile::tempdir().unwrap();
        assert!(BlockDevice::from_dev(root.path(), 42).unwrap().is_none());
    }
}
