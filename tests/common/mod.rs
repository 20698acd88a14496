#![allow(dead_code)]

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use strom_rs::kmod::sysfs::{dev_major, dev_minor};
use strom_rs::strom::SimulatedAccelerator;
use strom_rs::{Engine, StromConfig};
use tempfile::TempDir;

pub const PAGE: u32 = 4096;
pub const UID: u32 = 1000;

pub struct Fixture {
    pub sysfs: TempDir,
    pub data: TempDir,
    pub dev: Arc<SimulatedAccelerator>,
    pub engine: Arc<Engine>,
}

impl Fixture {
    /// Engine whose sysfs claims the data directory sits on an NVMe disk.
    pub fn nvme() -> Self {
        Self::build(true, |_| {})
    }

    /// Engine with an empty sysfs: every file is not block backed.
    pub fn plain() -> Self {
        Self::build(false, |_| {})
    }

    pub fn with_config(nvme: bool, tweak: impl FnOnce(&mut StromConfig)) -> Self {
        Self::build(nvme, tweak)
    }

    fn build(nvme: bool, tweak: impl FnOnce(&mut StromConfig)) -> Self {
        let sysfs = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        fs::create_dir_all(sysfs.path().join("devices/system/node/node0")).unwrap();
        if nvme {
            let dev = fs::metadata(data.path()).unwrap().dev();
            fake_nvme(sysfs.path(), dev, 0);
        }

        let dev = Arc::new(SimulatedAccelerator::new(PAGE));
        let mut config = StromConfig {
            sysfs_root: sysfs.path().to_path_buf(),
            worker_threads: 4,
            ..StromConfig::default()
        };
        tweak(&mut config);
        let engine = Engine::new(config, dev.clone()).unwrap();
        Self {
            sysfs,
            data,
            dev,
            engine,
        }
    }

    /// A source file of `len` bytes; byte `i` of chunk `c` is `(c * 7 + i) % 251`.
    pub fn source(&self, len: usize) -> File {
        let path = self.data.path().join("relation");
        let mut f = File::create(&path).unwrap();
        f.write_all(&pattern(0, len)).unwrap();
        f.sync_all().unwrap();
        File::open(&path).unwrap()
    }
}

/// Expected contents of `len` bytes starting at file offset `offset`.
pub fn pattern(offset: usize, len: usize) -> Vec<u8> {
    (offset..offset + len)
        .map(|pos| ((pos / PAGE as usize * 7 + pos % PAGE as usize) % 251) as u8)
        .collect()
}

/// Publish an NVMe namespace for device number `dev` under `root`.
pub fn fake_nvme(root: &Path, dev: u64, numa: i32) {
    let disk = root.join("devices/pci0000:00/0000:00:01.0/nvme/nvme0/nvme0n1");
    fs::create_dir_all(disk.join("device")).unwrap();
    fs::write(disk.join("device/numa_node"), format!("{numa}\n")).unwrap();
    fs::write(disk.join("device/dma_mask_bits"), "64\n").unwrap();

    fs::create_dir_all(root.join("dev/block")).unwrap();
    let link = root
        .join("dev/block")
        .join(format!("{}:{}", dev_major(dev), dev_minor(dev)));
    std::os::unix::fs::symlink(&disk, link).unwrap();
}
