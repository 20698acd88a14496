//! Boundary with the accelerator driver.
//!
//! The engine never allocates accelerator memory. It asks the driver to pin an
//! already-allocated virtual range and report its physical pages, and it hands
//! physical destinations to the DMA path. [`AcceleratorMemory`] is that seam;
//! [`SimulatedAccelerator`] is an in-process device used when no hardware
//! driver is attached.

use crate::error::{StromError, StromResult};
use crate::utils::{align_down, align_up};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Physical pages backing a pinned virtual range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedPages {
    pub page_size: u32,
    /// `vaddr` rounded down to `page_size`.
    pub base_vaddr: u64,
    /// One entry per page from `base_vaddr`; `None` when the page is not
    /// currently backed.
    pub paddrs: Vec<Option<u64>>,
}

/// Driver-side operations the region registry and DMA path depend on.
pub trait AcceleratorMemory: Send + Sync + fmt::Debug {
    /// Pin `[vaddr, vaddr + length)` and report its physical pages.
    ///
    /// # Errors
    /// `InvalidRange` if the range is not device memory owned by `owner`.
    fn pin_pages(&self, vaddr: u64, length: u64, owner: u32) -> StromResult<PinnedPages>;

    /// Drop a pin taken by [`pin_pages`](Self::pin_pages).
    fn unpin_pages(&self, vaddr: u64, length: u64);

    /// Store `data` at physical address `paddr`. `data` never crosses a device page.
    fn write_phys(&self, paddr: u64, data: &[u8]) -> io::Result<()>;
}

// ===============================================================================================
// Simulated device
// ===============================================================================================

const SIM_VA_BASE: u64 = 0x7f00_0000_0000;
const SIM_PA_BASE: u64 = 0x38_0000_0000; // BAR-like window

#[derive(Debug)]
struct SimAllocation {
    length: u64,
    owner: u32,
    pins: usize,
    pages: Vec<Option<u64>>,
}

#[derive(Debug, Default)]
struct SimState {
    next_vaddr: u64,
    next_frame: u64,
    allocations: BTreeMap<u64, SimAllocation>,
    frames: HashMap<u64, Box<[u8]>>,
}

/// An accelerator whose "device memory" lives in host RAM.
///
/// Frames are handed out sequentially, so freshly allocated ranges are
/// physically contiguous; [`remap`](Self::remap) and
/// [`evict_page`](Self::evict_page) model the driver moving or dropping pages.
#[derive(Debug)]
pub struct SimulatedAccelerator {
    page_size: u32,
    state: Mutex<SimState>,
}

impl SimulatedAccelerator {
    /// Default GPU page size used by P2P-capable drivers.
    pub const DEFAULT_PAGE_SIZE: u32 = 64 * 1024;

    #[must_use]
    pub fn new(page_size: u32) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        Self {
            page_size,
            state: Mutex::new(SimState {
                next_vaddr: SIM_VA_BASE,
                ..SimState::default()
            }),
        }
    }

    #[must_use]
    pub const fn page_size(&self) -> u32 {
        self.page_size
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate `length` bytes of device memory for `owner`, returning its virtual address.
    pub fn allocate(&self, length: u64, owner: u32) -> u64 {
        let page = u64::from(self.page_size);
        let mut st = self.lock();
        let npages = align_up(length.max(1), page) / page;

        let vaddr = st.next_vaddr;
        st.next_vaddr += (npages + 1) * page; // one page gap between allocations

        let mut pages = Vec::with_capacity(npages as usize);
        for _ in 0..npages {
            pages.push(Some(SIM_PA_BASE + st.next_frame * page));
            st.next_frame += 1;
        }
        st.allocations.insert(
            vaddr,
            SimAllocation {
                length,
                owner,
                pins: 0,
                pages,
            },
        );
        vaddr
    }

    /// Free an allocation. Pinned ranges stay readable until unpinned.
    pub fn free(&self, vaddr: u64) -> bool {
        let mut st = self.lock();
        let Some(alloc) = st.allocations.remove(&vaddr) else {
            return false;
        };
        for paddr in alloc.pages.into_iter().flatten() {
            st.frames.remove(&paddr);
        }
        true
    }

    /// Move every page of the allocation to fresh frames, keeping contents.
    pub fn remap(&self, vaddr: u64) -> bool {
        let page = u64::from(self.page_size);
        let mut st = self.lock();
        let Some(npages) = st.allocations.get(&vaddr).map(|a| a.pages.len()) else {
            return false;
        };
        for idx in 0..npages {
            let frame = SIM_PA_BASE + st.next_frame * page;
            st.next_frame += 1;
            let old = st.allocations.get_mut(&vaddr).and_then(|a| a.pages[idx].replace(frame));
            if let Some(old) = old
                && let Some(data) = st.frames.remove(&old)
            {
                st.frames.insert(frame, data);
            }
        }
        true
    }

    /// Drop the backing of one page; it resolves to nothing until remapped.
    pub fn evict_page(&self, vaddr: u64, page_index: usize) -> bool {
        let mut st = self.lock();
        let old = st
            .allocations
            .get_mut(&vaddr)
            .and_then(|a| a.pages.get_mut(page_index))
            .and_then(Option::take);
        match old {
            Some(paddr) => {
                st.frames.remove(&paddr);
                true
            }
            None => false,
        }
    }

    /// Read device memory back through the current virtual mapping.
    /// Unbacked or never-written bytes read as zero.
    pub fn read(&self, vaddr: u64, length: usize) -> Vec<u8> {
        let page = u64::from(self.page_size);
        let st = self.lock();
        let mut out = vec![0u8; length];

        let Some((&base, alloc)) = st.allocations.range(..=vaddr).next_back() else {
            return out;
        };
        let mut done = 0usize;
        while done < length {
            let pos = vaddr - base + done as u64;
            let idx = (pos / page) as usize;
            let in_page = (pos % page) as usize;
            let n = (self.page_size as usize - in_page).min(length - done);
            if let Some(Some(paddr)) = alloc.pages.get(idx)
                && let Some(frame) = st.frames.get(paddr)
            {
                out[done..done + n].copy_from_slice(&frame[in_page..in_page + n]);
            }
            done += n;
        }
        out
    }

    /// Number of outstanding pins on the allocation at `vaddr`.
    pub fn pin_count(&self, vaddr: u64) -> usize {
        self.lock().allocations.get(&vaddr).map_or(0, |a| a.pins)
    }
}

impl Default for SimulatedAccelerator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PAGE_SIZE)
    }
}

impl AcceleratorMemory for SimulatedAccelerator {
    fn pin_pages(&self, vaddr: u64, length: u64, owner: u32) -> StromResult<PinnedPages> {
        if length == 0 {
            return Err(StromError::InvalidRange);
        }
        let page = u64::from(self.page_size);
        let mut st = self.lock();

        let Some((&base, alloc)) = st.allocations.range_mut(..=vaddr).next_back() else {
            return Err(StromError::InvalidRange);
        };
        let end = vaddr.checked_add(length).ok_or(StromError::InvalidRange)?;
        if end > base + alloc.length || (owner != 0 && owner != alloc.owner) {
            return Err(StromError::InvalidRange);
        }

        let base_vaddr = align_down(vaddr, page);
        let first = ((base_vaddr - base) / page) as usize;
        let last = (align_up(end, page) - base) / page;
        let paddrs = alloc.pages[first..last as usize].to_vec();
        alloc.pins += 1;

        Ok(PinnedPages {
            page_size: self.page_size,
            base_vaddr,
            paddrs,
        })
    }

    fn unpin_pages(&self, vaddr: u64, _length: u64) {
        let mut st = self.lock();
        if let Some((_, alloc)) = st.allocations.range_mut(..=vaddr).next_back() {
            alloc.pins = alloc.pins.saturating_sub(1);
        }
    }

    fn write_phys(&self, paddr: u64, data: &[u8]) -> io::Result<()> {
        let page = u64::from(self.page_size);
        let frame = align_down(paddr, page);
        let offset = (paddr - frame) as usize;
        if offset + data.len() > self.page_size as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write crosses a device page",
            ));
        }

        let mut st = self.lock();
        let mapped = st
            .allocations
            .values()
            .any(|a| a.pages.contains(&Some(frame)));
        if !mapped {
            return Err(io::Error::from_raw_os_error(libc::EFAULT));
        }
        let buf = st
            .frames
            .entry(frame)
            .or_insert_with(|| vec![0u8; self.page_size as usize].into_boxed_slice());
        buf[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u32 = 4096;

    #[test]
    fn pin_reports_contiguous_frames() {
        let dev = SimulatedAccelerator::new(PAGE);
        let va = dev.allocate(4 * 4096, 1000);
        let pinned = dev.pin_pages(va, 4 * 4096, 1000).unwrap();
        assert_eq!(pinned.base_vaddr, va);
        assert_eq!(pinned.paddrs.len(), 4);
        let p0 = pinned.paddrs[0].unwrap();
        for (i, p) in pinned.paddrs.iter().enumerate() {
            assert_eq!(p.unwrap(), p0 + i as u64 * 4096);
        }
        assert_eq!(dev.pin_count(va), 1);
        dev.unpin_pages(va, 4 * 4096);
        assert_eq!(dev.pin_count(va), 0);
    }

    #[test]
    fn pin_rejects_foreign_or_unmapped() {
        let dev = SimulatedAccelerator::new(PAGE);
        let va = dev.allocate(4096, 1000);
        assert!(matches!(
            dev.pin_pages(va, 4096, 1001),
            Err(StromError::InvalidRange)
        ));
        assert!(matches!(
            dev.pin_pages(va, 8192, 1000),
            Err(StromError::InvalidRange)
        ));
        assert!(matches!(
            dev.pin_pages(0x1000, 4096, 1000),
            Err(StromError::InvalidRange)
        ));
        // root may pin anything
        assert!(dev.pin_pages(va, 4096, 0).is_ok());
    }

    #[test]
    fn write_then_read_through_mapping() {
        let dev = SimulatedAccelerator::new(PAGE);
        let va = dev.allocate(2 * 4096, 0);
        let pinned = dev.pin_pages(va, 2 * 4096, 0).unwrap();
        dev.write_phys(pinned.paddrs[1].unwrap() + 10, b"hello").unwrap();
        assert_eq!(dev.read(va + 4096 + 10, 5), b"hello");

        assert!(dev.remap(va));
        assert_eq!(dev.read(va + 4096 + 10, 5), b"hello");
        let again = dev.pin_pages(va, 2 * 4096, 0).unwrap();
        assert_ne!(again.paddrs[1], pinned.paddrs[1]);
    }

    #[test]
    fn write_crossing_page_is_rejected() {
        let dev = SimulatedAccelerator::new(PAGE);
        let va = dev.allocate(2 * 4096, 0);
        let pinned = dev.pin_pages(va, 2 * 4096, 0).unwrap();
        let data = vec![1u8; 16];
        assert!(dev.write_phys(pinned.paddrs[0].unwrap() + 4090, &data).is_err());
    }

    #[test]
    fn evicted_page_resolves_to_none() {
        let dev = SimulatedAccelerator::new(PAGE);
        let va = dev.allocate(3 * 4096, 0);
        assert!(dev.evict_page(va, 1));
        let pinned = dev.pin_pages(va, 3 * 4096, 0).unwrap();
        assert!(pinned.paddrs[0].is_some());
        assert!(pinned.paddrs[1].is_none());
        assert!(pinned.paddrs[2].is_some());
    }
}
