use crate::error::{StromError, StromResult};
use crate::strom::accel::{AcceleratorMemory, PinnedPages};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Page-table entry outside the valid window.
pub const PADDR_INVALID: u64 = u64::MAX;

/// Handles start here so a zeroed ABI field never names a live region.
const FIRST_HANDLE: u64 = 0x5000_0001;

/// One contiguous physical piece of a transfer; never crosses a device page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysSegment {
    pub paddr: u64,
    pub len: u32,
}

/// An immutable, versioned view of a region's physical pages.
///
/// A rebuild produces a new table; tasks hold on to the one they were
/// planned against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTable {
    pub version: u32,
    pub page_size: u32,
    /// Always `npages` long; entries outside the valid window are `PADDR_INVALID`.
    pub paddrs: Vec<u64>,
    /// Byte offset of the valid window from the page-aligned base.
    pub valid_offset: u64,
    /// Byte length of the valid window.
    pub valid_length: u64,
}

impl PageTable {
    /// Build a table from pinned pages. The valid window is the first run of
    /// backed pages; everything outside it is invalidated.
    fn from_pinned(version: u32, pinned: &PinnedPages) -> Self {
        let npages = pinned.paddrs.len();
        let first = pinned.paddrs.iter().position(Option::is_some);
        let mut paddrs = vec![PADDR_INVALID; npages];

        let window = first.map_or(0..0, |start| {
            let run = pinned.paddrs[start..]
                .iter()
                .take_while(|p| p.is_some())
                .count();
            start..start + run
        });
        for idx in window.clone() {
            paddrs[idx] = pinned.paddrs[idx].unwrap_or(PADDR_INVALID);
        }

        let page = u64::from(pinned.page_size);
        Self {
            version,
            page_size: pinned.page_size,
            paddrs,
            valid_offset: window.start as u64 * page,
            valid_length: window.len() as u64 * page,
        }
    }

    #[must_use]
    pub fn npages(&self) -> usize {
        self.paddrs.len()
    }

    /// Page indices touched by bytes `[pos, pos + len)`.
    #[must_use]
    pub fn page_range(&self, pos: u64, len: u64) -> Range<usize> {
        let page = u64::from(self.page_size);
        let first = (pos / page) as usize;
        let last = (pos + len).div_ceil(page) as usize;
        first..last
    }

    /// True when `[pos, pos + len)` lies inside the valid window.
    #[must_use]
    pub fn covers(&self, pos: u64, len: u64) -> bool {
        len > 0 && pos >= self.valid_offset && pos + len <= self.valid_offset + self.valid_length
    }

    /// Physical segments for `[pos, pos + len)`, split at page boundaries and
    /// merged inside a page. `None` if any byte is outside the valid window.
    #[must_use]
    pub fn resolve(&self, pos: u64, len: u64) -> Option<Vec<PhysSegment>> {
        if !self.covers(pos, len) {
            return None;
        }
        let page = u64::from(self.page_size);
        let mut segments = Vec::new();
        let mut cur = pos;
        let end = pos + len;
        while cur < end {
            let idx = (cur / page) as usize;
            let paddr = *self.paddrs.get(idx)?;
            if paddr == PADDR_INVALID {
                return None;
            }
            let in_page = cur % page;
            let n = (page - in_page).min(end - cur);
            segments.push(PhysSegment {
                paddr: paddr + in_page,
                len: n as u32,
            });
            cur += n;
        }
        Some(segments)
    }

    /// Whether `pages` still map to the same physical addresses as in `captured`.
    #[must_use]
    pub fn still_maps(&self, captured: &Self, pages: Range<usize>) -> bool {
        if self.version == captured.version {
            return true;
        }
        pages.into_iter().all(|idx| {
            let now = self.paddrs.get(idx).copied().unwrap_or(PADDR_INVALID);
            let then = captured.paddrs.get(idx).copied().unwrap_or(PADDR_INVALID);
            now != PADDR_INVALID && now == then
        })
    }
}

/// A registered accelerator-memory range.
#[derive(Debug)]
pub struct Region {
    handle: u64,
    vaddr: u64,
    length: u64,
    owner: u32,
    /// `vaddr` minus the page-aligned base of the table.
    head_offset: u64,
    table: RwLock<Arc<PageTable>>,
    task_refs: AtomicUsize,
    accel: Arc<dyn AcceleratorMemory>,
}

impl Region {
    #[must_use]
    pub const fn handle(&self) -> u64 {
        self.handle
    }

    #[must_use]
    pub const fn vaddr(&self) -> u64 {
        self.vaddr
    }

    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    #[must_use]
    pub const fn owner(&self) -> u32 {
        self.owner
    }

    #[must_use]
    pub const fn head_offset(&self) -> u64 {
        self.head_offset
    }

    /// The current page table. Cheap; never torn.
    #[must_use]
    pub fn snapshot(&self) -> Arc<PageTable> {
        Arc::clone(&self.table.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Number of outstanding tasks referencing this region.
    #[must_use]
    pub fn task_refs(&self) -> usize {
        self.task_refs.load(Ordering::Acquire)
    }

    /// Re-resolve the physical pages and publish a new table version.
    ///
    /// # Errors
    /// Propagates `InvalidRange` when the driver can no longer resolve the range.
    pub fn rebuild(&self) -> StromResult<Arc<PageTable>> {
        let mut guard = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let pinned = self.accel.pin_pages(self.vaddr, self.length, self.owner)?;
        // The new pin replaces the one held for the previous table.
        self.accel.unpin_pages(self.vaddr, self.length);

        let table = Arc::new(PageTable::from_pinned(guard.version.wrapping_add(1), &pinned));
        tracing::debug!(
            handle = format_args!("{:#x}", self.handle),
            version = table.version,
            valid_length = table.valid_length,
            "rebuilt region page table"
        );
        *guard = Arc::clone(&table);
        Ok(table)
    }

    fn pin(self: &Arc<Self>) -> RegionRef {
        self.task_refs.fetch_add(1, Ordering::AcqRel);
        RegionRef(Arc::clone(self))
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.accel.unpin_pages(self.vaddr, self.length);
    }
}

/// A task's reference to a region; keeps unregistration refused while alive.
#[derive(Debug)]
pub struct RegionRef(Arc<Region>);

impl RegionRef {
    /// A plain handle to the region, without holding the task reference.
    #[must_use]
    pub fn region(&self) -> Arc<Region> {
        Arc::clone(&self.0)
    }
}

impl std::ops::Deref for RegionRef {
    type Target = Region;

    fn deref(&self) -> &Region {
        &self.0
    }
}

impl Drop for RegionRef {
    fn drop(&mut self) {
        self.0.task_refs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Output of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionMapping {
    pub handle: u64,
    pub page_size: u32,
    pub npages: u32,
}

/// Output of `list`; `total > handles.len()` means the room was too small.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionList {
    pub total: usize,
    pub handles: Vec<u64>,
}

/// Output of `info`; `npages > paddrs.len()` means the room was too small.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub handle: u64,
    pub version: u32,
    pub page_size: u32,
    pub owner: u32,
    pub npages: usize,
    pub map_offset: u64,
    pub map_length: u64,
    pub paddrs: Vec<u64>,
}

/// Tracks registered accelerator-memory regions.
#[derive(Debug)]
pub struct RegionRegistry {
    accel: Arc<dyn AcceleratorMemory>,
    max_regions: usize,
    next_handle: AtomicU64,
    regions: RwLock<BTreeMap<u64, Arc<Region>>>,
}

impl RegionRegistry {
    #[must_use]
    pub fn new(accel: Arc<dyn AcceleratorMemory>, max_regions: usize) -> Self {
        Self {
            accel,
            max_regions,
            next_handle: AtomicU64::new(FIRST_HANDLE),
            regions: RwLock::new(BTreeMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<u64, Arc<Region>>> {
        self.regions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<u64, Arc<Region>>> {
        self.regions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `[vaddr, vaddr + length)` for direct transfer.
    ///
    /// # Errors
    /// `InvalidArgument` for an empty range, `InvalidRange` if the driver cannot
    /// resolve it, `OutOfHandles` when the registry is full.
    pub fn register(&self, vaddr: u64, length: u64, owner: u32) -> StromResult<RegionMapping> {
        if length == 0 {
            return Err(StromError::InvalidArgument("zero length region".into()));
        }
        if self.read().len() >= self.max_regions {
            return Err(StromError::OutOfHandles);
        }

        let pinned = self.accel.pin_pages(vaddr, length, owner)?;
        let table = PageTable::from_pinned(1, &pinned);
        if !table.covers(vaddr - pinned.base_vaddr, length) {
            self.accel.unpin_pages(vaddr, length);
            return Err(StromError::InvalidRange);
        }

        let npages = u32::try_from(table.npages()).map_err(|_| StromError::InvalidRange)?;
        let mapping = RegionMapping {
            handle: self.next_handle.fetch_add(1, Ordering::Relaxed),
            page_size: table.page_size,
            npages,
        };
        let region = Arc::new(Region {
            handle: mapping.handle,
            vaddr,
            length,
            owner,
            head_offset: vaddr - pinned.base_vaddr,
            table: RwLock::new(Arc::new(table)),
            task_refs: AtomicUsize::new(0),
            accel: Arc::clone(&self.accel),
        });

        let mut regions = self.write();
        if regions.len() >= self.max_regions {
            // Dropping `region` releases the pin.
            return Err(StromError::OutOfHandles);
        }
        regions.insert(mapping.handle, region);
        drop(regions);

        tracing::debug!(
            handle = format_args!("{:#x}", mapping.handle),
            vaddr = format_args!("{vaddr:#x}"),
            length,
            npages,
            "registered region"
        );
        Ok(mapping)
    }

    /// Remove a region.
    ///
    /// # Errors
    /// `UnknownHandle`, `PermissionDenied` for a foreign non-root caller, or
    /// `RegionBusy` while a task references it.
    pub fn unregister(&self, handle: u64, caller: u32) -> StromResult<()> {
        let mut regions = self.write();
        let region = regions
            .get(&handle)
            .ok_or(StromError::UnknownHandle(handle))?;
        check_owner(region, caller)?;

        let refs = region.task_refs();
        if refs > 0 {
            return Err(StromError::RegionBusy { handle, refs });
        }
        regions.remove(&handle);
        drop(regions);

        tracing::debug!(handle = format_args!("{handle:#x}"), "unregistered region");
        Ok(())
    }

    /// Remove a region regardless of outstanding tasks. In-flight tasks keep
    /// it alive until they are collected.
    pub(crate) fn forget(&self, handle: u64) -> bool {
        self.write().remove(&handle).is_some()
    }

    /// Up to `room` handles plus the true total.
    #[must_use]
    pub fn list(&self, room: usize) -> RegionList {
        let regions = self.read();
        RegionList {
            total: regions.len(),
            handles: regions.keys().take(room).copied().collect(),
        }
    }

    /// Page-table metadata and up to `room` physical addresses.
    ///
    /// # Errors
    /// `UnknownHandle` or `PermissionDenied`.
    pub fn info(&self, handle: u64, room: usize, caller: u32) -> StromResult<RegionInfo> {
        let region = self.get(handle, caller)?;
        let table = region.snapshot();
        Ok(RegionInfo {
            handle,
            version: table.version,
            page_size: table.page_size,
            owner: region.owner,
            npages: table.npages(),
            map_offset: table.valid_offset,
            map_length: table.valid_length,
            paddrs: table.paddrs.iter().take(room).copied().collect(),
        })
    }

    /// Look up a region the caller may use.
    ///
    /// # Errors
    /// `UnknownHandle` or `PermissionDenied`.
    pub fn get(&self, handle: u64, caller: u32) -> StromResult<Arc<Region>> {
        let regions = self.read();
        let region = regions
            .get(&handle)
            .ok_or(StromError::UnknownHandle(handle))?;
        check_owner(region, caller)?;
        Ok(Arc::clone(region))
    }

    /// Look up and pin in one step, so `unregister` cannot slip in between.
    ///
    /// # Errors
    /// `UnknownHandle` or `PermissionDenied`.
    pub fn acquire(&self, handle: u64, caller: u32) -> StromResult<RegionRef> {
        let regions = self.read();
        let region = regions
            .get(&handle)
            .ok_or(StromError::UnknownHandle(handle))?;
        check_owner(region, caller)?;
        Ok(region.pin())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

fn check_owner(region: &Region, caller: u32) -> StromResult<()> {
    if caller == 0 || caller == region.owner {
        Ok(())
    } else {
        Err(StromError::PermissionDenied)
    }
}
