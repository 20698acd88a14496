//! Per-chunk routing and scatter-gather descriptor construction.
//!
//! Planning is pure: it takes a page-table snapshot and a residency oracle and
//! produces the list of DMA submissions and host copies a task will run.

use crate::error::{StromError, StromResult};
use crate::strom::region::{PageTable, PhysSegment};
use crate::utils::align_down;

/// Sector size every chunk must be a multiple of.
pub const SECTOR_SIZE: u32 = 512;

/// Chunk size and per-file segment boundary shared by a whole task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGeometry {
    chunk_sz: u32,
    relseg_sz: u32,
}

impl ChunkGeometry {
    /// # Errors
    /// `InvalidArgument` unless `chunk_sz` is a positive multiple of 512.
    pub fn new(chunk_sz: u32, relseg_sz: u32) -> StromResult<Self> {
        if chunk_sz == 0 || chunk_sz % SECTOR_SIZE != 0 {
            return Err(StromError::InvalidArgument(format!(
                "chunk size {chunk_sz} is not a positive multiple of {SECTOR_SIZE}"
            )));
        }
        Ok(Self {
            chunk_sz,
            relseg_sz,
        })
    }

    #[must_use]
    pub const fn chunk_sz(&self) -> u32 {
        self.chunk_sz
    }

    #[must_use]
    pub const fn relseg_sz(&self) -> u32 {
        self.relseg_sz
    }

    /// Segment a chunk belongs to; always 0 without a boundary.
    #[must_use]
    pub const fn segment(&self, chunk_id: u32) -> u32 {
        if self.relseg_sz == 0 {
            0
        } else {
            chunk_id / self.relseg_sz
        }
    }

    /// Byte offset of a chunk within its segment's address space.
    #[must_use]
    pub const fn file_offset(&self, chunk_id: u32) -> u64 {
        let pos = if self.relseg_sz == 0 {
            chunk_id
        } else {
            chunk_id % self.relseg_sz
        };
        pos as u64 * self.chunk_sz as u64
    }
}

/// One coalesced storage-to-accelerator transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaSubmission {
    pub segment: u32,
    pub file_offset: u64,
    pub len: u64,
    /// Destination byte position relative to the region's page-aligned base.
    pub dest_pos: u64,
    pub blocks: Vec<PhysSegment>,
    pub chunk_ids: Vec<u32>,
}

/// A chunk routed through host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedChunk {
    pub chunk_id: u32,
    pub file_offset: u64,
    /// Byte offset in the writeback (or destination) host buffer.
    pub buf_offset: u64,
}

/// Routing outcome for a storage-to-accelerator task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectPlan {
    pub submissions: Vec<DmaSubmission>,
    pub staged: Vec<StagedChunk>,
    /// Chunk ids in destination-slot order.
    pub placement: Vec<u32>,
    pub nr_ssd2gpu: u32,
    pub nr_ram2gpu: u32,
    pub nr_dma_submit: u32,
    pub nr_dma_blocks: u32,
}

/// Routing outcome for a storage-to-host task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostPlan {
    /// Coalesced reads from storage.
    pub reads: Vec<HostRead>,
    /// Chunks served from the page cache.
    pub copies: Vec<StagedChunk>,
    pub nr_ram2ram: u32,
    pub nr_ssd2ram: u32,
    pub nr_dma_submit: u32,
    pub nr_dma_blocks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRead {
    pub segment: u32,
    pub file_offset: u64,
    pub buf_offset: u64,
    pub len: u64,
    pub chunk_ids: Vec<u32>,
}

/// Inputs that stay fixed while planning one direct task.
#[derive(Debug, Clone, Copy)]
pub struct DirectTarget<'a> {
    pub table: &'a PageTable,
    /// Byte position of the task's first slot relative to the page-aligned base.
    pub dest_base: u64,
    /// The source device can DMA straight into accelerator memory.
    pub direct_capable: bool,
    pub max_submit_bytes: u64,
}

/// Route every chunk of a direct task.
///
/// Direct chunks take destination slots from the head in the order they are
/// routed. Staged chunks fill the writeback buffer from its tail: the n-th
/// staged chunk lands at `(nr_chunks - n) * chunk_sz`.
pub fn plan_direct(
    geom: ChunkGeometry,
    chunk_ids: &[u32],
    target: DirectTarget<'_>,
    mut prefer_host: impl FnMut(u64, u64) -> bool,
) -> DirectPlan {
    let chunk_sz = u64::from(geom.chunk_sz);
    let nr_chunks = chunk_ids.len() as u64;
    let page = u64::from(target.table.page_size);
    let mut plan = DirectPlan::default();

    for &id in chunk_ids {
        let file_offset = geom.file_offset(id);
        let segment = geom.segment(id);
        let dest_pos = target.dest_base + u64::from(plan.nr_ssd2gpu) * chunk_sz;

        let blocks = (target.direct_capable && !prefer_host(file_offset, chunk_sz))
            .then(|| target.table.resolve(dest_pos, chunk_sz))
            .flatten();

        let Some(blocks) = blocks else {
            plan.nr_ram2gpu += 1;
            plan.staged.push(StagedChunk {
                chunk_id: id,
                file_offset,
                buf_offset: (nr_chunks - u64::from(plan.nr_ram2gpu)) * chunk_sz,
            });
            continue;
        };

        plan.nr_ssd2gpu += 1;
        plan.placement.push(id);

        if let Some(prev) = plan.submissions.last_mut()
            && prev.segment == segment
            && prev.file_offset + prev.len == file_offset
            && prev.dest_pos + prev.len == dest_pos
            && prev.len + chunk_sz <= target.max_submit_bytes
            && phys_adjacent(prev.blocks.last(), blocks.first())
        {
            prev.len += chunk_sz;
            prev.chunk_ids.push(id);
            append_blocks(&mut prev.blocks, blocks, page);
            continue;
        }

        plan.submissions.push(DmaSubmission {
            segment,
            file_offset,
            len: chunk_sz,
            dest_pos,
            blocks,
            chunk_ids: vec![id],
        });
    }

    // Staged chunks were assigned descending offsets; slot order is the reverse.
    plan.placement
        .extend(plan.staged.iter().rev().map(|s| s.chunk_id));
    plan.nr_dma_submit = plan.submissions.len() as u32;
    plan.nr_dma_blocks = plan.submissions.iter().map(|s| s.blocks.len() as u32).sum();
    plan
}

/// Route every chunk of a storage-to-host task. Chunk `i` of the list lands at
/// `i * chunk_sz` in the destination buffer.
pub fn plan_host(
    geom: ChunkGeometry,
    chunk_ids: &[u32],
    max_submit_bytes: u64,
    block_size: u64,
    mut is_cached: impl FnMut(u64, u64) -> bool,
) -> HostPlan {
    let chunk_sz = u64::from(geom.chunk_sz);
    let mut plan = HostPlan::default();

    for (i, &id) in chunk_ids.iter().enumerate() {
        let file_offset = geom.file_offset(id);
        let segment = geom.segment(id);
        let buf_offset = i as u64 * chunk_sz;

        if is_cached(file_offset, chunk_sz) {
            plan.nr_ram2ram += 1;
            plan.copies.push(StagedChunk {
                chunk_id: id,
                file_offset,
                buf_offset,
            });
            continue;
        }

        plan.nr_ssd2ram += 1;
        if let Some(prev) = plan.reads.last_mut()
            && prev.segment == segment
            && prev.file_offset + prev.len == file_offset
            && prev.buf_offset + prev.len == buf_offset
            && prev.len + chunk_sz <= max_submit_bytes
        {
            prev.len += chunk_sz;
            prev.chunk_ids.push(id);
            continue;
        }
        plan.reads.push(HostRead {
            segment,
            file_offset,
            buf_offset,
            len: chunk_sz,
            chunk_ids: vec![id],
        });
    }

    plan.nr_dma_submit = plan.reads.len() as u32;
    plan.nr_dma_blocks = plan
        .reads
        .iter()
        .map(|r| r.len.div_ceil(block_size.max(1)) as u32)
        .sum();
    plan
}

fn phys_adjacent(last: Option<&PhysSegment>, next: Option<&PhysSegment>) -> bool {
    matches!((last, next), (Some(a), Some(b)) if a.paddr + u64::from(a.len) == b.paddr)
}

/// Append `blocks`, merging the seam when both sides share a device page.
fn append_blocks(dst: &mut Vec<PhysSegment>, blocks: Vec<PhysSegment>, page: u64) {
    let mut iter = blocks.into_iter();
    if let Some(first) = iter.next() {
        match dst.last_mut() {
            Some(last)
                if last.paddr + u64::from(last.len) == first.paddr
                    && align_down(last.paddr, page) == align_down(first.paddr, page) =>
            {
                last.len += first.len;
            }
            _ => dst.push(first),
        }
    }
    dst.extend(iter);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strom::region::PADDR_INVALID;
    use proptest::prelude::*;

    const PAGE: u32 = 4096;

    fn table(npages: usize, valid: std::ops::Range<usize>) -> PageTable {
        let mut paddrs = vec![PADDR_INVALID; npages];
        for i in valid.clone() {
            paddrs[i] = 0x10_0000_0000 + i as u64 * u64::from(PAGE);
        }
        PageTable {
            version: 1,
            page_size: PAGE,
            paddrs,
            valid_offset: valid.start as u64 * u64::from(PAGE),
            valid_length: valid.len() as u64 * u64::from(PAGE),
        }
    }

    fn target(table: &PageTable) -> DirectTarget<'_> {
        DirectTarget {
            table,
            dest_base: 0,
            direct_capable: true,
            max_submit_bytes: 128 * 1024,
        }
    }

    #[test]
    fn geometry_validation() {
        assert!(ChunkGeometry::new(0, 0).is_err());
        assert!(ChunkGeometry::new(1000, 0).is_err());
        assert!(ChunkGeometry::new(8192, 0).is_ok());
    }

    #[test]
    fn segment_offsets_reset() {
        let geom = ChunkGeometry::new(8192, 4).unwrap();
        assert_eq!(geom.file_offset(3), 3 * 8192);
        assert_eq!(geom.file_offset(4), 0);
        assert_eq!(geom.segment(4), 1);
        let flat = ChunkGeometry::new(8192, 0).unwrap();
        assert_eq!(flat.file_offset(4), 4 * 8192);
        assert_eq!(flat.segment(1_000_000), 0);
    }

    #[test]
    fn contiguous_chunks_coalesce() {
        let t = table(1024, 0..1024);
        let geom = ChunkGeometry::new(PAGE, 0).unwrap();
        let plan = plan_direct(geom, &[0, 1, 2, 3], target(&t), |_, _| false);
        assert_eq!(plan.nr_ssd2gpu, 4);
        assert_eq!(plan.nr_ram2gpu, 0);
        assert_eq!(plan.nr_dma_submit, 1);
        assert_eq!(plan.nr_dma_blocks, 4);
        assert_eq!(plan.placement, vec![0, 1, 2, 3]);
    }

    #[test]
    fn segment_boundary_splits_submission() {
        let t = table(64, 0..64);
        let geom = ChunkGeometry::new(PAGE, 2).unwrap();
        // 1 -> seg 0 offset 4096; 2 -> seg 1 offset 0
        let plan = plan_direct(geom, &[0, 1, 2, 3], target(&t), |_, _| false);
        assert_eq!(plan.nr_dma_submit, 2);
        assert_eq!(plan.submissions[1].file_offset, 0);
        assert_eq!(plan.submissions[1].segment, 1);
    }

    #[test]
    fn submit_size_cap() {
        let t = table(64, 0..64);
        let geom = ChunkGeometry::new(PAGE, 0).unwrap();
        let mut tgt = target(&t);
        tgt.max_submit_bytes = 2 * u64::from(PAGE);
        let plan = plan_direct(geom, &[0, 1, 2, 3, 4], tgt, |_, _| false);
        assert_eq!(plan.nr_dma_submit, 3);
        assert_eq!(plan.nr_dma_blocks, 5);
    }

    #[test]
    fn small_chunks_share_device_page() {
        let t = table(4, 0..4);
        let geom = ChunkGeometry::new(1024, 0).unwrap();
        let plan = plan_direct(geom, &[0, 1, 2, 3, 4], target(&t), |_, _| false);
        assert_eq!(plan.nr_dma_submit, 1);
        // 4 KiB in the first page plus 1 KiB in the second
        assert_eq!(plan.nr_dma_blocks, 2);
    }

    #[test]
    fn tail_fill_order() {
        // Only one slot is resolvable: A goes direct, B and C are staged.
        let t = table(4, 0..1);
        let geom = ChunkGeometry::new(PAGE, 0).unwrap();
        let (a, b, c) = (10, 20, 30);
        let plan = plan_direct(geom, &[a, b, c], target(&t), |_, _| false);
        assert_eq!(plan.nr_ssd2gpu, 1);
        assert_eq!(plan.nr_ram2gpu, 2);
        let chunk = u64::from(PAGE);
        assert_eq!(plan.staged[0].chunk_id, b);
        assert_eq!(plan.staged[0].buf_offset, 2 * chunk);
        assert_eq!(plan.staged[1].chunk_id, c);
        assert_eq!(plan.staged[1].buf_offset, chunk);
        assert_eq!(plan.placement, vec![a, c, b]);
    }

    #[test]
    fn incapable_device_stages_everything() {
        let t = table(8, 0..8);
        let geom = ChunkGeometry::new(PAGE, 0).unwrap();
        let mut tgt = target(&t);
        tgt.direct_capable = false;
        let plan = plan_direct(geom, &[5, 6], tgt, |_, _| false);
        assert_eq!(plan.nr_ssd2gpu, 0);
        assert_eq!(plan.nr_dma_submit, 0);
        assert_eq!(plan.staged[0].buf_offset, u64::from(PAGE));
        assert_eq!(plan.staged[1].buf_offset, 0);
    }

    #[test]
    fn cached_chunks_prefer_host() {
        let t = table(8, 0..8);
        let geom = ChunkGeometry::new(PAGE, 0).unwrap();
        let plan = plan_direct(geom, &[0, 1, 2], target(&t), |off, _| off == u64::from(PAGE));
        assert_eq!(plan.nr_ssd2gpu, 2);
        assert_eq!(plan.nr_ram2gpu, 1);
        assert_eq!(plan.placement, vec![0, 2, 1]);
    }

    #[test]
    fn host_plan_counts() {
        let geom = ChunkGeometry::new(PAGE, 0).unwrap();
        let plan = plan_host(geom, &[0, 1, 2, 7], 1 << 20, 4096, |off, _| off == 0);
        assert_eq!(plan.nr_ram2ram, 1);
        assert_eq!(plan.nr_ssd2ram, 3);
        assert_eq!(plan.nr_dma_submit, 2);
        assert_eq!(plan.reads[0].len, 2 * u64::from(PAGE));
        assert_eq!(plan.reads[1].buf_offset, 3 * u64::from(PAGE));
        assert_eq!(plan.nr_dma_blocks, 3);
    }

    proptest! {
        #[test]
        fn routing_accounts_for_every_chunk(
            ids in proptest::collection::vec(0u32..256, 1..48),
            valid_pages in 0usize..64,
            relseg in 0u32..8,
            capable in any::<bool>(),
        ) {
            let t = table(64, 0..valid_pages);
            let geom = ChunkGeometry::new(PAGE, relseg).unwrap();
            let mut tgt = target(&t);
            tgt.direct_capable = capable;
            let plan = plan_direct(geom, &ids, tgt, |_, _| false);

            prop_assert_eq!((plan.nr_ssd2gpu + plan.nr_ram2gpu) as usize, ids.len());
            prop_assert_eq!(plan.placement.len(), ids.len());

            let capacity = u64::from(PAGE) * ids.len() as u64;
            let mut offsets: Vec<u64> = plan.staged.iter().map(|s| s.buf_offset).collect();
            prop_assert!(offsets.iter().all(|&o| o + u64::from(PAGE) <= capacity));
            offsets.sort_unstable();
            offsets.dedup();
            prop_assert_eq!(offsets.len(), plan.staged.len());

            let mut sorted_in = ids.clone();
            let mut sorted_out = plan.placement.clone();
            sorted_in.sort_unstable();
            sorted_out.sort_unstable();
            prop_assert_eq!(sorted_in, sorted_out);
        }
    }
}
