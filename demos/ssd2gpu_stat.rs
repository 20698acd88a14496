use std::env;
use std::fs::File;
use std::io;
use std::sync::Arc;
use strom_rs::strom::{DirectRequest, SimulatedAccelerator};
use strom_rs::{Engine, StromConfig, StromError};

const BLCKSZ: u32 = 8192;

fn main() -> Result<(), StromError> {
    let mut args = env::args().skip(1);
    let Some(path) = args.next() else {
        let usage = "usage: ssd2gpu_stat <file> [nchunks]";
        return Err(io::Error::new(io::ErrorKind::InvalidInput, usage).into());
    };
    let nchunks: u32 = args.next().and_then(|n| n.parse().ok()).unwrap_or(32);

    let file = File::open(&path)?;
    let dev = Arc::new(SimulatedAccelerator::default());
    let engine = Engine::new(StromConfig::from_env(), dev.clone())?;
    let session = engine.open_session();

    println!("--- Source File ---");
    match session.check_file(&file) {
        Ok(cap) => println!(
            "  {path}: numa node {}, dma64 {}",
            cap.numa_node.as_raw(),
            cap.support_dma64
        ),
        Err(e) => println!("  {path}: {e} (all chunks go through the writeback buffer)"),
    }

    let length = u64::from(nchunks) * u64::from(BLCKSZ);
    let vaddr = dev.allocate(length, session.uid());
    let region = session.map_gpu_memory(vaddr, length)?;
    println!("--- Region {:#x} ---", region.handle);
    println!("  {} pages of {} bytes", region.npages, region.page_size);

    let (wb, _) = session.allocate_dma_buffer(length as usize, -1)?;
    let chunk_ids: Vec<u32> = (0..nchunks).collect();
    let sub = session.memcpy_ssd2gpu(&DirectRequest {
        handle: region.handle,
        offset: 0,
        file: &file,
        chunk_ids: &chunk_ids,
        chunk_sz: BLCKSZ,
        relseg_sz: 0,
        wb_buffer: wb,
    })?;
    let status = session.wait(sub.task_id)?;

    println!("--- Task {} ---", sub.task_id);
    println!("  ssd2gpu {:>6} | ram2gpu {:>6}", sub.nr_ssd2gpu, sub.nr_ram2gpu);
    println!("  submits {:>6} | blocks  {:>6}", sub.nr_dma_submit, sub.nr_dma_blocks);
    println!("  status  {}", status.as_raw());

    let stat = session.stat_info();
    println!("--- Statistics ---");
    println!("  ssd2gpu    {:>8} calls {:>14} clk", stat.nr_ssd2gpu, stat.clk_ssd2gpu);
    println!("  setup_prps {:>8} calls {:>14} clk", stat.nr_setup_prps, stat.clk_setup_prps);
    println!("  submit_dma {:>8} calls {:>14} clk", stat.nr_submit_dma, stat.clk_submit_dma);
    println!("  wait_dtask {:>8} calls {:>14} clk", stat.nr_wait_dtask, stat.clk_wait_dtask);
    println!(
        "  wrong wakeups {}, dma count {}/{}",
        stat.nr_wrong_wakeup, stat.cur_dma_count, stat.max_dma_count
    );

    session.unmap_gpu_memory(region.handle)?;
    session.release_dma_buffer(wb)?;
    Ok(())
}
