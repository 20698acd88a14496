mod common;

use common::{Fixture, PAGE, UID, pattern};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use strom_rs::strom::DirectRequest;
use strom_rs::StromError;

const CHUNK: usize = PAGE as usize;

#[test]
fn stats_stay_consistent_under_concurrent_submissions() {
    let fx = Fixture::nvme();
    let va = fx.dev.allocate(64 * u64::from(PAGE), UID);
    let file = fx.source(64 * CHUNK);
    let setup = fx.engine.session_as(UID);
    let region = setup.map_gpu_memory(va, 64 * u64::from(PAGE)).unwrap();

    let done = AtomicBool::new(false);
    thread::scope(|scope| {
        let reader = scope.spawn(|| {
            let mut samples = 0u64;
            while !done.load(Ordering::Acquire) {
                let snap = setup.stat_info();
                assert!(snap.cur_dma_count <= snap.max_dma_count);
                samples += 1;
            }
            samples
        });

        let submitters: Vec<_> = (0..10u32)
            .map(|t| {
                let session = fx.engine.session_as(UID);
                let file = &file;
                scope.spawn(move || {
                    let mut ids = Vec::new();
                    for i in 0..10u32 {
                        // A writeback buffer serves one outstanding task.
                        let (wb, _) = session.allocate_dma_buffer(4 * CHUNK, -1).unwrap();
                        let first = ((t * 10 + i) % 16) * 4;
                        let chunks: Vec<u32> = (first..first + 4).collect();
                        let req = DirectRequest {
                            handle: region.handle,
                            offset: u64::from(first) * u64::from(PAGE),
                            file,
                            chunk_ids: &chunks,
                            chunk_sz: PAGE,
                            relseg_sz: 0,
                            wb_buffer: wb,
                        };
                        ids.push(session.memcpy_ssd2gpu(&req).unwrap().task_id);
                    }
                    for id in ids {
                        assert!(session.wait(id).unwrap().is_success());
                    }
                })
            })
            .collect();

        for s in submitters {
            s.join().unwrap();
        }
        done.store(true, Ordering::Release);
        assert!(reader.join().unwrap() > 0);
    });

    let snap = setup.stat_info();
    assert_eq!(snap.cur_dma_count, 0);
    assert!(snap.max_dma_count >= 1);
    assert!(snap.max_dma_count <= 100);
    assert_eq!(snap.nr_ssd2gpu, 100);
    assert_eq!(snap.nr_wait_dtask, 100);
    assert_eq!(fx.dev.read(va, 64 * CHUNK), pattern(0, 64 * CHUNK));
}

#[test]
fn outstanding_limit_rejects_until_collected() {
    let fx = Fixture::with_config(true, |c| {
        c.max_outstanding_tasks = 3;
        c.worker_threads = 1;
    });
    let s = fx.engine.session_as(UID);
    let va = fx.dev.allocate(4 * u64::from(PAGE), UID);
    let region = s.map_gpu_memory(va, 4 * u64::from(PAGE)).unwrap();
    let file = fx.source(4 * CHUNK);

    let submit = || {
        let (wb, _) = s.allocate_dma_buffer(CHUNK, -1).unwrap();
        s.memcpy_ssd2gpu(&DirectRequest {
            handle: region.handle,
            offset: 0,
            file: &file,
            chunk_ids: &[0],
            chunk_sz: PAGE,
            relseg_sz: 0,
            wb_buffer: wb,
        })
    };

    let ids: Vec<_> = (0..3).map(|_| submit().unwrap().task_id).collect();
    let err = submit().unwrap_err();
    assert!(matches!(err, StromError::TooManyOutstanding { limit: 3 }));
    assert!(err.is_retryable());

    s.wait(ids[0]).unwrap();
    let extra = submit().unwrap().task_id;
    for id in ids.into_iter().skip(1).chain([extra]) {
        assert!(s.wait(id).unwrap().is_success());
    }
    assert_eq!(s.stat_info().max_dma_count, 3);
}
