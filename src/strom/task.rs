use crate::error::{StromError, StromResult};
use crate::strom::buffer::BufferLease;
use crate::strom::region::RegionRef;
use crate::strom::stats::{Stage, Stats};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Building,
    Submitted,
    Completed,
    Failed,
}

impl TaskState {
    const fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Stage a task failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedStage {
    /// A transfer could not be handed to a worker.
    SubmitDma,
    /// The device reported an error, or the data landed somewhere it no
    /// longer should have.
    Completion,
}

/// Final status delivered by a wait.
#[derive(Debug)]
pub enum TaskStatus {
    Success,
    Failed {
        stage: FailedStage,
        /// First error observed.
        error: StromError,
        failed_chunks: u32,
        total_chunks: u32,
    },
}

impl TaskStatus {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Some chunks of a failed task did land.
    #[must_use]
    pub const fn is_partial(&self) -> bool {
        match self {
            Self::Success => false,
            Self::Failed {
                failed_chunks,
                total_chunks,
                ..
            } => *failed_chunks < *total_chunks,
        }
    }

    #[must_use]
    pub const fn error(&self) -> Option<&StromError> {
        match self {
            Self::Success => None,
            Self::Failed { error, .. } => Some(error),
        }
    }

    /// `0`, or the negative errno of the first failure.
    #[must_use]
    pub fn as_raw(&self) -> i64 {
        self.error().map_or(0, StromError::errno)
    }
}

/// What one job reports when it finishes.
#[derive(Debug)]
pub struct JobFailure {
    pub stage: FailedStage,
    pub error: StromError,
    pub chunks: u32,
}

/// Resources a task keeps busy until its status is collected or reclaimed.
#[derive(Debug, Default)]
pub struct TaskHolds {
    pub region: Option<RegionRef>,
    pub buffer: Option<BufferLease>,
}

#[derive(Debug)]
struct TaskEntry {
    owner: u32,
    state: TaskState,
    pending: usize,
    total_chunks: u32,
    failed_chunks: u32,
    first_error: Option<(FailedStage, StromError)>,
    completed_at: Option<Instant>,
    _holds: TaskHolds,
}

impl TaskEntry {
    fn into_status(self) -> TaskStatus {
        match self.first_error {
            None => TaskStatus::Success,
            Some((stage, error)) => TaskStatus::Failed {
                stage,
                error,
                failed_chunks: self.failed_chunks,
                total_chunks: self.total_chunks,
            },
        }
    }
}

#[derive(Debug, Default)]
struct WaitSlot {
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
    cond: Condvar,
}

impl WaitSlot {
    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outstanding tasks, spread over hashed wait slots. A completion wakes every
/// waiter in its slot; waiters on other tasks of that slot go back to sleep
/// and are counted as wrong wakeups.
#[derive(Debug)]
pub struct TaskTable {
    slots: Box<[WaitSlot]>,
    next_id: AtomicU64,
    stats: Arc<Stats>,
    limit: usize,
    reclaim_after: Duration,
}

impl TaskTable {
    #[must_use]
    pub fn new(stats: Arc<Stats>, nslots: usize, limit: usize, reclaim_after: Duration) -> Self {
        Self {
            slots: (0..nslots.max(1)).map(|_| WaitSlot::default()).collect(),
            next_id: AtomicU64::new(1),
            stats,
            limit,
            reclaim_after,
        }
    }

    fn slot(&self, id: TaskId) -> &WaitSlot {
        &self.slots[(id % self.slots.len() as u64) as usize]
    }

    /// Allocate a task owned by `owner` in the `Building` state.
    ///
    /// # Errors
    /// `TooManyOutstanding` when the limit is reached even after reclaiming
    /// expired tasks.
    pub fn begin(&self, total_chunks: u32, owner: u32, holds: TaskHolds) -> StromResult<TaskId> {
        if !self.stats.try_begin_task(self.limit)
            && (self.reclaim_expired() == 0 || !self.stats.try_begin_task(self.limit))
        {
            return Err(StromError::TooManyOutstanding { limit: self.limit });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slot(id).lock().insert(
            id,
            TaskEntry {
                owner,
                state: TaskState::Building,
                pending: 0,
                total_chunks,
                failed_chunks: 0,
                first_error: None,
                completed_at: None,
                _holds: holds,
            },
        );
        Ok(id)
    }

    /// Move a task to `Submitted` with `jobs` completions to come.
    pub fn mark_submitted(&self, id: TaskId, jobs: usize) {
        let slot = self.slot(id);
        let mut tasks = slot.lock();
        let Some(entry) = tasks.get_mut(&id) else {
            return;
        };
        entry.state = TaskState::Submitted;
        entry.pending = jobs;
        if jobs == 0 {
            Self::finish(entry);
            drop(tasks);
            slot.cond.notify_all();
        }
    }

    /// Report one finished job.
    pub fn complete(&self, id: TaskId, result: Result<(), JobFailure>) {
        let slot = self.slot(id);
        let mut tasks = slot.lock();
        let Some(entry) = tasks.get_mut(&id) else {
            return;
        };

        if let Err(failure) = result {
            tracing::debug!(task = id, error = %failure.error, "transfer job failed");
            entry.failed_chunks += failure.chunks;
            if entry.first_error.is_none() {
                entry.first_error = Some((failure.stage, failure.error));
            }
        }
        entry.pending = entry.pending.saturating_sub(1);
        if entry.pending == 0 && entry.state == TaskState::Submitted {
            Self::finish(entry);
            drop(tasks);
            slot.cond.notify_all();
        }
    }

    fn finish(entry: &mut TaskEntry) {
        entry.state = if entry.first_error.is_some() {
            TaskState::Failed
        } else {
            TaskState::Completed
        };
        entry.completed_at = Some(Instant::now());
    }

    /// The entry for `id` as seen by `caller`. Tasks of other users look unknown.
    fn visible(
        tasks: &HashMap<TaskId, TaskEntry>,
        id: TaskId,
        caller: u32,
    ) -> StromResult<&TaskEntry> {
        match tasks.get(&id) {
            Some(entry) if caller == 0 || caller == entry.owner => Ok(entry),
            _ => Err(StromError::UnknownTask(id)),
        }
    }

    /// Block until the task completes and collect its status.
    ///
    /// # Errors
    /// `UnknownTask` for an unknown, foreign or already collected id.
    pub fn wait(&self, id: TaskId, caller: u32) -> StromResult<TaskStatus> {
        self.wait_until(id, caller, None)
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`.
    ///
    /// # Errors
    /// `UnknownTask`, or `WaitTimeout` leaving the task outstanding.
    pub fn wait_timeout(
        &self,
        id: TaskId,
        caller: u32,
        timeout: Duration,
    ) -> StromResult<TaskStatus> {
        self.wait_until(id, caller, Some(Instant::now() + timeout))
    }

    /// Collect the status if the task is done, `None` if it is still running.
    ///
    /// # Errors
    /// `UnknownTask`.
    pub fn try_wait(&self, id: TaskId, caller: u32) -> StromResult<Option<TaskStatus>> {
        let mut tasks = self.slot(id).lock();
        if !Self::visible(&tasks, id, caller)?.state.is_done() {
            return Ok(None);
        }
        Ok(Self::collect(&self.stats, &mut tasks, id))
    }

    fn wait_until(
        &self,
        id: TaskId,
        caller: u32,
        deadline: Option<Instant>,
    ) -> StromResult<TaskStatus> {
        let _timer = self.stats.time(Stage::WaitDtask);
        let slot = self.slot(id);
        let mut tasks = slot.lock();
        let mut woken = false;

        loop {
            if Self::visible(&tasks, id, caller)?.state.is_done() {
                return Self::collect(&self.stats, &mut tasks, id)
                    .ok_or(StromError::UnknownTask(id));
            }
            if woken {
                self.stats.wrong_wakeup();
            }

            tasks = match deadline {
                None => slot.cond.wait(tasks).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                        return Err(StromError::WaitTimeout);
                    };
                    let (guard, res) = slot
                        .cond
                        .wait_timeout(tasks, left)
                        .unwrap_or_else(PoisonError::into_inner);
                    if res.timed_out() && guard.get(&id).is_some_and(|e| !e.state.is_done()) {
                        return Err(StromError::WaitTimeout);
                    }
                    guard
                }
            };
            woken = true;
        }
    }

    fn collect(
        stats: &Stats,
        tasks: &mut HashMap<TaskId, TaskEntry>,
        id: TaskId,
    ) -> Option<TaskStatus> {
        let entry = tasks.remove(&id)?;
        stats.end_task();
        Some(entry.into_status())
    }

    /// Remove finished tasks nobody collected within the reclaim window.
    pub fn reclaim_expired(&self) -> usize {
        let mut reclaimed = 0;
        for slot in &self.slots {
            let mut tasks = slot.lock();
            let before = tasks.len();
            tasks.retain(|id, entry| {
                let expired = entry
                    .completed_at
                    .is_some_and(|at| at.elapsed() >= self.reclaim_after);
                if expired {
                    tracing::warn!(
                        task = id,
                        "reclaiming completed task that was never waited on"
                    );
                }
                !expired
            });
            let n = before - tasks.len();
            for _ in 0..n {
                self.stats.end_task();
            }
            reclaimed += n;
        }
        reclaimed
    }

    /// Tasks submitted but not yet collected.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.slots.iter().map(|s| s.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const UID: u32 = 1000;

    fn table(limit: usize) -> TaskTable {
        TaskTable::new(Arc::new(Stats::new()), 4, limit, Duration::from_secs(60))
    }

    fn begin(t: &TaskTable, chunks: u32) -> TaskId {
        t.begin(chunks, UID, TaskHolds::default()).unwrap()
    }

    fn io_failure(chunks: u32) -> JobFailure {
        JobFailure {
            stage: FailedStage::Completion,
            error: StromError::DeviceIo("short read".into()),
            chunks,
        }
    }

    #[test]
    fn wait_is_single_consumer() {
        let t = table(8);
        let id = begin(&t, 1);
        t.mark_submitted(id, 1);
        t.complete(id, Ok(()));
        assert!(t.wait(id, UID).unwrap().is_success());
        assert!(matches!(t.wait(id, UID), Err(StromError::UnknownTask(x)) if x == id));
    }

    #[test]
    fn foreign_caller_cannot_collect() {
        let t = table(8);
        let id = begin(&t, 1);
        t.mark_submitted(id, 1);
        t.complete(id, Ok(()));

        assert!(matches!(t.wait(id, UID + 1), Err(StromError::UnknownTask(_))));
        assert!(matches!(t.try_wait(id, UID + 1), Err(StromError::UnknownTask(_))));
        assert!(matches!(
            t.wait_timeout(id, UID + 1, Duration::from_millis(1)),
            Err(StromError::UnknownTask(_))
        ));
        assert!(t.wait(id, UID).unwrap().is_success());

        // Root collects anyone's task.
        let other = begin(&t, 1);
        t.mark_submitted(other, 0);
        assert!(t.wait(other, 0).unwrap().is_success());
    }

    #[test]
    fn blocking_wait_sees_completion() {
        let t = Arc::new(table(8));
        let id = begin(&t, 2);
        t.mark_submitted(id, 2);

        let worker = {
            let t = Arc::clone(&t);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                t.complete(id, Ok(()));
                t.complete(id, Err(io_failure(1)));
            })
        };
        let status = t.wait(id, UID).unwrap();
        worker.join().unwrap();

        assert_eq!(status.as_raw(), -i64::from(libc::EIO));
        assert!(status.is_partial());
        assert!(matches!(
            status,
            TaskStatus::Failed {
                stage: FailedStage::Completion,
                failed_chunks: 1,
                total_chunks: 2,
                ..
            }
        ));
    }

    #[test]
    fn sibling_completion_counts_wrong_wakeup() {
        let stats = Arc::new(Stats::new());
        // One slot: every task shares the same wait queue.
        let t = Arc::new(TaskTable::new(stats.clone(), 1, 8, Duration::from_secs(60)));
        let a = begin(&t, 1);
        let b = begin(&t, 1);
        t.mark_submitted(a, 1);
        t.mark_submitted(b, 1);

        let waiter = {
            let t = Arc::clone(&t);
            thread::spawn(move || t.wait(a, UID).unwrap())
        };
        thread::sleep(Duration::from_millis(30));
        t.complete(b, Ok(()));
        thread::sleep(Duration::from_millis(30));
        t.complete(a, Ok(()));
        assert!(waiter.join().unwrap().is_success());
        assert!(stats.snapshot().nr_wrong_wakeup >= 1);
        assert!(t.wait(b, UID).unwrap().is_success());
    }

    #[test]
    fn try_wait_and_timeout_leave_task_outstanding() {
        let t = table(8);
        let id = begin(&t, 1);
        t.mark_submitted(id, 1);
        assert!(t.try_wait(id, UID).unwrap().is_none());
        assert!(matches!(
            t.wait_timeout(id, UID, Duration::from_millis(10)),
            Err(StromError::WaitTimeout)
        ));
        t.complete(id, Ok(()));
        assert!(t.try_wait(id, UID).unwrap().unwrap().is_success());
        assert!(matches!(t.try_wait(id, UID), Err(StromError::UnknownTask(_))));
    }

    #[test]
    fn limit_and_reclaim() {
        let stats = Arc::new(Stats::new());
        let t = TaskTable::new(stats.clone(), 4, 2, Duration::ZERO);
        let a = begin(&t, 1);
        let b = begin(&t, 1);
        t.mark_submitted(a, 1);
        t.mark_submitted(b, 1);
        assert!(matches!(
            t.begin(1, UID, TaskHolds::default()),
            Err(StromError::TooManyOutstanding { limit: 2 })
        ));

        // `a` finishes but is never waited on; the next begin reclaims it.
        t.complete(a, Ok(()));
        let c = begin(&t, 1);
        assert!(matches!(t.wait(a, UID), Err(StromError::UnknownTask(_))));
        assert_eq!(t.outstanding(), 2);
        assert_eq!(stats.snapshot().cur_dma_count, 2);

        // Unfinished tasks are never reclaimed.
        assert_eq!(t.reclaim_expired(), 0);
        t.mark_submitted(c, 0);
        assert_eq!(t.reclaim_expired(), 1);
        assert_eq!(stats.snapshot().cur_dma_count, 1);
    }

    #[test]
    fn zero_jobs_complete_immediately() {
        let t = table(8);
        let id = begin(&t, 0);
        t.mark_submitted(id, 0);
        assert!(t.wait(id, UID).unwrap().is_success());
    }
}
