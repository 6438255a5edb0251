//! Worker pool and shared run queue.
//!
//! A fixed pool of worker threads, one pinned to each core (rounded up to
//! an even count), drains a shared virtual-time run queue. Blocking happens
//! in exactly one place: a worker with nothing to fetch waits on the
//! `task_ready` condvar. Submitting one task signals one worker; submitting
//! a batch broadcasts.

use crate::vtask::{TaskId, VTask, VTaskTree};

use reef_types::histogram::TimeHistogram;

use parking_lot::{Condvar, Mutex};

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

thread_local! {
    static WORKER_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Index of the worker the calling thread belongs to, if any.
pub fn current_worker() -> Option<usize> {
    WORKER_ID.with(Cell::get)
}

/// Scheduler construction knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker thread count; defaults to the core count rounded up to even.
    pub workers: Option<usize>,
    /// Pin each worker to the core matching its index.
    pub pin_workers: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            pin_workers: true,
        }
    }
}

/// Per-worker latency accounting.
pub struct WorkerStats {
    /// Time spent fetching from the run queue (including idle waits).
    pub rq_time: TimeHistogram,
    /// Task execution time.
    pub task_vtime: TimeHistogram,
    /// Tasks executed.
    pub executed: u64,
    /// Cancelled tasks dropped at fetch time.
    pub dropped: u64,
}

impl WorkerStats {
    fn new() -> Self {
        Self {
            rq_time: TimeHistogram::time(),
            task_vtime: TimeHistogram::time(),
            executed: 0,
            dropped: 0,
        }
    }
}

struct Core {
    rq: Mutex<VTaskTree>,
    task_ready: Condvar,
    running: AtomicBool,
    seq: AtomicU64,
    stats: Vec<Mutex<WorkerStats>>,
    base: Instant,
}

/// The worker pool.
pub struct Scheduler {
    core: Arc<Core>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn the worker pool.
    pub fn open(config: SchedulerConfig) -> Self {
        let cores = std::thread::available_parallelism().map_or(2, |n| n.get());
        let workers = config
            .workers
            .unwrap_or_else(|| reef_types::bits::align_up(cores, 2));

        let core = Arc::new(Core {
            rq: Mutex::new(VTaskTree::new()),
            task_ready: Condvar::new(),
            running: AtomicBool::new(true),
            seq: AtomicU64::new(0),
            stats: (0..workers).map(|_| Mutex::new(WorkerStats::new())).collect(),
            base: Instant::now(),
        });

        let handles = (0..workers)
            .map(|worker| {
                let core = core.clone();
                let pin = config.pin_workers;
                std::thread::Builder::new()
                    .name(format!("reef-worker-{worker}"))
                    .spawn(move || {
                        WORKER_ID.with(|id| id.set(Some(worker)));
                        if pin {
                            bind_to_core(worker);
                        }
                        worker_loop(&core, worker);
                    })
                    .expect("worker thread spawn")
            })
            .collect();

        tracing::debug!(workers, "scheduler started");
        Scheduler {
            core,
            workers: handles,
        }
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.core.stats.len()
    }

    /// Queue a closure at the given virtual time.
    pub fn submit(&self, vtime: u64, exec: impl FnOnce() + Send + 'static) -> TaskId {
        let seqid = self.core.seq.fetch_add(1, Ordering::Relaxed);
        self.submit_task(VTask::new(vtime, seqid, exec))
    }

    /// Queue a prepared task; its seqid is overwritten to preserve
    /// submission order.
    pub fn submit_task(&self, mut task: VTask) -> TaskId {
        task.seqid = self.core.seq.fetch_add(1, Ordering::Relaxed);
        let id = self.core.rq.lock().push(task);
        self.core.task_ready.notify_one();
        id
    }

    /// Queue a batch, waking every worker when more than one task landed.
    pub fn submit_batch(&self, tasks: impl IntoIterator<Item = VTask>) {
        let mut queued = 0usize;
        {
            let mut rq = self.core.rq.lock();
            for mut task in tasks {
                task.seqid = self.core.seq.fetch_add(1, Ordering::Relaxed);
                rq.push(task);
                queued += 1;
            }
        }
        match queued {
            0 => {}
            1 => {
                self.core.task_ready.notify_one();
            }
            _ => {
                self.core.task_ready.notify_all();
            }
        }
    }

    /// Unqueue a task that has not been fetched yet.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.core.rq.lock().remove(id).is_some()
    }

    /// Flag every queued task; workers drop them at fetch time, invoking
    /// cancel hooks instead of bodies.
    pub fn cancel_all(&self) {
        self.core.rq.lock().cancel_all();
        self.core.task_ready.notify_all();
    }

    /// Tasks currently queued.
    pub fn queued(&self) -> usize {
        self.core.rq.lock().len()
    }

    /// Run `f` over a worker's stats.
    pub fn with_worker_stats<R>(&self, worker: usize, f: impl FnOnce(&WorkerStats) -> R) -> R {
        f(&self.core.stats[worker].lock())
    }

    /// Stop the pool: wake everyone, drain nothing further, join.
    pub fn close(mut self) {
        self.shutdown();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }

    fn shutdown(&self) {
        self.core.running.store(false, Ordering::SeqCst);
        self.core.task_ready.notify_all();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(core: &Core, worker: usize) {
    let now = || core.base.elapsed().as_nanos() as u64;

    while core.running.load(Ordering::SeqCst) {
        let fetch_start = now();
        let task = {
            let mut rq = core.rq.lock();
            loop {
                if let Some(task) = rq.pop() {
                    break Some(task);
                }
                if !core.running.load(Ordering::SeqCst) {
                    break None;
                }
                core.task_ready.wait(&mut rq);
            }
        };
        let fetched = now();

        let Some(task) = task else { break };

        {
            let mut stats = core.stats[worker].lock();
            stats.rq_time.add(fetched - fetch_start);
        }

        if task.cancelled {
            if let Some(cancel) = task.cancel {
                cancel();
            }
            core.stats[worker].lock().dropped += 1;
            continue;
        }

        (task.exec)();

        let mut stats = core.stats[worker].lock();
        stats.task_vtime.add(now() - fetched);
        stats.executed += 1;
    }

    tracing::trace!(worker, "worker stopped");
}

#[cfg(target_os = "linux")]
fn bind_to_core(core_id: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core_id % libc::sysconf(libc::_SC_NPROCESSORS_ONLN).max(1) as usize, &mut set);
        // failure just means we run unpinned
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_to_core(_core_id: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    fn scheduler(workers: usize) -> Scheduler {
        Scheduler::open(SchedulerConfig {
            workers: Some(workers),
            pin_workers: false,
        })
    }

    #[test]
    fn executes_submitted_tasks() {
        let sched = scheduler(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = counter.clone();
            sched.submit(0, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 100 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        sched.close();
    }

    #[test]
    fn single_worker_runs_in_vtime_order() {
        let sched = scheduler(1);
        let (tx, rx) = mpsc::channel();

        // park the worker on a first task so the rest queue up behind it
        let gate = Arc::new(AtomicBool::new(false));
        {
            let gate = gate.clone();
            sched.submit(0, move || {
                while !gate.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            });
        }

        for (vtime, tag) in [(30u64, 'c'), (10, 'a'), (20, 'b')] {
            let tx = tx.clone();
            sched.submit(vtime, move || {
                tx.send(tag).unwrap();
            });
        }
        gate.store(true, Ordering::SeqCst);

        let order: Vec<char> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec!['a', 'b', 'c']);
        sched.close();
    }

    #[test]
    fn cancel_all_runs_hooks_not_bodies() {
        let sched = scheduler(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));

        // hold the worker while we queue and cancel
        let gate = Arc::new(AtomicBool::new(false));
        {
            let gate = gate.clone();
            sched.submit(0, move || {
                while !gate.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            });
        }

        for _ in 0..10 {
            let ran = ran.clone();
            let cancelled = cancelled.clone();
            let mut task = VTask::new(1, 0, move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
            task.cancel = Some(Box::new(move || {
                cancelled.fetch_add(1, Ordering::SeqCst);
            }));
            sched.submit_task(task);
        }

        sched.cancel_all();
        gate.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + Duration::from_secs(5);
        while cancelled.load(Ordering::SeqCst) < 10 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(cancelled.load(Ordering::SeqCst), 10);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        sched.close();
    }

    #[test]
    fn worker_thread_identity() {
        let sched = scheduler(2);
        let (tx, rx) = mpsc::channel();
        sched.submit(0, move || {
            tx.send(current_worker()).unwrap();
        });
        let id = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(id, Some(w) if w < 2));
        assert_eq!(current_worker(), None);
        sched.close();
    }
}
