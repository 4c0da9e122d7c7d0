//! Worker pool: a fixed-size ring of OS threads draining a task queue,
//! used for the per-file subtasks of one backup/restore/verify
//! (copy/reconstruct/hash/compress/encrypt), spec.md §5 "Scheduling
//! model" and "Shared resource policy". Deliberately synchronous (plain
//! `std::thread` + a mutex/condvar queue) rather than `tokio`-async: the
//! per-file work is itself CPU/disk bound, and spec.md §5 names the
//! mutex-and-condition-variable task queue explicitly rather than an
//! async channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() -> bool + Send + 'static>;

/// `outstanding` counts tasks that are queued or currently running on a
/// worker; it reaches zero only once every submitted task has actually
/// returned, not merely once the queue is empty (a worker can still be
/// mid-task after popping the last item). Guarded by the same mutex as
/// `tasks` so the condvar wakes exactly when either changes.
struct QueueState {
    tasks: VecDeque<Task>,
    outstanding: usize,
}

struct Shared {
    state: Mutex<QueueState>,
    condvar: Condvar,
    shutdown: AtomicBool,
    outcome: AtomicBool,
}

/// `workers` OS threads sharing one task queue. Each submitted task
/// returns `bool`; the pool's `outcome` flips to `false` on the first
/// task that returns `false` and stays false for the rest of this pool's
/// lifetime (spec.md §5: "a false outcome aborts the enclosing workflow
/// step").
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                outstanding: 0,
            }),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
            outcome: AtomicBool::new(true),
        });

        let handles = (0..workers.max(1))
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || worker_loop(shared))
            })
            .collect();

        WorkerPool { shared, handles }
    }

    /// Enqueues one subtask; wakes a worker.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        let mut state = self.shared.state.lock().unwrap();
        state.outstanding += 1;
        state.tasks.push_back(Box::new(task));
        self.shared.condvar.notify_one();
    }

    /// Blocks until every submitted task has finished running, then
    /// returns the pool's `outcome` (true only if every task returned
    /// `true`).
    pub fn wait_for_quiescence(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        while state.outstanding != 0 {
            state = self.shared.condvar.wait(state).unwrap();
        }
        self.shared.outcome.load(Ordering::Acquire)
    }

    pub fn shutdown(mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.condvar.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    break Some(task);
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                state = shared.condvar.wait(state).unwrap();
            }
        };

        let Some(task) = task else { return };
        let ok = task();
        if !ok {
            shared.outcome.store(false, Ordering::Release);
        }

        let mut state = shared.state.lock().unwrap();
        state.outstanding -= 1;
        if state.outstanding == 0 {
            shared.condvar.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn all_tasks_succeeding_leaves_outcome_true() {
        let pool = WorkerPool::new(4);
        let completed = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let completed = Arc::clone(&completed);
            pool.submit(move || {
                completed.fetch_add(1, Ordering::SeqCst);
                true
            });
        }
        assert!(pool.wait_for_quiescence());
        assert_eq!(completed.load(Ordering::SeqCst), 20);
        pool.shutdown();
    }

    #[test]
    fn one_failing_task_flips_outcome_to_false() {
        let pool = WorkerPool::new(2);
        pool.submit(|| true);
        pool.submit(|| false);
        pool.submit(|| true);
        assert!(!pool.wait_for_quiescence());
        pool.shutdown();
    }

    /// A slow task dequeued early must still be counted "outstanding"
    /// after the queue has drained, so a fast sibling task finishing
    /// first and seeing an empty queue can't make `wait_for_quiescence`
    /// return before the slow task's write actually lands.
    #[test]
    fn quiescence_waits_for_a_slow_straggler_not_just_an_empty_queue() {
        let pool = WorkerPool::new(2);
        let slow_task_finished = Arc::new(AtomicBool::new(false));

        {
            let slow_task_finished = Arc::clone(&slow_task_finished);
            pool.submit(move || {
                std::thread::sleep(Duration::from_millis(100));
                slow_task_finished.store(true, Ordering::SeqCst);
                true
            });
        }
        pool.submit(|| true);

        assert!(pool.wait_for_quiescence());
        assert!(slow_task_finished.load(Ordering::SeqCst));
        pool.shutdown();
    }
}
