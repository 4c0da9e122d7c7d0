//! Per-server shared state (spec.md §5 "the `shmem` region"): in a
//! multi-process origin this would be a named shared-memory segment;
//! here it is an arena of atomics behind a typed accessor, shared via
//! `Arc` between the supervisor and the tasks it spawns (spec.md §9
//! "Global mutable state").

use repository::RepositoryLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// One server's runtime flags. `repository` is the single-writer lock
/// from the `repository` crate; everything else is a plain atomic.
pub struct ServerState {
    pub name: String,
    online: AtomicBool,
    primary: AtomicBool,
    valid: AtomicBool,
    wal_streaming: AtomicU32,
    pub repository: RepositoryLock,
}

impl ServerState {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(ServerState {
            name: name.into(),
            online: AtomicBool::new(false),
            primary: AtomicBool::new(false),
            valid: AtomicBool::new(false),
            wal_streaming: AtomicU32::new(0),
            repository: RepositoryLock::new(),
        })
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, value: bool) {
        self.online.store(value, Ordering::Release);
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::Acquire)
    }

    pub fn set_primary(&self, value: bool) {
        self.primary.store(value, Ordering::Release);
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn set_valid(&self, value: bool) {
        self.valid.store(value, Ordering::Release);
    }

    pub fn wal_streaming_count(&self) -> u32 {
        self.wal_streaming.load(Ordering::Acquire)
    }

    /// Increments before the streamer task is spawned; the streamer
    /// decrements it in its own teardown (spec.md §4.8 concurrency
    /// property: at most one WAL streamer per server).
    pub fn begin_wal_streaming(&self) -> bool {
        self.wal_streaming
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_wal_streaming(&self) {
        self.wal_streaming.store(0, Ordering::Release);
    }
}

/// Process-wide `running` flag flipped by `TERM`/`INT` handlers
/// (spec.md §5 "Cancellation").
#[derive(Clone)]
pub struct RunningFlag(Arc<AtomicBool>);

impl RunningFlag {
    pub fn new() -> Self {
        RunningFlag(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for RunningFlag {
    fn default() -> Self {
        Self::new()
    }
}
