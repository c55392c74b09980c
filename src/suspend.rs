//! Early-suspend / late-resume coordination.
//!
//! Handlers are called in ascending level order when the system goes to
//! sleep and in descending order when it wakes. Requests only record the
//! wanted state and queue work; the work re-checks the state under the
//! handler lock, so a request that is reverted before its work runs is
//! dropped and the most recent request wins.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;

use log::{debug, info, warn};

use crate::workqueue::WorkQueue;

const SUSPEND_REQUESTED: u8 = 0x1;
const SUSPENDED: u8 = 0x2;
const SUSPEND_REQUESTED_AND_SUSPENDED: u8 = SUSPEND_REQUESTED | SUSPENDED;

/// The state userspace asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SuspendState {
    On,
    Mem,
}

impl std::str::FromStr for SuspendState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "on" => Ok(SuspendState::On),
            "mem" | "standby" => Ok(SuspendState::Mem),
            other => Err(format!("unknown suspend state {other:?}")),
        }
    }
}

/// Where the coordinator currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Phase {
    Active,
    SuspendRequested,
    Suspended,
    /// Suspended, with a wake request not yet handled.
    ResumeRequested,
}

impl Phase {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Phase::Active,
            SUSPEND_REQUESTED => Phase::SuspendRequested,
            SUSPEND_REQUESTED_AND_SUSPENDED => Phase::Suspended,
            _ => Phase::ResumeRequested,
        }
    }
}

/// A participant in the early-suspend lifecycle.
///
/// Callbacks run on the coordinator's worker with the handler list locked;
/// they may block but must not register or unregister handlers.
pub trait EarlySuspend: Send + Sync {
    fn level(&self) -> i32;

    fn suspend(&self) {}

    fn resume(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

struct Registered {
    id: HandlerId,
    level: i32,
    handler: Arc<dyn EarlySuspend>,
}

/// Process-wide lock keeping the system awake.
#[derive(Debug)]
pub struct WakeLock {
    name: &'static str,
    held: AtomicBool,
}

impl WakeLock {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            held: AtomicBool::new(true),
        }
    }

    fn acquire(&self) {
        if !self.held.swap(true, Ordering::AcqRel) {
            debug!("wake lock {} acquired", self.name);
        }
    }

    fn release(&self) {
        if self.held.swap(false, Ordering::AcqRel) {
            debug!("wake lock {} released", self.name);
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Work {
    EarlySuspend,
    LateResume,
}

struct StateWord {
    bits: u8,
    requested: SuspendState,
}

struct Inner {
    handlers: Mutex<Vec<Registered>>,
    state: Mutex<StateWord>,
    wake_lock: WakeLock,
    post_suspend: Mutex<Option<Instant>>,
    // completed suspends that flushed the filesystems
    syncs: AtomicU64,
    next_id: AtomicU64,
    queue: Arc<WorkQueue<Work>>,
}

fn sync_filesystems() {
    // SAFETY: sync(2) takes no arguments and always succeeds
    unsafe { libc::sync() };
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    fn early_suspend(&self) {
        let handlers = lock(&self.handlers);
        let abort = {
            let mut state = lock(&self.state);
            if state.bits == SUSPEND_REQUESTED {
                state.bits |= SUSPENDED;
                None
            } else {
                Some(state.bits)
            }
        };

        if let Some(bits) = abort {
            debug!("early_suspend: abort, state {bits}");
            drop(handlers);
        } else {
            debug!("early_suspend: call handlers");
            for h in handlers.iter() {
                h.handler.suspend();
            }
            drop(handlers);
            debug!("early_suspend: sync");
            sync_filesystems();
            self.syncs.fetch_add(1, Ordering::AcqRel);
            *lock(&self.post_suspend) = Some(Instant::now());
        }

        let state = lock(&self.state);
        if state.bits == SUSPEND_REQUESTED_AND_SUSPENDED {
            self.wake_lock.release();
        }
    }

    fn late_resume(&self) {
        let handlers = lock(&self.handlers);
        let abort = {
            let mut state = lock(&self.state);
            if state.bits == SUSPENDED {
                state.bits &= !SUSPENDED;
                None
            } else {
                Some(state.bits)
            }
        };

        if let Some(bits) = abort {
            debug!("late_resume: abort, state {bits}");
            return;
        }

        *lock(&self.post_suspend) = None;
        debug!("late_resume: call handlers");
        for h in handlers.iter().rev() {
            h.handler.resume();
        }
        info!("late_resume: done");
    }

    fn run(&self, work: Work) {
        match work {
            Work::EarlySuspend => self.early_suspend(),
            Work::LateResume => self.late_resume(),
        }
    }
}

/// Registry of early-suspend handlers and the sleep/wake state machine.
pub struct SuspendCoordinator {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SuspendCoordinator {
    /// Work stays queued until [`start`](Self::start) or
    /// [`run_pending`](Self::run_pending).
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: Mutex::new(Vec::new()),
                state: Mutex::new(StateWord {
                    bits: 0,
                    requested: SuspendState::On,
                }),
                wake_lock: WakeLock::new("main"),
                post_suspend: Mutex::new(None),
                syncs: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
                queue: WorkQueue::new("suspend"),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the dedicated suspend worker.
    pub fn start(&self) -> Result<(), std::io::Error> {
        let inner = Arc::clone(&self.inner);
        let handle = self.inner.queue.spawn_worker(move |work| inner.run(work))?;
        *lock(&self.worker) = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.queue.shutdown();
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                warn!("suspend worker panicked");
            }
        }
    }

    /// Runs queued suspend/resume work on the calling thread.
    pub fn run_pending(&self) -> usize {
        self.inner.queue.run_pending(|work| self.inner.run(work))
    }

    /// Inserts `handler` after every handler of the same or lower level.
    /// A handler registered while suspended is suspended right away.
    pub fn register(&self, handler: Arc<dyn EarlySuspend>) -> HandlerId {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let level = handler.level();
        let mut handlers = lock(&self.inner.handlers);
        let pos = handlers
            .iter()
            .position(|h| h.level > level)
            .unwrap_or(handlers.len());
        handlers.insert(
            pos,
            Registered {
                id,
                level,
                handler: Arc::clone(&handler),
            },
        );
        let suspended = lock(&self.inner.state).bits & SUSPENDED != 0;
        if suspended {
            handler.suspend();
        }
        debug!("registered {id} at level {level}");
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut handlers = lock(&self.inner.handlers);
        let before = handlers.len();
        handlers.retain(|h| h.id != id);
        handlers.len() != before
    }

    /// Asks for sleep (`Mem`) or wake (`On`). Repeating the current request
    /// does nothing.
    pub fn request_suspend_state(&self, new_state: SuspendState) {
        let mut state = lock(&self.inner.state);
        let old_sleep = state.bits & SUSPEND_REQUESTED != 0;
        info!(
            "request_suspend_state: {} ({:?}->{:?})",
            if new_state != SuspendState::On { "sleep" } else { "wakeup" },
            state.requested,
            new_state
        );

        if !old_sleep && new_state != SuspendState::On {
            state.bits |= SUSPEND_REQUESTED;
            if !self.inner.queue.queue(Work::EarlySuspend) {
                warn!("request_suspend_state: early suspend already queued");
            }
        } else if old_sleep && new_state == SuspendState::On {
            state.bits &= !SUSPEND_REQUESTED;
            self.inner.wake_lock.acquire();
            if !self.inner.queue.queue(Work::LateResume) {
                warn!("request_suspend_state: late resume already queued");
            }
        }
        state.requested = new_state;
    }

    pub fn requested_state(&self) -> SuspendState {
        lock(&self.inner.state).requested
    }

    pub fn phase(&self) -> Phase {
        Phase::from_bits(lock(&self.inner.state).bits)
    }

    pub fn wake_lock(&self) -> &WakeLock {
        &self.inner.wake_lock
    }

    /// When the last completed early suspend finished, if not resumed since.
    pub fn post_suspend_since(&self) -> Option<Instant> {
        *lock(&self.inner.post_suspend)
    }

    pub fn pending_work(&self) -> usize {
        self.inner.queue.len()
    }

    /// Number of early suspends that ran their handlers and flushed the
    /// filesystems.
    pub fn filesystem_syncs(&self) -> u64 {
        self.inner.syncs.load(Ordering::Acquire)
    }
}

impl Default for SuspendCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SuspendCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        level: i32,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl EarlySuspend for Recorder {
        fn level(&self) -> i32 {
            self.level
        }

        fn suspend(&self) {
            self.log.lock().unwrap().push(format!("suspend {}", self.level));
        }

        fn resume(&self) {
            self.log.lock().unwrap().push(format!("resume {}", self.level));
        }
    }

    fn with_handlers(levels: &[i32]) -> (SuspendCoordinator, Arc<Mutex<Vec<String>>>, Vec<HandlerId>) {
        let coordinator = SuspendCoordinator::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let ids = levels
            .iter()
            .map(|&level| {
                coordinator.register(Arc::new(Recorder {
                    level,
                    log: log.clone(),
                }))
            })
            .collect();
        (coordinator, log, ids)
    }

    #[test]
    fn test_handler_order() {
        let (c, log, _) = with_handlers(&[5, 1, 3]);
        c.request_suspend_state(SuspendState::Mem);
        c.run_pending();
        c.request_suspend_state(SuspendState::On);
        c.run_pending();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["suspend 1", "suspend 3", "suspend 5", "resume 5", "resume 3", "resume 1"]
        );
        assert_eq!(c.phase(), Phase::Active);
    }

    #[test]
    fn test_duplicate_suspend_request_is_noop() {
        let (c, log, _) = with_handlers(&[0]);
        c.request_suspend_state(SuspendState::Mem);
        c.request_suspend_state(SuspendState::Mem);
        assert_eq!(c.pending_work(), 1);
        assert_eq!(c.run_pending(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["suspend 0"]);
        assert_eq!(c.phase(), Phase::Suspended);
        assert!(!c.wake_lock().is_held());
        assert!(c.post_suspend_since().is_some());
        assert_eq!(c.filesystem_syncs(), 1);
    }

    #[test]
    fn test_reverted_request_aborts_suspend() {
        let (c, log, _) = with_handlers(&[0]);
        c.request_suspend_state(SuspendState::Mem);
        c.request_suspend_state(SuspendState::On);
        assert_eq!(c.run_pending(), 2);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(c.phase(), Phase::Active);
        assert!(c.wake_lock().is_held());
        assert_eq!(c.requested_state(), SuspendState::On);
        // an aborted suspend does not flush
        assert_eq!(c.filesystem_syncs(), 0);
    }

    #[test]
    fn test_resume_racing_a_completed_suspend_keeps_wake_lock() {
        let (c, log, _) = with_handlers(&[0]);
        c.request_suspend_state(SuspendState::Mem);
        c.run_pending();
        c.request_suspend_state(SuspendState::On);
        assert_eq!(c.phase(), Phase::ResumeRequested);
        assert!(c.wake_lock().is_held());
        c.request_suspend_state(SuspendState::Mem);
        // the resume work aborts, the second suspend work finds the system suspended already
        c.run_pending();
        assert_eq!(*log.lock().unwrap(), vec!["suspend 0"]);
        assert_eq!(c.phase(), Phase::Suspended);
        assert!(!c.wake_lock().is_held());
    }

    #[test]
    fn test_register_while_suspended_suspends_handler() {
        let (c, log, ids) = with_handlers(&[2]);
        c.request_suspend_state(SuspendState::Mem);
        c.run_pending();
        c.register(Arc::new(Recorder {
            level: 1,
            log: log.clone(),
        }));
        assert_eq!(*log.lock().unwrap(), vec!["suspend 2", "suspend 1"]);

        assert!(c.unregister(ids[0]));
        assert!(!c.unregister(ids[0]));
        c.request_suspend_state(SuspendState::On);
        c.run_pending();
        assert_eq!(log.lock().unwrap().last().unwrap(), "resume 1");
        assert!(c.post_suspend_since().is_none());
    }

    #[test]
    fn test_worker_thread_runs_requests() {
        let (c, log, _) = with_handlers(&[0]);
        c.start().unwrap();
        c.request_suspend_state(SuspendState::Mem);
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while c.phase() != Phase::Suspended && Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        c.stop();
        assert_eq!(*log.lock().unwrap(), vec!["suspend 0"]);
    }

    #[test]
    fn test_parse_state() {
        assert_eq!("mem\n".parse::<SuspendState>(), Ok(SuspendState::Mem));
        assert_eq!("on".parse::<SuspendState>(), Ok(SuspendState::On));
        assert!("off".parse::<SuspendState>().is_err());
    }
}
