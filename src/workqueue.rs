use std::collections::VecDeque;
use std::io::Error as IoError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, trace};

/// Deferred work executed off the caller's thread.
///
/// Queuing an item that is already pending is a no-op, mirroring a work item
/// that cannot be queued twice. Items run in FIFO order on one dedicated
/// worker, or on the caller through [`run_pending`](Self::run_pending).
pub struct WorkQueue<T> {
    name: String,
    pending: Mutex<VecDeque<T>>,
    doorbell: watch::WatchSender<u64>,
    doorbell_rx: Mutex<Option<watch::WatchReceiver<u64>>>,
    rung: AtomicU64,
    shutdown: AtomicBool,
}

impl<T: PartialEq + Send + 'static> WorkQueue<T> {
    pub fn new(name: &str) -> Arc<Self> {
        let (doorbell, doorbell_rx) = watch::channel(0);
        Arc::new(Self {
            name: name.to_string(),
            pending: Mutex::new(VecDeque::new()),
            doorbell,
            doorbell_rx: Mutex::new(Some(doorbell_rx)),
            rung: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        })
    }

    fn ring(&self) {
        let n = self.rung.fetch_add(1, Ordering::AcqRel) + 1;
        self.doorbell.send(n);
    }

    /// Returns `false` when an equal item was already pending.
    pub fn queue(&self, item: T) -> bool {
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.contains(&item) {
                return false;
            }
            pending.push_back(item);
        }
        self.ring();
        true
    }

    /// Drops pending items matching `pred`.
    pub fn cancel(&self, pred: impl Fn(&T) -> bool) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let before = pending.len();
        pending.retain(|item| !pred(item));
        before - pending.len()
    }

    pub fn is_pending(&self, item: &T) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(item)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop(&self) -> Option<T> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Runs everything pending on the calling thread, including items queued
    /// while draining. Returns how many items ran.
    pub fn run_pending(&self, mut work: impl FnMut(T)) -> usize {
        let mut ran = 0;
        while let Some(item) = self.pop() {
            work(item);
            ran += 1;
        }
        ran
    }

    /// Starts the dedicated worker. Only one worker can ever be spawned.
    pub fn spawn_worker<F>(self: &Arc<Self>, mut work: F) -> Result<JoinHandle<()>, IoError>
    where
        F: FnMut(T) + Send + 'static,
    {
        let mut doorbell = self
            .doorbell_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| IoError::other(format!("{} already has a worker", self.name)))?;
        let queue = Arc::clone(self);

        std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                debug!("{}: worker started", queue.name);
                loop {
                    let ran = queue.run_pending(&mut work);
                    if ran > 0 {
                        trace!("{}: ran {ran} items", queue.name);
                    }
                    if queue.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    doorbell.wait();
                }
                debug!("{}: worker stopped", queue.name);
            })
    }

    /// Asks the worker to exit once it has drained what is pending.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.ring();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_duplicate_items_coalesce() {
        let q = WorkQueue::new("test");
        assert!(q.queue(1));
        assert!(!q.queue(1));
        assert!(q.queue(2));
        let mut seen = Vec::new();
        assert_eq!(q.run_pending(|i| seen.push(i)), 2);
        assert_eq!(seen, vec![1, 2]);
        assert!(q.is_empty());
        assert!(q.queue(1));
    }

    #[test]
    fn test_cancel_drops_matching_items() {
        let q = WorkQueue::new("test");
        q.queue(1);
        q.queue(2);
        q.queue(3);
        assert_eq!(q.cancel(|i| *i != 2), 2);
        assert!(q.is_pending(&2));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_worker_runs_items_in_order() {
        let q = WorkQueue::new("test-worker");
        let (tx, rx) = mpsc::channel();
        q.queue(7);
        let handle = q.spawn_worker(move |i| tx.send(i).unwrap()).unwrap();
        q.queue(8);
        q.queue(9);

        let got: Vec<i32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, vec![7, 8, 9]);
        assert!(q.spawn_worker(|_| {}).is_err());

        q.shutdown();
        handle.join().unwrap();
    }
}
