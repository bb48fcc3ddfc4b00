//! # Dispatcher Pool
//!
//! User handlers run on a bounded pool of dedicated threads, never on the
//! I/O executor. A single FIFO holds pending handler invocations; the main
//! dispatcher is always present and auxiliary dispatchers are spawned on
//! demand when a handler stalls.
//!
//! ## Stall detection
//!
//! Before a handler runs, its dispatcher registers a deadline of
//! `max_dispatch_time` with the watchdog. If the deadline passes before
//! the handler returns, the dispatcher is marked *blocked* and, while the
//! pool is below `max_dispatchers`, a fresh auxiliary dispatcher is
//! spawned to keep the queue moving. The stalled handler is never
//! cancelled; the timeout only recovers throughput.
//!
//! ## Auxiliary lifetime
//!
//! An auxiliary dispatcher keeps working only while it is the sole
//! unblocked dispatcher. As soon as another dispatcher is unblocked
//! again it exits and parks itself in the elapsed set, to be joined on
//! the next queue drain. This keeps the pool at one active thread in the
//! steady state, however many stalls happened before.
//!
//! Forward progress is guaranteed under `n` concurrently wedged handlers
//! as long as `max_dispatchers > n`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// A queued handler invocation.
pub type SyncHandler = Box<dyn FnOnce() + Send + 'static>;

/// Observable pool state, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Live dispatcher threads (main plus auxiliaries, reaped ones gone).
    pub dispatchers: usize,
    /// Dispatchers currently marked blocked by the watchdog.
    pub blocked: usize,
    /// Exited dispatchers awaiting a join.
    pub elapsed: usize,
    /// Most dispatcher threads ever alive at once.
    pub peak: usize,
}

struct RunningHandler {
    seq: u64,
    deadline: Instant,
}

#[derive(Default)]
struct Registry {
    dispatchers: HashMap<ThreadId, JoinHandle<()>>,
    blocked: HashSet<ThreadId>,
    elapsed: HashSet<ThreadId>,
    running: HashMap<ThreadId, RunningHandler>,
    next_seq: u64,
    peak: usize,
}

struct Shared {
    queue: Mutex<VecDeque<SyncHandler>>,
    queue_cv: Condvar,
    is_dispatching: AtomicBool,
    max_dispatchers: usize,
    max_dispatch_time: Duration,
    registry: Mutex<Registry>,
    watchdog_cv: Condvar,
}

/// Bounded dispatcher pool with stall detection.
pub struct DispatcherPool {
    shared: Arc<Shared>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl DispatcherPool {
    /// Create a pool allowing `max_dispatchers` threads in total (the main
    /// dispatcher counts toward the limit).
    pub fn new(max_dispatchers: usize, max_dispatch_time: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                queue_cv: Condvar::new(),
                is_dispatching: AtomicBool::new(false),
                max_dispatchers: max_dispatchers.max(1),
                max_dispatch_time,
                registry: Mutex::new(Registry::default()),
                watchdog_cv: Condvar::new(),
            }),
            watchdog: Mutex::new(None),
        }
    }

    /// Spawn the main dispatcher and the watchdog. Idempotent.
    pub fn start(&self) {
        if self.shared.is_dispatching.swap(true, Ordering::SeqCst) {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let main = thread::Builder::new()
            .name("dispatcher-main".into())
            .spawn(move || main_dispatch(&shared))
            .expect("spawning main dispatcher");
        {
            let mut registry = self.shared.registry.lock().expect("registry poisoned");
            registry.dispatchers.insert(main.thread().id(), main);
            registry.peak = registry.peak.max(registry.dispatchers.len());
        }

        let shared = Arc::clone(&self.shared);
        let watchdog = thread::Builder::new()
            .name("dispatcher-watchdog".into())
            .spawn(move || watchdog(&shared))
            .expect("spawning dispatcher watchdog");
        *self.watchdog.lock().expect("watchdog slot poisoned") = Some(watchdog);
    }

    /// Queue a handler invocation.
    pub fn enqueue(&self, handler: SyncHandler) {
        self.shared
            .queue
            .lock()
            .expect("handler queue poisoned")
            .push_back(handler);
        self.shared.queue_cv.notify_one();
    }

    /// Queue several handler invocations, preserving their order.
    pub fn enqueue_all(&self, handlers: impl IntoIterator<Item = SyncHandler>) {
        let mut queue = self.shared.queue.lock().expect("handler queue poisoned");
        for handler in handlers {
            queue.push_back(handler);
        }
        drop(queue);
        self.shared.queue_cv.notify_all();
    }

    /// Stop dispatching and join every dispatcher thread. Queued but
    /// not-yet-running handlers are dropped; once this returns, no handler
    /// runs anymore.
    pub fn stop(&self) {
        if !self.shared.is_dispatching.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.queue_cv.notify_all();
        self.shared.watchdog_cv.notify_all();

        let handles: Vec<JoinHandle<()>> = {
            let mut registry = self.shared.registry.lock().expect("registry poisoned");
            registry.elapsed.clear();
            registry.blocked.clear();
            registry.running.clear();
            registry.dispatchers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            // A dispatcher never calls stop(), so this cannot self-join.
            if let Err(e) = handle.join() {
                tracing::error!("dispatcher thread panicked: {:?}", e);
            }
        }
        if let Some(watchdog) = self.watchdog.lock().expect("watchdog slot poisoned").take() {
            if let Err(e) = watchdog.join() {
                tracing::error!("dispatcher watchdog panicked: {:?}", e);
            }
        }
        self.shared.queue.lock().expect("handler queue poisoned").clear();
    }

    pub fn is_dispatching(&self) -> bool {
        self.shared.is_dispatching.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DispatcherStats {
        let registry = self.shared.registry.lock().expect("registry poisoned");
        DispatcherStats {
            dispatchers: registry.dispatchers.len(),
            blocked: registry.blocked.len(),
            elapsed: registry.elapsed.len(),
            peak: registry.peak,
        }
    }
}

impl Drop for DispatcherPool {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// DISPATCH LOOPS
// ============================================================================

/// Main dispatcher: lives for the whole pool lifetime.
fn main_dispatch(shared: &Arc<Shared>) {
    while shared.is_dispatching.load(Ordering::SeqCst) {
        let mut queue = shared.queue.lock().expect("handler queue poisoned");
        if queue.is_empty() {
            // Wake idle auxiliaries so they can elapse themselves.
            shared.queue_cv.notify_all();
            let _unused = shared
                .queue_cv
                .wait_timeout(queue, Duration::from_millis(100))
                .expect("handler queue poisoned");
        } else {
            while shared.is_dispatching.load(Ordering::SeqCst) {
                let Some(handler) = queue.pop_front() else {
                    break;
                };
                drop(queue);
                invoke_handler(shared, handler);
                reap_elapsed(shared);
                queue = shared.queue.lock().expect("handler queue poisoned");
            }
        }
    }
}

/// Auxiliary dispatcher: works only while it is the sole unblocked
/// dispatcher, then parks itself in the elapsed set.
fn aux_dispatch(shared: &Arc<Shared>) {
    let id = thread::current().id();
    while shared.is_dispatching.load(Ordering::SeqCst) && is_active_dispatcher(shared, id) {
        let mut queue = shared.queue.lock().expect("handler queue poisoned");
        if queue.is_empty() {
            let (returned, _timeout) = shared
                .queue_cv
                .wait_timeout(queue, Duration::from_millis(100))
                .expect("handler queue poisoned");
            if returned.is_empty() {
                // Woken by the main dispatcher going idle, or timed out:
                // this auxiliary is no longer needed.
                break;
            }
        } else {
            while shared.is_dispatching.load(Ordering::SeqCst) && is_active_dispatcher(shared, id)
            {
                let Some(handler) = queue.pop_front() else {
                    break;
                };
                drop(queue);
                invoke_handler(shared, handler);
                reap_elapsed(shared);
                queue = shared.queue.lock().expect("handler queue poisoned");
            }
        }
    }

    shared
        .registry
        .lock()
        .expect("registry poisoned")
        .elapsed
        .insert(id);
}

/// Run one handler under watchdog supervision.
fn invoke_handler(shared: &Arc<Shared>, handler: SyncHandler) {
    let id = thread::current().id();
    let seq = {
        let mut registry = shared.registry.lock().expect("registry poisoned");
        registry.next_seq += 1;
        let seq = registry.next_seq;
        registry.running.insert(
            id,
            RunningHandler {
                seq,
                deadline: Instant::now() + shared.max_dispatch_time,
            },
        );
        seq
    };
    shared.watchdog_cv.notify_one();

    // A panicking handler must not take the dispatcher (and the queue
    // lock) down with it.
    if catch_unwind(AssertUnwindSafe(handler)).is_err() {
        tracing::error!("user handler panicked; dispatcher continues");
    }

    let mut registry = shared.registry.lock().expect("registry poisoned");
    if registry.running.get(&id).is_some_and(|running| running.seq == seq) {
        registry.running.remove(&id);
    }
    registry.blocked.remove(&id);
}

/// A dispatcher is active iff every other dispatcher is blocked.
fn is_active_dispatcher(shared: &Arc<Shared>, id: ThreadId) -> bool {
    let registry = shared.registry.lock().expect("registry poisoned");
    registry
        .dispatchers
        .keys()
        .all(|other| *other == id || registry.blocked.contains(other))
}

/// Join dispatchers that marked themselves elapsed.
fn reap_elapsed(shared: &Arc<Shared>) {
    let joinable: Vec<JoinHandle<()>> = {
        let mut registry = shared.registry.lock().expect("registry poisoned");
        let ids: Vec<ThreadId> = registry.elapsed.drain().collect();
        ids.iter()
            .filter_map(|id| registry.dispatchers.remove(id))
            .collect()
    };
    for handle in joinable {
        if let Err(e) = handle.join() {
            tracing::error!("elapsed dispatcher panicked: {:?}", e);
        }
    }
}

/// Watchdog: watches running-handler deadlines, marks overrunning
/// dispatchers blocked, and spawns replacements while capacity remains.
fn watchdog(shared: &Arc<Shared>) {
    let mut registry = shared.registry.lock().expect("registry poisoned");
    loop {
        if !shared.is_dispatching.load(Ordering::SeqCst) {
            return;
        }
        let next_deadline = registry.running.values().map(|running| running.deadline).min();
        match next_deadline {
            None => {
                registry = shared
                    .watchdog_cv
                    .wait_timeout(registry, Duration::from_millis(100))
                    .expect("registry poisoned")
                    .0;
            }
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    registry = shared
                        .watchdog_cv
                        .wait_timeout(registry, deadline - now)
                        .expect("registry poisoned")
                        .0;
                    continue;
                }

                let overdue: Vec<ThreadId> = registry
                    .running
                    .iter()
                    .filter(|(_, running)| running.deadline <= now)
                    .map(|(id, _)| *id)
                    .collect();
                for id in overdue {
                    registry.running.remove(&id);
                    registry.blocked.insert(id);
                    tracing::debug!("blocking call detected in dispatcher {:?}", id);

                    if registry.dispatchers.len() < shared.max_dispatchers {
                        let shared_clone = Arc::clone(shared);
                        match thread::Builder::new()
                            .name("dispatcher-aux".into())
                            .spawn(move || aux_dispatch(&shared_clone))
                        {
                            Ok(handle) => {
                                registry.dispatchers.insert(handle.thread().id(), handle);
                                registry.peak = registry.peak.max(registry.dispatchers.len());
                            }
                            Err(e) => {
                                tracing::error!("spawning auxiliary dispatcher failed: {}", e);
                            }
                        }
                    } else {
                        tracing::debug!("maximum number of dispatchers exceeded");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn handlers_run_in_order() {
        let pool = DispatcherPool::new(2, Duration::from_millis(100));
        pool.start();

        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            pool.enqueue(Box::new(move || {
                log.lock().unwrap().push(i);
            }));
        }
        thread::sleep(Duration::from_millis(200));
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        pool.stop();
    }

    #[test]
    fn no_handler_runs_after_stop() {
        let pool = DispatcherPool::new(2, Duration::from_millis(100));
        pool.start();

        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            pool.enqueue(Box::new(move || {
                thread::sleep(Duration::from_millis(50));
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        thread::sleep(Duration::from_millis(20));
        pool.stop();
        let after_stop = ran.load(Ordering::SeqCst);
        // An in-flight handler completed before stop returned; a handler
        // never started stays unstarted.
        assert!(after_stop <= 1);

        // Nothing enqueued after stop ever runs.
        let ran2 = Arc::clone(&ran);
        pool.enqueue(Box::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(ran.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn panicking_handler_does_not_kill_the_pool() {
        let pool = DispatcherPool::new(2, Duration::from_millis(100));
        pool.start();

        pool.enqueue(Box::new(|| panic!("boom")));
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            pool.enqueue(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        thread::sleep(Duration::from_millis(200));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        pool.stop();
    }
}
