//! # Actor Runtime
//!
//! A small many-actor, single-threaded-per-actor runtime. Protocol state is
//! never locked for concurrent access; instead every actor owns a
//! [`Mailbox`], a serial queue of closures, and the process-wide
//! [`Scheduler`] dispatches mailboxes with pending work onto a fixed pool of
//! worker threads.
//!
//! ## Guarantees
//!
//! - Two closures enqueued on the same mailbox never run concurrently, and
//!   they run in enqueue order.
//! - Closures enqueued on different mailboxes may run in parallel on
//!   different workers.
//! - After executing one closure a mailbox yields back to the scheduler even
//!   if more work is queued, so no actor can starve the others.
//!
//! ## Suspension
//!
//! The only suspension point in actor code is returning from the current
//! closure. Anything that must happen later is enqueued again, or scheduled
//! with [`Mailbox::enqueue_after`].

pub mod channel;
pub mod timer;

pub use channel::Channel;
pub use timer::Timer;

use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static CURRENT_MAILBOX: RefCell<Option<Arc<Mailbox>>> = RefCell::new(None);
}

/// Dispatches ready mailboxes onto a worker pool.
///
/// The pool size defaults to `max(hardware concurrency, 2)`. Most code uses
/// the process-wide instance from [`Scheduler::shared`]; tests construct
/// isolated schedulers so they can shut them down deterministically.
pub struct Scheduler {
    weak_self: Weak<Scheduler>,
    ready: Channel<Arc<Mailbox>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    num_workers: usize,
}

impl Scheduler {
    /// Create and start a scheduler. `num_workers == 0` selects the default
    /// pool size.
    pub fn new(num_workers: usize) -> Arc<Scheduler> {
        let num_workers = if num_workers == 0 {
            num_cpus::get().max(2)
        } else {
            num_workers
        };
        let scheduler = Arc::new_cyclic(|weak| Scheduler {
            weak_self: weak.clone(),
            ready: Channel::new(),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            num_workers,
        });
        scheduler.start();
        scheduler
    }

    /// The process-wide scheduler, started on first use.
    pub fn shared() -> Arc<Scheduler> {
        static SHARED: OnceLock<Arc<Scheduler>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Scheduler::new(0)))
    }

    /// Spawn the worker pool. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        debug!(workers = self.num_workers, "starting scheduler");
        let mut workers = self.workers.lock();
        for id in 1..=self.num_workers {
            let scheduler = Arc::clone(&this);
            let handle = thread::Builder::new()
                .name(format!("blip-worker-{id}"))
                .spawn(move || scheduler.worker_loop(id))
                .expect("failed to spawn scheduler worker");
            workers.push(handle);
        }
    }

    /// Stop accepting work, let the workers drain what is already queued,
    /// and join them. Must not be called from a worker thread.
    pub fn stop(&self) {
        self.ready.close();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
        debug!("scheduler stopped");
    }

    fn schedule(&self, mailbox: Arc<Mailbox>) {
        self.ready.push(mailbox);
    }

    fn worker_loop(self: Arc<Self>, id: usize) {
        trace!(worker = id, "worker started");
        while let Some(mailbox) = self.ready.pop() {
            mailbox.perform_next_message();
        }
        trace!(worker = id, "worker finished");
    }
}

/// A per-actor serial queue of closures.
///
/// The event counter includes the closure currently executing, which is what
/// makes the scheduling hand-off race-free: an enqueue only submits the
/// mailbox to the scheduler when the counter was zero, and the worker
/// resubmits it after running one closure if the counter shows remaining
/// work. A mailbox is therefore in the ready queue (or running) at most
/// once at any time.
pub struct Mailbox {
    weak_self: Weak<Mailbox>,
    name: String,
    scheduler: Arc<Scheduler>,
    queue: Mutex<VecDeque<(Instant, Task)>>,
    event_count: AtomicUsize,
    max_depth: AtomicUsize,
    max_latency_ns: AtomicU64,
    busy_ns: AtomicU64,
}

impl Mailbox {
    pub fn new(name: impl Into<String>, scheduler: &Arc<Scheduler>) -> Arc<Mailbox> {
        scheduler.start();
        Arc::new_cyclic(|weak| Mailbox {
            weak_self: weak.clone(),
            name: name.into(),
            scheduler: Arc::clone(scheduler),
            queue: Mutex::new(VecDeque::new()),
            event_count: AtomicUsize::new(0),
            max_depth: AtomicUsize::new(0),
            max_latency_ns: AtomicU64::new(0),
            busy_ns: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a closure to the mailbox; it will run after everything already
    /// queued, and never concurrently with another closure of this mailbox.
    pub fn enqueue(&self, f: impl FnOnce() + Send + 'static) {
        self.enqueue_task(Box::new(f));
    }

    fn enqueue_task(&self, task: Task) {
        {
            let mut queue = self.queue.lock();
            queue.push_back((Instant::now(), task));
            let depth = queue.len();
            self.max_depth.fetch_max(depth, Ordering::Relaxed);
        }
        if self.event_count.fetch_add(1, Ordering::AcqRel) == 0 {
            if let Some(this) = self.weak_self.upgrade() {
                self.scheduler.schedule(this);
            }
        }
    }

    /// Enqueue `f` once `delay` has elapsed. A zero delay is an ordinary
    /// [`enqueue`](Mailbox::enqueue).
    ///
    /// The armed timer holds only a weak reference to the mailbox; if the
    /// mailbox is dropped before the timer fires, the firing is a no-op.
    pub fn enqueue_after(&self, delay: Duration, f: impl FnOnce() + Send + 'static) {
        if delay.is_zero() {
            return self.enqueue(f);
        }
        let proxy: Weak<Mailbox> = self.weak_self.clone();
        Timer::after(delay, move || {
            if let Some(mailbox) = proxy.upgrade() {
                mailbox.enqueue(f);
            }
        });
    }

    pub(crate) fn perform_next_message(self: Arc<Self>) {
        let (queued_at, task) = match self.queue.lock().pop_front() {
            Some(entry) => entry,
            None => return,
        };
        self.max_latency_ns
            .fetch_max(queued_at.elapsed().as_nanos() as u64, Ordering::Relaxed);

        CURRENT_MAILBOX.with(|current| *current.borrow_mut() = Some(Arc::clone(&self)));
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(task));
        self.busy_ns
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        CURRENT_MAILBOX.with(|current| *current.borrow_mut() = None);
        if outcome.is_err() {
            warn!(mailbox = %self.name, "closure panicked on mailbox");
        }

        // Yield after one closure; resubmit if work remains.
        if self.event_count.fetch_sub(1, Ordering::AcqRel) > 1 {
            self.scheduler.schedule(Arc::clone(&self));
        }
    }

    /// The mailbox whose closure the calling thread is currently executing.
    pub fn current() -> Option<Arc<Mailbox>> {
        CURRENT_MAILBOX.with(|current| current.borrow().clone())
    }

    /// Whether the calling thread is executing a closure of this mailbox.
    pub fn is_current(&self) -> bool {
        Mailbox::current().map_or(false, |mailbox| std::ptr::eq(Arc::as_ptr(&mailbox), self))
    }

    /// Number of closures queued or executing.
    pub fn pending_events(&self) -> usize {
        self.event_count.load(Ordering::Acquire)
    }

    /// Log accumulated queue statistics.
    pub fn log_stats(&self) {
        info!(
            mailbox = %self.name,
            max_depth = self.max_depth.load(Ordering::Relaxed),
            max_latency_us = self.max_latency_ns.load(Ordering::Relaxed) / 1_000,
            busy_ms = self.busy_ns.load(Ordering::Relaxed) / 1_000_000,
            "mailbox stats"
        );
    }
}

/// A typed actor: private state plus the mailbox that serializes access to
/// it.
///
/// Closures passed to [`Actor::enqueue`] receive `&mut S`. The mailbox
/// serializes their execution, so the internal lock is never contended; it
/// exists to make the hand-off between worker threads sound.
pub struct Actor<S: Send + 'static> {
    mailbox: Arc<Mailbox>,
    state: Arc<Mutex<S>>,
}

impl<S: Send + 'static> Actor<S> {
    pub fn new(name: impl Into<String>, scheduler: &Arc<Scheduler>, state: S) -> Actor<S> {
        Actor {
            mailbox: Mailbox::new(name, scheduler),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Run `f` against the actor's state, after everything already queued.
    pub fn enqueue(&self, f: impl FnOnce(&mut S) + Send + 'static) {
        let state = Arc::clone(&self.state);
        self.mailbox.enqueue(move || {
            let mut state = state.lock();
            f(&mut state);
        });
    }

    /// Run `f` against the actor's state once `delay` has elapsed.
    pub fn enqueue_after(&self, delay: Duration, f: impl FnOnce(&mut S) + Send + 'static) {
        let state = Arc::clone(&self.state);
        self.mailbox.enqueue_after(delay, move || {
            let mut state = state.lock();
            f(&mut state);
        });
    }

    /// Read the actor's state from outside the actor. Diagnostics only; the
    /// returned data may be stale the moment the closure returns, and this
    /// must not be called from the actor's own closures.
    pub fn inspect<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }
}

impl<S: Send + 'static> Clone for Actor<S> {
    fn clone(&self) -> Self {
        Actor {
            mailbox: Arc::clone(&self.mailbox),
            state: Arc::clone(&self.state),
        }
    }
}
