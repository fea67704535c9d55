//! One-shot timers backed by a shared service thread.
//!
//! All timers in the process share one thread that sleeps until the nearest
//! deadline, fires the due callbacks, and goes back to sleep. The contract
//! is deliberately small: a callback runs once, no earlier than its
//! deadline, or not at all if it was cancelled first.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Key ordering fires earlier deadlines first; the token breaks ties in arm
/// order, so callbacks armed for the same instant run FIFO.
type Key = (Instant, u64);

struct Service {
    state: Mutex<State>,
    wakeup: Condvar,
}

struct State {
    entries: BTreeMap<Key, Callback>,
    next_token: u64,
}

impl Service {
    fn shared() -> &'static Service {
        static SERVICE: OnceLock<Service> = OnceLock::new();
        static START: std::sync::Once = std::sync::Once::new();
        let service = SERVICE.get_or_init(|| Service {
            state: Mutex::new(State {
                entries: BTreeMap::new(),
                next_token: 0,
            }),
            wakeup: Condvar::new(),
        });
        START.call_once(|| {
            thread::Builder::new()
                .name("blip-timer".into())
                .spawn(|| SERVICE.get().expect("timer service initialized").run())
                .expect("failed to spawn timer service thread");
        });
        service
    }

    fn run(&self) {
        let mut state = self.state.lock();
        loop {
            let now = Instant::now();
            let mut due: Vec<Callback> = Vec::new();
            while state
                .entries
                .first_key_value()
                .map_or(false, |(&(deadline, _), _)| deadline <= now)
            {
                let (_, callback) = state.entries.pop_first().unwrap();
                due.push(callback);
            }
            if !due.is_empty() {
                MutexGuard::unlocked(&mut state, || {
                    for callback in due {
                        if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                            warn!("timer callback panicked");
                        }
                    }
                });
                continue;
            }
            match state.entries.first_key_value() {
                Some((&(deadline, _), _)) => {
                    let _ = self.wakeup.wait_until(&mut state, deadline);
                }
                None => self.wakeup.wait(&mut state),
            }
        }
    }
}

/// Handle to a one-shot scheduled callback.
///
/// Dropping the handle does not cancel the timer; a timer armed and then
/// forgotten fires on its own (the `autoDelete` pattern). Use [`Timer::cancel`]
/// to disarm it.
pub struct Timer {
    key: Key,
}

impl Timer {
    /// Arm a timer that runs `callback` once `delay` has elapsed.
    pub fn after(delay: Duration, callback: impl FnOnce() + Send + 'static) -> Timer {
        let service = Service::shared();
        let deadline = Instant::now() + delay;
        let key;
        let is_next;
        {
            let mut state = service.state.lock();
            state.next_token += 1;
            key = (deadline, state.next_token);
            state.entries.insert(key, Box::new(callback));
            is_next = state
                .entries
                .first_key_value()
                .map_or(false, |(&first, _)| first == key);
        }
        if is_next {
            service.wakeup.notify_one();
        }
        Timer { key }
    }

    /// Disarm the timer. Returns `true` when the callback had not fired yet
    /// and will now never run.
    pub fn cancel(&self) -> bool {
        Service::shared().state.lock().entries.remove(&self.key).is_some()
    }
}
