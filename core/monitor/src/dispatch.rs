//! Per-key work queues.
//!
//! Jobs submitted under the same key run one at a time in submission order on
//! a consumer thread that exists only while the key has pending work. Jobs
//! under different keys run concurrently.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone, Default)]
pub struct KeyedDispatcher {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<QueueState>,
    idle: Condvar,
    panics: AtomicU64,
}

#[derive(Default)]
struct QueueState {
    // A key is present exactly while a consumer owns it.
    queues: HashMap<String, VecDeque<Job>>,
    in_flight: usize,
}

impl KeyedDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, key: &str, job: impl FnOnce() + Send + 'static) {
        let start_consumer = {
            let mut state = self.inner.lock();
            state.in_flight += 1;
            match state.queues.get_mut(key) {
                Some(queue) => {
                    queue.push_back(Box::new(job));
                    false
                }
                None => {
                    state
                        .queues
                        .insert(key.to_string(), VecDeque::from([Box::new(job) as Job]));
                    true
                }
            }
        };

        if start_consumer {
            let inner = Arc::clone(&self.inner);
            let owned_key = key.to_string();
            let spawned = thread::Builder::new()
                .name(format!("dispatch:{}", key))
                .spawn(move || drain(&inner, &owned_key));
            if let Err(err) = spawned {
                error!(key, error = %err, "Failed to spawn queue consumer; draining inline");
                drain(&self.inner, key);
            }
        }
    }

    /// Blocks until no job is queued or running, or `timeout` elapses.
    /// Returns whether the dispatcher is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        while state.in_flight > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.inner.idle.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Number of jobs that panicked since creation.
    pub fn panic_count(&self) -> u64 {
        self.inner.panics.load(Ordering::Relaxed)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn finish_job(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.idle.notify_all();
        }
    }
}

fn drain(inner: &Inner, key: &str) {
    loop {
        let job = {
            let mut state = inner.lock();
            match state.queues.get_mut(key).and_then(VecDeque::pop_front) {
                Some(job) => job,
                None => {
                    state.queues.remove(key);
                    debug!(key, "Queue drained");
                    return;
                }
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            let total = inner.panics.fetch_add(1, Ordering::Relaxed) + 1;
            error!(key, total_panics = total, "Queued handler panicked; continuing");
        }
        inner.finish_job();
    }
}
