//! Admission control for `get_objects_new`: block while
//! `used + request_size > cap` or `dealing >= parallelism cap`, then
//! check-then-increment atomically under one lock acquisition to avoid
//! overshoot.
//!
//! Rather than polling the accounting state on a fixed interval, a
//! `tokio::sync::Notify` woken on every accounting change lets a blocked
//! admission wake as soon as room frees up.

use parking_lot::Mutex;
use tokio::sync::Notify;

struct Accounting {
    used_memory: u64,
    cap: u64,
    dealing: u32,
}

/// Per-node memory/parallelism accounting guarding `get_objects_new`
/// admission.
pub struct MemoryAccount {
    state: Mutex<Accounting>,
    notify: Notify,
    parallelism_cap: u32,
}

impl MemoryAccount {
    pub fn new(cap: u64, parallelism_cap: u32) -> Self {
        Self {
            state: Mutex::new(Accounting {
                used_memory: 0,
                cap,
                dealing: 0,
            }),
            notify: Notify::new(),
            parallelism_cap,
        }
    }

    pub fn used(&self) -> u64 {
        self.state.lock().used_memory
    }

    /// The live configured cap, reflecting any `update_cap` call — the
    /// value `descriptor_snapshot` must read instead of the immutable
    /// config default so `compute_total`/`compute_free` stay in lockstep
    /// with what admission is actually enforcing.
    pub fn cap(&self) -> u64 {
        self.state.lock().cap
    }

    pub fn dealing(&self) -> u32 {
        self.state.lock().dealing
    }

    /// Blocks until `used_memory + request_size <= cap` and
    /// `dealing < parallelism_cap`, then admits atomically. Admission
    /// never rejects, it only waits.
    pub async fn admit(&self, request_size: u64) {
        loop {
            // Register for the next notification before checking the
            // condition: `Notify::notified()` enrolls as a waiter at
            // creation time, so a release that lands between the check
            // below and the `.await` is never missed.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.used_memory + request_size <= state.cap
                    && state.dealing < self.parallelism_cap
                {
                    state.used_memory += request_size;
                    state.dealing += 1;
                    return;
                }
            }
            notified.await;
        }
    }

    /// Releases the accounting taken by a matching `admit` call, whether
    /// inference succeeded or errored — both paths release the same
    /// accounting before the socket is handled further.
    pub fn release(&self, request_size: u64) {
        {
            let mut state = self.state.lock();
            state.used_memory = state.used_memory.saturating_sub(request_size);
            state.dealing = state.dealing.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }

    pub fn update_cap(&self, cap: u64) {
        let mut state = self.state.lock();
        state.cap = cap;
        drop(state);
        self.notify.notify_waiters();
    }
}
