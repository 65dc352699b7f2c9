//! TimerRegistry (§4.7): the central owner of all scheduled callbacks.
//!
//! Every timer is registered with a stable name and component tag, every
//! timer can be cancelled individually or en-masse, and no timers are
//! accepted after shutdown is initiated. The registry is the only
//! component allowed to hold process-wide mutable scheduling state; every
//! other component is handed an `Arc<TimerRegistry>`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Opaque handle returned by registration; cancel it to stop the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct Entry {
    name: String,
    component: &'static str,
    join: JoinHandle<()>,
}

/// Owns every scheduled one-shot and periodic callback in the process.
pub struct TimerRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Entry>>,
    shutdown: AtomicBool,
}

impl TimerRegistry {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    fn alloc(&self, name: &str, component: &'static str, join: JoinHandle<()>) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().expect("timer registry poisoned").insert(
            id,
            Entry { name: name.to_string(), component, join },
        );
        TimerHandle(id)
    }

    /// Register a one-shot callback that fires after `delay`.
    ///
    /// Returns an inert handle (the callback never runs) if shutdown has
    /// already been initiated; this is logged, not an error, per §4.7.
    pub fn register_once<F>(self: &std::sync::Arc<Self>, name: &str, component: &'static str, delay: Duration, fut: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.load(Ordering::SeqCst) {
            tracing::warn!(name, component, "timer registry is shut down; ignoring registration");
            return TimerHandle(0);
        }

        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
        });
        self.alloc(name, component, join)
    }

    /// Register a periodic callback invoked every `interval` via `make_fut`,
    /// which is called once per tick to build that tick's future (so each
    /// iteration can borrow fresh state).
    pub fn register_periodic<F, Fut>(
        self: &std::sync::Arc<Self>,
        name: &str,
        component: &'static str,
        interval: Duration,
        mut make_fut: F,
    ) -> TimerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.load(Ordering::SeqCst) {
            tracing::warn!(name, component, "timer registry is shut down; ignoring registration");
            return TimerHandle(0);
        }

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                make_fut().await;
            }
        });
        self.alloc(name, component, join)
    }

    /// Cancel one timer by handle. No-op if already cancelled or inert.
    pub fn cancel(&self, handle: TimerHandle) {
        if handle.0 == 0 {
            return;
        }
        if let Some(entry) = self.entries.lock().expect("timer registry poisoned").remove(&handle.0) {
            entry.join.abort();
        }
    }

    /// Cancel every timer whose name starts with `prefix`.
    pub fn cancel_by_prefix(&self, prefix: &str) {
        let mut entries = self.entries.lock().expect("timer registry poisoned");
        let ids: Vec<u64> = entries
            .iter()
            .filter(|(_, e)| e.name.starts_with(prefix))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(entry) = entries.remove(&id) {
                entry.join.abort();
            }
        }
    }

    /// Cancel every timer tagged with `component`.
    pub fn cancel_by_component(&self, component: &str) {
        let mut entries = self.entries.lock().expect("timer registry poisoned");
        let ids: Vec<u64> = entries
            .iter()
            .filter(|(_, e)| e.component == component)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(entry) = entries.remove(&id) {
                entry.join.abort();
            }
        }
    }

    /// Cancel every outstanding timer and refuse further registrations.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut entries = self.entries.lock().expect("timer registry poisoned");
        for (_, entry) in entries.drain() {
            entry.join.abort();
        }
    }

    pub fn active_count(&self) -> usize {
        self.entries.lock().expect("timer registry poisoned").len()
    }
}
