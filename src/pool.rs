//! Freelist pool for [`LogEntry`] allocations.
//!
//! Ingress acquires an entry, fills it, and enqueues; the worker releases it
//! after the last sink callback. The pool only bounds retained capacity;
//! acquisition never blocks or fails.

use crate::entry::LogEntry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug)]
pub struct EntryPool {
    free: Mutex<Vec<LogEntry>>,
    max_retained: usize,
    reused: AtomicU64,
    allocated: AtomicU64,
}

impl EntryPool {
    pub fn new(max_retained: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_retained,
            reused: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
        }
    }

    /// Take a blank entry, reusing a released allocation when one is around.
    pub fn acquire(&self) -> LogEntry {
        let recycled = self
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        match recycled {
            Some(entry) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                entry
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                LogEntry::default()
            }
        }
    }

    /// Return an entry once every sink is done with it. Excess entries beyond
    /// the retained cap are simply dropped.
    pub fn release(&self, mut entry: LogEntry) {
        entry.reset();
        let mut free = self
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if free.len() < self.max_retained {
            free.push(entry);
        }
    }

    /// Entries currently parked in the freelist.
    pub fn retained(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// (fresh allocations, reuses) since construction.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.allocated.load(Ordering::Relaxed),
            self.reused.load(Ordering::Relaxed),
        )
    }
}
