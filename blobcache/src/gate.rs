//! Per-object-name mutual exclusion around the local disk cache.
//!
//! Entries are created on first use and reference counted: a waiter counts
//! as a holder, and the entry is only removed when the last holder leaves.
//! Callers on different names never share a mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

struct Entry {
    lock: Arc<tokio::sync::Mutex<()>>,
    holders: usize,
}

#[derive(Default)]
pub struct NameGate {
    entries: Mutex<HashMap<String, Entry>>,
}

impl NameGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, name: &str) -> GateGuard<'_> {
        let lock = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = entries.entry(name.to_string()).or_insert_with(|| Entry {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                holders: 0,
            });
            entry.holders += 1;
            entry.lock.clone()
        };
        // Registered before awaiting so a cancelled wait still releases its count.
        let mut guard = GateGuard {
            gate: self,
            name: name.to_string(),
            held: None,
        };
        guard.held = Some(lock.lock_owned().await);
        tracing::debug!(name, "gate acquired");
        guard
    }

    /// Number of names currently held or waited on.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, name: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(name) {
            entry.holders -= 1;
            if entry.holders == 0 {
                entries.remove(name);
            }
        }
    }
}

pub struct GateGuard<'a> {
    gate: &'a NameGate,
    name: String,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        // Unlock before the count drops so a removed entry is never locked.
        self.held.take();
        self.gate.release(&self.name);
    }
}
