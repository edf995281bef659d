//! Single-resolution completion handles.
//!
//! A [`Completion`] is the caller's side of an asynchronous operation that
//! produces exactly one terminal value. Any number of [`Resolver`] clones may
//! race to settle it; the first one wins and every later attempt is a no-op.
//! An optional deadline turns an unresolved completion into a fallback value
//! once it elapses, which is how `initialize()` bounds its overall duration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Expiry<T> {
    at: Instant,
    fallback: T,
}

struct Slot<T> {
    resolved: AtomicBool,
    value: Mutex<Option<T>>,
    ready: Condvar,
    expiry: Option<Expiry<T>>,
}

impl<T: Clone> Slot<T> {
    fn lock_value(&self) -> MutexGuard<'_, Option<T>> {
        self.value.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settle(&self, value: T) -> bool {
        if self
            .resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let value = match &self.expiry {
            Some(expiry) if Instant::now() >= expiry.at => expiry.fallback.clone(),
            _ => value,
        };

        let mut slot = self.lock_value();
        *slot = Some(value);
        self.ready.notify_all();
        true
    }

    fn settle_expired(&self) {
        if let Some(expiry) = &self.expiry {
            if Instant::now() >= expiry.at {
                self.settle(expiry.fallback.clone());
            }
        }
    }
}

/// Producer side of a [`Completion`].
pub struct Resolver<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Clone> Resolver<T> {
    /// Settles the completion. Returns `false` when another resolver got
    /// there first.
    pub fn resolve(&self, value: T) -> bool {
        self.slot.settle(value)
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.resolved.load(Ordering::Acquire)
    }

    /// True once the deadline (if any) has elapsed.
    pub fn is_expired(&self) -> bool {
        self.slot
            .expiry
            .as_ref()
            .map(|e| Instant::now() >= e.at)
            .unwrap_or(false)
    }
}

/// Consumer side: wait for, or poll, the terminal value.
pub struct Completion<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Clone> Completion<T> {
    pub fn pending() -> (Resolver<T>, Completion<T>) {
        Self::build(None)
    }

    /// A completion that resolves to `fallback` if nothing settles it within
    /// `timeout`.
    pub fn with_deadline(timeout: Duration, fallback: T) -> (Resolver<T>, Completion<T>) {
        Self::build(Some(Expiry {
            at: Instant::now() + timeout,
            fallback,
        }))
    }

    /// An already-settled completion.
    pub fn ready(value: T) -> Completion<T> {
        let (resolver, completion) = Self::pending();
        resolver.resolve(value);
        completion
    }

    fn build(expiry: Option<Expiry<T>>) -> (Resolver<T>, Completion<T>) {
        let slot = Arc::new(Slot {
            resolved: AtomicBool::new(false),
            value: Mutex::new(None),
            ready: Condvar::new(),
            expiry,
        });
        (
            Resolver {
                slot: Arc::clone(&slot),
            },
            Completion { slot },
        )
    }

    pub fn is_done(&self) -> bool {
        self.slot.settle_expired();
        self.slot.lock_value().is_some()
    }

    pub fn try_get(&self) -> Option<T> {
        self.slot.settle_expired();
        self.slot.lock_value().clone()
    }

    /// Blocks until the completion is settled (or its deadline elapses).
    pub fn wait(&self) -> T {
        loop {
            if let Some(value) = self.wait_timeout(Duration::from_millis(250)) {
                return value;
            }
        }
    }

    /// Blocks for at most `timeout`. `None` means the value is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let mut limit = Instant::now() + timeout;
        if let Some(expiry) = &self.slot.expiry {
            limit = limit.min(expiry.at);
        }

        let mut slot = self.slot.lock_value();
        loop {
            if let Some(value) = slot.as_ref() {
                return Some(value.clone());
            }
            let now = Instant::now();
            if now >= limit {
                break;
            }
            let (guard, _) = self
                .slot
                .ready
                .wait_timeout(slot, limit - now)
                .unwrap_or_else(|e| e.into_inner());
            slot = guard;
        }
        drop(slot);

        self.slot.settle_expired();
        self.slot.lock_value().clone()
    }
}
