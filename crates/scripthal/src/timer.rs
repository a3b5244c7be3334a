//! One-shot timer scheduler
//!
//! Registrations are keyed by `(deadline, sequence)` so the earliest deadline
//! fires first and registrations sharing a deadline fire in the order they
//! were scheduled.

use crate::callback::Callback;
use crate::engine::ScriptEngine;
use crate::HalError;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Identifier of a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Pending fire-once registrations
pub struct TimerScheduler<V> {
    pending: BTreeMap<(Instant, u64), Callback<V>>,
    next_seq: u64,
    max_pending: usize,
}

impl<V: Clone> TimerScheduler<V> {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            next_seq: 0,
            max_pending,
        }
    }

    /// Register `callback` to fire once at least `delay_ms` from now.
    ///
    /// Fails without retaining the callback when the scheduler is full.
    pub fn schedule<E>(
        &mut self,
        engine: &mut E,
        delay_ms: u64,
        callback: &V,
    ) -> Result<TimerId, HalError>
    where
        E: ScriptEngine<Value = V>,
    {
        if self.pending.len() >= self.max_pending {
            tracing::warn!(
                "Timer rejected: {} registrations pending",
                self.pending.len()
            );
            return Err(HalError::TimerCapacity {
                limit: self.max_pending,
            });
        }

        let callback = Callback::retain(engine, callback)?;
        let deadline = Instant::now() + Duration::from_millis(delay_ms);
        let seq = self.next_seq;
        self.next_seq += 1;

        self.pending.insert((deadline, seq), callback);
        tracing::debug!("Timer {} scheduled in {}ms", seq, delay_ms);
        Ok(TimerId(seq))
    }

    /// Remove every registration due at `now`, in firing order
    pub fn take_due(&mut self, now: Instant) -> Vec<(TimerId, Callback<V>)> {
        let mut due = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, seq), callback) = entry.remove_entry();
            due.push((TimerId(seq), callback));
        }
        due
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Release every pending callback without invoking it
    pub fn release_all<E>(&mut self, engine: &mut E) -> usize
    where
        E: ScriptEngine<Value = V>,
    {
        let released = self.pending.len();
        for (_, callback) in std::mem::take(&mut self.pending) {
            callback.release(engine);
        }
        released
    }
}
