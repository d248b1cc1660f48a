// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A single shared cancellation signal observed by every blocking call in
//! the capture engine (§5). Non-negative: once asserted it cannot be
//! withdrawn.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{ArgusError, Result};

/// Granularity at which blocking waiters re-check the token. Bounds the
/// cancellation latency declared in §5 (guidance: <= 100ms).
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    signal: Condvar,
    lock: Mutex<()>,
}

/// Shared cancellation token. Cheap to clone (an `Arc` internally); every
/// task (T-ctl, T-prod, T-cons, T-sig) holds a clone.
#[derive(Debug, Clone)]
pub struct CancelToken(std::sync::Arc<Inner>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(std::sync::Arc::new(Inner {
            cancelled: AtomicBool::new(false),
            reason: Mutex::new(None),
            signal: Condvar::new(),
            lock: Mutex::new(()),
        }))
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.0.reason.lock().unwrap().clone()
    }

    /// Assert cancellation with a human-readable reason ("signal",
    /// "deadline", "upstream error"). Idempotent: later calls do not
    /// overwrite an already-recorded reason.
    pub fn cancel(&self, reason: &str) {
        let mut slot = self.0.reason.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
        drop(slot);
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.signal.notify_all();
    }

    /// Returns `Err(Cancelled)` immediately if already asserted.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ArgusError::Cancelled(
                self.reason().unwrap_or_else(|| "unknown".to_string()),
            ))
        } else {
            Ok(())
        }
    }

    /// Blocks until `deadline` or cancellation, whichever comes first.
    /// Implemented as a condvar wait loop (per §9's re-architecting note)
    /// rather than a flat `thread::sleep`, so cancellation wakes it early.
    pub fn sleep_until(&self, deadline: Instant) -> Result<()> {
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let remaining = deadline - now;
            let wait_for = remaining.min(POLL_INTERVAL);
            let guard = self.0.lock.lock().unwrap();
            let _ = self.0.signal.wait_timeout(guard, wait_for).unwrap();
        }
    }

    /// Blocks for up to `timeout`, returning early on cancellation.
    /// `Ok(true)` if the wait ran to completion, `Ok(false)` if cancelled.
    pub fn wait_for(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(true);
            }
            let remaining = (deadline - now).min(POLL_INTERVAL);
            let guard = self.0.lock.lock().unwrap();
            let _ = self.0.signal.wait_timeout(guard, remaining).unwrap();
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn not_cancelled_by_default() {
        let tok = CancelToken::new();
        assert!(!tok.is_cancelled());
        assert!(tok.check().is_ok());
    }

    #[test]
    fn cancel_is_observed_and_sticky() {
        let tok = CancelToken::new();
        tok.cancel("signal");
        assert!(tok.is_cancelled());
        assert_eq!(tok.reason().as_deref(), Some("signal"));
        // a second cancel with a different reason does not overwrite the first
        tok.cancel("deadline");
        assert_eq!(tok.reason().as_deref(), Some("signal"));
        match tok.check() {
            Err(ArgusError::Cancelled(r)) => assert_eq!(r, "signal"),
            other => panic!("expected Cancelled, got {:?}", other),
        }
    }

    #[test]
    fn sleep_until_wakes_early_on_cancel() {
        let tok = CancelToken::new();
        let tok2 = tok.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tok2.cancel("signal");
        });
        let start = Instant::now();
        let res = tok.sleep_until(Instant::now() + Duration::from_secs(10));
        assert!(res.is_err());
        assert!(start.elapsed() < Duration::from_secs(1));
        handle.join().unwrap();
    }

    #[test]
    fn wait_for_runs_to_completion_when_not_cancelled() {
        let tok = CancelToken::new();
        let start = Instant::now();
        let ran_out = tok.wait_for(Duration::from_millis(30)).unwrap();
        assert!(ran_out);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
