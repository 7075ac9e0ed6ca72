//! Offset watermark for blocking consumers.
//!
//! [`OffsetNotify`] holds the next offset to be published. Consumers wait until it passes
//! the offset they want; publishers raise it and wake every waiter. Waits can be cut short
//! by a [`CancelToken`].

use crate::error::{LogError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct State {
    next_offset: i64,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

/// Next-offset watermark with broadcast wakeups.
#[derive(Debug, Clone)]
pub struct OffsetNotify {
    shared: Arc<Shared>,
}

impl OffsetNotify {
    /// Creates a watermark at `next_offset`.
    pub fn new(next_offset: i64) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_offset,
                    closed: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Current watermark.
    pub fn next_offset(&self) -> i64 {
        self.shared.lock().next_offset
    }

    /// Blocks until the watermark is past `offset`.
    ///
    /// Fails with `Cancelled` once `cancel` fires and with `Closed` after [`close`](Self::close).
    pub fn wait(&self, offset: i64, cancel: &CancelToken) -> Result<()> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(LogError::Closed);
        }
        if state.next_offset > offset {
            return Ok(());
        }

        cancel.register(&self.shared);
        loop {
            if state.closed {
                return Err(LogError::Closed);
            }
            if state.next_offset > offset {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(LogError::Cancelled);
            }

            state = match cancel.remaining() {
                Some(timeout) => {
                    self.shared
                        .cond
                        .wait_timeout(state, timeout)
                        .unwrap_or_else(|err| err.into_inner())
                        .0
                }
                None => self
                    .shared
                    .cond
                    .wait(state)
                    .unwrap_or_else(|err| err.into_inner()),
            };
        }
    }

    /// Raises the watermark to `next_offset` (never lowers it) and wakes all waiters.
    pub fn set(&self, next_offset: i64) -> Result<()> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(LogError::Closed);
        }
        if next_offset > state.next_offset {
            state.next_offset = next_offset;
        }
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Wakes all waiters with `Closed` and rejects later waits and sets.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.cond.notify_all();
    }
}

#[derive(Debug)]
struct CancelInner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    waiters: Mutex<Vec<Weak<Shared>>>,
}

/// Cancellation signal for blocking waits, fired explicitly or by a deadline.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token that only fires on [`cancel`](Self::cancel).
    pub fn new() -> Self {
        Self::with_deadline(None)
    }

    /// A token that also fires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now().checked_add(timeout))
    }

    fn with_deadline(deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                deadline,
                waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Fires the token and wakes every wait using it.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);

        let waiters: Vec<Arc<Shared>> = self
            .waiters()
            .drain(..)
            .filter_map(|waiter| waiter.upgrade())
            .collect();
        for shared in waiters {
            // Taking the state lock orders the wakeup after the waiter's flag check.
            let _state = shared.lock();
            shared.cond.notify_all();
        }
    }

    /// Returns true once cancelled or past the deadline.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
            || self
                .inner
                .deadline
                .map_or(false, |deadline| Instant::now() >= deadline)
    }

    fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn waiters(&self) -> MutexGuard<'_, Vec<Weak<Shared>>> {
        self.inner
            .waiters
            .lock()
            .unwrap_or_else(|err| err.into_inner())
    }

    fn register(&self, shared: &Arc<Shared>) {
        let mut waiters = self.waiters();
        waiters.retain(|waiter| waiter.strong_count() > 0);
        let target = Arc::downgrade(shared);
        if !waiters.iter().any(|waiter| waiter.ptr_eq(&target)) {
            waiters.push(target);
        }
    }
}
