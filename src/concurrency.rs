//! Concurrency primitives
//!
//! The source state machine is thread-plus-condvar; host callbacks can land
//! on any thread and must not block. We keep that shape but map each
//! suspension point onto `tokio` tasks: `Mutex`/`RwLock` replace the mutex
//! hierarchy, and [`Condition`] replaces a condvar, broadcasting through
//! `tokio::sync::Notify`. Waiters register (`enable()`) before checking
//! their predicate so a signal arriving between the check and the
//! `notified().await` is never lost.
//!
//! # Mutex hierarchy
//!
//! Always acquire in this order, never the reverse:
//! `send` ▶ `scan` ▶ `peer_registry` ▶ `live_session` ▶ `cccd_set` ▶
//! `discovered_peers` ▶ `send_state`. Leaf locks (write-char, write-desc,
//! bond, scan-retry) are never held while acquiring a hierarchy lock.
//! [`PeerRegistry`](crate::registry::PeerRegistry) holds `live_session`,
//! `cccd_set`, and `discovered_peers` as separate fields so this ordering is
//! enforceable at the type level: each is its own lock, acquired in the
//! documented order by callers that need more than one.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout as tokio_timeout;

/// A broadcastable condition variable, built on `tokio::sync::Notify`.
#[derive(Debug, Default)]
pub struct Condition {
    notify: Notify,
}

impl Condition {
    pub fn new() -> Self {
        Self {
            notify: Notify::new(),
        }
    }

    /// Wake every current waiter.
    pub fn broadcast(&self) {
        self.notify.notify_waiters();
    }

    /// Wait until `predicate` returns true or `bound` elapses. Returns
    /// `true` if the predicate was satisfied, `false` on timeout.
    ///
    /// `predicate` is re-evaluated after every wakeup (spurious or real)
    /// until the deadline passes, matching condvar-with-predicate usage.
    pub async fn wait_for<F>(&self, bound: Duration, mut predicate: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + bound;
        loop {
            // Register as a waiter *before* checking the predicate: `enable()`
            // makes this call count for any `broadcast()` that happens after
            // it, even if we haven't started `.await`ing yet, closing the
            // lost-wakeup window between the check and the wait.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if predicate() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return predicate();
            }
            match tokio_timeout(remaining, notified).await {
                Ok(()) => continue,
                Err(_) => return predicate(),
            }
        }
    }

    /// Like [`Self::wait_for`], but also races the wait against
    /// `shutdown`'s own unbounded condition. Returns `false` immediately
    /// (without waiting out `bound`) once `shutdown.trigger()` has fired,
    /// instead of only noticing shutdown on the next predicate check —
    /// every suspension point in the connect/bond/discover/write pipeline
    /// that runs inline inside a send (i.e. before that send has reached
    /// its own `SendCompletion::wait`) needs this to satisfy `terminate`'s
    /// O(1)-unblocking guarantee, since nothing else is racing it against
    /// shutdown.
    pub async fn wait_for_cancellable<F>(
        &self,
        bound: Duration,
        shutdown: &ShutdownSignal,
        predicate: F,
    ) -> bool
    where
        F: FnMut() -> bool,
    {
        if shutdown.is_finished() {
            return false;
        }
        tokio::select! {
            result = self.wait_for(bound, predicate) => result,
            _ = shutdown.wait_forever() => false,
        }
    }

    /// Wait for a single `broadcast()` or until `bound` elapses, whichever
    /// comes first — with no predicate. Returns `true` if signaled, `false`
    /// on timeout.
    ///
    /// Use this (instead of `wait_for` with an always-false predicate) when
    /// the real completion check lives behind a lock this call can't poll
    /// synchronously (e.g. an async-locked registry): check that real state
    /// after this returns. `wait_for(bound, || false)` would silently
    /// defeat early wakeup — its loop re-arms and keeps waiting out the
    /// remaining bound even after a broadcast, since the predicate can never
    /// be satisfied.
    pub async fn wait_signal(&self, bound: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        tokio_timeout(bound, notified).await.is_ok()
    }

    /// Unbounded variant of [`Self::wait_for`], used for the send-completion
    /// wait: it has no timeout of its own because every step that can block
    /// on the way to completion already has its own bound, so the total
    /// latency is capped by those, not by this wait.
    pub async fn wait_until<F>(&self, mut predicate: F)
    where
        F: FnMut() -> bool,
    {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if predicate() {
                return;
            }
            notified.await;
        }
    }
}

/// Global shutdown signal. `terminate()` flips this and broadcasts every
/// condition; waiters observing it return `Cancelled` instead of hanging.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    finished: std::sync::atomic::AtomicBool,
    condition: Condition,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            finished: std::sync::atomic::AtomicBool::new(false),
            condition: Condition::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.condition.broadcast();
    }

    pub async fn wait_or_finished(&self, bound: Duration) -> bool {
        let finished = &self.finished;
        self.condition
            .wait_for(bound, || finished.load(Ordering::SeqCst))
            .await
    }

    /// Block until `trigger()` is called, with no bound. Used alongside
    /// [`Condition::wait_until`] to make the send-completion wait
    /// cancellable.
    pub async fn wait_forever(&self) {
        let finished = &self.finished;
        self.condition
            .wait_until(|| finished.load(Ordering::SeqCst))
            .await;
    }
}
