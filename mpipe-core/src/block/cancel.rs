use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Something blocked on a condition variable that a cancellation must wake
pub(crate) trait Waiter: Send + Sync {
    /// Wake every thread waiting on this object
    ///
    /// Implementations take their own lock before notifying so a waiter that
    /// checked the token under that lock cannot miss the wakeup.
    fn wake_all(&self);
}

struct CancelInner {
    cancelled: AtomicBool,
    waiters: Mutex<Vec<Weak<dyn Waiter>>>,
}

/// Cancellation signal for blocking pipeline operations
///
/// Clones share the same flag. Cancelling is permanent and wakes every
/// blocking call that has been handed this token (queue pops, pause gates).
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);

        // Snapshot so wake_all never runs under our own lock
        let waiters: Vec<Weak<dyn Waiter>> = self
            .inner
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for waiter in waiters.iter().filter_map(Weak::upgrade) {
            waiter.wake_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Make `waiter` receive a wakeup on cancel (idempotent per waiter)
    pub(crate) fn register(&self, waiter: Weak<dyn Waiter>) {
        let mut waiters = self
            .inner
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        waiters.retain(|w| w.strong_count() > 0);
        if !waiters.iter().any(|w| Weak::ptr_eq(w, &waiter)) {
            waiters.push(waiter);
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingWaiter(AtomicUsize);

    impl Waiter for CountingWaiter {
        fn wake_all(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_registered_waiter_woken_once() {
        let token = CancelToken::new();
        let waiter = Arc::new(CountingWaiter(AtomicUsize::new(0)));
        let as_dyn: Arc<dyn Waiter> = waiter.clone();

        token.register(Arc::downgrade(&as_dyn));
        token.register(Arc::downgrade(&as_dyn));
        token.cancel();

        assert_eq!(waiter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dead_waiters_are_skipped() {
        let token = CancelToken::new();
        {
            let waiter: Arc<dyn Waiter> = Arc::new(CountingWaiter(AtomicUsize::new(0)));
            token.register(Arc::downgrade(&waiter));
        }
        // Waiter already dropped; cancel must not panic
        token.cancel();
        assert!(token.is_cancelled());
    }
}
