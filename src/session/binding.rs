//! A client's binding to a TA context

use super::registry::RegistryId;
use crate::error::ErrorOrigin;
use crate::tee::{Context, Identity};
use crate::time::{TeeTime, TimeSource};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// An open session.
///
/// Borrow counting and the exclusive lock are kept in the owning
/// registry under the registry mutex; this struct holds what the TA
/// callbacks and the cancellation path read.
pub struct Session {
    id: u32,
    registry: RegistryId,
    context: OnceLock<Arc<Context>>,
    client: Mutex<Identity>,
    cancel: AtomicBool,
    cancel_mask: AtomicBool,
    cancel_time: Mutex<TeeTime>,
    err_origin: Mutex<ErrorOrigin>,
    pub(crate) lock_cv: Condvar,
    pub(crate) refc_cv: Condvar,
}

impl Session {
    pub(crate) fn new(id: u32, registry: RegistryId) -> Self {
        Self {
            id,
            registry,
            context: OnceLock::new(),
            client: Mutex::new(Identity::default()),
            cancel: AtomicBool::new(false),
            cancel_mask: AtomicBool::new(true),
            cancel_time: Mutex::new(TeeTime::INFINITE),
            err_origin: Mutex::new(ErrorOrigin::TrustedApp),
            lock_cv: Condvar::new(),
            refc_cv: Condvar::new(),
        }
    }

    /// Session id, unique within its registry
    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn registry(&self) -> RegistryId {
        self.registry
    }

    /// Context this session is bound to, once resolution succeeded
    pub fn context(&self) -> Option<&Arc<Context>> {
        self.context.get()
    }

    pub(crate) fn bind_context(&self, ctx: Arc<Context>) {
        if self.context.set(ctx).is_err() {
            panic!("session {} bound to two contexts", self.id);
        }
    }

    /// Identity of the client that opened the session
    pub fn client(&self) -> Identity {
        *self.client.lock()
    }

    pub(crate) fn set_client(&self, client: Identity) {
        *self.client.lock() = client;
    }

    /// Flag the session as cancelled. Never blocks.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Set the cancellation mask, returning the previous value.
    pub fn set_cancel_mask(&self, mask: bool) -> bool {
        self.cancel_mask.swap(mask, Ordering::AcqRel)
    }

    pub fn cancel_deadline(&self) -> TeeTime {
        *self.cancel_time.lock()
    }

    pub(crate) fn set_cancel_deadline(&self, deadline: TeeTime) {
        *self.cancel_time.lock() = deadline;
    }

    pub(crate) fn err_origin(&self) -> ErrorOrigin {
        *self.err_origin.lock()
    }

    pub(crate) fn set_err_origin(&self, origin: ErrorOrigin) {
        *self.err_origin.lock() = origin;
    }

    /// Whether the TA should abandon the current operation.
    ///
    /// Always false while cancellation is masked. Otherwise true once
    /// cancel was requested, or once `now` (sampled from `clock` when
    /// `None`) reaches the deadline. A failing clock reads as "not yet".
    pub fn is_cancelled(&self, clock: &dyn TimeSource, now: Option<TeeTime>) -> bool {
        if self.cancel_mask.load(Ordering::Acquire) {
            return false;
        }

        if self.cancel.load(Ordering::Acquire) {
            return true;
        }

        let deadline = self.cancel_deadline();
        if deadline.is_infinite() {
            return false;
        }

        let now = match now {
            Some(now) => now,
            None => match clock.now() {
                Ok(now) => now,
                Err(_) => return false,
            },
        };

        deadline.has_passed(now)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("registry", &self.registry)
            .field("context", &self.context.get().map(|c| *c.uuid()))
            .field("client", &self.client())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn session() -> Session {
        Session::new(1, RegistryId(0))
    }

    #[test]
    fn test_masked_by_default() {
        let clock = ManualClock::new(TeeTime::new(10, 0));
        let s = session();
        s.request_cancel();
        assert!(!s.is_cancelled(&clock, None));

        assert!(s.set_cancel_mask(false));
        assert!(s.is_cancelled(&clock, None));
    }

    #[test]
    fn test_cancel_flag_beats_deadline() {
        let clock = ManualClock::new(TeeTime::new(10, 0));
        let s = session();
        s.set_cancel_mask(false);
        s.set_cancel_deadline(TeeTime::new(100, 0));

        assert!(!s.is_cancelled(&clock, None));
        s.request_cancel();
        assert!(s.is_cancelled(&clock, None));
    }

    #[test]
    fn test_deadline_expiry() {
        let clock = ManualClock::new(TeeTime::new(10, 0));
        let s = session();
        s.set_cancel_mask(false);
        s.set_cancel_deadline(TeeTime::new(10, 500));

        assert!(!s.is_cancelled(&clock, None));
        clock.advance(499);
        assert!(!s.is_cancelled(&clock, None));
        clock.advance(1);
        assert!(s.is_cancelled(&clock, None));

        // Caller-supplied time takes precedence over the clock
        assert!(!s.is_cancelled(&clock, Some(TeeTime::new(9, 0))));
    }

    #[test]
    fn test_infinite_deadline_and_clock_failure() {
        let clock = ManualClock::new(TeeTime::new(u32::MAX - 1, 0));
        let s = session();
        s.set_cancel_mask(false);
        assert!(!s.is_cancelled(&clock, None));

        s.set_cancel_deadline(TeeTime::new(1, 0));
        clock.fail();
        assert!(!s.is_cancelled(&clock, None));
    }
}
