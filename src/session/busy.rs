//! Busy gate and single-instance lock
//!
//! A non-concurrent context admits one thread at a time: its book moves
//! `Idle -> Busy(thread) -> Idle`. Single-instance contexts additionally
//! serialise against each other through a recursive, process-wide
//! single-instance lock. A thread already holding that lock never waits
//! on a busy context: it gets `Error::Busy` back instead.

use super::state::{CoreState, TeeState};
use crate::error::{Error, Result};
use crate::tee::Context;
use parking_lot::MutexGuard;
use std::thread;

/// Entry into a context, released on drop.
#[must_use = "dropping the guard immediately releases the context"]
pub(crate) struct BusyGuard<'a> {
    state: &'a TeeState,
    ctx: &'a Context,
    engaged: bool,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if self.engaged {
            self.state.clear_busy(self.ctx);
        }
    }
}

impl TeeState {
    /// Take the single-instance lock, recursively for the holder.
    fn lock_single_instance(&self, st: &mut MutexGuard<'_, CoreState>) {
        if self.concurrent_single_instance() {
            return;
        }

        let me = thread::current().id();
        if st.single_instance.holder != Some(me) {
            while st.single_instance.holder.is_some() {
                self.single_instance_cv.wait(st);
            }
            st.single_instance.holder = Some(me);
            assert_eq!(st.single_instance.count, 0);
        }

        st.single_instance.count += 1;
    }

    fn unlock_single_instance(&self, st: &mut MutexGuard<'_, CoreState>) {
        if self.concurrent_single_instance() {
            return;
        }

        assert_eq!(
            st.single_instance.holder,
            Some(thread::current().id()),
            "single-instance lock released by a thread that does not hold it"
        );
        assert!(st.single_instance.count > 0);

        st.single_instance.count -= 1;
        if st.single_instance.count == 0 {
            st.single_instance.holder = None;
            self.single_instance_cv.notify_one();
        }
    }

    pub(crate) fn has_single_instance_lock(&self, st: &CoreState) -> bool {
        !self.concurrent_single_instance()
            && st.single_instance.holder == Some(thread::current().id())
    }

    /// Whether the calling thread holds the single-instance lock.
    pub fn holds_single_instance_lock(&self) -> bool {
        let st = self.lock();
        self.has_single_instance_lock(&st)
    }

    /// Enter `ctx`, blocking until it is free.
    ///
    /// Fails with `Error::Busy` instead of blocking when the calling
    /// thread holds the single-instance lock, since waiting could then
    /// only dead-lock. Concurrent contexts are entered immediately.
    pub(crate) fn try_acquire_busy<'a>(&'a self, ctx: &'a Context) -> Result<BusyGuard<'a>> {
        if ctx.flags().is_concurrent() {
            return Ok(BusyGuard {
                state: self,
                ctx,
                engaged: false,
            });
        }

        let mut st = self.lock();
        let single = ctx.flags().is_single_instance();

        if single {
            self.lock_single_instance(&mut st);
        }

        if self.has_single_instance_lock(&st) {
            if st.book(ctx.id()).busy.is_some() {
                if single {
                    self.unlock_single_instance(&mut st);
                }
                return Err(Error::Busy);
            }
        } else {
            while st.book(ctx.id()).busy.is_some() {
                ctx.busy_cv.wait(&mut st);
            }
        }

        st.book_mut(ctx.id()).busy = Some(thread::current().id());
        Ok(BusyGuard {
            state: self,
            ctx,
            engaged: true,
        })
    }

    /// Enter `ctx` on a path that cannot back out; dead-lock avoidance is fatal.
    pub(crate) fn acquire_busy<'a>(&'a self, ctx: &'a Context) -> BusyGuard<'a> {
        match self.try_acquire_busy(ctx) {
            Ok(guard) => guard,
            Err(_) => panic!("dead-lock entering TA {}", ctx.uuid()),
        }
    }

    fn clear_busy(&self, ctx: &Context) {
        let mut st = self.lock();

        let book = st.book_mut(ctx.id());
        assert!(book.busy.is_some(), "TA {} was not busy", ctx.uuid());
        book.busy = None;
        ctx.busy_cv.notify_one();

        if ctx.flags().is_single_instance() {
            self.unlock_single_instance(&mut st);
        }
    }
}
