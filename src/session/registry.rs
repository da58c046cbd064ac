//! Per-channel session registries
//!
//! Each client channel owns an ordered list of open sessions. A session
//! is borrowed with [`TeeState::get_session`], optionally exclusively,
//! and handed back when the returned [`SessionRef`] drops. Unlinking
//! waits until the unlinking thread is the only borrower left.

use super::binding::Session;
use super::state::{CoreState, TeeState};
use crate::error::{Error, Result};
use std::ops::Deref;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Stable handle of a session registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistryId(pub(crate) u64);

/// Handle to one client channel's session list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionRegistry {
    id: RegistryId,
}

impl SessionRegistry {
    pub fn id(&self) -> RegistryId {
        self.id
    }
}

/// Registry entry: the session plus its borrow bookkeeping.
pub(crate) struct SessionSlot {
    pub(crate) session: Arc<Session>,
    pub(crate) ref_count: usize,
    pub(crate) lock_thread: Option<ThreadId>,
    pub(crate) unlink: bool,
}

/// A borrowed session; returned to the registry on drop.
pub struct SessionRef<'a> {
    state: &'a TeeState,
    session: Option<Arc<Session>>,
}

impl<'a> SessionRef<'a> {
    pub(crate) fn new(state: &'a TeeState, session: Arc<Session>) -> Self {
        Self {
            state,
            session: Some(session),
        }
    }

    /// Take the session out without handing the borrow back.
    fn detach(mut self) -> Arc<Session> {
        match self.session.take() {
            Some(session) => session,
            None => unreachable!("session reference detached twice"),
        }
    }
}

impl Deref for SessionRef<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        match &self.session {
            Some(session) => session,
            None => unreachable!("session reference used after detach"),
        }
    }
}

impl Drop for SessionRef<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.state.put_session(&session);
        }
    }
}

fn find_nolock(list: &[SessionSlot], id: u32) -> Option<&SessionSlot> {
    list.iter().find(|slot| slot.session.id() == id)
}

/// Next free id: last assigned + 1, skipping zero, probing linearly.
fn new_session_id(list: &[SessionSlot]) -> Option<u32> {
    next_free_id(list.last().map(|slot| slot.session.id()), u32::MAX, |id| {
        find_nolock(list, id).is_some()
    })
}

/// First id in `1..=max` not in use, searching upwards from `last + 1`
/// and wrapping back to 1. `None` once every id is taken.
fn next_free_id(last: Option<u32>, max: u32, in_use: impl Fn(u32) -> bool) -> Option<u32> {
    let next = |id: u32| if id >= max { 1 } else { id + 1 };
    let start = last.map_or(1, next);

    let mut id = start;
    loop {
        if !in_use(id) {
            return Some(id);
        }
        id = next(id);
        if id == start {
            return None;
        }
    }
}

fn dec_ref_count(slot: &mut SessionSlot) {
    assert!(slot.ref_count > 0, "session {} ref count underflow", slot.session.id());
    slot.ref_count -= 1;
    if slot.ref_count == 1 {
        slot.session.refc_cv.notify_one();
    }
}

/// Registry created with the state for sessions opened by the normal world
const NSEC_REGISTRY: RegistryId = RegistryId(0);

impl TeeState {
    /// Sessions opened from the non-secure side
    pub fn nsec_sessions(&self) -> SessionRegistry {
        SessionRegistry { id: NSEC_REGISTRY }
    }

    /// Create an empty session registry for a client channel.
    pub fn create_registry(&self) -> SessionRegistry {
        SessionRegistry {
            id: self.lock().new_registry_id(),
        }
    }

    /// Number of sessions in a registry, including ones being torn down
    pub fn session_count(&self, registry: &SessionRegistry) -> usize {
        self.lock().session_list(registry.id).len()
    }

    /// Ids of the sessions in a registry, in insertion order
    pub fn session_ids(&self, registry: &SessionRegistry) -> Vec<u32> {
        self.lock()
            .session_list(registry.id)
            .iter()
            .map(|slot| slot.session.id())
            .collect()
    }

    /// Look a session up without borrowing it.
    pub fn find_session(&self, registry: &SessionRegistry, id: u32) -> Option<Arc<Session>> {
        let st = self.lock();
        find_nolock(st.session_list(registry.id), id).map(|slot| slot.session.clone())
    }

    /// Borrow a session.
    ///
    /// With `exclusive` the call blocks until no other thread holds the
    /// session's exclusive lock. Sessions being unlinked, or still being
    /// opened, are invisible; a waiter that observes the unlink gets `None`.
    pub fn get_session(
        &self,
        registry: &SessionRegistry,
        id: u32,
        exclusive: bool,
    ) -> Option<SessionRef<'_>> {
        let me = thread::current().id();
        let mut st = self.lock();

        let session = {
            let slot = find_nolock(st.session_list(registry.id), id)?;
            if slot.unlink {
                return None;
            }
            slot.session.clone()
        };
        if !st.is_session_ready(&session) {
            return None;
        }

        let slot = st.slot_mut(&session);
        slot.ref_count += 1;
        if !exclusive {
            drop(st);
            return Some(SessionRef::new(self, session));
        }
        assert_ne!(
            slot.lock_thread,
            Some(me),
            "session {} locked twice by the same thread",
            id
        );

        loop {
            let slot = st.slot_mut(&session);
            if slot.unlink {
                dec_ref_count(slot);
                return None;
            }
            if slot.lock_thread.is_none() {
                slot.lock_thread = Some(me);
                break;
            }
            session.lock_cv.wait(&mut st);
        }

        drop(st);
        Some(SessionRef::new(self, session))
    }

    /// Hand a borrowed session back.
    pub(crate) fn put_session(&self, session: &Session) {
        let mut st = self.lock();
        let slot = st.slot_mut(session);

        if slot.lock_thread == Some(thread::current().id()) {
            slot.lock_thread = None;
            session.lock_cv.notify_one();
        }
        dec_ref_count(slot);
    }

    /// Remove an exclusively borrowed session from its registry.
    ///
    /// Wakes exclusive waiters so they bail out, then blocks until the
    /// caller's own borrow is the only one left.
    pub(crate) fn unlink_session(&self, borrowed: SessionRef<'_>) {
        let session = borrowed.detach();
        let me = thread::current().id();
        let mut st = self.lock();

        {
            let slot = st.slot_mut(&session);
            assert!(slot.ref_count >= 1);
            assert_eq!(slot.lock_thread, Some(me), "unlink without the session lock");
            assert!(!slot.unlink, "session {} unlinked twice", session.id());
            slot.unlink = true;
        }
        session.lock_cv.notify_all();

        while st.slot_mut(&session).ref_count != 1 {
            session.refc_cv.wait(&mut st);
        }

        let id = session.id();
        st.session_list_mut(session.registry())
            .retain(|slot| slot.session.id() != id);
    }

    /// Allocate an id and append a fresh session, borrowed once by the caller.
    pub(crate) fn insert_session(
        &self,
        st: &mut CoreState,
        registry: &SessionRegistry,
    ) -> Result<Arc<Session>> {
        let list = st.session_list_mut(registry.id);
        let id = new_session_id(list).ok_or(Error::Overflow)?;
        let session = Arc::new(Session::new(id, registry.id));

        list.push(SessionSlot {
            session: session.clone(),
            ref_count: 1,
            lock_thread: None,
            unlink: false,
        });
        Ok(session)
    }

    /// Undo [`TeeState::insert_session`] for a session nobody else has seen bound.
    pub(crate) fn discard_session(&self, st: &mut CoreState, session: &Session) {
        let id = session.id();
        st.session_list_mut(session.registry())
            .retain(|slot| slot.session.id() != id);
    }
}
