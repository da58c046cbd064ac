//! Process-wide state shared by every session manager
//!
//! One mutex totally orders every structural change: context registry
//! membership, context and session bookkeeping, and the single-instance
//! lock. All condition variables in the crate wait on this mutex.

use super::binding::Session;
use super::registry::{RegistryId, SessionSlot};
use crate::tee::{Context, ContextId, TaFlags, TaKind};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;
use uuid::Uuid;

/// Mutable per-context bookkeeping, guarded by the registry mutex.
#[derive(Debug, Default)]
pub(crate) struct ContextBook {
    /// Sessions bound to the context plus transient holds during open
    pub(crate) ref_count: usize,
    /// Thread currently executing inside the context, if any
    pub(crate) busy: Option<ThreadId>,
    pub(crate) is_initializing: bool,
    pub(crate) is_releasing: bool,
}

/// Holder of the single-instance lock and its recursion depth
#[derive(Debug, Default)]
pub(crate) struct SingleInstanceLock {
    pub(crate) holder: Option<ThreadId>,
    pub(crate) count: usize,
}

#[derive(Default)]
pub(crate) struct CoreState {
    /// Discoverable contexts in insertion order
    pub(crate) contexts: Vec<Arc<Context>>,
    /// Bookkeeping for every context not yet destroyed, registered or not
    pub(crate) books: HashMap<ContextId, ContextBook>,
    pub(crate) sessions: HashMap<RegistryId, Vec<SessionSlot>>,
    pub(crate) single_instance: SingleInstanceLock,
    next_context_id: u64,
    next_registry_id: u64,
}

impl CoreState {
    pub(crate) fn book(&self, id: ContextId) -> &ContextBook {
        match self.books.get(&id) {
            Some(book) => book,
            None => panic!("unknown TA context {:?}", id),
        }
    }

    pub(crate) fn book_mut(&mut self, id: ContextId) -> &mut ContextBook {
        match self.books.get_mut(&id) {
            Some(book) => book,
            None => panic!("unknown TA context {:?}", id),
        }
    }

    /// First registered context with `uuid`
    pub(crate) fn find_context(&self, uuid: &Uuid) -> Option<Arc<Context>> {
        self.contexts.iter().find(|c| c.uuid() == uuid).cloned()
    }

    /// Create a context in the initializing state with one reference held.
    pub(crate) fn register_context(
        &mut self,
        uuid: Uuid,
        flags: TaFlags,
        kind: TaKind,
    ) -> Arc<Context> {
        self.next_context_id += 1;
        let id = ContextId(self.next_context_id);
        let ctx = Arc::new(Context::new(id, uuid, flags, kind));

        self.books.insert(
            id,
            ContextBook {
                ref_count: 1,
                busy: None,
                is_initializing: true,
                is_releasing: false,
            },
        );
        self.contexts.push(ctx.clone());
        ctx
    }

    /// Drop a context from the registry; it stays alive for current holders.
    pub(crate) fn unregister_context(&mut self, id: ContextId) {
        self.contexts.retain(|c| c.id() != id);
    }

    pub(crate) fn new_registry_id(&mut self) -> RegistryId {
        let id = RegistryId(self.next_registry_id);
        self.next_registry_id += 1;
        self.sessions.insert(id, Vec::new());
        id
    }

    pub(crate) fn session_list(&self, registry: RegistryId) -> &[SessionSlot] {
        match self.sessions.get(&registry) {
            Some(list) => list,
            None => panic!("unknown session registry {:?}", registry),
        }
    }

    pub(crate) fn session_list_mut(&mut self, registry: RegistryId) -> &mut Vec<SessionSlot> {
        match self.sessions.get_mut(&registry) {
            Some(list) => list,
            None => panic!("unknown session registry {:?}", registry),
        }
    }

    /// Whether a session is bound to a fully initialised context
    pub(crate) fn is_session_ready(&self, session: &Session) -> bool {
        session
            .context()
            .and_then(|ctx| self.books.get(&ctx.id()))
            .map(|book| !book.is_initializing)
            .unwrap_or(false)
    }

    pub(crate) fn slot_mut(&mut self, session: &Session) -> &mut SessionSlot {
        let id = session.id();
        match self
            .session_list_mut(session.registry())
            .iter_mut()
            .find(|slot| slot.session.id() == id)
        {
            Some(slot) => slot,
            None => panic!("session {} is not registered", id),
        }
    }
}

/// The explicit process-wide state object.
///
/// Created once by the embedder and shared by reference with every
/// [`SessionManager`](super::SessionManager) that serves a client channel.
pub struct TeeState {
    pub(crate) inner: Mutex<CoreState>,
    /// Signalled when a context finishes initialising (or fails to)
    pub(crate) init_cv: Condvar,
    /// Signalled when the single-instance lock is released
    pub(crate) single_instance_cv: Condvar,
    /// Signalled when a context drops its last reference
    pub(crate) idle_cv: Condvar,
    concurrent_single_instance: bool,
}

impl TeeState {
    pub fn new(concurrent_single_instance: bool) -> Self {
        let mut core = CoreState::default();
        // Registry 0 holds sessions opened from the non-secure side
        core.new_registry_id();

        Self {
            inner: Mutex::new(core),
            init_cv: Condvar::new(),
            single_instance_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            concurrent_single_instance,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.inner.lock()
    }

    /// Whether single-instance TAs skip the single-instance lock
    pub fn concurrent_single_instance(&self) -> bool {
        self.concurrent_single_instance
    }

    /// Number of contexts currently discoverable in the registry
    pub fn context_count(&self) -> usize {
        self.lock().contexts.len()
    }

    /// Registered context for `uuid`, if any
    pub fn find_context(&self, uuid: &Uuid) -> Option<Arc<Context>> {
        self.lock().find_context(uuid)
    }

    /// Current reference count of a context, `None` once destroyed
    pub fn context_ref_count(&self, ctx: &Context) -> Option<usize> {
        self.lock().books.get(&ctx.id()).map(|b| b.ref_count)
    }

    /// Whether a context has been destroyed
    pub fn is_destroyed(&self, ctx: &Context) -> bool {
        !self.lock().books.contains_key(&ctx.id())
    }

    pub(crate) fn is_initializing(&self, ctx: &Context) -> bool {
        self.lock()
            .books
            .get(&ctx.id())
            .map(|b| b.is_initializing)
            .unwrap_or(false)
    }
}

impl Default for TeeState {
    fn default() -> Self {
        Self::new(false)
    }
}

impl std::fmt::Debug for TeeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeeState")
            .field("concurrent_single_instance", &self.concurrent_single_instance)
            .finish_non_exhaustive()
    }
}
