//! Loaded TA instances

use super::flags::TaFlags;
use super::ops::{TaKind, TaOps};
use parking_lot::Condvar;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// Stable handle of a context; never reused within one [`TeeState`](crate::session::TeeState).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub(crate) u64);

/// One loaded TA instance, shared by every session bound to it.
///
/// Reference count, busy and lifecycle flags are kept by the owning
/// state object under its registry mutex. Only `panicked` lives here:
/// it is monotonic, so it may be read without the mutex.
pub struct Context {
    id: ContextId,
    uuid: Uuid,
    flags: TaFlags,
    kind: TaKind,
    ops: OnceLock<Arc<dyn TaOps>>,
    panicked: AtomicBool,
    pub(crate) busy_cv: Condvar,
}

impl Context {
    pub(crate) fn new(id: ContextId, uuid: Uuid, flags: TaFlags, kind: TaKind) -> Self {
        Self {
            id,
            uuid,
            flags,
            kind,
            ops: OnceLock::new(),
            panicked: AtomicBool::new(false),
            busy_cv: Condvar::new(),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    pub fn flags(&self) -> TaFlags {
        self.flags
    }

    pub fn kind(&self) -> TaKind {
        self.kind
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    pub(crate) fn mark_panicked(&self) {
        if !self.panicked.swap(true, Ordering::AcqRel) {
            tracing::debug!("TA {} ({}) panicked", self.uuid, self.kind.as_str());
        }
    }

    /// Attach the operation set once loading completes.
    pub(crate) fn install_ops(&self, ops: Arc<dyn TaOps>) {
        if self.ops.set(ops).is_err() {
            panic!("TA context {} initialised twice", self.uuid);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_loaded(&self) -> bool {
        self.ops.get().is_some()
    }

    /// Operation set of a fully initialised context.
    pub(crate) fn ops(&self) -> &dyn TaOps {
        match self.ops.get() {
            Some(ops) => ops.as_ref(),
            None => panic!("TA context {} entered before initialisation", self.uuid),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("uuid", &self.uuid)
            .field("flags", &self.flags)
            .field("kind", &self.kind)
            .field("panicked", &self.is_panicked())
            .finish_non_exhaustive()
    }
}
