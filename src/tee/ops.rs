//! The capability interface every TA kind implements

use super::context::Context;
use super::identity::Identity;
use super::param::Params;
use crate::error::{Error, ErrorOrigin, Result};
use crate::session::Session;
use crate::time::{TeeTime, TimeSource};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Backend that provides a TA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaKind {
    /// Secure partition (e.g. a standalone MM service)
    SecurePartition,
    /// Pseudo TA compiled into the kernel
    Pseudo,
    /// User-mode TA loaded from storage
    User,
}

impl TaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaKind::SecurePartition => "secure-partition",
            TaKind::Pseudo => "pseudo",
            TaKind::User => "user",
        }
    }
}

/// Heap statistics reported by a TA
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapStats {
    pub allocated: u32,
    pub max_allocated: u32,
    pub size: u32,
    pub num_alloc_fail: u32,
    pub biggest_alloc_fail: u32,
    pub biggest_alloc_fail_used: u32,
}

/// Lifecycle callbacks of a loaded TA instance.
///
/// Every entry may crash the TA; an implementation reports that through
/// [`TaCall::mark_panicked`] and the manager quarantines the context.
pub trait TaOps: Send + Sync {
    fn enter_open_session(&self, call: &mut TaCall<'_>) -> Result<()>;

    fn enter_close_session(&self, call: &mut TaCall<'_>);

    fn enter_invoke_cmd(&self, call: &mut TaCall<'_>, cmd: u32) -> Result<()>;

    fn dump_mem_stats(&self, _call: &mut TaCall<'_>) -> Result<HeapStats> {
        Err(Error::NotSupported)
    }

    /// Drop per-instance state after a panic. Called at most once.
    fn release_state(&self) {}

    /// Tear the instance down. Called exactly once.
    fn destroy(&self) {}
}

/// View handed to a TA callback for the duration of one entry.
pub struct TaCall<'a> {
    session: &'a Session,
    context: &'a Context,
    params: &'a mut Params,
    clock: &'a dyn TimeSource,
}

impl<'a> TaCall<'a> {
    pub(crate) fn new(
        session: &'a Session,
        context: &'a Context,
        params: &'a mut Params,
        clock: &'a dyn TimeSource,
    ) -> Self {
        Self {
            session,
            context,
            params,
            clock,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session.id()
    }

    pub fn client(&self) -> Identity {
        self.session.client()
    }

    pub fn uuid(&self) -> &Uuid {
        self.context.uuid()
    }

    pub fn params(&mut self) -> &mut Params {
        self.params
    }

    /// Cooperative cancellation check.
    pub fn is_cancelled(&self) -> bool {
        self.session.is_cancelled(self.clock, None)
    }

    /// Same as [`TaCall::is_cancelled`] with a caller-sampled time.
    pub fn is_cancelled_at(&self, now: TeeTime) -> bool {
        self.session.is_cancelled(self.clock, Some(now))
    }

    /// Set the cancellation mask, returning the previous value.
    pub fn mask_cancellation(&self, mask: bool) -> bool {
        self.session.set_cancel_mask(mask)
    }

    /// Record where an error returned by this entry originated.
    pub fn set_error_origin(&self, origin: ErrorOrigin) {
        self.session.set_err_origin(origin);
    }

    /// The TA crashed; the context is never re-entered.
    pub fn mark_panicked(&self) {
        self.context.mark_panicked();
    }
}
