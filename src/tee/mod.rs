//! Trusted Application model
//!
//! Types a TA backend and the session manager share: capability flags,
//! client identities, invocation parameters, the [`TaOps`] callback
//! interface and the loaded [`Context`].

mod context;
mod flags;
mod identity;
mod loader;
mod ops;
mod param;

pub use context::{Context, ContextId};
pub use flags::TaFlags;
pub use identity::{Caller, Identity, Login};
pub use loader::{PseudoTaFactory, PseudoTaTable, TaLoader};
pub use ops::{HeapStats, TaCall, TaKind, TaOps};
pub use param::{Direction, MemClass, MemRef, Param, Params, NUM_PARAMS};
