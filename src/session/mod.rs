//! Session management
//!
//! The process-wide [`TeeState`] owns the context registry, the session
//! registries and the single-instance lock. [`SessionManager`] drives
//! open, invoke, cancel and close on top of it.

mod binding;
mod busy;
mod manager;
mod registry;
mod state;
#[cfg(feature = "ta-stats")]
mod stats;

pub use binding::Session;
pub use manager::{SessionManager, SessionManagerBuilder};
pub use registry::{RegistryId, SessionRef, SessionRegistry};
pub use state::TeeState;
#[cfg(feature = "ta-stats")]
pub use stats::{TaStats, TA_STATS_RECORD_SIZE};
