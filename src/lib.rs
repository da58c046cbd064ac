//! tacore - Trusted Application session and context manager
//!
//! tacore is the part of a TEE kernel that turns "open a session to TA
//! `<uuid>`" into a running, isolated Trusted Application instance and
//! routes every later invoke, cancel and close to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      SessionManager                          │
//! │   open_session / invoke_command / cancel_command / close     │
//! │         │                    │                               │
//! │  ┌──────▼───────┐   ┌────────▼─────────┐   ┌──────────────┐  │
//! │  │  TaLoader    │   │    TeeState      │   │  TimeSource  │  │
//! │  │  SP < PTA <  │   │  - contexts      │   │  deadlines   │  │
//! │  │  user TA     │   │  - registries    │   └──────────────┘  │
//! │  └──────┬───────┘   │  - busy gate     │                     │
//! │         │           │  - SI lock       │                     │
//! │         │           └────────┬─────────┘                     │
//! └─────────┼────────────────────┼───────────────────────────────┘
//!           │                    │ enter_* under busy gate
//! ┌─────────▼────────────────────▼───────────────────────────────┐
//! │                 Context  ──▶  TaOps (TA backend)             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Features
//!
//! - Single-instance TAs share one context across sessions, serialized
//!   by a per-context busy gate and a recursive global lock
//! - Two-phase loading: concurrent openers of a TA that is still being
//!   instantiated wait for the first one to finish
//! - Panicked instances are quarantined and their state released exactly once
//! - Optional per-instance heap statistics (`ta-stats` feature)
//! - Polled mailbox transport to the system firmware
//!
//! ## Modules
//!
//! - [`session`]: Process-wide state, session registries and the manager
//! - [`tee`]: TA flags, identities, parameters, contexts and loaders
//! - [`transport`]: Firmware message channel
//! - [`time`]: TEE time and cancellation deadlines
//! - [`config`]: Configuration management
//! - [`logging`]: Tracing subscriber setup

pub mod config;
pub mod error;
pub mod logging;
pub mod session;
pub mod tee;
pub mod time;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::TaCoreConfig;
pub use error::{Error, ErrorOrigin, Result, TeeError, TeeResult};
pub use session::{SessionManager, SessionManagerBuilder, SessionRegistry, TeeState};
pub use tee::{Caller, Identity, Login, Params, TaFlags, TaOps};
