//! Client identities

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Login method a client used to authenticate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum Login {
    #[default]
    Public = 0x0000_0000,
    User = 0x0000_0001,
    Group = 0x0000_0002,
    Application = 0x0000_0004,
    ApplicationUser = 0x0000_0005,
    ApplicationGroup = 0x0000_0006,
    /// Session opened by another TA
    TrustedApp = 0xF000_0000,
}

/// Owning client of a session: login method plus identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Identity {
    pub login: Login,
    pub uuid: Uuid,
}

impl Identity {
    pub fn new(login: Login, uuid: Uuid) -> Self {
        Self { login, uuid }
    }

    /// Identity of a TA acting as client
    pub fn trusted_app(uuid: Uuid) -> Self {
        Self::new(Login::TrustedApp, uuid)
    }
}

/// Who is issuing a request against an existing session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    /// The TEE kernel itself; always trusted
    Kernel,
    /// The non-secure world, on behalf of whichever client opened the session
    NonSecure,
    /// A specific client, e.g. a TA calling another TA
    Client(Identity),
}

impl From<Identity> for Caller {
    fn from(identity: Identity) -> Self {
        Caller::Client(identity)
    }
}
