//! TA loader backends

use super::flags::TaFlags;
use super::ops::{TaKind, TaOps};
use crate::error::{Error, Result};
use std::sync::Arc;
use uuid::Uuid;

/// A backend able to provide TA instances for some set of UUIDs.
///
/// Loading happens in two phases. `lookup` runs with the registry mutex
/// held and must not block; `instantiate` runs without it while other
/// openers of the same UUID wait for the context to finish initialising.
pub trait TaLoader: Send + Sync {
    fn kind(&self) -> TaKind;

    /// Flags of the TA behind `uuid`, or `Error::ItemNotFound` if this
    /// backend does not provide it.
    fn lookup(&self, uuid: &Uuid) -> Result<TaFlags>;

    /// Load a fresh instance.
    fn instantiate(&self, uuid: &Uuid) -> Result<Arc<dyn TaOps>>;
}

/// Factory producing a pseudo-TA instance
pub type PseudoTaFactory = Arc<dyn Fn() -> Arc<dyn TaOps> + Send + Sync>;

struct PseudoTaEntry {
    name: String,
    uuid: Uuid,
    flags: TaFlags,
    factory: PseudoTaFactory,
}

/// Pseudo TAs compiled into the kernel.
///
/// Pseudo TAs are always single-instance and multi-session.
#[derive(Default)]
pub struct PseudoTaTable {
    entries: Vec<PseudoTaEntry>,
}

impl PseudoTaTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pseudo TA
    pub fn register(
        &mut self,
        name: impl Into<String>,
        uuid: Uuid,
        flags: TaFlags,
        factory: PseudoTaFactory,
    ) -> Result<()> {
        let name = name.into();
        if self.entries.iter().any(|e| e.uuid == uuid) {
            return Err(Error::BadParameters(format!(
                "pseudo TA {} ({}) registered twice",
                name, uuid
            )));
        }

        self.entries.push(PseudoTaEntry {
            name,
            uuid,
            flags: flags | TaFlags::SINGLE_INSTANCE | TaFlags::MULTI_SESSION,
            factory,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, uuid: &Uuid) -> Option<&PseudoTaEntry> {
        self.entries.iter().find(|e| e.uuid == *uuid)
    }
}

impl TaLoader for PseudoTaTable {
    fn kind(&self) -> TaKind {
        TaKind::Pseudo
    }

    fn lookup(&self, uuid: &Uuid) -> Result<TaFlags> {
        self.find(uuid).map(|e| e.flags).ok_or(Error::ItemNotFound)
    }

    fn instantiate(&self, uuid: &Uuid) -> Result<Arc<dyn TaOps>> {
        let entry = self.find(uuid).ok_or(Error::ItemNotFound)?;
        tracing::debug!("Instantiating pseudo TA {} ({})", entry.name, uuid);
        Ok((entry.factory)())
    }
}
