//! TA capability flags

use bitflags::bitflags;

bitflags! {
    /// Capability flags declared in a TA header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TaFlags: u32 {
        /// Only one instance may exist system-wide
        const SINGLE_INSTANCE = 1 << 2;
        /// One instance may serve several sessions
        const MULTI_SESSION = 1 << 3;
        /// Single-instance TA stays loaded after its last session closes
        const INSTANCE_KEEP_ALIVE = 1 << 4;
        /// May receive secure-data-path memory references
        const SECURE_DATA_PATH = 1 << 5;
        /// Internally concurrent: bypasses the busy gate
        const CONCURRENT = 1 << 8;
        /// Keep-alive TA stays registered in panicked state after a crash
        const INSTANCE_KEEP_CRASHED = 1 << 13;

        const _ = !0;
    }
}

impl TaFlags {
    pub fn is_single_instance(self) -> bool {
        self.contains(TaFlags::SINGLE_INSTANCE)
    }

    pub fn is_concurrent(self) -> bool {
        self.contains(TaFlags::CONCURRENT)
    }

    /// Keep-alive only applies to single-instance TAs.
    pub fn keep_alive(self) -> bool {
        self.is_single_instance() && self.contains(TaFlags::INSTANCE_KEEP_ALIVE)
    }

    /// Keep-crashed only applies on top of keep-alive.
    pub fn keep_crashed(self) -> bool {
        self.keep_alive() && self.contains(TaFlags::INSTANCE_KEEP_CRASHED)
    }

    /// Whether an idle context (no sessions left) must be destroyed.
    pub fn destroy_when_idle(self, panicked: bool) -> bool {
        (panicked && !self.keep_crashed()) || !self.keep_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_requires_single_instance() {
        let flags = TaFlags::INSTANCE_KEEP_ALIVE | TaFlags::INSTANCE_KEEP_CRASHED;
        assert!(!flags.keep_alive());
        assert!(!flags.keep_crashed());
        assert!(flags.destroy_when_idle(false));
    }

    #[test]
    fn test_destroy_when_idle() {
        let plain = TaFlags::SINGLE_INSTANCE | TaFlags::MULTI_SESSION;
        assert!(plain.destroy_when_idle(false));

        let alive = plain | TaFlags::INSTANCE_KEEP_ALIVE;
        assert!(!alive.destroy_when_idle(false));
        assert!(alive.destroy_when_idle(true));

        let crashed = alive | TaFlags::INSTANCE_KEEP_CRASHED;
        assert!(!crashed.destroy_when_idle(true));
    }
}
