//! Invocation parameters passed to a TA

use bytes::BytesMut;

/// Number of parameter slots in every request
pub const NUM_PARAMS: usize = 4;

/// Data direction of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
    InOut,
}

/// Class of memory backing a memory reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemClass {
    /// Shared memory owned by the non-secure world
    #[default]
    NonSecure,
    /// TEE private memory
    Reserved,
    /// Secure-data-path memory, only for TAs flagged SDP
    SecureDataPath,
}

/// Memory reference parameter
#[derive(Debug, Clone, Default)]
pub struct MemRef {
    pub class: MemClass,
    pub data: BytesMut,
}

impl MemRef {
    pub fn new(class: MemClass, data: impl Into<BytesMut>) -> Self {
        Self {
            class,
            data: data.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// One parameter slot
#[derive(Debug, Clone, Default)]
pub enum Param {
    #[default]
    None,
    Value { dir: Direction, a: u32, b: u32 },
    MemRef { dir: Direction, mem: MemRef },
}

impl Param {
    pub fn value_input(a: u32, b: u32) -> Self {
        Param::Value {
            dir: Direction::Input,
            a,
            b,
        }
    }

    pub fn value_output() -> Self {
        Param::Value {
            dir: Direction::Output,
            a: 0,
            b: 0,
        }
    }

    pub fn memref(dir: Direction, mem: MemRef) -> Self {
        Param::MemRef { dir, mem }
    }

    /// The `(a, b)` pair of a value parameter
    pub fn value(&self) -> Option<(u32, u32)> {
        match self {
            Param::Value { a, b, .. } => Some((*a, *b)),
            _ => None,
        }
    }
}

/// The four parameter slots of a request
#[derive(Debug, Clone, Default)]
pub struct Params {
    pub slots: [Param; NUM_PARAMS],
}

impl Params {
    pub fn new(slots: [Param; NUM_PARAMS]) -> Self {
        Self { slots }
    }

    pub fn get(&self, index: usize) -> Option<&Param> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Param> {
        self.slots.get_mut(index)
    }

    /// Whether any non-empty memory reference lives in SDP memory.
    pub fn has_sdp_memref(&self) -> bool {
        self.slots.iter().any(|slot| match slot {
            Param::MemRef { mem, .. } => mem.size() > 0 && mem.class == MemClass::SecureDataPath,
            _ => false,
        })
    }
}
