//! Connection identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one physical connection.
///
/// `ConnId` combines a sequential slot number, which is reused once the connection closes, with a coarse stamp
/// taken when the slot was allocated. The two are packed into a single `u64` [`compiled`](ConnId::compiled) value
/// which is the handle exposed to the bus, so that a slot reused after a reconnect never resolves to a reply meant
/// for its predecessor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnId {
    slot: u32,
    stamp: u64,
}

impl ConnId {
    /// Bits of the compiled id holding the slot.
    pub const SLOT_BITS: u32 = 24;
    /// Highest usable slot number.
    pub const MAX_SLOT: u32 = (1 << Self::SLOT_BITS) - 1;
    const STAMP_MASK: u64 = (1 << (64 - Self::SLOT_BITS)) - 1;

    /// Creates an id from its parts. The stamp is truncated to the bits available in the compiled form.
    pub fn new(slot: u32, stamp: u64) -> Self {
        debug_assert!(slot <= Self::MAX_SLOT);
        ConnId {
            slot,
            stamp: stamp & Self::STAMP_MASK,
        }
    }

    /// Splits a compiled id back into its parts.
    pub fn from_compiled(compiled: u64) -> Self {
        ConnId {
            slot: (compiled & u64::from(Self::MAX_SLOT)) as u32,
            stamp: compiled >> Self::SLOT_BITS,
        }
    }

    /// The sequential slot number.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// The allocation stamp.
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    /// The packed `stamp << 24 | slot` handle.
    pub fn compiled(&self) -> u64 {
        self.stamp << Self::SLOT_BITS | u64::from(self.slot)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.slot, self.stamp)
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnId")
            .field("slot", &self.slot)
            .field("stamp", &self.stamp)
            .field("compiled", &self.compiled())
            .finish()
    }
}
