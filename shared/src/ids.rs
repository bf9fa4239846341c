use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle of a network connection, assigned by the zone that accepted it.
pub type ConnectionId = u32;

/// Identifier of a zone authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId(pub u32);

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zone-{}", self.0)
    }
}

/// Stable entity identifier, unique across every zone in the system.
///
/// The upper 16 bits carry the zone that spawned the entity and the lower
/// 48 bits a per-zone counter, so two zones can allocate ids without
/// coordinating. The id never changes when the entity migrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

const SEQUENCE_BITS: u32 = 48;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

impl EntityId {
    pub fn compose(origin: ZoneId, sequence: u64) -> Self {
        EntityId(((origin.0 as u64 & 0xFFFF) << SEQUENCE_BITS) | (sequence & SEQUENCE_MASK))
    }

    /// Zone that originally spawned the entity (not necessarily its owner).
    pub fn origin_zone(&self) -> ZoneId {
        ZoneId((self.0 >> SEQUENCE_BITS) as u32)
    }

    pub fn sequence(&self) -> u64 {
        self.0 & SEQUENCE_MASK
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}:{}", self.origin_zone().0, self.sequence())
    }
}

/// Identifier of one migration attempt: source zone plus its own counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TicketId {
    pub source: ZoneId,
    pub sequence: u32,
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ticket-{}/{}", self.source.0, self.sequence)
    }
}
