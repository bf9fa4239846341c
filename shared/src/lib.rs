//! Types shared by zone authorities, their peers and their clients.
//!
//! Everything here is plain data: the fixed-point vector math the simulation
//! is built on, the identifiers that stay stable across zones, and the
//! `Packet` enum every datagram is encoded as.

pub mod fixed;
pub mod ids;
pub mod messages;

pub use fixed::{isqrt, units, FixedVec3, FIXED_SCALE};
pub use ids::{ConnectionId, EntityId, TicketId, ZoneId};
pub use messages::{
    quantize_facing, AbortReason, AnimationState, AttackRequest, CorrectionReason, Event,
    EventKind, MigrationSnapshot, MigrationStatus, MigrationTicket, MirrorState, NackReason,
    ObserverSnapshot, SnapshotEntry, ZoneMessage, TAU_MILLIRADIANS,
};

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_TICK_RATE_HZ: u32 = 60;
pub const DEFAULT_SERVER_PORT: u16 = 7777;

pub const ACTION_ATTACK: u8 = 1 << 0;
pub const ACTION_BLOCK: u8 = 1 << 1;
pub const ACTION_JUMP: u8 = 1 << 2;
pub const ACTION_SPRINT: u8 = 1 << 3;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Connect {
        client_version: u32,
        class_id: u8,
    },
    /// Takes control of an entity that migrated here after a `Redirect`.
    Reattach {
        client_version: u32,
        entity_id: EntityId,
    },
    Input(InputState),
    Attack(AttackRequest),
    Pong {
        server_time: u64,
    },
    Disconnect,

    Connected {
        connection_id: ConnectionId,
        entity_id: EntityId,
        zone: ZoneId,
    },
    Snapshot(ObserverSnapshot),
    Event(Event),
    Ping {
        server_time: u64,
    },
    /// The connection's entity now belongs to another zone authority.
    Redirect {
        zone: ZoneId,
        address: String,
    },
    Disconnected {
        reason: String,
    },

    Zone(ZoneMessage),
}

/// Per-tick client intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputState {
    pub entity_id: EntityId,
    pub sequence: u32,
    /// Requested displacement since the previous input, in fixed units.
    pub move_vector: FixedVec3,
    /// Yaw in milliradians.
    pub facing: i32,
    pub action_flags: u8,
    pub client_time: u64,
}

impl InputState {
    pub fn has_action(&self, flag: u8) -> bool {
        self.action_flags & flag != 0
    }
}
