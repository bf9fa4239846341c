//! Message content owned by the simulation core.
//!
//! The transport decides how these bytes travel; the core decides what they
//! say. Snapshots are the unreliable stream, [`Event`]s the reliable one, and
//! [`ZoneMessage`]s flow between neighbouring zone authorities.

use crate::fixed::FixedVec3;
use crate::ids::{ConnectionId, EntityId, TicketId, ZoneId};
use serde::{Deserialize, Serialize};

/// Full turn in milliradians; facings live in `0..TAU_MILLIRADIANS`.
pub const TAU_MILLIRADIANS: i32 = 6283;

/// Maps a facing in milliradians onto the 16-bit wire rotation.
pub fn quantize_facing(facing: i32) -> u16 {
    let wrapped = facing.rem_euclid(TAU_MILLIRADIANS) as u32;
    ((wrapped * 65_536) / TAU_MILLIRADIANS as u32) as u16
}

/// Client intent for an attack, stamped with the client's clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackRequest {
    pub attacker: EntityId,
    pub target: EntityId,
    pub weapon_slot: u8,
    /// Aim direction; only its direction matters.
    pub aim: FixedVec3,
    pub sequence: u32,
    pub client_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AnimationState {
    #[default]
    Idle,
    Walk,
    Run,
    Attack,
    Block,
    Jump,
    Dead,
}

/// One replicated entity inside an observer snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub entity_id: EntityId,
    pub tier: u8,
    pub quantized_position: FixedVec3,
    pub quantized_rotation: u16,
    pub animation_state: AnimationState,
}

/// Per-observer unreliable state update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserverSnapshot {
    pub tick: u64,
    pub last_processed_input: u32,
    pub entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrectionReason {
    /// The claimed hit did not validate against the rewound target.
    Miss,
    /// The weapon was still cooling down.
    OnCooldown,
    /// Target is not simulated authoritatively by this zone.
    TargetNotOwned,
    /// Target or attacker unknown, dead, or the weapon slot is empty.
    InvalidTarget,
}

/// Reliable event payloads. The entity id the event is about lives on
/// [`Event`]; everything else is here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    Spawn {
        tier: u8,
        position: FixedVec3,
    },
    Despawn,
    Hit {
        attacker: EntityId,
        damage: i32,
        remaining_health: i32,
        killed: bool,
        degraded_compensation: bool,
    },
    /// Sent to the attacking observer only.
    Correction {
        reason: CorrectionReason,
        target_position: Option<FixedVec3>,
    },
    /// Authoritative position after a soft movement correction.
    MovementCorrected {
        position: FixedVec3,
        sequence: u32,
    },
    MigrationStarted {
        destination: ZoneId,
    },
    MigrationCompleted {
        destination: ZoneId,
    },
    MigrationAborted {
        destination: ZoneId,
    },
}

/// `(type, entity_id, payload)` for the reliable stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub entity_id: EntityId,
    pub kind: EventKind,
}

impl Event {
    pub fn new(entity_id: EntityId, kind: EventKind) -> Self {
        Self { entity_id, kind }
    }
}

/// Minimal authoritative state carried by a migration ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSnapshot {
    pub entity_id: EntityId,
    pub class_id: u8,
    pub position: FixedVec3,
    pub velocity: FixedVec3,
    pub facing: i32,
    pub health: i32,
    pub max_health: i32,
    pub active_effects: Vec<u32>,
    pub connection: Option<ConnectionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NackReason {
    OutOfBounds,
    DuplicateEntity,
    Malformed,
    WrongDestination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    Nacked(NackReason),
    TimedOut,
    EntityGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    Initiated,
    PendingAck { deadline_tick: u64 },
    Complete,
    Aborted(AbortReason),
}

impl MigrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationStatus::Complete | MigrationStatus::Aborted(_))
    }
}

/// Tracks one in-flight handoff through its state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationTicket {
    pub id: TicketId,
    pub entity_id: EntityId,
    pub source: ZoneId,
    pub destination: ZoneId,
    pub snapshot: MigrationSnapshot,
    pub status: MigrationStatus,
}

/// Read-only shadow state for an entity inside a neighbour's overlap margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorState {
    pub entity_id: EntityId,
    pub class_id: u8,
    pub position: FixedVec3,
    pub velocity: FixedVec3,
    pub facing: i32,
    pub health: i32,
    pub animation: AnimationState,
}

/// Zone-to-zone traffic. Fire-and-forget; every receiver tolerates loss,
/// duplication and reordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ZoneMessage {
    MigrationInitiated(MigrationTicket),
    MigrationAck {
        ticket: TicketId,
        entity_id: EntityId,
    },
    MigrationNack {
        ticket: TicketId,
        entity_id: EntityId,
        reason: NackReason,
    },
    /// Source gave up waiting; a destination that accepted must step back.
    MigrationAbort {
        ticket: TicketId,
        entity_id: EntityId,
    },
    /// Complete set of entities the sender mirrors into the receiver this tick.
    MirrorUpdate {
        from: ZoneId,
        tick: u64,
        entities: Vec<MirrorState>,
    },
}
