//! Entity registry
//!
//! A single arena keyed by stable [`EntityId`]. The registry is the only
//! writer of entity state and keeps the spatial index in step with every
//! position it stores. Cross-zone relations are ids plus snapshots, never
//! references.

use crate::error::RegistryError;
use crate::spatial::{Region, SpatialIndex};
use shared::{
    AnimationState, ConnectionId, EntityId, FixedVec3, MigrationSnapshot, MirrorState, TicketId,
    ZoneId,
};
use std::collections::BTreeMap;

/// Weapon slots tracked per entity for cooldowns.
pub const MAX_WEAPON_SLOTS: usize = 8;

/// Who simulates an entity, from this zone's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    /// Simulated here.
    Owned,
    /// Simulated here as a fallback while a handoff awaits its answer.
    Migrating {
        ticket: TicketId,
        destination: ZoneId,
    },
    /// Read-only shadow of an entity another zone owns.
    Mirror { owner: ZoneId },
}

impl Authority {
    /// Whether this zone may accept input and apply effects for the entity.
    pub fn is_local(&self) -> bool {
        !matches!(self, Authority::Mirror { .. })
    }
}

/// Component data for a new entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Components {
    pub class_id: u8,
    pub position: FixedVec3,
    pub velocity: FixedVec3,
    pub facing: i32,
    pub health: i32,
    pub max_health: i32,
    pub active_effects: Vec<u32>,
    pub player_controlled: bool,
}

impl Components {
    pub fn new(class_id: u8, position: FixedVec3, max_health: i32) -> Self {
        Self {
            class_id,
            position,
            velocity: FixedVec3::ZERO,
            facing: 0,
            health: max_health,
            max_health,
            active_effects: Vec::new(),
            player_controlled: false,
        }
    }

    pub fn from_snapshot(snapshot: &MigrationSnapshot) -> Self {
        Self {
            class_id: snapshot.class_id,
            position: snapshot.position,
            velocity: snapshot.velocity,
            facing: snapshot.facing,
            health: snapshot.health,
            max_health: snapshot.max_health,
            active_effects: snapshot.active_effects.clone(),
            player_controlled: snapshot.connection.is_some(),
        }
    }

    pub fn from_mirror(state: &MirrorState) -> Self {
        Self {
            class_id: state.class_id,
            position: state.position,
            velocity: state.velocity,
            facing: state.facing,
            health: state.health,
            max_health: state.health.max(1),
            active_effects: Vec::new(),
            player_controlled: false,
        }
    }
}

/// Bookkeeping for the movement validator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotionState {
    pub last_input_tick: u64,
    pub last_sequence: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    id: EntityId,
    position: FixedVec3,
    pub class_id: u8,
    pub velocity: FixedVec3,
    /// Yaw in milliradians.
    pub facing: i32,
    pub health: i32,
    pub max_health: i32,
    pub active_effects: Vec<u32>,
    pub animation: AnimationState,
    pub authority: Authority,
    pub connection: Option<ConnectionId>,
    pub player_controlled: bool,
    pub motion: MotionState,
    /// First tick each weapon slot may fire again.
    pub weapon_ready: [u64; MAX_WEAPON_SLOTS],
}

impl EntityRecord {
    fn new(id: EntityId, components: Components, authority: Authority, tick: u64) -> Self {
        Self {
            id,
            position: components.position,
            class_id: components.class_id,
            velocity: components.velocity,
            facing: components.facing,
            health: components.health,
            max_health: components.max_health,
            active_effects: components.active_effects,
            animation: AnimationState::Idle,
            authority,
            connection: None,
            player_controlled: components.player_controlled,
            motion: MotionState {
                last_input_tick: tick,
                last_sequence: 0,
            },
            weapon_ready: [0; MAX_WEAPON_SLOTS],
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Current position. Changed only through [`EntityRegistry::set_kinematics`]
    /// so the spatial index never goes stale.
    pub fn position(&self) -> FixedVec3 {
        self.position
    }

    pub fn is_alive(&self) -> bool {
        self.health > 0
    }

    pub fn migration_snapshot(&self) -> MigrationSnapshot {
        MigrationSnapshot {
            entity_id: self.id,
            class_id: self.class_id,
            position: self.position,
            velocity: self.velocity,
            facing: self.facing,
            health: self.health,
            max_health: self.max_health,
            active_effects: self.active_effects.clone(),
            connection: self.connection,
        }
    }

    pub fn mirror_state(&self) -> MirrorState {
        MirrorState {
            entity_id: self.id,
            class_id: self.class_id,
            position: self.position,
            velocity: self.velocity,
            facing: self.facing,
            health: self.health,
            animation: self.animation,
        }
    }
}

pub struct EntityRegistry {
    zone: ZoneId,
    next_sequence: u64,
    entities: BTreeMap<EntityId, EntityRecord>,
    index: SpatialIndex,
}

impl EntityRegistry {
    pub fn new(zone: ZoneId, cell_size: i64) -> Self {
        Self {
            zone,
            next_sequence: 1,
            entities: BTreeMap::new(),
            index: SpatialIndex::new(cell_size),
        }
    }

    /// Spawns a locally owned entity with a fresh system-wide id.
    pub fn create(&mut self, components: Components, tick: u64) -> EntityId {
        let mut id = EntityId::compose(self.zone, self.next_sequence);
        while self.entities.contains_key(&id) {
            self.next_sequence += 1;
            id = EntityId::compose(self.zone, self.next_sequence);
        }
        self.next_sequence += 1;

        self.index.insert(id, components.position);
        self.entities
            .insert(id, EntityRecord::new(id, components, Authority::Owned, tick));
        id
    }

    /// Inserts an entity whose id was assigned elsewhere (migration, mirror).
    pub fn insert_with_id(
        &mut self,
        id: EntityId,
        components: Components,
        authority: Authority,
        tick: u64,
    ) -> Result<(), RegistryError> {
        if self.entities.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        self.index.insert(id, components.position);
        self.entities
            .insert(id, EntityRecord::new(id, components, authority, tick));
        Ok(())
    }

    pub fn destroy(&mut self, id: EntityId) -> Result<EntityRecord, RegistryError> {
        let record = self
            .entities
            .remove(&id)
            .ok_or(RegistryError::NotFound(id))?;
        self.index.remove(id);
        Ok(record)
    }

    pub fn get(&self, id: EntityId) -> Option<&EntityRecord> {
        self.entities.get(&id)
    }

    /// Mutable access to non-positional components.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut EntityRecord> {
        self.entities.get_mut(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Moves a locally simulated entity.
    pub fn set_kinematics(
        &mut self,
        id: EntityId,
        position: FixedVec3,
        velocity: FixedVec3,
    ) -> Result<(), RegistryError> {
        let record = self
            .entities
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        if !record.authority.is_local() {
            return Err(RegistryError::Mirrored(id));
        }
        record.position = position;
        record.velocity = velocity;
        self.index.update(id, position);
        Ok(())
    }

    /// Overwrites a mirror with the owner's latest state.
    pub fn apply_mirror(&mut self, state: &MirrorState) -> Result<(), RegistryError> {
        let record = self
            .entities
            .get_mut(&state.entity_id)
            .ok_or(RegistryError::NotFound(state.entity_id))?;
        if record.authority.is_local() {
            return Err(RegistryError::Duplicate(state.entity_id));
        }
        record.position = state.position;
        record.velocity = state.velocity;
        record.facing = state.facing;
        record.health = state.health;
        record.class_id = state.class_id;
        record.animation = state.animation;
        self.index.update(state.entity_id, state.position);
        Ok(())
    }

    pub fn set_authority(
        &mut self,
        id: EntityId,
        authority: Authority,
    ) -> Result<(), RegistryError> {
        let record = self
            .entities
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        record.authority = authority;
        if !authority.is_local() {
            record.connection = None;
        }
        Ok(())
    }

    pub fn query(&self, region: &Region, out: &mut Vec<EntityId>) {
        self.index.query(region, out);
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.values()
    }

    /// Ids of entities this zone simulates (owned or migrating), in id order.
    pub fn local_ids(&self, out: &mut Vec<EntityId>) {
        out.clear();
        out.extend(
            self.entities
                .values()
                .filter(|r| r.authority.is_local())
                .map(|r| r.id),
        );
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn owned_count(&self) -> usize {
        self.entities
            .values()
            .filter(|r| r.authority == Authority::Owned)
            .count()
    }

    pub fn mirror_count(&self) -> usize {
        self.entities
            .values()
            .filter(|r| !r.authority.is_local())
            .count()
    }

    pub fn cell_size(&self) -> i64 {
        self.index.cell_size()
    }

    pub fn rebuild_index(&mut self, cell_size: i64) {
        self.index.rebuild(cell_size);
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }
}
