//! Area-of-interest replication
//!
//! Each observer sees the entities within its outermost tier radius. Every
//! visible entity carries the tier of its distance band and is republished no
//! more often than that tier's refresh period. Entering the area emits one
//! `Spawn`, leaving it emits one `Despawn`; removing an observer despawns
//! everything it still sees.
//!
//! Under budget pressure this manager degrades first: outer tiers refresh less
//! often and their positions are sent with coarser precision.

use crate::config::AoiTier;
use crate::context::{Outbox, TickContext};
use crate::registry::EntityRegistry;
use crate::spatial::Region;
use log::warn;
use shared::{
    quantize_facing, ConnectionId, EntityId, Event, EventKind, ObserverSnapshot, SnapshotEntry,
};
use std::collections::{BTreeMap, HashMap};

/// Position precision (fixed units) for each tier before degradation.
const BASE_PRECISION: [i32; 3] = [1, 10, 100];
/// Coarsest precision outer tiers are ever degraded to.
const MAX_PRECISION: i32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Visible {
    tier: u8,
    last_sent_tick: u64,
    seen_tick: u64,
}

#[derive(Debug)]
pub struct Observer {
    pub connection: ConnectionId,
    pub entity: EntityId,
    visible: HashMap<EntityId, Visible>,
}

impl Observer {
    pub fn sees(&self, id: EntityId) -> bool {
        self.visible.contains_key(&id)
    }

    pub fn tier_of(&self, id: EntityId) -> Option<u8> {
        self.visible.get(&id).map(|v| v.tier)
    }

    pub fn visible_count(&self) -> usize {
        self.visible.len()
    }
}

pub struct AoiManager {
    tiers: Vec<AoiTier>,
    observers: BTreeMap<ConnectionId, Observer>,
    degradation: u8,
    scratch: Vec<EntityId>,
    connections: Vec<ConnectionId>,
    gone: Vec<EntityId>,
}

impl AoiManager {
    pub fn new(tiers: Vec<AoiTier>) -> Self {
        Self {
            tiers,
            observers: BTreeMap::new(),
            degradation: 0,
            scratch: Vec::new(),
            connections: Vec::new(),
            gone: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, connection: ConnectionId, entity: EntityId) {
        self.observers.insert(
            connection,
            Observer {
                connection,
                entity,
                visible: HashMap::new(),
            },
        );
    }

    /// Removes an observer, emitting a despawn for everything it still sees.
    pub fn remove_observer(&mut self, connection: ConnectionId, outbox: &mut Outbox) -> bool {
        let mut observer = match self.observers.remove(&connection) {
            Some(observer) => observer,
            None => return false,
        };
        Self::despawn_all(&mut observer, &mut self.gone, outbox);
        true
    }

    /// Empties `observer`'s visible set, one despawn per entity in id order.
    fn despawn_all(observer: &mut Observer, buf: &mut Vec<EntityId>, outbox: &mut Outbox) {
        buf.clear();
        buf.extend(observer.visible.drain().map(|(id, _)| id));
        buf.sort_unstable();
        for id in buf.drain(..) {
            outbox
                .events
                .push((observer.connection, Event::new(id, EventKind::Despawn)));
        }
    }

    pub fn observer(&self, connection: ConnectionId) -> Option<&Observer> {
        self.observers.get(&connection)
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn degradation(&self) -> u8 {
        self.degradation
    }

    pub fn set_degradation(&mut self, level: u8) {
        self.degradation = level;
    }

    /// Connections currently seeing `id`, in connection order.
    pub fn observers_of(&self, id: EntityId, out: &mut Vec<ConnectionId>) {
        out.clear();
        out.extend(
            self.observers
                .values()
                .filter(|o| o.visible.contains_key(&id))
                .map(|o| o.connection),
        );
    }

    /// Refresh period of `tier` at the current degradation level.
    pub fn refresh_period(&self, tier: u8) -> u64 {
        let base = self
            .tiers
            .get(tier as usize)
            .map(|t| t.refresh_every.max(1))
            .unwrap_or(1) as u64;
        if tier == 0 {
            base
        } else {
            base << self.degradation.min(8)
        }
    }

    /// Positional precision of `tier` at the current degradation level.
    pub fn precision(&self, tier: u8) -> i32 {
        let base = BASE_PRECISION
            .get(tier as usize)
            .copied()
            .unwrap_or(MAX_PRECISION);
        if tier == 0 || self.degradation < 2 {
            return base;
        }
        let mut step = base;
        for _ in 1..self.degradation {
            step = step.saturating_mul(10);
        }
        step.min(MAX_PRECISION)
    }

    fn tier_for(&self, distance_sq: i64) -> Option<u8> {
        let d = distance_sq as i128;
        self.tiers
            .iter()
            .position(|t| d <= t.radius as i128 * t.radius as i128)
            .map(|i| i as u8)
    }

    /// Recomputes every observer's visible set and publishes snapshots.
    ///
    /// `last_input` supplies the acknowledged input sequence per connection.
    pub fn update<F>(
        &mut self,
        ctx: &TickContext,
        registry: &EntityRegistry,
        last_input: F,
        outbox: &mut Outbox,
    ) where
        F: Fn(ConnectionId) -> u32,
    {
        let reach = self.tiers.last().map(|t| t.radius).unwrap_or(0);
        let tick = ctx.tick;
        let mut connections = std::mem::take(&mut self.connections);
        connections.clear();
        connections.extend(self.observers.keys().copied());

        for &connection in &connections {
            let entity = match self.observers.get(&connection) {
                Some(observer) => observer.entity,
                None => continue,
            };
            let center = match registry.get(entity) {
                Some(record) => record.position(),
                None => {
                    // Nothing left to view from; close out what it saw
                    warn!(
                        "Observer {} lost its entity {}, dropping it",
                        connection, entity
                    );
                    self.remove_observer(connection, outbox);
                    continue;
                }
            };

            let mut found = std::mem::take(&mut self.scratch);
            registry.query(
                &Region::Sphere {
                    center,
                    radius: reach,
                },
                &mut found,
            );

            let mut entries = outbox.take_snapshot_buffer();
            for id in &found {
                let record = match registry.get(*id) {
                    Some(record) => record,
                    None => continue,
                };
                let position = record.position();
                let tier = match self.tier_for(position.distance_sq(&center)) {
                    Some(tier) => tier,
                    None => continue,
                };
                let period = self.refresh_period(tier);
                let precision = self.precision(tier);

                let observer = match self.observers.get_mut(&connection) {
                    Some(observer) => observer,
                    None => break,
                };
                let due = match observer.visible.get_mut(id) {
                    Some(visible) => {
                        visible.tier = tier;
                        visible.seen_tick = tick;
                        if tick >= visible.last_sent_tick + period {
                            visible.last_sent_tick = tick;
                            true
                        } else {
                            false
                        }
                    }
                    None => {
                        observer.visible.insert(
                            *id,
                            Visible {
                                tier,
                                last_sent_tick: tick,
                                seen_tick: tick,
                            },
                        );
                        outbox
                            .events
                            .push((connection, Event::new(*id, EventKind::Spawn { tier, position })));
                        true
                    }
                };

                if due {
                    entries.push(SnapshotEntry {
                        entity_id: *id,
                        tier,
                        quantized_position: position.quantize(precision),
                        quantized_rotation: quantize_facing(record.facing),
                        animation_state: record.animation,
                    });
                }
            }
            self.scratch = found;

            if let Some(observer) = self.observers.get_mut(&connection) {
                let gone = &mut self.gone;
                gone.clear();
                observer.visible.retain(|id, visible| {
                    if visible.seen_tick == tick {
                        true
                    } else {
                        gone.push(*id);
                        false
                    }
                });
                gone.sort_unstable();
                for id in gone.drain(..) {
                    outbox
                        .events
                        .push((connection, Event::new(id, EventKind::Despawn)));
                }
            }

            if entries.is_empty() {
                outbox.recycle_snapshot_buffer(entries);
            } else {
                outbox.snapshots.push((
                    connection,
                    ObserverSnapshot {
                        tick,
                        last_processed_input: last_input(connection),
                        entries,
                    },
                ));
            }
        }
        self.connections = connections;
    }
}
