//! Bounded per-entity position history for lag compensation.

use crate::context::{SimTime, SUBTICKS};
use shared::{EntityId, FixedVec3};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionHistorySample {
    pub tick: u64,
    pub position: FixedVec3,
    pub velocity: FixedVec3,
}

/// Result of reconstructing an entity at a past time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconstructed {
    pub position: FixedVec3,
    pub velocity: FixedVec3,
    /// The requested time predates the retained window; the oldest sample was used.
    pub degraded: bool,
}

/// Ring of samples for one entity, oldest first. Capacity is fixed at creation
/// so pushes never reallocate.
#[derive(Debug, Clone)]
pub struct HistoryRing {
    samples: VecDeque<PositionHistorySample>,
    capacity: usize,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a sample. A sample for the newest tick replaces it; samples
    /// older than the newest are ignored so the ring stays time-ordered.
    pub fn push(&mut self, sample: PositionHistorySample) {
        if let Some(last) = self.samples.back_mut() {
            if sample.tick == last.tick {
                *last = sample;
                return;
            }
            if sample.tick < last.tick {
                return;
            }
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn oldest(&self) -> Option<&PositionHistorySample> {
        self.samples.front()
    }

    pub fn newest(&self) -> Option<&PositionHistorySample> {
        self.samples.back()
    }

    pub fn sample_at(&self, tick: u64) -> Option<&PositionHistorySample> {
        self.samples
            .binary_search_by_key(&tick, |s| s.tick)
            .ok()
            .and_then(|i| self.samples.get(i))
    }

    /// State at `time`: the exact sample when one exists, otherwise the linear
    /// interpolation between the two samples bracketing it.
    pub fn resolve_at(&self, time: SimTime) -> Option<Reconstructed> {
        let oldest = self.samples.front()?;
        let newest = self.samples.back()?;

        if time < SimTime::from_tick(oldest.tick) {
            return Some(Reconstructed {
                position: oldest.position,
                velocity: oldest.velocity,
                degraded: true,
            });
        }
        if time >= SimTime::from_tick(newest.tick) {
            return Some(Reconstructed {
                position: newest.position,
                velocity: newest.velocity,
                degraded: false,
            });
        }

        if time.fraction() == 0 {
            if let Some(exact) = self.sample_at(time.floor_tick() as u64) {
                return Some(Reconstructed {
                    position: exact.position,
                    velocity: exact.velocity,
                    degraded: false,
                });
            }
        }

        // First sample strictly after `time`; its predecessor is at or before.
        let after = self
            .samples
            .partition_point(|s| SimTime::from_tick(s.tick) <= time);
        let b = self.samples.get(after)?;
        let a = self.samples.get(after.checked_sub(1)?)?;

        let start = SimTime::from_tick(a.tick).0;
        let span = (b.tick - a.tick) as i64 * SUBTICKS;
        let offset = time.0 - start;
        Some(Reconstructed {
            position: FixedVec3::lerp(a.position, b.position, offset, span),
            velocity: FixedVec3::lerp(a.velocity, b.velocity, offset, span),
            degraded: false,
        })
    }
}

/// History rings for every locally simulated entity.
pub struct PositionHistory {
    capacity: usize,
    rings: HashMap<EntityId, HistoryRing>,
}

impl PositionHistory {
    pub fn new(window_ticks: u32) -> Self {
        Self {
            capacity: window_ticks as usize + 1,
            rings: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&mut self, id: EntityId, tick: u64, position: FixedVec3, velocity: FixedVec3) {
        let capacity = self.capacity;
        self.rings
            .entry(id)
            .or_insert_with(|| HistoryRing::new(capacity))
            .push(PositionHistorySample {
                tick,
                position,
                velocity,
            });
    }

    pub fn forget(&mut self, id: EntityId) {
        self.rings.remove(&id);
    }

    pub fn ring(&self, id: EntityId) -> Option<&HistoryRing> {
        self.rings.get(&id)
    }

    pub fn resolve_at(&self, id: EntityId, time: SimTime) -> Option<Reconstructed> {
        self.rings.get(&id)?.resolve_at(time)
    }

    pub fn len(&self) -> usize {
        self.rings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rings.is_empty()
    }
}
