//! Per-tick context and the outbox every phase writes into.

use crate::config::{ZoneConfig, ZoneDescriptor};
use crate::persistence::PersistenceRecord;
use crate::scheduler::MonitoringSignal;
use shared::{
    ConnectionId, Event, MirrorState, ObserverSnapshot, Packet, SnapshotEntry, ZoneId, ZoneMessage,
};
use std::net::SocketAddr;

/// Milliticks per tick; [`SimTime`] resolution.
pub const SUBTICKS: i64 = 1000;

/// Server time in thousandths of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimTime(pub i64);

impl SimTime {
    pub fn from_tick(tick: u64) -> Self {
        SimTime(tick as i64 * SUBTICKS)
    }

    /// `ms` milliseconds before `self` at `tick_rate` ticks per second.
    pub fn rewind_ms(self, ms: u64, tick_rate: u32) -> Self {
        SimTime(self.0 - (ms as i64 * tick_rate as i64 * SUBTICKS) / 1000)
    }

    /// Whole tick at or before this time.
    pub fn floor_tick(self) -> i64 {
        self.0.div_euclid(SUBTICKS)
    }

    pub fn fraction(self) -> i64 {
        self.0.rem_euclid(SUBTICKS)
    }
}

/// Everything a component may know about "now". Passed explicitly so a tick
/// can be replayed without ambient state.
#[derive(Debug, Clone, Copy)]
pub struct TickContext<'a> {
    pub config: &'a ZoneConfig,
    pub zone: &'a ZoneDescriptor,
    pub tick: u64,
}

impl<'a> TickContext<'a> {
    pub fn new(config: &'a ZoneConfig, tick: u64) -> Self {
        Self {
            config,
            zone: &config.zone,
            tick,
        }
    }

    pub fn zone_id(&self) -> ZoneId {
        self.zone.id
    }

    /// Server clock in milliseconds since the zone started.
    pub fn now_ms(&self) -> u64 {
        self.tick * 1000 / self.config.tick_rate.max(1) as u64
    }

    pub fn now(&self) -> SimTime {
        SimTime::from_tick(self.tick)
    }
}

/// Everything one tick produced for the outside world.
///
/// Reused across ticks; the zone clears it at the start of each tick so the
/// vectors keep their capacity.
#[derive(Debug, Default)]
pub struct Outbox {
    /// Unreliable per-observer state.
    pub snapshots: Vec<(ConnectionId, ObserverSnapshot)>,
    /// Reliable events.
    pub events: Vec<(ConnectionId, Event)>,
    /// Packets for addresses that may have no session (connect replies,
    /// redirects, pings).
    pub control: Vec<(SocketAddr, Packet)>,
    pub zone_messages: Vec<(ZoneId, ZoneMessage)>,
    pub persistence: Vec<PersistenceRecord>,
    pub signals: Vec<MonitoringSignal>,
    snapshot_pool: Vec<Vec<SnapshotEntry>>,
    mirror_pool: Vec<Vec<MirrorState>>,
}

impl Outbox {
    /// Empties every queue. Payload vectors of snapshots and mirror updates
    /// go back to the pools for the next tick.
    pub fn clear(&mut self) {
        for (_, snapshot) in self.snapshots.drain(..) {
            let mut entries = snapshot.entries;
            entries.clear();
            self.snapshot_pool.push(entries);
        }
        for (_, message) in self.zone_messages.drain(..) {
            if let ZoneMessage::MirrorUpdate { mut entities, .. } = message {
                entities.clear();
                self.mirror_pool.push(entities);
            }
        }
        self.events.clear();
        self.control.clear();
        self.persistence.clear();
        self.signals.clear();
    }

    pub fn take_snapshot_buffer(&mut self) -> Vec<SnapshotEntry> {
        self.snapshot_pool.pop().unwrap_or_default()
    }

    pub fn recycle_snapshot_buffer(&mut self, mut entries: Vec<SnapshotEntry>) {
        entries.clear();
        self.snapshot_pool.push(entries);
    }

    pub fn take_mirror_buffer(&mut self) -> Vec<MirrorState> {
        self.mirror_pool.pop().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
            && self.events.is_empty()
            && self.control.is_empty()
            && self.zone_messages.is_empty()
            && self.persistence.is_empty()
            && self.signals.is_empty()
    }

    pub fn events_for(&self, connection: ConnectionId) -> impl Iterator<Item = &Event> {
        self.events
            .iter()
            .filter(move |(conn, _)| *conn == connection)
            .map(|(_, event)| event)
    }

    pub fn snapshot_for(&self, connection: ConnectionId) -> Option<&ObserverSnapshot> {
        self.snapshots
            .iter()
            .find(|(conn, _)| *conn == connection)
            .map(|(_, snapshot)| snapshot)
    }
}
