//! Connection sessions and input queuing for a zone authority
//!
//! This module handles the server-side bookkeeping for connected clients, including:
//! - Session lifecycle (connect, disconnect, timeout, redirect to another zone)
//! - Input buffering in sequence order, with stale duplicates dropped
//! - Round-trip time estimation from ping/pong exchanges
//! - Per-connection violation counters used for anti-cheat escalation
//!
//! A session only refers to its entity by id. It never owns the entity; the
//! registry decides when an entity lives or dies.

use log::{info, warn};
use shared::{ConnectionId, EntityId, InputState, ZoneId};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Inputs a single connection may have queued before new ones are refused.
pub const MAX_PENDING_INPUTS: usize = 64;

/// Weight of a new RTT sample in the moving average, in percent.
const RTT_SMOOTHING_PCT: u64 = 20;

/// Violation counters for one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViolationCounters {
    /// Malformed, out-of-range or misaddressed packets
    pub protocol: u32,
    /// Movement clamped to the allowed maximum
    pub soft: u32,
    /// Movement rejected outright
    pub hard: u32,
}

/// What happened to an input handed to [`ClientManager::add_input`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAdmission {
    Queued,
    /// Sequence already processed or already queued; silently dropped
    Stale,
    /// Queue full; dropped and counted as a protocol violation
    Overflow,
    UnknownClient,
}

/// Represents a connected client and its per-connection state
///
/// Each session maintains:
/// - Connection metadata (ID, address, last activity)
/// - The entity it controls and the zone currently authoritative for it
/// - Input acknowledgment tracking for reconciliation
/// - Buffered inputs waiting for processing in sequence order
/// - Latency estimate and violation counters
#[derive(Debug)]
pub struct Session {
    /// Unique connection identifier assigned by this zone
    pub id: ConnectionId,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
    /// Entity this connection controls (weak reference by id)
    pub entity_id: Option<EntityId>,
    /// Zone currently authoritative for the entity
    pub zone: ZoneId,
    /// Highest input sequence number we've processed
    pub last_processed_input: u32,
    /// Buffered inputs waiting to be processed, sorted by sequence
    pub pending_inputs: Vec<InputState>,
    /// Smoothed round-trip time in milliseconds, once measured
    pub rtt_ms: Option<u64>,
    pub violations: ViolationCounters,
    /// Set once the connection crossed an escalation threshold
    pub kick_candidate: bool,
}

impl Session {
    /// Creates a new session with the given ID and network address
    ///
    /// The session starts with no entity, no processed inputs and an empty
    /// input buffer, and is marked as recently active.
    pub fn new(id: ConnectionId, addr: SocketAddr, zone: ZoneId) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            entity_id: None,
            zone,
            last_processed_input: 0,
            pending_inputs: Vec::new(),
            rtt_ms: None,
            violations: ViolationCounters::default(),
            kick_candidate: false,
        }
    }

    /// Adds a new input to the session's pending queue
    ///
    /// Updates the last seen time and inserts the input in sequence order, so
    /// out-of-order datagrams are still applied in the order they were sent.
    /// Inputs at or below the last processed sequence, or already queued, are
    /// duplicates from the unreliable transport and are dropped.
    pub fn add_input(&mut self, input: InputState) -> InputAdmission {
        self.last_seen = Instant::now();

        if input.sequence <= self.last_processed_input {
            return InputAdmission::Stale;
        }
        let slot = match self
            .pending_inputs
            .binary_search_by_key(&input.sequence, |i| i.sequence)
        {
            Ok(_) => return InputAdmission::Stale,
            Err(slot) => slot,
        };
        if self.pending_inputs.len() >= MAX_PENDING_INPUTS {
            self.violations.protocol += 1;
            return InputAdmission::Overflow;
        }
        self.pending_inputs.insert(slot, input);
        InputAdmission::Queued
    }

    /// Folds a round-trip sample into the moving average
    pub fn record_rtt(&mut self, sample_ms: u64) {
        self.last_seen = Instant::now();
        self.rtt_ms = Some(match self.rtt_ms {
            None => sample_ms,
            Some(current) => {
                (current * (100 - RTT_SMOOTHING_PCT) + sample_ms * RTT_SMOOTHING_PCT) / 100
            }
        });
    }

    /// Estimated one-way delay (half the smoothed RTT)
    pub fn one_way_delay_ms(&self) -> u64 {
        self.rtt_ms.unwrap_or(0) / 2
    }

    /// Checks if the session has exceeded the connection timeout
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Manages every session attached to this zone
///
/// The ClientManager enforces the zone's capacity, assigns connection ids and
/// hands inputs to the tick in a deterministic order: by connection id, then
/// by sequence. Sessions are kept in a `BTreeMap` so iteration order does not
/// depend on hashing.
pub struct ClientManager {
    /// Sessions indexed by connection id
    clients: BTreeMap<ConnectionId, Session>,
    /// Reverse lookup from socket address
    by_addr: HashMap<SocketAddr, ConnectionId>,
    /// Next available connection id
    next_client_id: ConnectionId,
    /// Maximum number of concurrent sessions
    max_clients: usize,
    /// Silence after which a session is dropped
    timeout: Duration,
}

impl ClientManager {
    /// Creates a new client manager with the specified capacity and timeout
    ///
    /// Connection ids start from 1 and increment for each new session.
    pub fn new(max_clients: usize, timeout: Duration) -> Self {
        Self {
            clients: BTreeMap::new(),
            by_addr: HashMap::new(),
            next_client_id: 1,
            max_clients,
            timeout,
        }
    }

    /// Attempts to add a new session
    ///
    /// Returns Some(connection_id) if successful, None if the zone is at
    /// capacity. An existing session from the same address is replaced.
    pub fn add_client(&mut self, addr: SocketAddr, zone: ZoneId) -> Option<ConnectionId> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id = self.next_client_id.wrapping_add(1).max(1);

        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, Session::new(client_id, addr, zone));
        self.by_addr.insert(addr, client_id);

        Some(client_id)
    }

    /// Removes a session and returns it
    ///
    /// Returns None if it was already gone. Used for explicit disconnects,
    /// timeouts and redirects alike; the caller decides what happens to the
    /// entity.
    pub fn remove_client(&mut self, client_id: &ConnectionId) -> Option<Session> {
        let session = self.clients.remove(client_id)?;
        if self.by_addr.get(&session.addr) == Some(client_id) {
            self.by_addr.remove(&session.addr);
        }
        info!("Client {} disconnected", session.id);
        Some(session)
    }

    /// Finds a connection id by network address
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<ConnectionId> {
        self.by_addr.get(&addr).copied()
    }

    /// Finds the connection controlling `entity_id`, if any
    pub fn find_client_by_entity(&self, entity_id: EntityId) -> Option<ConnectionId> {
        self.clients
            .values()
            .find(|s| s.entity_id == Some(entity_id))
            .map(|s| s.id)
    }

    pub fn get(&self, client_id: ConnectionId) -> Option<&Session> {
        self.clients.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: ConnectionId) -> Option<&mut Session> {
        self.clients.get_mut(&client_id)
    }

    pub fn addr_of(&self, client_id: ConnectionId) -> Option<SocketAddr> {
        self.clients.get(&client_id).map(|s| s.addr)
    }

    /// Buffers an input for a session
    pub fn add_input(&mut self, client_id: ConnectionId, input: InputState) -> InputAdmission {
        match self.clients.get_mut(&client_id) {
            Some(session) => {
                let admission = session.add_input(input);
                if admission == InputAdmission::Overflow {
                    warn!("Client {} input queue overflow", client_id);
                }
                admission
            }
            None => InputAdmission::UnknownClient,
        }
    }

    /// Collects every unprocessed input in processing order
    ///
    /// Ordered by connection id and then sequence, so a replay of the same
    /// inbound stream applies inputs identically. `out` is cleared first.
    pub fn get_chronological_inputs(&self, out: &mut Vec<(ConnectionId, InputState)>) {
        out.clear();
        for (client_id, session) in &self.clients {
            for input in &session.pending_inputs {
                if input.sequence > session.last_processed_input {
                    out.push((*client_id, input.clone()));
                }
            }
        }
    }

    /// Marks an input sequence as processed for a session
    ///
    /// The value is echoed in snapshots so clients can reconcile predictions.
    pub fn mark_input_processed(&mut self, client_id: ConnectionId, sequence: u32) {
        if let Some(session) = self.clients.get_mut(&client_id) {
            session.last_processed_input = session.last_processed_input.max(sequence);
        }
    }

    /// Removes processed inputs from every buffer
    pub fn cleanup_processed_inputs(&mut self) {
        for session in self.clients.values_mut() {
            let last = session.last_processed_input;
            session.pending_inputs.retain(|input| input.sequence > last);
        }
    }

    /// Removes and returns sessions that have been silent past the timeout
    pub fn check_timeouts(&mut self) -> Vec<Session> {
        let timeout = self.timeout;
        let timed_out: Vec<ConnectionId> = self
            .clients
            .iter()
            .filter(|(_, session)| session.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        timed_out
            .iter()
            .filter_map(|client_id| {
                warn!("Client {} timed out", client_id);
                self.remove_client(client_id)
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.clients.values()
    }

    /// Returns the number of attached sessions
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if no sessions are attached
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::FixedVec3;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    fn manager(max: usize) -> ClientManager {
        ClientManager::new(max, Duration::from_secs(5))
    }

    fn input(sequence: u32, client_time: u64) -> InputState {
        InputState {
            entity_id: EntityId(1),
            sequence,
            move_vector: FixedVec3::new(10, 0, 0),
            facing: 0,
            action_flags: 0,
            client_time,
        }
    }

    #[test]
    fn test_session_creation() {
        let addr = test_addr();
        let session = Session::new(1, addr, ZoneId(1));

        assert_eq!(session.id, 1);
        assert_eq!(session.addr, addr);
        assert_eq!(session.last_processed_input, 0);
        assert!(session.pending_inputs.is_empty());
        assert!(session.entity_id.is_none());
        assert!(!session.kick_candidate);
    }

    #[test]
    fn test_session_orders_inputs_by_sequence() {
        let mut session = Session::new(1, test_addr(), ZoneId(1));

        assert_eq!(session.add_input(input(2, 100)), InputAdmission::Queued);
        assert_eq!(session.add_input(input(1, 50)), InputAdmission::Queued);

        assert_eq!(session.pending_inputs.len(), 2);
        assert_eq!(session.pending_inputs[0].sequence, 1);
        assert_eq!(session.pending_inputs[1].sequence, 2);
    }

    #[test]
    fn test_duplicate_and_stale_inputs_dropped() {
        let mut session = Session::new(1, test_addr(), ZoneId(1));
        session.last_processed_input = 5;

        assert_eq!(session.add_input(input(5, 0)), InputAdmission::Stale);
        assert_eq!(session.add_input(input(6, 0)), InputAdmission::Queued);
        assert_eq!(session.add_input(input(6, 0)), InputAdmission::Stale);
        assert_eq!(session.violations, ViolationCounters::default());
    }

    #[test]
    fn test_input_overflow_counts_violation() {
        let mut session = Session::new(1, test_addr(), ZoneId(1));
        for seq in 1..=MAX_PENDING_INPUTS as u32 {
            assert_eq!(session.add_input(input(seq, 0)), InputAdmission::Queued);
        }
        assert_eq!(
            session.add_input(input(MAX_PENDING_INPUTS as u32 + 1, 0)),
            InputAdmission::Overflow
        );
        assert_eq!(session.violations.protocol, 1);
    }

    #[test]
    fn test_session_timeout() {
        let mut session = Session::new(1, test_addr(), ZoneId(1));

        assert!(!session.is_timed_out(Duration::from_secs(1)));

        session.last_seen = Instant::now() - Duration::from_secs(2);

        assert!(session.is_timed_out(Duration::from_secs(1)));
    }

    #[test]
    fn test_rtt_smoothing() {
        let mut session = Session::new(1, test_addr(), ZoneId(1));
        assert_eq!(session.one_way_delay_ms(), 0);

        session.record_rtt(100);
        assert_eq!(session.rtt_ms, Some(100));

        session.record_rtt(200);
        assert_eq!(session.rtt_ms, Some(120));
        assert_eq!(session.one_way_delay_ms(), 60);
    }

    #[test]
    fn test_add_client_max_capacity() {
        let mut manager = manager(1);

        let client_id1 = manager.add_client(test_addr(), ZoneId(1));
        assert_eq!(client_id1, Some(1));
        assert_eq!(manager.len(), 1);

        let client_id2 = manager.add_client(test_addr2(), ZoneId(1));
        assert!(client_id2.is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_client() {
        let mut manager = manager(2);
        let client_id = manager.add_client(test_addr(), ZoneId(1)).unwrap();

        let removed = manager.remove_client(&client_id);
        assert_eq!(removed.map(|s| s.id), Some(client_id));
        assert!(manager.is_empty());
        assert_eq!(manager.find_client_by_addr(test_addr()), None);

        assert!(manager.remove_client(&999).is_none());
    }

    #[test]
    fn test_find_client_by_addr_and_entity() {
        let mut manager = manager(2);
        let client_id1 = manager.add_client(test_addr(), ZoneId(1)).unwrap();
        let _client_id2 = manager.add_client(test_addr2(), ZoneId(1)).unwrap();

        assert_eq!(manager.find_client_by_addr(test_addr()), Some(client_id1));

        let unknown_addr: SocketAddr = "192.168.1.1:9999".parse().unwrap();
        assert_eq!(manager.find_client_by_addr(unknown_addr), None);

        manager.get_mut(client_id1).unwrap().entity_id = Some(EntityId(77));
        assert_eq!(manager.find_client_by_entity(EntityId(77)), Some(client_id1));
    }

    #[test]
    fn test_add_input_to_nonexistent_client() {
        let mut manager = manager(2);
        assert_eq!(
            manager.add_input(999, input(1, 100)),
            InputAdmission::UnknownClient
        );
    }

    #[test]
    fn test_get_chronological_inputs() {
        let mut manager = manager(3);
        let client_id1 = manager.add_client(test_addr(), ZoneId(1)).unwrap();
        let client_id2 = manager.add_client(test_addr2(), ZoneId(1)).unwrap();

        manager.add_input(client_id2, input(1, 50));
        manager.add_input(client_id1, input(2, 200));
        manager.add_input(client_id1, input(1, 100));

        let mut inputs = Vec::new();
        manager.get_chronological_inputs(&mut inputs);

        assert_eq!(inputs.len(), 3);
        assert_eq!((inputs[0].0, inputs[0].1.sequence), (client_id1, 1));
        assert_eq!((inputs[1].0, inputs[1].1.sequence), (client_id1, 2));
        assert_eq!((inputs[2].0, inputs[2].1.sequence), (client_id2, 1));
    }

    #[test]
    fn test_mark_and_cleanup_processed_inputs() {
        let mut manager = manager(1);
        let client_id = manager.add_client(test_addr(), ZoneId(1)).unwrap();
        manager.add_input(client_id, input(1, 0));
        manager.add_input(client_id, input(2, 0));

        manager.mark_input_processed(client_id, 1);
        manager.cleanup_processed_inputs();

        let session = manager.get(client_id).unwrap();
        assert_eq!(session.last_processed_input, 1);
        assert_eq!(session.pending_inputs.len(), 1);
        assert_eq!(session.pending_inputs[0].sequence, 2);
    }

    #[test]
    fn test_check_timeouts_returns_sessions() {
        let mut manager = manager(2);
        let client_id = manager.add_client(test_addr(), ZoneId(1)).unwrap();
        manager.get_mut(client_id).unwrap().last_seen = Instant::now() - Duration::from_secs(10);
        manager.add_client(test_addr2(), ZoneId(1)).unwrap();

        let removed = manager.check_timeouts();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, client_id);
        assert_eq!(manager.len(), 1);
    }
}
