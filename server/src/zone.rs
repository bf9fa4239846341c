//! One zone authority: the tick loop over the six core components
//!
//! Everything that reaches the zone from outside is queued as [`Inbound`] and
//! only consumed at the start of a tick. Everything the tick produces lands in
//! the [`Outbox`], which the network boundary dispatches after the tick.
//!
//! Phase order per tick: drain, movement, AOI, combat, boundary, dispatch.

use crate::aoi::AoiManager;
use crate::boundary::{BoundaryManager, Handoff};
use crate::client_manager::{ClientManager, InputAdmission};
use crate::combat::CombatResolver;
use crate::config::ZoneConfig;
use crate::context::{Outbox, TickContext};
use crate::error::{ConfigError, RegistryError};
use crate::history::PositionHistory;
use crate::movement::MovementValidator;
use crate::registry::{Authority, Components, EntityRegistry};
use crate::scheduler::{Phase, PhaseTimings, TickScheduler};
use log::{debug, info, warn};
use shared::{
    AttackRequest, ConnectionId, EntityId, Event, FixedVec3, InputState, Packet, ZoneMessage,
    PROTOCOL_VERSION,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Work queued for the next tick.
#[derive(Debug, Clone)]
pub enum Inbound {
    Packet { addr: SocketAddr, packet: Packet },
    /// The persistence worker finished writing a batch.
    PersistenceFlushed { records: usize },
}

pub struct ZoneAuthority {
    config: Arc<ZoneConfig>,
    tick: u64,
    registry: EntityRegistry,
    history: PositionHistory,
    clients: ClientManager,
    movement: MovementValidator,
    aoi: AoiManager,
    combat: CombatResolver,
    boundary: BoundaryManager,
    scheduler: TickScheduler,

    inbound: VecDeque<Inbound>,
    outbox: Outbox,
    timings: PhaseTimings,
    persisted_records: u64,

    // Reused per tick
    inputs: Vec<(ConnectionId, InputState)>,
    attacks: Vec<(ConnectionId, AttackRequest)>,
    zone_inbox: Vec<ZoneMessage>,
    handoffs: Vec<Handoff>,
    notices: Vec<Event>,
    observers: Vec<ConnectionId>,
    local: Vec<EntityId>,
}

impl ZoneAuthority {
    pub fn new(config: ZoneConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);

        Ok(Self {
            tick: 0,
            registry: EntityRegistry::new(config.zone.id, config.cell_size),
            history: PositionHistory::new(config.rewind_window_ticks()),
            clients: ClientManager::new(
                config.max_clients,
                Duration::from_secs(config.client_timeout_secs),
            ),
            movement: MovementValidator::new(&config),
            aoi: AoiManager::new(config.aoi_tiers.clone()),
            combat: CombatResolver::new(&config),
            boundary: BoundaryManager::new(&config),
            scheduler: TickScheduler::new(config.tick_period(), config.scheduler),
            inbound: VecDeque::new(),
            outbox: Outbox::default(),
            timings: PhaseTimings::default(),
            persisted_records: 0,
            inputs: Vec::new(),
            attacks: Vec::new(),
            zone_inbox: Vec::new(),
            handoffs: Vec::new(),
            notices: Vec::new(),
            observers: Vec::new(),
            local: Vec::new(),
            config,
        })
    }

    pub fn config(&self) -> &ZoneConfig {
        &self.config
    }

    /// Last completed tick.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn history(&self) -> &PositionHistory {
        &self.history
    }

    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    pub fn aoi(&self) -> &AoiManager {
        &self.aoi
    }

    pub fn boundary(&self) -> &BoundaryManager {
        &self.boundary
    }

    pub fn scheduler(&self) -> &TickScheduler {
        &self.scheduler
    }

    /// Output of the last tick.
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn timings(&self) -> &PhaseTimings {
        &self.timings
    }

    pub fn persisted_records(&self) -> u64 {
        self.persisted_records
    }

    /// Whether this zone is the single authority for `id` right now.
    ///
    /// A migrating entity is simulated here only as a fallback and does not
    /// count.
    pub fn is_authoritative(&self, id: EntityId) -> bool {
        self.registry
            .get(id)
            .is_some_and(|r| r.authority == Authority::Owned)
    }

    pub fn push(&mut self, inbound: Inbound) {
        self.inbound.push_back(inbound);
    }

    pub fn push_packet(&mut self, addr: SocketAddr, packet: Packet) {
        self.inbound.push_back(Inbound::Packet { addr, packet });
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    /// Spawns a non-player entity owned by this zone.
    pub fn spawn(&mut self, class_id: u8, position: FixedVec3) -> EntityId {
        let caps = self.config.class(class_id);
        let position = self.config.world.effective().clamp(&position);
        let id = self.registry.create(
            Components::new(caps.class_id, position, caps.max_health),
            self.tick,
        );
        self.history.record(id, self.tick, position, FixedVec3::ZERO);
        debug!("Spawned {} (class {}) at {:?}", id, caps.class_id, position);
        id
    }

    /// Removes an entity simulated here. Mirrors belong to their owner.
    pub fn despawn(&mut self, id: EntityId) -> Result<(), RegistryError> {
        let config = Arc::clone(&self.config);
        let ctx = TickContext::new(&config, self.tick);
        match self.registry.get(id) {
            None => Err(RegistryError::NotFound(id)),
            Some(record) if !record.authority.is_local() => Err(RegistryError::Mirrored(id)),
            Some(_) => {
                self.remove_entity(&ctx, id);
                Ok(())
            }
        }
    }

    /// Runs one full tick and returns what it produced.
    pub fn run_tick(&mut self) -> &Outbox {
        self.tick += 1;
        self.outbox.clear();
        self.timings.clear();

        let config = Arc::clone(&self.config);
        let ctx = TickContext::new(&config, self.tick);

        let started = Instant::now();
        self.drain(&ctx);
        self.timings.record(Phase::Drain, started.elapsed());

        let started = Instant::now();
        self.process_inputs(&ctx);
        self.timings.record(Phase::Movement, started.elapsed());

        let started = Instant::now();
        let clients = &self.clients;
        self.aoi.update(
            &ctx,
            &self.registry,
            |connection| {
                clients
                    .get(connection)
                    .map(|s| s.last_processed_input)
                    .unwrap_or(0)
            },
            &mut self.outbox,
        );
        self.timings.record(Phase::Aoi, started.elapsed());

        let started = Instant::now();
        self.resolve_attacks(&ctx);
        self.timings.record(Phase::Combat, started.elapsed());

        let started = Instant::now();
        self.run_boundary(&ctx);
        self.timings.record(Phase::Boundary, started.elapsed());

        let started = Instant::now();
        self.publish_notices();
        self.apply_handoffs(&ctx);
        if ctx.tick % ctx.config.tick_rate.max(1) as u64 == 0 {
            let server_time = ctx.now_ms();
            for session in self.clients.iter() {
                self.outbox
                    .control
                    .push((session.addr, Packet::Ping { server_time }));
            }
        }
        self.timings.record(Phase::Dispatch, started.elapsed());

        let decision = self.scheduler.observe(
            ctx.tick,
            &self.timings,
            self.registry.cell_size(),
            &mut self.outbox.signals,
        );
        if let Some(level) = decision.degradation {
            self.aoi.set_degradation(level);
        }
        if let Some(cell_size) = decision.widen_cells_to {
            self.registry.rebuild_index(cell_size);
        }

        // Periodic performance monitoring
        if ctx.tick % 60 == 0 {
            debug!(
                "Tick {}: {} entities ({} owned, {} mirrors), {} clients, {} migrations in flight, {}us",
                ctx.tick,
                self.registry.len(),
                self.registry.owned_count(),
                self.registry.mirror_count(),
                self.clients.len(),
                self.boundary.in_flight(),
                self.timings.total().as_micros()
            );
        }

        &self.outbox
    }

    fn drain(&mut self, ctx: &TickContext) {
        while let Some(inbound) = self.inbound.pop_front() {
            match inbound {
                Inbound::Packet { addr, packet } => self.handle_packet(ctx, addr, packet),
                Inbound::PersistenceFlushed { records } => {
                    self.persisted_records += records as u64;
                }
            }
        }

        if ctx.tick % ctx.config.tick_rate.max(1) as u64 == 0 {
            for session in self.clients.check_timeouts() {
                self.aoi.remove_observer(session.id, &mut self.outbox);
                if let Some(entity) = session.entity_id {
                    self.release_entity(ctx, session.id, entity);
                }
            }
        }
    }

    /// Processes one packet from a client or a neighbouring zone.
    fn handle_packet(&mut self, ctx: &TickContext, addr: SocketAddr, packet: Packet) {
        match packet {
            Packet::Connect {
                client_version,
                class_id,
            } => {
                info!(
                    "Client connecting from {} (version: {}, class: {})",
                    addr, client_version, class_id
                );
                if client_version != PROTOCOL_VERSION {
                    self.refuse(addr, "Incompatible protocol version");
                    return;
                }
                if let Some(existing) = self.clients.find_client_by_addr(addr) {
                    info!("Removing existing client {} from {}", existing, addr);
                    self.disconnect(ctx, existing);
                }
                let connection = match self.clients.add_client(addr, ctx.zone_id()) {
                    Some(connection) => connection,
                    None => {
                        self.refuse(addr, "Server full");
                        return;
                    }
                };

                let caps = ctx.config.class(class_id);
                let mut components =
                    Components::new(caps.class_id, ctx.zone.spawn_point, caps.max_health);
                components.player_controlled = true;
                let entity_id = self.registry.create(components, ctx.tick);
                self.history
                    .record(entity_id, ctx.tick, ctx.zone.spawn_point, FixedVec3::ZERO);
                self.attach(ctx, connection, addr, entity_id);
            }

            Packet::Reattach {
                client_version,
                entity_id,
            } => {
                let claimable = self.registry.get(entity_id).is_some_and(|r| {
                    r.authority == Authority::Owned && r.player_controlled && r.connection.is_none()
                });
                if client_version != PROTOCOL_VERSION || !claimable {
                    warn!("Refusing reattach of {} from {}", entity_id, addr);
                    self.refuse(addr, "Entity not available");
                    return;
                }
                if let Some(existing) = self.clients.find_client_by_addr(addr) {
                    self.disconnect(ctx, existing);
                }
                match self.clients.add_client(addr, ctx.zone_id()) {
                    Some(connection) => {
                        info!("Client {} reattached to {}", connection, entity_id);
                        self.attach(ctx, connection, addr, entity_id);
                    }
                    None => self.refuse(addr, "Server full"),
                }
            }

            Packet::Input(input) => {
                let connection = match self.clients.find_client_by_addr(addr) {
                    Some(connection) => connection,
                    None => return,
                };
                if self.clients.add_input(connection, input) == InputAdmission::Overflow {
                    if let Some(session) = self.clients.get_mut(connection) {
                        session.violations.protocol += 1;
                    }
                }
            }

            Packet::Attack(attack) => {
                let connection = match self.clients.find_client_by_addr(addr) {
                    Some(connection) => connection,
                    None => return,
                };
                if let Some(session) = self.clients.get_mut(connection) {
                    session.last_seen = Instant::now();
                    if session.entity_id == Some(attack.attacker) {
                        self.attacks.push((connection, attack));
                    } else {
                        session.violations.protocol += 1;
                        warn!(
                            "Client {} attacked as {} which it does not control",
                            connection, attack.attacker
                        );
                    }
                }
            }

            Packet::Pong { server_time } => {
                if let Some(connection) = self.clients.find_client_by_addr(addr) {
                    if let Some(session) = self.clients.get_mut(connection) {
                        session.record_rtt(ctx.now_ms().saturating_sub(server_time));
                    }
                }
            }

            Packet::Disconnect => {
                if let Some(connection) = self.clients.find_client_by_addr(addr) {
                    self.disconnect(ctx, connection);
                }
            }

            Packet::Zone(message) => self.zone_inbox.push(message),

            _ => {
                warn!("Unexpected packet type from {}", addr);
            }
        }
    }

    fn refuse(&mut self, addr: SocketAddr, reason: &str) {
        self.outbox.control.push((
            addr,
            Packet::Disconnected {
                reason: reason.to_string(),
            },
        ));
    }

    fn attach(
        &mut self,
        ctx: &TickContext,
        connection: ConnectionId,
        addr: SocketAddr,
        entity_id: EntityId,
    ) {
        if let Some(record) = self.registry.get_mut(entity_id) {
            record.connection = Some(connection);
        }
        if let Some(session) = self.clients.get_mut(connection) {
            session.entity_id = Some(entity_id);
        }
        self.aoi.add_observer(connection, entity_id);
        self.outbox.control.push((
            addr,
            Packet::Connected {
                connection_id: connection,
                entity_id,
                zone: ctx.zone_id(),
            },
        ));
    }

    fn disconnect(&mut self, ctx: &TickContext, connection: ConnectionId) {
        self.aoi.remove_observer(connection, &mut self.outbox);
        if let Some(session) = self.clients.remove_client(&connection) {
            if let Some(entity) = session.entity_id {
                self.release_entity(ctx, connection, entity);
            }
        }
    }

    /// Despawns a departed player's entity if it is still controlled here.
    fn release_entity(&mut self, ctx: &TickContext, connection: ConnectionId, entity: EntityId) {
        let controlled = self.registry.get(entity).is_some_and(|r| {
            r.authority.is_local() && r.connection == Some(connection)
        });
        if controlled {
            self.remove_entity(ctx, entity);
        }
    }

    fn remove_entity(&mut self, ctx: &TickContext, id: EntityId) {
        if self.registry.destroy(id).is_ok() {
            self.history.forget(id);
            self.boundary.entity_removed(ctx, id, &mut self.outbox);
            debug!("Despawned {}", id);
        }
    }

    fn process_inputs(&mut self, ctx: &TickContext) {
        let mut inputs = std::mem::take(&mut self.inputs);
        self.clients.get_chronological_inputs(&mut inputs);

        for (connection, input) in &inputs {
            if let Some(session) = self.clients.get_mut(*connection) {
                self.movement.apply(
                    ctx,
                    &mut self.registry,
                    &mut self.history,
                    session,
                    input,
                    &mut self.outbox,
                );
            }
            self.clients.mark_input_processed(*connection, input.sequence);
        }
        self.clients.cleanup_processed_inputs();
        self.inputs = inputs;

        // Every simulated entity gets a sample, moved or not
        self.registry.local_ids(&mut self.local);
        for id in &self.local {
            if let Some(record) = self.registry.get(*id) {
                self.history
                    .record(*id, ctx.tick, record.position(), record.velocity);
            }
        }
    }

    fn resolve_attacks(&mut self, ctx: &TickContext) {
        let mut attacks = std::mem::take(&mut self.attacks);
        let aoi = &self.aoi;

        for (connection, attack) in attacks.drain(..) {
            let delay = self
                .clients
                .get(connection)
                .map(|s| s.one_way_delay_ms())
                .unwrap_or(0);
            self.combat.resolve(
                ctx,
                &mut self.registry,
                &self.history,
                |id, out| aoi.observers_of(id, out),
                connection,
                delay,
                &attack,
                &mut self.outbox,
            );
        }
        self.attacks = attacks;
    }

    fn run_boundary(&mut self, ctx: &TickContext) {
        let mut inbox = std::mem::take(&mut self.zone_inbox);
        for message in inbox.drain(..) {
            self.boundary.handle_message(
                ctx,
                &mut self.registry,
                &mut self.history,
                message,
                &mut self.outbox,
                &mut self.handoffs,
            );
        }
        self.zone_inbox = inbox;

        self.boundary
            .detect_crossings(ctx, &mut self.registry, &mut self.outbox);
        self.boundary
            .expire(ctx, &mut self.registry, &mut self.outbox);
        self.boundary
            .collect_mirrors(ctx, &self.registry, &mut self.outbox);
    }

    /// Sends migration events to everyone watching the entity.
    fn publish_notices(&mut self) {
        self.boundary.drain_notices(&mut self.notices);
        for event in self.notices.drain(..) {
            self.aoi.observers_of(event.entity_id, &mut self.observers);
            if let Some(controller) = self.clients.find_client_by_entity(event.entity_id) {
                if !self.observers.contains(&controller) {
                    self.observers.push(controller);
                }
            }
            for connection in &self.observers {
                self.outbox.events.push((*connection, event.clone()));
            }
        }
    }

    /// Points sessions whose entity changed owner at the new authority.
    fn apply_handoffs(&mut self, ctx: &TickContext) {
        let mut handoffs = std::mem::take(&mut self.handoffs);
        for handoff in handoffs.drain(..) {
            let connection = match self.clients.find_client_by_entity(handoff.entity_id) {
                Some(connection) => connection,
                None => continue,
            };
            let address = match ctx.zone.neighbor(handoff.destination) {
                Some(neighbor) => neighbor.address.clone(),
                None => {
                    warn!(
                        "No address for {}, cannot redirect client {}",
                        handoff.destination, connection
                    );
                    continue;
                }
            };

            if let Some(addr) = self.clients.addr_of(connection) {
                self.outbox.control.push((
                    addr,
                    Packet::Redirect {
                        zone: handoff.destination,
                        address,
                    },
                ));
            }
            self.aoi.remove_observer(connection, &mut self.outbox);
            if let Some(mut session) = self.clients.remove_client(&connection) {
                session.zone = handoff.destination;
                info!(
                    "Client {} redirected to {} with {}",
                    connection, session.zone, handoff.entity_id
                );
            }
        }
        self.handoffs = handoffs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{units, EventKind};
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn connect(zone: &mut ZoneAuthority, port: u16) -> (ConnectionId, EntityId) {
        zone.push_packet(
            addr(port),
            Packet::Connect {
                client_version: PROTOCOL_VERSION,
                class_id: 0,
            },
        );
        let outbox = zone.run_tick();
        outbox
            .control
            .iter()
            .find_map(|(a, p)| match p {
                Packet::Connected {
                    connection_id,
                    entity_id,
                    ..
                } if *a == addr(port) => Some((*connection_id, *entity_id)),
                _ => None,
            })
            .expect("connected reply")
    }

    fn input(entity_id: EntityId, sequence: u32, dx: i32) -> Packet {
        Packet::Input(InputState {
            entity_id,
            sequence,
            move_vector: FixedVec3::new(dx, 0, 0),
            facing: 0,
            action_flags: 0,
            client_time: 0,
        })
    }

    #[test]
    fn test_connect_spawns_player() {
        let mut zone = ZoneAuthority::new(ZoneConfig::default()).unwrap();
        let (connection, entity) = connect(&mut zone, 5000);

        assert!(zone.is_authoritative(entity));
        let record = zone.registry().get(entity).unwrap();
        assert_eq!(record.connection, Some(connection));
        assert!(record.player_controlled);
        assert_eq!(record.position(), zone.config().zone.spawn_point);
        assert!(zone.aoi().observer(connection).is_some());
        assert_eq!(zone.clients().len(), 1);
    }

    #[test]
    fn test_wrong_version_refused() {
        let mut zone = ZoneAuthority::new(ZoneConfig::default()).unwrap();
        zone.push_packet(
            addr(5000),
            Packet::Connect {
                client_version: PROTOCOL_VERSION + 1,
                class_id: 0,
            },
        );
        let outbox = zone.run_tick();
        assert!(matches!(
            outbox.control[0].1,
            Packet::Disconnected { .. }
        ));
        assert!(zone.clients().is_empty());
    }

    #[test]
    fn test_server_full() {
        let mut config = ZoneConfig::default();
        config.max_clients = 1;
        let mut zone = ZoneAuthority::new(config).unwrap();
        connect(&mut zone, 5000);

        zone.push_packet(
            addr(5001),
            Packet::Connect {
                client_version: PROTOCOL_VERSION,
                class_id: 0,
            },
        );
        let outbox = zone.run_tick();
        match &outbox.control[0].1 {
            Packet::Disconnected { reason } => assert_eq!(reason, "Server full"),
            other => panic!("Unexpected packet {:?}", other),
        }
        assert_eq!(zone.registry().len(), 1);
    }

    #[test]
    fn test_input_moves_player_and_acknowledges() {
        let mut zone = ZoneAuthority::new(ZoneConfig::default()).unwrap();
        let (connection, entity) = connect(&mut zone, 5000);
        let start = zone.registry().get(entity).unwrap().position();

        // Class 0 runs 6 m/s; 50 mm per tick is well inside the cap
        zone.push_packet(addr(5000), input(entity, 1, 50));
        let acknowledged = zone
            .run_tick()
            .snapshot_for(connection)
            .unwrap()
            .last_processed_input;
        assert_eq!(acknowledged, 1);

        let moved = zone.registry().get(entity).unwrap().position();
        assert_eq!(moved, start + FixedVec3::new(50, 0, 0));
        assert_eq!(zone.clients().get(connection).unwrap().last_processed_input, 1);
    }

    #[test]
    fn test_disconnect_despawns_player() {
        let mut zone = ZoneAuthority::new(ZoneConfig::default()).unwrap();
        let (_, entity) = connect(&mut zone, 5000);
        let (watcher, _) = connect(&mut zone, 5001);
        zone.run_tick();
        assert!(zone.aoi().observer(watcher).unwrap().sees(entity));

        zone.push_packet(addr(5000), Packet::Disconnect);
        let despawned = zone
            .run_tick()
            .events_for(watcher)
            .any(|e| e.entity_id == entity && e.kind == EventKind::Despawn);
        assert!(despawned);
        assert!(zone.registry().get(entity).is_none());
        assert_eq!(zone.clients().len(), 1);
    }

    #[test]
    fn test_pong_updates_rtt() {
        let mut zone = ZoneAuthority::new(ZoneConfig::default()).unwrap();
        let (connection, _) = connect(&mut zone, 5000);
        for _ in 0..59 {
            zone.run_tick();
        }
        // Tick 60 is 1000ms; a pong for a 900ms ping means 100ms RTT
        zone.push_packet(addr(5000), Packet::Pong { server_time: 900 });
        zone.run_tick();
        let session = zone.clients().get(connection).unwrap();
        assert!(session.rtt_ms.is_some());
        assert_eq!(session.one_way_delay_ms(), (1016 - 900) / 2);
    }

    #[test]
    fn test_spawn_and_despawn_npc() {
        let mut zone = ZoneAuthority::new(ZoneConfig::default()).unwrap();
        let id = zone.spawn(1, FixedVec3::new(units(10) as i32, 0, 0));
        assert!(zone.is_authoritative(id));
        assert_eq!(zone.registry().get(id).unwrap().max_health, 700);

        zone.despawn(id).unwrap();
        assert!(!zone.is_authoritative(id));
        assert_eq!(zone.despawn(id), Err(RegistryError::NotFound(id)));
    }

    #[test]
    fn test_attack_for_foreign_entity_is_violation() {
        let mut zone = ZoneAuthority::new(ZoneConfig::default()).unwrap();
        let (connection, _) = connect(&mut zone, 5000);
        let npc = zone.spawn(0, zone.config().zone.spawn_point);

        zone.push_packet(
            addr(5000),
            Packet::Attack(AttackRequest {
                attacker: npc,
                target: npc,
                weapon_slot: 0,
                aim: FixedVec3::new(1, 0, 0),
                sequence: 1,
                client_time: 0,
            }),
        );
        zone.run_tick();
        assert_eq!(
            zone.clients().get(connection).unwrap().violations.protocol,
            1
        );
    }

    #[test]
    fn test_persistence_flush_is_counted() {
        let mut zone = ZoneAuthority::new(ZoneConfig::default()).unwrap();
        zone.push(Inbound::PersistenceFlushed { records: 12 });
        zone.run_tick();
        assert_eq!(zone.persisted_records(), 12);
    }
}
