//! Zone boundary management: aura projection and entity migration
//!
//! Mirrors: every tick the zone sends each neighbour the full set of local
//! entities inside that neighbour's overlap margin. The receiver upserts them
//! as read-only shadows and drops shadows that are no longer listed.
//!
//! Migration, per entity:
//!
//! ```text
//!   Owned --cross margin--> Migrating (PENDING_ACK) --ACK--> Mirror   (COMPLETE)
//!                                   |--NACK / timeout--> Owned        (ABORTED)
//! ```
//!
//! The destination validates the snapshot and answers ACK or NACK, caching its
//! decision so a duplicate INITIATED gets the same answer. A source that times
//! out sends ABORT, which demotes a destination that accepted late. Resolved
//! tickets are kept for a while so late or duplicated replies are ignored.

use crate::config::{MigrationConfig, ZoneConfig};
use crate::context::{Outbox, TickContext};
use crate::error::MigrationError;
use crate::history::PositionHistory;
use crate::persistence::{MigrationOutcome, PersistenceRecord};
use crate::registry::{Authority, Components, EntityRegistry};
use crate::spatial::Region;
use log::{debug, info, warn};
use shared::{
    AbortReason, EntityId, Event, EventKind, FixedVec3, MigrationStatus, MigrationTicket,
    MirrorState, NackReason, TicketId, ZoneId, ZoneMessage,
};
use std::collections::{BTreeMap, HashMap};

/// Ticks between retransmissions of an unanswered INITIATED or an ABORT.
pub const RESEND_EVERY_TICKS: u64 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationStats {
    pub started: u64,
    pub completed: u64,
    pub refused: u64,
    pub timed_out: u64,
    pub accepted: u64,
    pub demoted: u64,
}

/// Session-level consequence of a handoff, carried out by the zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handoff {
    pub entity_id: EntityId,
    /// Zone now authoritative for the entity.
    pub destination: ZoneId,
}

#[derive(Debug, Clone)]
struct Outgoing {
    ticket: MigrationTicket,
    resolved_tick: Option<u64>,
    last_sent_tick: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Accepted,
    Refused(NackReason),
    /// The source aborted; the ticket is dead here.
    Withdrawn,
}

#[derive(Debug, Clone, Copy)]
struct Incoming {
    entity_id: EntityId,
    decision: Decision,
    decided_tick: u64,
}

pub struct BoundaryManager {
    policy: MigrationConfig,
    next_ticket: u32,
    outgoing: BTreeMap<TicketId, Outgoing>,
    incoming: HashMap<TicketId, Incoming>,
    in_flight: HashMap<EntityId, TicketId>,
    retry_after: HashMap<EntityId, u64>,
    last_mirror_tick: HashMap<ZoneId, u64>,
    stats: MigrationStats,
    notices: Vec<Event>,
    scratch: Vec<EntityId>,
    crossings: Vec<(EntityId, ZoneId)>,
    timed_out: Vec<(TicketId, EntityId, ZoneId)>,
}

impl BoundaryManager {
    pub fn new(config: &ZoneConfig) -> Self {
        Self {
            policy: config.migration,
            next_ticket: 1,
            outgoing: BTreeMap::new(),
            incoming: HashMap::new(),
            in_flight: HashMap::new(),
            retry_after: HashMap::new(),
            last_mirror_tick: HashMap::new(),
            stats: MigrationStats::default(),
            notices: Vec::new(),
            scratch: Vec::new(),
            crossings: Vec::new(),
            timed_out: Vec::new(),
        }
    }

    pub fn stats(&self) -> MigrationStats {
        self.stats
    }

    /// Migrations awaiting an answer.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn ticket(&self, id: TicketId) -> Option<&MigrationTicket> {
        self.outgoing.get(&id).map(|o| &o.ticket)
    }

    pub fn ticket_for(&self, entity: EntityId) -> Option<TicketId> {
        self.in_flight.get(&entity).copied()
    }

    /// Retained outgoing tickets, resolved or not.
    pub fn retained_tickets(&self) -> usize {
        self.outgoing.len()
    }

    /// Events about migrations since the last call, for the zone to fan out.
    pub fn drain_notices(&mut self, out: &mut Vec<Event>) {
        out.append(&mut self.notices);
    }

    /// Applies one message from a neighbour.
    pub fn handle_message(
        &mut self,
        ctx: &TickContext,
        registry: &mut EntityRegistry,
        history: &mut PositionHistory,
        message: ZoneMessage,
        outbox: &mut Outbox,
        handoffs: &mut Vec<Handoff>,
    ) {
        match message {
            ZoneMessage::MigrationInitiated(ticket) => {
                self.on_initiated(ctx, registry, history, ticket, outbox)
            }
            ZoneMessage::MigrationAck { ticket, entity_id } => {
                self.on_ack(ctx, registry, history, ticket, entity_id, outbox, handoffs)
            }
            ZoneMessage::MigrationNack {
                ticket,
                entity_id,
                reason,
            } => self.on_nack(ctx, registry, ticket, entity_id, reason, outbox),
            ZoneMessage::MigrationAbort { ticket, entity_id } => {
                self.on_abort(ctx, registry, history, ticket, entity_id, handoffs)
            }
            ZoneMessage::MirrorUpdate {
                from,
                tick,
                entities,
            } => self.apply_mirror_update(ctx, registry, from, tick, &entities),
        }
    }

    fn validate(
        &self,
        ctx: &TickContext,
        registry: &EntityRegistry,
        ticket: &MigrationTicket,
    ) -> Result<(), MigrationError> {
        let snapshot = &ticket.snapshot;
        if ticket.destination != ctx.zone_id() {
            return Err(MigrationError::WrongDestination(ticket.entity_id));
        }
        if snapshot.entity_id != ticket.entity_id
            || snapshot.max_health <= 0
            || snapshot.health < 0
            || snapshot.health > snapshot.max_health
            || !ctx.config.world.effective().contains(&snapshot.position)
        {
            return Err(MigrationError::Malformed(ticket.entity_id));
        }
        if !ctx.zone.bounds.contains(&snapshot.position) {
            return Err(MigrationError::OutOfBounds(ticket.entity_id));
        }
        match registry.get(ticket.entity_id) {
            Some(record) if record.authority.is_local() => {
                Err(MigrationError::DuplicateEntity(ticket.entity_id))
            }
            _ => Ok(()),
        }
    }

    fn on_initiated(
        &mut self,
        ctx: &TickContext,
        registry: &mut EntityRegistry,
        history: &mut PositionHistory,
        ticket: MigrationTicket,
        outbox: &mut Outbox,
    ) {
        let source = ticket.source;
        if let Some(previous) = self.incoming.get(&ticket.id) {
            let reply = match previous.decision {
                Decision::Accepted => ZoneMessage::MigrationAck {
                    ticket: ticket.id,
                    entity_id: previous.entity_id,
                },
                Decision::Refused(reason) => ZoneMessage::MigrationNack {
                    ticket: ticket.id,
                    entity_id: previous.entity_id,
                    reason,
                },
                Decision::Withdrawn => return,
            };
            debug!("Repeating decision for duplicate {}", ticket.id);
            outbox.zone_messages.push((source, reply));
            return;
        }

        let decision = match self.validate(ctx, registry, &ticket) {
            Ok(()) => {
                let id = ticket.entity_id;
                if registry.get(id).is_some() {
                    // Promote the shadow we were mirroring
                    if let Err(e) = registry.destroy(id) {
                        warn!("Could not drop mirror of {} before adoption: {}", id, e);
                    }
                }
                let components = Components::from_snapshot(&ticket.snapshot);
                let position = components.position;
                let velocity = components.velocity;
                if let Err(e) = registry.insert_with_id(id, components, Authority::Owned, ctx.tick) {
                    warn!("Could not adopt {} from {}: {}", id, ticket.id, e);
                    return;
                }
                history.record(id, ctx.tick, position, velocity);
                self.stats.accepted += 1;
                info!("Accepted {} for {} from {}", ticket.id, id, source);
                outbox.zone_messages.push((
                    source,
                    ZoneMessage::MigrationAck {
                        ticket: ticket.id,
                        entity_id: id,
                    },
                ));
                Decision::Accepted
            }
            Err(error) => {
                let reason = error.nack_reason();
                warn!("Refusing {} from {}: {}", ticket.id, source, error);
                outbox.zone_messages.push((
                    source,
                    ZoneMessage::MigrationNack {
                        ticket: ticket.id,
                        entity_id: ticket.entity_id,
                        reason,
                    },
                ));
                Decision::Refused(reason)
            }
        };

        outbox.persistence.push(PersistenceRecord::Migration {
            tick: ctx.tick,
            zone: ctx.zone_id(),
            ticket: ticket.id,
            entity: ticket.entity_id,
            source,
            destination: ticket.destination,
            outcome: match decision {
                Decision::Accepted => MigrationOutcome::Accepted,
                _ => MigrationOutcome::Refused,
            },
        });
        self.incoming.insert(
            ticket.id,
            Incoming {
                entity_id: ticket.entity_id,
                decision,
                decided_tick: ctx.tick,
            },
        );
    }

    /// Looks up an outgoing ticket still waiting for its answer.
    fn pending(&mut self, ticket: TicketId, entity_id: EntityId) -> Option<&mut Outgoing> {
        match self.outgoing.get_mut(&ticket) {
            Some(outgoing)
                if !outgoing.ticket.status.is_terminal()
                    && outgoing.ticket.entity_id == entity_id =>
            {
                Some(outgoing)
            }
            _ => {
                debug!("Ignoring reply for resolved or unknown {}", ticket);
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_ack(
        &mut self,
        ctx: &TickContext,
        registry: &mut EntityRegistry,
        history: &mut PositionHistory,
        ticket: TicketId,
        entity_id: EntityId,
        outbox: &mut Outbox,
        handoffs: &mut Vec<Handoff>,
    ) {
        let outgoing = match self.pending(ticket, entity_id) {
            Some(outgoing) => outgoing,
            None => return,
        };
        outgoing.ticket.status = MigrationStatus::Complete;
        outgoing.resolved_tick = Some(ctx.tick);
        let destination = outgoing.ticket.destination;
        self.in_flight.remove(&entity_id);

        let player = registry
            .get(entity_id)
            .map(|r| r.player_controlled)
            .unwrap_or(false);
        if registry
            .set_authority(
                entity_id,
                Authority::Mirror {
                    owner: destination,
                },
            )
            .is_ok()
        {
            history.forget(entity_id);
        }
        if player {
            handoffs.push(Handoff {
                entity_id,
                destination,
            });
        }

        self.stats.completed += 1;
        info!("{} complete: {} now owned by {}", ticket, entity_id, destination);
        self.notices.push(Event::new(
            entity_id,
            EventKind::MigrationCompleted { destination },
        ));
        outbox.persistence.push(PersistenceRecord::Migration {
            tick: ctx.tick,
            zone: ctx.zone_id(),
            ticket,
            entity: entity_id,
            source: ctx.zone_id(),
            destination,
            outcome: MigrationOutcome::Completed,
        });
    }

    fn on_nack(
        &mut self,
        ctx: &TickContext,
        registry: &mut EntityRegistry,
        ticket: TicketId,
        entity_id: EntityId,
        reason: NackReason,
        outbox: &mut Outbox,
    ) {
        let outgoing = match self.pending(ticket, entity_id) {
            Some(outgoing) => outgoing,
            None => return,
        };
        outgoing.ticket.status = MigrationStatus::Aborted(AbortReason::Nacked(reason));
        outgoing.resolved_tick = Some(ctx.tick);
        let destination = outgoing.ticket.destination;

        warn!("{} refused by {}: {:?}", ticket, destination, reason);
        self.stats.refused += 1;
        self.restore(
            ctx,
            registry,
            (ticket, entity_id, destination),
            MigrationOutcome::Aborted,
            outbox,
        );
    }

    /// Returns an aborted migration's entity to local ownership.
    fn restore(
        &mut self,
        ctx: &TickContext,
        registry: &mut EntityRegistry,
        (ticket, entity_id, destination): (TicketId, EntityId, ZoneId),
        outcome: MigrationOutcome,
        outbox: &mut Outbox,
    ) {
        self.in_flight.remove(&entity_id);
        self.retry_after.insert(
            entity_id,
            ctx.tick + self.policy.retry_cooldown_ticks as u64,
        );
        if let Some(record) = registry.get(entity_id) {
            if record.authority
                == (Authority::Migrating {
                    ticket,
                    destination,
                })
            {
                if let Err(e) = registry.set_authority(entity_id, Authority::Owned) {
                    warn!("Could not restore ownership of {} after {}: {}", entity_id, ticket, e);
                }
            }
        }
        self.notices.push(Event::new(
            entity_id,
            EventKind::MigrationAborted { destination },
        ));
        outbox.persistence.push(PersistenceRecord::Migration {
            tick: ctx.tick,
            zone: ctx.zone_id(),
            ticket,
            entity: entity_id,
            source: ctx.zone_id(),
            destination,
            outcome,
        });
    }

    fn on_abort(
        &mut self,
        ctx: &TickContext,
        registry: &mut EntityRegistry,
        history: &mut PositionHistory,
        ticket: TicketId,
        entity_id: EntityId,
        handoffs: &mut Vec<Handoff>,
    ) {
        let entry = self.incoming.entry(ticket).or_insert(Incoming {
            entity_id,
            decision: Decision::Withdrawn,
            decided_tick: ctx.tick,
        });
        if entry.decision != Decision::Accepted {
            entry.decision = Decision::Withdrawn;
            return;
        }
        entry.decision = Decision::Withdrawn;
        entry.decided_tick = ctx.tick;

        let (owned, player) = match registry.get(entity_id) {
            Some(record) => (
                record.authority == Authority::Owned,
                record.connection.is_some(),
            ),
            None => (false, false),
        };
        if !owned {
            return;
        }
        let source = ticket.source;
        if registry
            .set_authority(entity_id, Authority::Mirror { owner: source })
            .is_ok()
        {
            history.forget(entity_id);
            self.stats.demoted += 1;
            warn!("{} aborted by {}, demoted {} to mirror", ticket, source, entity_id);
            if player {
                handoffs.push(Handoff {
                    entity_id,
                    destination: source,
                });
            }
        }
    }

    /// Upserts a neighbour's mirror set and drops its shadows no longer listed.
    pub fn apply_mirror_update(
        &mut self,
        ctx: &TickContext,
        registry: &mut EntityRegistry,
        from: ZoneId,
        tick: u64,
        entities: &[MirrorState],
    ) {
        let last = self.last_mirror_tick.entry(from).or_insert(0);
        if tick < *last {
            debug!("Dropping stale mirror update from {} ({} < {})", from, tick, last);
            return;
        }
        *last = tick;

        for state in entities {
            match registry.get(state.entity_id) {
                None => {
                    if let Err(e) = registry.insert_with_id(
                        state.entity_id,
                        Components::from_mirror(state),
                        Authority::Mirror { owner: from },
                        ctx.tick,
                    ) {
                        warn!("Could not mirror {} from {}: {}", state.entity_id, from, e);
                        continue;
                    }
                    if let Some(record) = registry.get_mut(state.entity_id) {
                        record.animation = state.animation;
                    }
                }
                Some(record) if !record.authority.is_local() => {
                    if record.authority != (Authority::Mirror { owner: from }) {
                        if let Err(e) = registry
                            .set_authority(state.entity_id, Authority::Mirror { owner: from })
                        {
                            warn!("Could not rehome mirror {} to {}: {}", state.entity_id, from, e);
                        }
                    }
                    if let Err(e) = registry.apply_mirror(state) {
                        warn!("Could not update mirror {} from {}: {}", state.entity_id, from, e);
                    }
                }
                // Never overwrite an entity simulated here
                Some(_) => {}
            }
        }

        self.scratch.clear();
        self.scratch.extend(
            registry
                .iter()
                .filter(|r| r.authority == Authority::Mirror { owner: from })
                .map(|r| r.id())
                .filter(|id| !entities.iter().any(|s| s.entity_id == *id)),
        );
        for id in self.scratch.drain(..) {
            if let Err(e) = registry.destroy(id) {
                warn!("Could not drop stale mirror {} of {}: {}", id, from, e);
            }
        }
    }

    /// Sends each neighbour the local entities inside its overlap margin.
    pub fn collect_mirrors(
        &mut self,
        ctx: &TickContext,
        registry: &EntityRegistry,
        outbox: &mut Outbox,
    ) {
        let margin = ctx.zone.overlap_margin.max(0);
        let margin_sq = margin as i64 * margin as i64;
        let world = ctx.config.world.effective();

        for neighbor in &ctx.zone.neighbors {
            let b = &neighbor.bounds;
            let region = Region::Box {
                min: FixedVec3::new(
                    b.min_x.saturating_sub(margin),
                    world.min.y,
                    b.min_z.saturating_sub(margin),
                ),
                max: FixedVec3::new(
                    b.max_x.saturating_add(margin),
                    world.max.y,
                    b.max_z.saturating_add(margin),
                ),
            };
            registry.query(&region, &mut self.scratch);

            let mut entities = outbox.take_mirror_buffer();
            entities.extend(
                self.scratch
                    .iter()
                    .filter_map(|id| registry.get(*id))
                    .filter(|r| r.authority.is_local())
                    .filter(|r| b.distance_sq(&r.position()) <= margin_sq)
                    .map(|r| r.mirror_state()),
            );

            outbox.zone_messages.push((
                neighbor.id,
                ZoneMessage::MirrorUpdate {
                    from: ctx.zone_id(),
                    tick: ctx.tick,
                    entities,
                },
            ));
        }
        self.scratch.clear();
    }

    /// Starts a migration for every owned entity that crossed fully past the
    /// overlap margin into a neighbour's bounds.
    pub fn detect_crossings(
        &mut self,
        ctx: &TickContext,
        registry: &mut EntityRegistry,
        outbox: &mut Outbox,
    ) {
        let margin = ctx.zone.overlap_margin.max(0) as i64;
        let mut crossings = std::mem::take(&mut self.crossings);
        crossings.clear();

        for record in registry.iter() {
            if record.authority != Authority::Owned {
                continue;
            }
            let position = record.position();
            if ctx.zone.bounds.contains(&position) {
                continue;
            }
            if self
                .retry_after
                .get(&record.id())
                .is_some_and(|until| ctx.tick < *until)
            {
                continue;
            }
            if let Some(neighbor) = ctx
                .zone
                .neighbors
                .iter()
                .find(|n| n.bounds.depth(&position) >= margin)
            {
                crossings.push((record.id(), neighbor.id));
            }
        }

        for &(entity_id, destination) in &crossings {
            self.initiate(ctx, registry, entity_id, destination, outbox);
        }
        self.crossings = crossings;
    }

    /// Creates a ticket for `entity_id` and sends it to `destination`.
    pub fn initiate(
        &mut self,
        ctx: &TickContext,
        registry: &mut EntityRegistry,
        entity_id: EntityId,
        destination: ZoneId,
        outbox: &mut Outbox,
    ) -> Option<TicketId> {
        if self.in_flight.contains_key(&entity_id) {
            return None;
        }
        let snapshot = registry.get(entity_id)?.migration_snapshot();
        let id = TicketId {
            source: ctx.zone_id(),
            sequence: self.next_ticket,
        };
        self.next_ticket = self.next_ticket.wrapping_add(1);

        registry
            .set_authority(
                entity_id,
                Authority::Migrating {
                    ticket: id,
                    destination,
                },
            )
            .ok()?;

        let ticket = MigrationTicket {
            id,
            entity_id,
            source: ctx.zone_id(),
            destination,
            snapshot,
            status: MigrationStatus::Initiated,
        };
        outbox
            .zone_messages
            .push((destination, ZoneMessage::MigrationInitiated(ticket.clone())));

        let mut local = ticket;
        local.status = MigrationStatus::PendingAck {
            deadline_tick: ctx.tick + self.policy.timeout_ticks as u64,
        };
        self.outgoing.insert(
            id,
            Outgoing {
                ticket: local,
                resolved_tick: None,
                last_sent_tick: ctx.tick,
            },
        );
        self.in_flight.insert(entity_id, id);

        self.stats.started += 1;
        info!("{}: migrating {} to {}", id, entity_id, destination);
        self.notices.push(Event::new(
            entity_id,
            EventKind::MigrationStarted { destination },
        ));
        outbox.persistence.push(PersistenceRecord::Migration {
            tick: ctx.tick,
            zone: ctx.zone_id(),
            ticket: id,
            entity: entity_id,
            source: ctx.zone_id(),
            destination,
            outcome: MigrationOutcome::Started,
        });
        Some(id)
    }

    /// Times out unanswered tickets, retransmits and purges old state.
    pub fn expire(&mut self, ctx: &TickContext, registry: &mut EntityRegistry, outbox: &mut Outbox) {
        let mut timed_out = std::mem::take(&mut self.timed_out);
        timed_out.clear();

        for (id, outgoing) in self.outgoing.iter_mut() {
            let due_resend = ctx.tick >= outgoing.last_sent_tick + RESEND_EVERY_TICKS;
            match outgoing.ticket.status {
                MigrationStatus::PendingAck { deadline_tick } if ctx.tick >= deadline_tick => {
                    outgoing.ticket.status = MigrationStatus::Aborted(AbortReason::TimedOut);
                    outgoing.resolved_tick = Some(ctx.tick);
                    outgoing.last_sent_tick = ctx.tick;
                    timed_out.push((*id, outgoing.ticket.entity_id, outgoing.ticket.destination));
                }
                MigrationStatus::PendingAck { .. } | MigrationStatus::Initiated if due_resend => {
                    let mut ticket = outgoing.ticket.clone();
                    ticket.status = MigrationStatus::Initiated;
                    outbox
                        .zone_messages
                        .push((ticket.destination, ZoneMessage::MigrationInitiated(ticket)));
                    outgoing.last_sent_tick = ctx.tick;
                }
                MigrationStatus::Aborted(AbortReason::TimedOut)
                | MigrationStatus::Aborted(AbortReason::EntityGone)
                    if due_resend =>
                {
                    outbox.zone_messages.push((
                        outgoing.ticket.destination,
                        ZoneMessage::MigrationAbort {
                            ticket: *id,
                            entity_id: outgoing.ticket.entity_id,
                        },
                    ));
                    outgoing.last_sent_tick = ctx.tick;
                }
                _ => {}
            }
        }

        for &(ticket, entity_id, destination) in &timed_out {
            warn!("{} for {} timed out waiting on {}", ticket, entity_id, destination);
            self.stats.timed_out += 1;
            outbox.zone_messages.push((
                destination,
                ZoneMessage::MigrationAbort { ticket, entity_id },
            ));
            self.restore(
                ctx,
                registry,
                (ticket, entity_id, destination),
                MigrationOutcome::TimedOut,
                outbox,
            );
        }
        self.timed_out = timed_out;

        let retention = self.policy.ticket_retention_ticks as u64;
        let tick = ctx.tick;
        self.outgoing.retain(|_, o| match o.resolved_tick {
            Some(resolved) => tick < resolved + retention,
            None => true,
        });
        self.incoming
            .retain(|_, i| tick < i.decided_tick + retention);
        self.retry_after.retain(|_, until| tick < *until);
    }

    /// The entity was despawned here; abandon any migration in flight.
    pub fn entity_removed(&mut self, ctx: &TickContext, entity_id: EntityId, outbox: &mut Outbox) {
        let ticket = match self.in_flight.remove(&entity_id) {
            Some(ticket) => ticket,
            None => return,
        };
        if let Some(outgoing) = self.outgoing.get_mut(&ticket) {
            outgoing.ticket.status = MigrationStatus::Aborted(AbortReason::EntityGone);
            outgoing.resolved_tick = Some(ctx.tick);
            outgoing.last_sent_tick = ctx.tick;
            outbox.zone_messages.push((
                outgoing.ticket.destination,
                ZoneMessage::MigrationAbort { ticket, entity_id },
            ));
        }
        self.retry_after.remove(&entity_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NeighborZone, Rect, ZoneDescriptor};
    use shared::units;

    /// Zone 1 spans x in [-1000, 0), zone 2 spans [0, 1000); 50 unit margin.
    fn configs() -> (ZoneConfig, ZoneConfig) {
        let west = Rect::from_units(-1000, -1000, 0, 1000);
        let east = Rect::from_units(0, -1000, 1000, 1000);
        let margin = units(50) as i32;

        let mut a = ZoneConfig::default();
        a.zone = ZoneDescriptor {
            id: ZoneId(1),
            bounds: west,
            overlap_margin: margin,
            neighbors: vec![NeighborZone {
                id: ZoneId(2),
                bounds: east,
                address: "127.0.0.1:7002".to_string(),
            }],
            spawn_point: west.center(),
        };
        let mut b = ZoneConfig::default();
        b.zone = ZoneDescriptor {
            id: ZoneId(2),
            bounds: east,
            overlap_margin: margin,
            neighbors: vec![NeighborZone {
                id: ZoneId(1),
                bounds: west,
                address: "127.0.0.1:7001".to_string(),
            }],
            spawn_point: east.center(),
        };
        (a, b)
    }

    struct Side {
        config: ZoneConfig,
        registry: EntityRegistry,
        history: PositionHistory,
        boundary: BoundaryManager,
        outbox: Outbox,
        handoffs: Vec<Handoff>,
    }

    impl Side {
        fn new(config: ZoneConfig) -> Self {
            Self {
                registry: EntityRegistry::new(config.zone.id, config.cell_size),
                history: PositionHistory::new(config.rewind_window_ticks()),
                boundary: BoundaryManager::new(&config),
                outbox: Outbox::default(),
                handoffs: Vec::new(),
                config,
            }
        }

        fn deliver(&mut self, tick: u64, message: ZoneMessage) {
            let ctx = TickContext::new(&self.config, tick);
            self.boundary.handle_message(
                &ctx,
                &mut self.registry,
                &mut self.history,
                message,
                &mut self.outbox,
                &mut self.handoffs,
            );
        }

        fn step(&mut self, tick: u64) {
            let ctx = TickContext::new(&self.config, tick);
            self.boundary
                .detect_crossings(&ctx, &mut self.registry, &mut self.outbox);
            self.boundary.expire(&ctx, &mut self.registry, &mut self.outbox);
        }

        fn take_messages(&mut self) -> Vec<ZoneMessage> {
            self.outbox
                .zone_messages
                .drain(..)
                .map(|(_, message)| message)
                .collect()
        }

        fn authority(&self, id: EntityId) -> Option<Authority> {
            self.registry.get(id).map(|r| r.authority)
        }
    }

    fn deep_in_east() -> FixedVec3 {
        FixedVec3::new(units(60) as i32, 0, 0)
    }

    #[test]
    fn test_crossing_starts_migration() {
        let (a, _) = configs();
        let mut side = Side::new(a);
        let id = side
            .registry
            .create(Components::new(0, deep_in_east(), 100), 0);

        side.step(1);
        assert!(matches!(
            side.authority(id),
            Some(Authority::Migrating {
                destination: ZoneId(2),
                ..
            })
        ));
        assert_eq!(side.boundary.in_flight(), 1);
        assert!(matches!(
            side.take_messages()[0],
            ZoneMessage::MigrationInitiated(_)
        ));
    }

    #[test]
    fn test_inside_margin_does_not_migrate() {
        let (a, _) = configs();
        let mut side = Side::new(a);
        let id = side.registry.create(
            Components::new(0, FixedVec3::new(units(20) as i32, 0, 0), 100),
            0,
        );
        side.step(1);
        assert_eq!(side.authority(id), Some(Authority::Owned));
    }

    #[test]
    fn test_ack_completes_handoff() {
        let (a, b) = configs();
        let mut west = Side::new(a);
        let mut east = Side::new(b);
        let id = west
            .registry
            .create(Components::new(0, deep_in_east(), 100), 0);

        west.step(1);
        for message in west.take_messages() {
            east.deliver(1, message);
        }
        assert_eq!(east.authority(id), Some(Authority::Owned));

        for message in east.take_messages() {
            west.deliver(2, message);
        }
        assert_eq!(
            west.authority(id),
            Some(Authority::Mirror { owner: ZoneId(2) })
        );
        assert_eq!(west.boundary.stats().completed, 1);
        assert_eq!(west.boundary.in_flight(), 0);
    }

    #[test]
    fn test_player_handoff_requests_redirect() {
        let (a, b) = configs();
        let mut west = Side::new(a);
        let mut east = Side::new(b);
        let mut components = Components::new(0, deep_in_east(), 100);
        components.player_controlled = true;
        let id = west.registry.create(components, 0);
        west.registry.get_mut(id).unwrap().connection = Some(7);

        west.step(1);
        for message in west.take_messages() {
            east.deliver(1, message);
        }
        for message in east.take_messages() {
            west.deliver(2, message);
        }
        assert_eq!(
            west.handoffs,
            vec![Handoff {
                entity_id: id,
                destination: ZoneId(2)
            }]
        );
        assert!(east.registry.get(id).unwrap().player_controlled);
    }

    #[test]
    fn test_duplicate_initiated_gets_same_answer() {
        let (a, b) = configs();
        let mut west = Side::new(a);
        let mut east = Side::new(b);
        west.registry
            .create(Components::new(0, deep_in_east(), 100), 0);
        west.step(1);
        let initiated = west.take_messages().remove(0);

        east.deliver(1, initiated.clone());
        east.deliver(2, initiated);
        let replies = east.take_messages();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0], replies[1]);
        assert!(matches!(replies[0], ZoneMessage::MigrationAck { .. }));
        assert_eq!(east.boundary.stats().accepted, 1);
    }

    #[test]
    fn test_nack_keeps_entity_with_source() {
        let (a, b) = configs();
        let mut west = Side::new(a);
        let mut east = Side::new(b);
        let id = west
            .registry
            .create(Components::new(0, deep_in_east(), 100), 0);
        // East already owns an entity with this id
        east.registry
            .insert_with_id(id, Components::new(0, deep_in_east(), 100), Authority::Owned, 0)
            .unwrap();

        west.step(1);
        for message in west.take_messages() {
            east.deliver(1, message);
        }
        let replies = east.take_messages();
        assert!(matches!(
            replies[0],
            ZoneMessage::MigrationNack {
                reason: NackReason::DuplicateEntity,
                ..
            }
        ));
        for message in replies {
            west.deliver(2, message);
        }
        assert_eq!(west.authority(id), Some(Authority::Owned));
        assert_eq!(west.boundary.stats().refused, 1);

        // Retry cooldown keeps it from being re-offered immediately
        west.step(3);
        assert_eq!(west.authority(id), Some(Authority::Owned));
    }

    #[test]
    fn test_out_of_bounds_snapshot_refused() {
        let (a, b) = configs();
        let mut west = Side::new(a);
        let mut east = Side::new(b);
        let id = west
            .registry
            .create(Components::new(0, FixedVec3::new(-5_000, 0, 0), 100), 0);
        let ctx = TickContext::new(&west.config, 1);
        west.boundary
            .initiate(&ctx, &mut west.registry, id, ZoneId(2), &mut west.outbox);

        for message in west.take_messages() {
            east.deliver(1, message);
        }
        assert!(matches!(
            east.take_messages()[0],
            ZoneMessage::MigrationNack {
                reason: NackReason::OutOfBounds,
                ..
            }
        ));
        assert!(east.registry.get(id).is_none());
    }

    #[test]
    fn test_timeout_aborts_and_late_ack_ignored() {
        let (a, b) = configs();
        let timeout = a.migration.timeout_ticks as u64;
        let mut west = Side::new(a);
        let mut east = Side::new(b);
        let id = west
            .registry
            .create(Components::new(0, deep_in_east(), 100), 0);

        west.step(1);
        let initiated = west.take_messages().remove(0);
        let ticket = match &initiated {
            ZoneMessage::MigrationInitiated(t) => t.id,
            _ => unreachable!(),
        };

        // ACK is lost; the source gives up at the deadline
        east.deliver(1, initiated);
        let late_ack = east.take_messages().remove(0);
        for tick in 2..=1 + timeout {
            west.step(tick);
        }
        assert_eq!(west.authority(id), Some(Authority::Owned));
        assert_eq!(west.boundary.stats().timed_out, 1);
        let outcomes: Vec<MigrationOutcome> = west
            .outbox
            .persistence
            .iter()
            .filter_map(|r| match r {
                PersistenceRecord::Migration { outcome, .. } => Some(*outcome),
                _ => None,
            })
            .collect();
        assert_eq!(
            outcomes,
            vec![MigrationOutcome::Started, MigrationOutcome::TimedOut]
        );
        let sent = west.take_messages();
        let abort = sent
            .iter()
            .find(|m| matches!(m, ZoneMessage::MigrationAbort { .. }))
            .cloned()
            .unwrap();

        west.deliver(2 + timeout, late_ack);
        assert_eq!(west.authority(id), Some(Authority::Owned));
        assert_eq!(west.boundary.stats().completed, 0);
        assert!(matches!(
            west.boundary.ticket(ticket).unwrap().status,
            MigrationStatus::Aborted(AbortReason::TimedOut)
        ));

        // The destination that accepted steps back
        east.deliver(2 + timeout, abort);
        assert_eq!(
            east.authority(id),
            Some(Authority::Mirror { owner: ZoneId(1) })
        );
        assert_eq!(east.boundary.stats().demoted, 1);
    }

    #[test]
    fn test_abort_before_initiated_blocks_late_initiated() {
        let (a, b) = configs();
        let mut west = Side::new(a);
        let mut east = Side::new(b);
        let id = west
            .registry
            .create(Components::new(0, deep_in_east(), 100), 0);
        west.step(1);
        let initiated = west.take_messages().remove(0);
        let ticket = match &initiated {
            ZoneMessage::MigrationInitiated(t) => t.id,
            _ => unreachable!(),
        };

        east.deliver(1, ZoneMessage::MigrationAbort { ticket, entity_id: id });
        east.deliver(2, initiated);
        assert!(east.take_messages().is_empty());
        assert!(east.registry.get(id).is_none());
    }

    #[test]
    fn test_mirror_projection_and_removal() {
        let (a, b) = configs();
        let mut west = Side::new(a);
        let mut east = Side::new(b);
        let near_edge = west.registry.create(
            Components::new(0, FixedVec3::new(-units(30) as i32, 0, 0), 100),
            0,
        );
        let far_away = west.registry.create(
            Components::new(0, FixedVec3::new(-units(500) as i32, 0, 0), 100),
            0,
        );

        let ctx = TickContext::new(&west.config, 1);
        west.boundary
            .collect_mirrors(&ctx, &west.registry, &mut west.outbox);
        for message in west.take_messages() {
            east.deliver(1, message);
        }
        assert_eq!(
            east.authority(near_edge),
            Some(Authority::Mirror { owner: ZoneId(1) })
        );
        assert!(east.registry.get(far_away).is_none());

        // Walks away from the border; the next update drops the shadow
        west.registry
            .set_kinematics(near_edge, FixedVec3::new(-units(300) as i32, 0, 0), FixedVec3::ZERO)
            .unwrap();
        let ctx = TickContext::new(&west.config, 2);
        west.boundary
            .collect_mirrors(&ctx, &west.registry, &mut west.outbox);
        for message in west.take_messages() {
            east.deliver(2, message);
        }
        assert!(east.registry.get(near_edge).is_none());
    }

    #[test]
    fn test_mirror_update_never_overwrites_owned() {
        let (_, b) = configs();
        let mut east = Side::new(b);
        let id = east
            .registry
            .create(Components::new(0, deep_in_east(), 100), 0);
        let mut state = east.registry.get(id).unwrap().mirror_state();
        state.position = FixedVec3::ZERO;

        east.deliver(
            1,
            ZoneMessage::MirrorUpdate {
                from: ZoneId(1),
                tick: 1,
                entities: vec![state],
            },
        );
        assert_eq!(east.authority(id), Some(Authority::Owned));
        assert_eq!(east.registry.get(id).unwrap().position(), deep_in_east());
    }

    #[test]
    fn test_stale_mirror_update_ignored() {
        let (_, b) = configs();
        let mut east = Side::new(b);
        let id = EntityId::compose(ZoneId(1), 1);
        let state = MirrorState {
            entity_id: id,
            class_id: 0,
            position: FixedVec3::new(-1_000, 0, 0),
            velocity: FixedVec3::ZERO,
            facing: 0,
            health: 100,
            animation: Default::default(),
        };
        east.deliver(
            5,
            ZoneMessage::MirrorUpdate {
                from: ZoneId(1),
                tick: 5,
                entities: vec![state],
            },
        );
        east.deliver(
            6,
            ZoneMessage::MirrorUpdate {
                from: ZoneId(1),
                tick: 4,
                entities: vec![],
            },
        );
        assert!(east.registry.get(id).is_some());
    }

    #[test]
    fn test_resolved_tickets_purged_after_retention() {
        let (a, b) = configs();
        let retention = a.migration.ticket_retention_ticks as u64;
        let mut west = Side::new(a);
        let mut east = Side::new(b);
        west.registry
            .create(Components::new(0, deep_in_east(), 100), 0);
        west.step(1);
        for message in west.take_messages() {
            east.deliver(1, message);
        }
        for message in east.take_messages() {
            west.deliver(2, message);
        }
        assert_eq!(west.boundary.retained_tickets(), 1);

        let ctx = TickContext::new(&west.config, 2 + retention);
        west.boundary.expire(&ctx, &mut west.registry, &mut west.outbox);
        assert_eq!(west.boundary.retained_tickets(), 0);
    }
}
