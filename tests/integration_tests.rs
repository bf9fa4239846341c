//! Integration tests for zone authorities
//!
//! These tests drive whole zones tick by tick and wire neighbouring zones
//! together in-process, forwarding their zone-to-zone traffic by hand.

use server::config::{NeighborZone, Rect, ZoneConfig, ZoneDescriptor};
use server::persistence::{MigrationOutcome, PersistenceRecord, ViolationSeverity};
use server::registry::Authority;
use server::zone::ZoneAuthority;
use shared::{
    units, AttackRequest, ConnectionId, EntityId, EventKind, FixedVec3, InputState, Packet,
    ZoneId, PROTOCOL_VERSION,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
}

/// Connects a client from `port` and runs the tick that admits it.
fn connect(zone: &mut ZoneAuthority, port: u16) -> (ConnectionId, EntityId) {
    zone.push_packet(
        addr(port),
        Packet::Connect {
            client_version: PROTOCOL_VERSION,
            class_id: 0,
        },
    );
    zone.run_tick()
        .control
        .iter()
        .find_map(|(to, packet)| match packet {
            Packet::Connected {
                connection_id,
                entity_id,
                ..
            } if *to == addr(port) => Some((*connection_id, *entity_id)),
            _ => None,
        })
        .expect("client was not admitted")
}

fn input(entity_id: EntityId, sequence: u32, move_vector: FixedVec3) -> Packet {
    Packet::Input(InputState {
        entity_id,
        sequence,
        move_vector,
        facing: 0,
        action_flags: 0,
        client_time: 0,
    })
}

/// Forwards everything `from` addressed to `to` during its last tick.
fn forward(from: &ZoneAuthority, from_addr: SocketAddr, to: &mut ZoneAuthority) {
    let target = to.config().zone.id;
    let messages: Vec<_> = from
        .outbox()
        .zone_messages
        .iter()
        .filter(|(zone, _)| *zone == target)
        .map(|(_, message)| message.clone())
        .collect();
    for message in messages {
        to.push_packet(from_addr, Packet::Zone(message));
    }
}

/// Zone 1 owns x in [-1000 m, 0), zone 2 owns [0, 1000 m); 50 m margin.
fn two_zones() -> (ZoneAuthority, ZoneAuthority) {
    let west = Rect::from_units(-1000, -1000, 0, 1000);
    let east = Rect::from_units(0, -1000, 1000, 1000);
    let margin = units(50) as i32;

    let mut a = ZoneConfig::default();
    a.classes[0].max_speed = units(30);
    let mut b = a.clone();

    a.zone = ZoneDescriptor {
        id: ZoneId(1),
        bounds: west,
        overlap_margin: margin,
        neighbors: vec![NeighborZone {
            id: ZoneId(2),
            bounds: east,
            address: addr(7002).to_string(),
        }],
        spawn_point: FixedVec3::new(-units(10) as i32, 0, 0),
    };
    b.zone = ZoneDescriptor {
        id: ZoneId(2),
        bounds: east,
        overlap_margin: margin,
        neighbors: vec![NeighborZone {
            id: ZoneId(1),
            bounds: west,
            address: addr(7001).to_string(),
        }],
        spawn_point: east.center(),
    };
    (
        ZoneAuthority::new(a).unwrap(),
        ZoneAuthority::new(b).unwrap(),
    )
}

/// LAG COMPENSATION
mod lag_compensation_tests {
    use super::*;

    /// A hit at a rewind time between two samples validates against the
    /// interpolated position, not either sample
    #[test]
    fn hit_validates_against_interpolated_position() {
        let mut config = ZoneConfig::default();
        config.tick_rate = 20;
        config.classes[0].max_speed = units(48);
        config.zone.spawn_point = FixedVec3::new(1000, 0, 1000);
        let mut zone = ZoneAuthority::new(config).unwrap();

        let (_, target) = connect(&mut zone, 6000);
        let (shooter, attacker) = connect(&mut zone, 6001);
        assert_eq!(zone.tick(), 2);

        // Shooter backs off 10 m along -x; target steps off the aim line
        zone.push_packet(addr(6000), input(target, 1, FixedVec3::new(0, 0, -1200)));
        for sequence in 1..=5 {
            zone.push_packet(
                addr(6001),
                input(attacker, sequence, FixedVec3::new(-2000, 0, 0)),
            );
            zone.run_tick();
        }
        while zone.tick() < 100 {
            zone.run_tick();
        }
        assert_eq!(
            zone.registry().get(target).unwrap().position(),
            FixedVec3::new(1000, 0, -200)
        );

        // Tick 101 crosses to the other side of the line
        zone.push_packet(addr(6000), input(target, 2, FixedVec3::new(0, 0, 2400)));
        zone.run_tick();
        assert_eq!(
            zone.registry().get(target).unwrap().position(),
            FixedVec3::new(1000, 0, 2200)
        );

        // 150 ms RTT at 20 Hz rewinds 1.5 ticks from tick 102: tick 100.5
        let server_time = 102 * 50 - 150;
        zone.push_packet(addr(6001), Packet::Pong { server_time });
        zone.push_packet(
            addr(6001),
            Packet::Attack(AttackRequest {
                attacker,
                target,
                weapon_slot: 1,
                aim: FixedVec3::new(1000, 0, 0),
                sequence: 1,
                client_time: 0,
            }),
        );
        let outbox = zone.run_tick();

        let hit = outbox
            .events_for(shooter)
            .find(|e| e.entity_id == target)
            .expect("attacker saw no combat event");
        assert_eq!(
            hit.kind,
            EventKind::Hit {
                attacker,
                damage: 150,
                remaining_health: 850,
                killed: false,
                degraded_compensation: false,
            }
        );
        assert!(outbox
            .persistence
            .iter()
            .any(|r| matches!(r, PersistenceRecord::Combat { damage: 150, .. })));
        assert_eq!(zone.registry().get(target).unwrap().health, 850);
    }

    /// Lag compensation round trip: a retained sample resolves exactly
    #[test]
    fn retained_sample_resolves_exactly() {
        let mut zone = ZoneAuthority::new(ZoneConfig::default()).unwrap();
        let npc = zone.spawn(0, FixedVec3::new(1000, 0, 1000));
        for _ in 0..10 {
            zone.run_tick();
        }
        let ring = zone.history().ring(npc).unwrap();
        let sample = ring.sample_at(5).unwrap();
        let resolved = ring
            .resolve_at(server::context::SimTime::from_tick(5))
            .unwrap();
        assert_eq!(resolved.position, sample.position);
        assert!(!resolved.degraded);
    }
}

/// MOVEMENT VALIDATION
mod movement_tests {
    use super::*;

    /// 50 units in one tick against a 10 unit cap is rejected outright
    #[test]
    fn five_times_cap_is_rejected() {
        let mut config = ZoneConfig::default();
        config.tick_rate = 5;
        config.classes[0].max_speed = units(50);
        let mut zone = ZoneAuthority::new(config).unwrap();
        let (connection, entity) = connect(&mut zone, 6000);
        let start = zone.registry().get(entity).unwrap().position();

        zone.push_packet(
            addr(6000),
            input(entity, 1, FixedVec3::new(units(50) as i32, 0, 0)),
        );
        let outbox = zone.run_tick();

        assert!(outbox.persistence.iter().any(|r| matches!(
            r,
            PersistenceRecord::AntiCheat {
                severity: ViolationSeverity::Hard,
                ..
            }
        )));
        assert!(outbox
            .events_for(connection)
            .any(|e| matches!(e.kind, EventKind::MovementCorrected { .. })));
        assert_eq!(zone.registry().get(entity).unwrap().position(), start);

        let session = zone.clients().get(connection).unwrap();
        assert_eq!(session.violations.hard, 1);
        assert!(session.kick_candidate);
    }

    /// Duplicated and reordered inputs are applied once, in sequence order
    #[test]
    fn duplicate_inputs_apply_once() {
        let mut zone = ZoneAuthority::new(ZoneConfig::default()).unwrap();
        let (connection, entity) = connect(&mut zone, 6000);
        let start = zone.registry().get(entity).unwrap().position();
        let step = FixedVec3::new(40, 0, 0);

        zone.push_packet(addr(6000), input(entity, 2, step));
        zone.push_packet(addr(6000), input(entity, 1, step));
        zone.push_packet(addr(6000), input(entity, 2, step));
        zone.run_tick();
        zone.push_packet(addr(6000), input(entity, 1, step));
        zone.run_tick();

        assert_eq!(
            zone.registry().get(entity).unwrap().position(),
            start + FixedVec3::new(80, 0, 0)
        );
        let session = zone.clients().get(connection).unwrap();
        assert_eq!(session.last_processed_input, 2);
        assert_eq!(session.violations.protocol, 0);
    }
}

/// AREA OF INTEREST
mod aoi_tests {
    use super::*;

    /// An entity in range shows up in the next snapshot; removing it yields
    /// exactly one despawn
    #[test]
    fn spawn_then_single_despawn() {
        let mut zone = ZoneAuthority::new(ZoneConfig::default()).unwrap();
        let (watcher, _) = connect(&mut zone, 6000);
        let npc = zone.spawn(0, FixedVec3::new(units(30) as i32, 0, 0));

        let outbox = zone.run_tick();
        let snapshot = outbox.snapshot_for(watcher).unwrap();
        assert!(snapshot.entries.iter().any(|e| e.entity_id == npc));
        assert_eq!(
            outbox
                .events_for(watcher)
                .filter(|e| e.entity_id == npc && matches!(e.kind, EventKind::Spawn { .. }))
                .count(),
            1
        );

        zone.despawn(npc).unwrap();
        let mut despawns = 0;
        for _ in 0..20 {
            let outbox = zone.run_tick();
            despawns += outbox
                .events_for(watcher)
                .filter(|e| e.entity_id == npc && e.kind == EventKind::Despawn)
                .count();
        }
        assert_eq!(despawns, 1);
    }
}

/// ZONE BOUNDARIES
mod migration_tests {
    use super::*;

    /// A player walks from zone 1 into zone 2. Zone 2 already mirrors it,
    /// accepts the handoff and becomes authoritative before zone 1 despawns
    /// its copy for a watcher that stays behind.
    #[test]
    fn handoff_completes_before_source_despawns() {
        let (mut a, mut b) = two_zones();
        let (watcher, _) = connect(&mut a, 6000);
        let (_, mover) = connect(&mut a, 6001);

        let step = FixedVec3::new(500, 0, 0);
        let mut sequence = 0;
        let mut redirected = false;
        let mut reattached = false;
        let mut mirrored_before_handoff = false;
        let mut b_authoritative = false;
        let mut despawned_at_a = false;

        for _ in 0..400 {
            sequence += 1;
            if !redirected {
                a.push_packet(addr(6001), input(mover, sequence, step));
            } else if reattached {
                b.push_packet(addr(6001), input(mover, sequence, step));
            }

            a.run_tick();
            for (to, packet) in &a.outbox().control {
                if *to == addr(6001) {
                    if let Packet::Redirect { zone, address } = packet {
                        assert_eq!(*zone, ZoneId(2));
                        assert_eq!(address, &addr(7002).to_string());
                        redirected = true;
                    }
                }
            }
            if a.outbox()
                .events_for(watcher)
                .any(|e| e.entity_id == mover && e.kind == EventKind::Despawn)
            {
                assert!(b_authoritative, "zone 1 despawned before zone 2 took over");
                despawned_at_a = true;
            }
            forward(&a, addr(7001), &mut b);
            if redirected && !reattached {
                b.push_packet(
                    addr(6001),
                    Packet::Reattach {
                        client_version: PROTOCOL_VERSION,
                        entity_id: mover,
                    },
                );
            }

            b.run_tick();
            if b.outbox().control.iter().any(|(to, packet)| {
                *to == addr(6001) && matches!(packet, Packet::Connected { .. })
            }) {
                reattached = true;
            }
            forward(&b, addr(7002), &mut a);

            assert!(
                !(a.is_authoritative(mover) && b.is_authoritative(mover)),
                "two authorities for {}",
                mover
            );
            if a.is_authoritative(mover)
                && b.registry().get(mover).map(|r| r.authority)
                    == Some(Authority::Mirror { owner: ZoneId(1) })
            {
                mirrored_before_handoff = true;
            }
            b_authoritative |= b.is_authoritative(mover);

            if despawned_at_a {
                break;
            }
        }

        assert!(mirrored_before_handoff);
        assert!(redirected && reattached);
        assert!(despawned_at_a);
        assert!(b.is_authoritative(mover));
        assert!(a.registry().get(mover).is_none());
        assert_eq!(a.boundary().stats().completed, 1);
        assert!(b.clients().find_client_by_entity(mover).is_some());
    }

    /// Replies from the destination are lost. The source times out, keeps
    /// the entity, and the destination that accepted demotes its copy.
    #[test]
    fn timeout_leaves_original_authority() {
        let (mut a, mut b) = two_zones();
        let npc = a.spawn(0, FixedVec3::new(units(60) as i32, 0, 0));
        let timeout = a.config().migration.timeout_ticks as u64;

        let mut timeouts_recorded = 0;
        for _ in 0..timeout + 5 {
            timeouts_recorded += a
                .run_tick()
                .persistence
                .iter()
                .filter(|r| {
                    matches!(
                        r,
                        PersistenceRecord::Migration {
                            outcome: MigrationOutcome::TimedOut,
                            ..
                        }
                    )
                })
                .count();
            forward(&a, addr(7001), &mut b);
            b.run_tick();
            // Everything zone 2 sends is dropped

            assert!(!(a.is_authoritative(npc) && b.is_authoritative(npc)));
        }

        assert!(a.is_authoritative(npc));
        assert_eq!(
            b.registry().get(npc).map(|r| r.authority),
            Some(Authority::Mirror { owner: ZoneId(1) })
        );
        assert_eq!(a.boundary().stats().timed_out, 1);
        assert_eq!(a.boundary().stats().completed, 0);
        assert_eq!(b.boundary().stats().demoted, 1);
        assert_eq!(timeouts_recorded, 1);
    }

    /// Mirrors are read-only: input naming a mirrored entity moves nothing
    #[test]
    fn mirror_never_accepts_input() {
        let (mut a, mut b) = two_zones();
        let near_border = a.spawn(0, FixedVec3::new(-units(5) as i32, 0, 0));
        a.run_tick();
        forward(&a, addr(7001), &mut b);
        let (_, own) = connect(&mut b, 6000);
        let before = b.registry().get(near_border).unwrap().position();

        b.push_packet(addr(6000), input(near_border, 1, FixedVec3::new(10, 0, 0)));
        b.run_tick();
        assert_eq!(b.registry().get(near_border).unwrap().position(), before);
        assert!(b.is_authoritative(own));
        assert!(!b.is_authoritative(near_border));
    }
}
