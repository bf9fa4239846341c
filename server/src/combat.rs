//! Lag-compensated combat resolution
//!
//! An attack is validated against where the target was when the attacker saw
//! it: the server rewinds by the attacker's estimated one-way delay, rebuilds
//! the target's position from its history ring and runs the weapon's
//! geometric test there. Damage lands at the current tick.

use crate::config::{WeaponConfig, WeaponKind, ZoneConfig};
use crate::context::{Outbox, TickContext};
use crate::history::PositionHistory;
use crate::persistence::PersistenceRecord;
use crate::registry::{EntityRegistry, MAX_WEAPON_SLOTS};
use log::debug;
use shared::{
    AnimationState, AttackRequest, ConnectionId, CorrectionReason, EntityId, Event, EventKind,
    FixedVec3,
};

/// Aim vectors are rescaled to at most this length before the i128 math.
const MAX_AIM_LENGTH: i64 = 1_000_000;
/// Cosine scale used for melee arcs.
const COS_SCALE: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackOutcome {
    Hit {
        damage: i32,
        remaining_health: i32,
        killed: bool,
        degraded: bool,
    },
    Miss {
        degraded: bool,
    },
    OnCooldown,
    TargetNotOwned,
    Invalid,
}

#[derive(Debug, Clone, Copy)]
struct PreparedWeapon {
    config: WeaponConfig,
    /// cos(arc / 2) scaled by `COS_SCALE`; melee only.
    cos_half_arc: i64,
}

pub struct CombatResolver {
    weapons: Vec<PreparedWeapon>,
    max_rewind_ms: u64,
    hit_radius: i64,
    rewind_attacker: bool,
    tick_rate: u32,
    observers: Vec<ConnectionId>,
}

impl CombatResolver {
    pub fn new(config: &ZoneConfig) -> Self {
        let weapons = config
            .combat
            .weapons
            .iter()
            .map(|w| PreparedWeapon {
                config: *w,
                cos_half_arc: match w.kind {
                    WeaponKind::Melee {
                        arc_milliradians, ..
                    } => {
                        let half = arc_milliradians.clamp(0, 6283) as f64 / 2000.0;
                        (half.cos() * COS_SCALE as f64).round() as i64
                    }
                    WeaponKind::Ranged { .. } => COS_SCALE,
                },
            })
            .collect();
        Self {
            weapons,
            max_rewind_ms: config.combat.max_rewind_ms as u64,
            hit_radius: config.combat.hit_radius.max(0),
            rewind_attacker: config.combat.rewind_attacker,
            tick_rate: config.tick_rate.max(1),
            observers: Vec::new(),
        }
    }

    fn weapon(&self, slot: u8) -> Option<PreparedWeapon> {
        if slot as usize >= MAX_WEAPON_SLOTS {
            return None;
        }
        self.weapons.iter().find(|w| w.config.slot == slot).copied()
    }

    /// Resolves one attack and publishes its result.
    ///
    /// Hits go to every observer of the target and to the durable sink;
    /// everything else is a correction for the attacker's connection only.
    #[allow(clippy::too_many_arguments)]
    pub fn resolve(
        &mut self,
        ctx: &TickContext,
        registry: &mut EntityRegistry,
        history: &PositionHistory,
        observers_of: impl Fn(EntityId, &mut Vec<ConnectionId>),
        connection: ConnectionId,
        one_way_delay_ms: u64,
        attack: &AttackRequest,
        outbox: &mut Outbox,
    ) -> AttackOutcome {
        let (outcome, target_position) =
            self.evaluate(ctx, registry, history, one_way_delay_ms, attack);

        match outcome {
            AttackOutcome::Hit {
                damage,
                remaining_health,
                killed,
                degraded,
            } => {
                let event = Event::new(
                    attack.target,
                    EventKind::Hit {
                        attacker: attack.attacker,
                        damage,
                        remaining_health,
                        killed,
                        degraded_compensation: degraded,
                    },
                );
                let mut observers = std::mem::take(&mut self.observers);
                observers_of(attack.target, &mut observers);
                if !observers.contains(&connection) {
                    observers.push(connection);
                }
                for conn in &observers {
                    outbox.events.push((*conn, event.clone()));
                }
                self.observers = observers;

                outbox.persistence.push(PersistenceRecord::Combat {
                    tick: ctx.tick,
                    zone: ctx.zone_id(),
                    attacker: attack.attacker,
                    target: attack.target,
                    weapon_slot: attack.weapon_slot,
                    damage,
                    remaining_health,
                    killed,
                    degraded_compensation: degraded,
                });
            }
            AttackOutcome::Miss { .. } => {
                outbox
                    .events
                    .push((connection, correction(attack, CorrectionReason::Miss, target_position)));
            }
            AttackOutcome::OnCooldown => {
                outbox.events.push((
                    connection,
                    correction(attack, CorrectionReason::OnCooldown, None),
                ));
            }
            AttackOutcome::TargetNotOwned => {
                outbox.events.push((
                    connection,
                    correction(attack, CorrectionReason::TargetNotOwned, target_position),
                ));
            }
            AttackOutcome::Invalid => {
                outbox.events.push((
                    connection,
                    correction(attack, CorrectionReason::InvalidTarget, None),
                ));
            }
        }
        outcome
    }

    fn evaluate(
        &self,
        ctx: &TickContext,
        registry: &mut EntityRegistry,
        history: &PositionHistory,
        one_way_delay_ms: u64,
        attack: &AttackRequest,
    ) -> (AttackOutcome, Option<FixedVec3>) {
        let weapon = match self.weapon(attack.weapon_slot) {
            Some(weapon) => weapon,
            None => return (AttackOutcome::Invalid, None),
        };
        let attacker = match registry.get(attack.attacker) {
            Some(record) if record.authority.is_local() && record.is_alive() => record,
            _ => return (AttackOutcome::Invalid, None),
        };
        if ctx.tick < attacker.weapon_ready[attack.weapon_slot as usize] {
            return (AttackOutcome::OnCooldown, None);
        }
        let attacker_now = attacker.position();

        if attack.target == attack.attacker {
            return (AttackOutcome::Invalid, None);
        }
        let target = match registry.get(attack.target) {
            Some(record) => record,
            None => return (AttackOutcome::Invalid, None),
        };
        if !target.authority.is_local() {
            return (AttackOutcome::TargetNotOwned, Some(target.position()));
        }
        if !target.is_alive() {
            return (AttackOutcome::Invalid, None);
        }
        let target_now = target.position();

        let mut degraded = false;
        let delay = if one_way_delay_ms > self.max_rewind_ms {
            degraded = true;
            self.max_rewind_ms
        } else {
            one_way_delay_ms
        };
        let rewind_to = ctx.now().rewind_ms(delay, self.tick_rate);

        let target_then = match history.resolve_at(attack.target, rewind_to) {
            Some(state) => {
                degraded |= state.degraded;
                state.position
            }
            None => target_now,
        };
        let origin = if self.rewind_attacker {
            history
                .resolve_at(attack.attacker, rewind_to)
                .map(|s| s.position)
                .unwrap_or(attacker_now)
        } else {
            attacker_now
        };

        let ready_at = ctx.tick + weapon.config.cooldown_ticks as u64;
        if let Some(record) = registry.get_mut(attack.attacker) {
            record.weapon_ready[attack.weapon_slot as usize] = ready_at;
        }

        let hit = match weapon.config.kind {
            WeaponKind::Melee { range, .. } => cone_hit(
                &origin,
                &attack.aim,
                &target_then,
                range + self.hit_radius,
                weapon.cos_half_arc,
            ),
            WeaponKind::Ranged { range } => {
                ray_hit(&origin, &attack.aim, &target_then, range, self.hit_radius)
            }
        };

        if !hit {
            debug!(
                "Attack {} -> {} missed at {} (rewound {}ms)",
                attack.attacker, attack.target, target_then, delay
            );
            return (AttackOutcome::Miss { degraded }, Some(target_then));
        }

        let damage = weapon.config.damage.max(0);
        let record = match registry.get_mut(attack.target) {
            Some(record) => record,
            None => return (AttackOutcome::Invalid, None),
        };
        record.health = (record.health - damage).max(0);
        let killed = record.health == 0;
        if killed {
            record.animation = AnimationState::Dead;
        }
        (
            AttackOutcome::Hit {
                damage,
                remaining_health: record.health,
                killed,
                degraded,
            },
            Some(target_then),
        )
    }
}

fn correction(attack: &AttackRequest, reason: CorrectionReason, at: Option<FixedVec3>) -> Event {
    Event::new(
        attack.target,
        EventKind::Correction {
            reason,
            target_position: at,
        },
    )
}

fn bounded_aim(aim: &FixedVec3) -> Option<FixedVec3> {
    let len = aim.length();
    if len == 0 {
        return None;
    }
    if len > MAX_AIM_LENGTH {
        Some(aim.scale(MAX_AIM_LENGTH, len))
    } else {
        Some(*aim)
    }
}

fn dot128(a: &FixedVec3, b: &FixedVec3) -> i128 {
    a.x as i128 * b.x as i128 + a.y as i128 * b.y as i128 + a.z as i128 * b.z as i128
}

/// Ray from `origin` along `aim` against a sphere of `radius` at `center`,
/// limited to `range` along the ray.
pub fn ray_hit(
    origin: &FixedVec3,
    aim: &FixedVec3,
    center: &FixedVec3,
    range: i64,
    radius: i64,
) -> bool {
    let d = match bounded_aim(aim) {
        Some(d) => d,
        None => return false,
    };
    let v = *center - *origin;
    let dd = dot128(&d, &d);
    let vd = dot128(&v, &d);
    let vv = dot128(&v, &v);
    let r = radius as i128;

    if vv <= r * r {
        return true;
    }
    if vd < 0 {
        return false;
    }
    // Along-ray distance of the closest point must be within range
    let reach = (range + radius) as i128;
    if vd * vd > reach * reach * dd {
        return false;
    }
    // Perpendicular distance squared: |v|^2 - (v.d)^2 / |d|^2
    vv * dd - vd * vd <= r * r * dd
}

/// Cone of half-angle `acos(cos_half_arc / COS_SCALE)` around `aim`, reaching `reach`.
pub fn cone_hit(
    origin: &FixedVec3,
    aim: &FixedVec3,
    target: &FixedVec3,
    reach: i64,
    cos_half_arc: i64,
) -> bool {
    let a = match bounded_aim(aim) {
        Some(a) => a,
        None => return false,
    };
    let v = *target - *origin;
    let vv = dot128(&v, &v);
    if vv > reach as i128 * reach as i128 {
        return false;
    }
    if vv == 0 {
        return true;
    }
    let va = dot128(&v, &a);
    let len_v = shared::isqrt(vv.min(u64::MAX as i128) as u64) as i128;
    let len_a = a.length() as i128;
    va * COS_SCALE as i128 >= cos_half_arc as i128 * len_v * len_a
}
