//! Movement and input validation
//!
//! Every input is checked against what the entity's class could physically
//! have covered since its last accepted input:
//!
//! - within `max * (1 + tolerance)`: applied unmodified
//! - up to `max * reject_multiple`: clamped to `max`, soft violation
//! - beyond that: rejected, no movement, hard violation (kick candidate)
//!
//! Comparisons are done on squared lengths in `i128` so no rounding ever
//! moves an input across a threshold.

use crate::client_manager::Session;
use crate::config::{ClassCaps, MovementPolicy, WorldBounds, ZoneConfig, HARD_WORLD_EXTENT};
use crate::context::{Outbox, TickContext};
use crate::history::PositionHistory;
use crate::persistence::{PersistenceRecord, ViolationSeverity};
use crate::registry::EntityRegistry;
use log::warn;
use shared::{
    AnimationState, Event, EventKind, FixedVec3, InputState, ACTION_ATTACK, ACTION_BLOCK,
    ACTION_JUMP, ACTION_SPRINT, TAU_MILLIRADIANS,
};

/// Facing values beyond this many turns are treated as garbage.
const MAX_FACING_TURNS: i32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Clamp,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFault {
    UnknownEntity,
    /// Input names an entity this connection does not control.
    NotControlled,
    /// Entity is a mirror here; it never accepts input.
    NotLocal,
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementOutcome {
    Applied {
        position: FixedVec3,
    },
    Corrected {
        position: FixedVec3,
        claimed: i64,
        allowed: i64,
    },
    Rejected {
        claimed: i64,
        allowed: i64,
    },
    /// Dead entities keep their sequence moving but do not move.
    Ignored,
    Invalid(InputFault),
}

pub struct MovementValidator {
    policy: MovementPolicy,
    world: WorldBounds,
    tick_rate: u32,
    /// Longest gap credited to a single input.
    max_elapsed_ticks: u64,
}

impl MovementValidator {
    pub fn new(config: &ZoneConfig) -> Self {
        Self {
            policy: config.movement,
            world: config.world.effective(),
            tick_rate: config.tick_rate.max(1),
            max_elapsed_ticks: config.tick_rate.max(1) as u64,
        }
    }

    /// Largest displacement `caps` allows over `elapsed_ticks`.
    pub fn max_displacement(&self, caps: &ClassCaps, elapsed_ticks: u64) -> i64 {
        let elapsed = elapsed_ticks.clamp(1, self.max_elapsed_ticks) as i64;
        caps.max_speed * elapsed / self.tick_rate as i64
    }

    /// Places a displacement of squared length `claimed_sq` against `max`.
    pub fn classify(&self, claimed_sq: i64, max: i64) -> Verdict {
        let claimed_sq = claimed_sq.max(0) as i128 * 100 * 100;
        let max = max.max(0) as i128;
        let soft = max * (100 + self.policy.soft_tolerance_pct as i128);
        let hard = max * self.policy.reject_multiple_pct as i128;

        if claimed_sq <= soft * soft {
            Verdict::Accept
        } else if claimed_sq <= hard * hard {
            Verdict::Clamp
        } else {
            Verdict::Reject
        }
    }

    fn max_rotation(&self, caps: &ClassCaps, elapsed_ticks: u64) -> i64 {
        let elapsed = elapsed_ticks.clamp(1, self.max_elapsed_ticks) as i64;
        caps.rotation_rate * elapsed / self.tick_rate as i64
    }

    /// Turns from `current` toward `requested` by at most `max_step`.
    fn limit_rotation(current: i32, requested: i32, max_step: i64) -> i32 {
        let tau = TAU_MILLIRADIANS as i64;
        let mut delta = (requested as i64 - current as i64).rem_euclid(tau);
        if delta > tau / 2 {
            delta -= tau;
        }
        let step = delta.clamp(-max_step, max_step);
        (current as i64 + step).rem_euclid(tau) as i32
    }

    fn is_malformed(input: &InputState) -> bool {
        let m = &input.move_vector;
        let extent = HARD_WORLD_EXTENT.unsigned_abs();
        m.x.unsigned_abs() > extent
            || m.y.unsigned_abs() > extent
            || m.z.unsigned_abs() > extent
            || input.facing.unsigned_abs() > (TAU_MILLIRADIANS * MAX_FACING_TURNS).unsigned_abs()
    }

    fn animation_for(input: &InputState, displacement: &FixedVec3, max: i64) -> AnimationState {
        if input.has_action(ACTION_BLOCK) {
            AnimationState::Block
        } else if input.has_action(ACTION_ATTACK) {
            AnimationState::Attack
        } else if input.has_action(ACTION_JUMP) {
            AnimationState::Jump
        } else if *displacement == FixedVec3::ZERO {
            AnimationState::Idle
        } else if input.has_action(ACTION_SPRINT)
            || displacement.length_sq() as i128 * 100 > max as i128 * max as i128 * 36
        {
            AnimationState::Run
        } else {
            AnimationState::Walk
        }
    }

    /// Validates one input and applies whatever part of it is legal.
    pub fn apply(
        &self,
        ctx: &TickContext,
        registry: &mut EntityRegistry,
        history: &mut PositionHistory,
        session: &mut Session,
        input: &InputState,
        outbox: &mut Outbox,
    ) -> MovementOutcome {
        if session.entity_id != Some(input.entity_id) {
            return self.protocol_violation(ctx, session, input, InputFault::NotControlled, outbox);
        }
        if Self::is_malformed(input) {
            return self.protocol_violation(ctx, session, input, InputFault::Malformed, outbox);
        }
        let record = match registry.get(input.entity_id) {
            Some(record) => record,
            None => {
                return self.protocol_violation(
                    ctx,
                    session,
                    input,
                    InputFault::UnknownEntity,
                    outbox,
                )
            }
        };
        if !record.authority.is_local() {
            return MovementOutcome::Invalid(InputFault::NotLocal);
        }
        if !record.is_alive() {
            return MovementOutcome::Ignored;
        }

        let caps = ctx.config.class(record.class_id);
        let elapsed = ctx.tick.saturating_sub(record.motion.last_input_tick).max(1);
        let max = self.max_displacement(&caps, elapsed);
        let claimed_sq = input.move_vector.length_sq();
        let position = record.position();
        let facing = record.facing;

        let (displacement, verdict) = match self.classify(claimed_sq, max) {
            Verdict::Accept => (input.move_vector, Verdict::Accept),
            Verdict::Clamp => (input.move_vector.clamp_length(max), Verdict::Clamp),
            Verdict::Reject => {
                let claimed = input.move_vector.length();
                session.violations.hard += 1;
                if !session.kick_candidate {
                    warn!(
                        "Connection {} submitted {} for {} (allowed {}), flagging for kick",
                        session.id, claimed, input.entity_id, max
                    );
                }
                session.kick_candidate = true;
                outbox.persistence.push(PersistenceRecord::AntiCheat {
                    tick: ctx.tick,
                    zone: ctx.zone_id(),
                    connection: session.id,
                    entity: Some(input.entity_id),
                    severity: ViolationSeverity::Hard,
                    claimed,
                    allowed: max,
                    position: Some(position),
                });
                outbox.events.push((
                    session.id,
                    Event::new(
                        input.entity_id,
                        EventKind::MovementCorrected {
                            position,
                            sequence: input.sequence,
                        },
                    ),
                ));
                return MovementOutcome::Rejected { claimed, allowed: max };
            }
        };

        let new_position = self.world.clamp(&(position + displacement));
        let credited = elapsed.min(self.max_elapsed_ticks) as i64;
        let velocity = displacement.scale(self.tick_rate as i64, credited);
        let max_turn = self.max_rotation(&caps, elapsed);
        let new_facing = Self::limit_rotation(facing, input.facing, max_turn);

        if registry
            .set_kinematics(input.entity_id, new_position, velocity)
            .is_err()
        {
            return MovementOutcome::Invalid(InputFault::UnknownEntity);
        }
        if let Some(record) = registry.get_mut(input.entity_id) {
            record.facing = new_facing;
            record.animation = Self::animation_for(input, &displacement, max);
            record.motion.last_input_tick = ctx.tick;
            record.motion.last_sequence = input.sequence;
        }
        history.record(input.entity_id, ctx.tick, new_position, velocity);

        if verdict == Verdict::Accept {
            return MovementOutcome::Applied {
                position: new_position,
            };
        }

        let claimed = input.move_vector.length();
        session.violations.soft += 1;
        warn!(
            "Connection {} moved {} by {} (allowed {}), clamped ({} soft violations)",
            session.id, input.entity_id, claimed, max, session.violations.soft
        );
        if session.violations.soft >= self.policy.soft_violation_kick_threshold
            && !session.kick_candidate
        {
            warn!(
                "Connection {} reached {} soft violations, flagging for kick",
                session.id, session.violations.soft
            );
            session.kick_candidate = true;
        }
        outbox.persistence.push(PersistenceRecord::AntiCheat {
            tick: ctx.tick,
            zone: ctx.zone_id(),
            connection: session.id,
            entity: Some(input.entity_id),
            severity: ViolationSeverity::Soft,
            claimed,
            allowed: max,
            position: Some(new_position),
        });
        outbox.events.push((
            session.id,
            Event::new(
                input.entity_id,
                EventKind::MovementCorrected {
                    position: new_position,
                    sequence: input.sequence,
                },
            ),
        ));
        MovementOutcome::Corrected {
            position: new_position,
            claimed,
            allowed: max,
        }
    }

    fn protocol_violation(
        &self,
        ctx: &TickContext,
        session: &mut Session,
        input: &InputState,
        fault: InputFault,
        outbox: &mut Outbox,
    ) -> MovementOutcome {
        session.violations.protocol += 1;
        warn!(
            "Connection {} sent invalid input for {}: {:?}",
            session.id, input.entity_id, fault
        );
        outbox.persistence.push(PersistenceRecord::AntiCheat {
            tick: ctx.tick,
            zone: ctx.zone_id(),
            connection: session.id,
            entity: session.entity_id,
            severity: ViolationSeverity::Protocol,
            claimed: 0,
            allowed: 0,
            position: None,
        });
        MovementOutcome::Invalid(fault)
    }
}
