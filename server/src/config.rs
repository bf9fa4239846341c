//! Zone configuration
//!
//! Read once at startup (JSON via `serde_json`, overridden by CLI flags) and
//! immutable afterwards. Every configured limit is checked against the hard
//! constants below, so a malformed or hostile config can never lift the
//! simulation past them.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use shared::{units, FixedVec3, ZoneId, DEFAULT_TICK_RATE_HZ, TAU_MILLIRADIANS};
use std::path::Path;
use std::time::Duration;

/// Fastest any class may ever move, in fixed units per second.
pub const HARD_MAX_SPEED: i64 = units(50);
/// Fastest any class may ever turn, in milliradians per second.
pub const HARD_MAX_ROTATION_RATE: i64 = 4 * TAU_MILLIRADIANS as i64;
/// Absolute coordinate limit on every axis, in fixed units.
pub const HARD_WORLD_EXTENT: i32 = 500_000_000;
/// Longest history ring any entity keeps.
pub const HARD_MAX_REWIND_TICKS: u32 = 600;

/// Axis-aligned rectangle on the ground plane (X/Z), half-open on the max side
/// so adjacent zones partition space without double-claiming an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub min_x: i32,
    pub min_z: i32,
    pub max_x: i32,
    pub max_z: i32,
}

impl Rect {
    pub fn from_units(min_x: i64, min_z: i64, max_x: i64, max_z: i64) -> Self {
        Self {
            min_x: units(min_x) as i32,
            min_z: units(min_z) as i32,
            max_x: units(max_x) as i32,
            max_z: units(max_z) as i32,
        }
    }

    pub fn contains(&self, p: &FixedVec3) -> bool {
        p.x >= self.min_x && p.x < self.max_x && p.z >= self.min_z && p.z < self.max_z
    }

    /// Squared ground distance from `p` to the rectangle; zero inside.
    pub fn distance_sq(&self, p: &FixedVec3) -> i64 {
        let dx = if p.x < self.min_x {
            self.min_x as i64 - p.x as i64
        } else if p.x >= self.max_x {
            p.x as i64 - self.max_x as i64
        } else {
            0
        };
        let dz = if p.z < self.min_z {
            self.min_z as i64 - p.z as i64
        } else if p.z >= self.max_z {
            p.z as i64 - self.max_z as i64
        } else {
            0
        };
        dx * dx + dz * dz
    }

    /// How far inside the rectangle `p` is (distance to the nearest edge).
    /// Negative or zero when outside.
    pub fn depth(&self, p: &FixedVec3) -> i64 {
        if !self.contains(p) {
            return -isqrt_i64(self.distance_sq(p));
        }
        let left = p.x as i64 - self.min_x as i64;
        let right = self.max_x as i64 - p.x as i64;
        let near = p.z as i64 - self.min_z as i64;
        let far = self.max_z as i64 - p.z as i64;
        left.min(right).min(near).min(far)
    }

    pub fn center(&self) -> FixedVec3 {
        FixedVec3::new(
            ((self.min_x as i64 + self.max_x as i64) / 2) as i32,
            0,
            ((self.min_z as i64 + self.max_z as i64) / 2) as i32,
        )
    }

    fn is_valid(&self) -> bool {
        self.min_x < self.max_x
            && self.min_z < self.max_z
            && self.min_x >= -HARD_WORLD_EXTENT
            && self.min_z >= -HARD_WORLD_EXTENT
            && self.max_x <= HARD_WORLD_EXTENT
            && self.max_z <= HARD_WORLD_EXTENT
    }
}

fn isqrt_i64(v: i64) -> i64 {
    shared::isqrt(v.max(0) as u64) as i64
}

/// World extents; positions are clamped into this box on every move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldBounds {
    pub min: FixedVec3,
    pub max: FixedVec3,
}

impl WorldBounds {
    /// Configured bounds intersected with the hard world extent.
    pub fn effective(&self) -> WorldBounds {
        let hard = |v: i32| v.clamp(-HARD_WORLD_EXTENT, HARD_WORLD_EXTENT);
        WorldBounds {
            min: FixedVec3::new(hard(self.min.x), hard(self.min.y), hard(self.min.z)),
            max: FixedVec3::new(hard(self.max.x), hard(self.max.y), hard(self.max.z)),
        }
    }

    pub fn contains(&self, p: &FixedVec3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    pub fn clamp(&self, p: &FixedVec3) -> FixedVec3 {
        p.clamp_axes(&self.min, &self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborZone {
    pub id: ZoneId,
    pub bounds: Rect,
    /// Socket address of the neighbour's authority, e.g. `"10.0.0.2:7777"`.
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneDescriptor {
    pub id: ZoneId,
    pub bounds: Rect,
    /// Width of the band on each side of a shared edge that is mirrored.
    pub overlap_margin: i32,
    pub neighbors: Vec<NeighborZone>,
    pub spawn_point: FixedVec3,
}

impl ZoneDescriptor {
    pub fn neighbor(&self, id: ZoneId) -> Option<&NeighborZone> {
        self.neighbors.iter().find(|n| n.id == id)
    }
}

/// One distance band: entities within `radius` refresh every `refresh_every` ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AoiTier {
    pub radius: i64,
    pub refresh_every: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCaps {
    pub class_id: u8,
    /// Fixed units per second.
    pub max_speed: i64,
    /// Milliradians per second.
    pub rotation_rate: i64,
    pub max_health: i32,
}

impl ClassCaps {
    /// Caps clamped to the hard limits regardless of what was configured.
    pub fn hardened(&self) -> ClassCaps {
        ClassCaps {
            class_id: self.class_id,
            max_speed: self.max_speed.clamp(0, HARD_MAX_SPEED),
            rotation_rate: self.rotation_rate.clamp(0, HARD_MAX_ROTATION_RATE),
            max_health: self.max_health.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementPolicy {
    /// Displacement above the bound by at most this share is applied as-is.
    pub soft_tolerance_pct: u32,
    /// Displacement above this multiple of the bound is rejected outright.
    pub reject_multiple_pct: u32,
    /// Soft violations after which a connection becomes a kick candidate.
    pub soft_violation_kick_threshold: u32,
}

impl Default for MovementPolicy {
    fn default() -> Self {
        Self {
            soft_tolerance_pct: 20,
            reject_multiple_pct: 200,
            soft_violation_kick_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeaponKind {
    /// Cone in front of the attacker.
    Melee { range: i64, arc_milliradians: i32 },
    /// Ray along the aim direction against the target's hit sphere.
    Ranged { range: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeaponConfig {
    pub slot: u8,
    pub kind: WeaponKind,
    pub damage: i32,
    pub cooldown_ticks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombatConfig {
    pub rewind_window_ms: u32,
    pub max_rewind_ms: u32,
    pub hit_radius: i64,
    /// Rewind the attacker as well as the target before the geometric test.
    pub rewind_attacker: bool,
    pub weapons: Vec<WeaponConfig>,
}

impl Default for CombatConfig {
    fn default() -> Self {
        Self {
            rewind_window_ms: 2000,
            max_rewind_ms: 500,
            hit_radius: 500,
            rewind_attacker: false,
            weapons: vec![
                WeaponConfig {
                    slot: 0,
                    kind: WeaponKind::Melee {
                        range: units(3),
                        arc_milliradians: 1047,
                    },
                    damage: 250,
                    cooldown_ticks: 30,
                },
                WeaponConfig {
                    slot: 1,
                    kind: WeaponKind::Ranged { range: units(60) },
                    damage: 150,
                    cooldown_ticks: 45,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub timeout_ticks: u32,
    pub ticket_retention_ticks: u32,
    pub retry_cooldown_ticks: u32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            timeout_ticks: 30,
            ticket_retention_ticks: 120,
            retry_cooldown_ticks: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Share of the tick period the work may take before it counts as an overrun.
    pub budget_pct: u32,
    /// Consecutive overruns after which the spatial cell size is widened.
    pub cell_widen_after: u32,
    /// Clean ticks after which degradation steps back down one level.
    pub recover_after: u32,
    pub max_degradation: u8,
    pub max_cell_size: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            budget_pct: 90,
            cell_widen_after: 30,
            recover_after: 120,
            max_degradation: 3,
            max_cell_size: units(160),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub outbound_capacity: usize,
    pub persistence_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 8192,
            persistence_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    pub tick_rate: u32,
    pub max_clients: usize,
    pub client_timeout_secs: u64,
    pub world: WorldBounds,
    pub zone: ZoneDescriptor,
    /// Spatial index cell edge. Picked so a cell holds roughly 8-16 entities
    /// at the expected density.
    pub cell_size: i64,
    pub aoi_tiers: Vec<AoiTier>,
    pub classes: Vec<ClassCaps>,
    pub movement: MovementPolicy,
    pub combat: CombatConfig,
    pub migration: MigrationConfig,
    pub scheduler: SchedulerConfig,
    pub queues: QueueConfig,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        let bounds = Rect::from_units(-1000, -1000, 1000, 1000);
        Self {
            tick_rate: DEFAULT_TICK_RATE_HZ,
            max_clients: 400,
            client_timeout_secs: 5,
            world: WorldBounds {
                min: FixedVec3::new(units(-5000) as i32, units(-100) as i32, units(-5000) as i32),
                max: FixedVec3::new(units(5000) as i32, units(500) as i32, units(5000) as i32),
            },
            zone: ZoneDescriptor {
                id: ZoneId(1),
                bounds,
                overlap_margin: units(50) as i32,
                neighbors: Vec::new(),
                spawn_point: bounds.center(),
            },
            cell_size: units(20),
            aoi_tiers: vec![
                AoiTier {
                    radius: units(50),
                    refresh_every: 1,
                },
                AoiTier {
                    radius: units(100),
                    refresh_every: 3,
                },
                AoiTier {
                    radius: units(200),
                    refresh_every: 12,
                },
            ],
            classes: vec![
                ClassCaps {
                    class_id: 0,
                    max_speed: units(6),
                    rotation_rate: 12_566,
                    max_health: 1000,
                },
                ClassCaps {
                    class_id: 1,
                    max_speed: units(9),
                    rotation_rate: 12_566,
                    max_health: 700,
                },
            ],
            movement: MovementPolicy::default(),
            combat: CombatConfig::default(),
            migration: MigrationConfig::default(),
            scheduler: SchedulerConfig::default(),
            queues: QueueConfig::default(),
        }
    }
}

impl ZoneConfig {
    /// Reads and validates a JSON config file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: ZoneConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return Err(ConfigError::TickRate(self.tick_rate));
        }
        if self.aoi_tiers.is_empty()
            || self.aoi_tiers.iter().any(|t| t.refresh_every == 0 || t.radius <= 0)
            || self
                .aoi_tiers
                .windows(2)
                .any(|pair| pair[0].radius >= pair[1].radius)
        {
            return Err(ConfigError::AoiTiers);
        }
        if !self.zone.bounds.is_valid() || self.zone.neighbors.iter().any(|n| !n.bounds.is_valid())
        {
            return Err(ConfigError::ZoneBounds);
        }
        if self.classes.is_empty() {
            return Err(ConfigError::NoClasses);
        }
        if 100 + self.movement.soft_tolerance_pct >= self.movement.reject_multiple_pct {
            return Err(ConfigError::MovementThresholds {
                tolerance_pct: self.movement.soft_tolerance_pct,
                reject_multiple_pct: self.movement.reject_multiple_pct,
            });
        }
        if self.cell_size <= 0 {
            return Err(ConfigError::Zero("cell_size"));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Zero("max_clients"));
        }
        if self.migration.timeout_ticks == 0 {
            return Err(ConfigError::Zero("migration.timeout_ticks"));
        }
        if self.queues.outbound_capacity == 0 || self.queues.persistence_capacity == 0 {
            return Err(ConfigError::Zero("queue capacity"));
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.tick_rate.max(1) as u64)
    }

    /// Milliseconds to whole ticks, rounding up.
    pub fn ms_to_ticks(&self, ms: u32) -> u32 {
        let rate = self.tick_rate.max(1) as u64;
        ((ms as u64 * rate + 999) / 1000) as u32
    }

    pub fn rewind_window_ticks(&self) -> u32 {
        self.ms_to_ticks(self.combat.rewind_window_ms)
            .clamp(2, HARD_MAX_REWIND_TICKS)
    }

    /// Caps for `class_id`, falling back to the first configured class.
    pub fn class(&self, class_id: u8) -> ClassCaps {
        self.classes
            .iter()
            .find(|c| c.class_id == class_id)
            .or_else(|| self.classes.first())
            .map(ClassCaps::hardened)
            .unwrap_or(ClassCaps {
                class_id,
                max_speed: 0,
                rotation_rate: 0,
                max_health: 1,
            })
    }

    pub fn weapon(&self, slot: u8) -> Option<&WeaponConfig> {
        self.combat.weapons.iter().find(|w| w.slot == slot)
    }

    /// Outermost AOI radius.
    pub fn aoi_reach(&self) -> i64 {
        self.aoi_tiers.last().map(|t| t.radius).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ZoneConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rewind_window_ticks(), 120);
        assert_eq!(config.aoi_reach(), units(200));
    }

    #[test]
    fn test_rect_contains_is_half_open() {
        let rect = Rect::from_units(0, 0, 10, 10);
        assert!(rect.contains(&FixedVec3::new(0, 0, 0)));
        assert!(!rect.contains(&FixedVec3::new(10_000, 0, 5_000)));
        assert!(rect.contains(&FixedVec3::new(9_999, 0, 9_999)));
    }

    #[test]
    fn test_rect_distance_and_depth() {
        let rect = Rect::from_units(0, 0, 10, 10);
        let outside = FixedVec3::new(13_000, 0, 14_000);
        assert_eq!(rect.distance_sq(&outside), 3_000 * 3_000 + 4_000 * 4_000);
        assert_eq!(rect.depth(&outside), -5_000);

        let inside = FixedVec3::new(2_000, 0, 5_000);
        assert_eq!(rect.distance_sq(&inside), 0);
        assert_eq!(rect.depth(&inside), 2_000);
    }

    #[test]
    fn test_class_caps_are_hardened() {
        let mut config = ZoneConfig::default();
        config.classes = vec![ClassCaps {
            class_id: 4,
            max_speed: units(10_000),
            rotation_rate: i64::MAX,
            max_health: 0,
        }];

        let caps = config.class(4);
        assert_eq!(caps.max_speed, HARD_MAX_SPEED);
        assert_eq!(caps.rotation_rate, HARD_MAX_ROTATION_RATE);
        assert_eq!(caps.max_health, 1);

        // Unknown classes fall back to the first entry
        assert_eq!(config.class(99).class_id, 4);
    }

    #[test]
    fn test_invalid_tiers_rejected() {
        let mut config = ZoneConfig::default();
        config.aoi_tiers[1].radius = config.aoi_tiers[0].radius;
        assert!(matches!(config.validate(), Err(ConfigError::AoiTiers)));
    }

    #[test]
    fn test_movement_thresholds_must_be_ordered() {
        let mut config = ZoneConfig::default();
        config.movement.soft_tolerance_pct = 150;
        config.movement.reject_multiple_pct = 200;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MovementThresholds { .. })
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ZoneConfig::from_json(r#"{ "tick_rate": 30, "max_clients": 8 }"#).unwrap();
        assert_eq!(config.tick_rate, 30);
        assert_eq!(config.max_clients, 8);
        assert_eq!(config.aoi_tiers.len(), 3);
        assert_eq!(config.rewind_window_ticks(), 60);
    }

    #[test]
    fn test_invalid_json_tick_rate() {
        let result = ZoneConfig::from_json(r#"{ "tick_rate": 0 }"#);
        assert!(matches!(result, Err(ConfigError::TickRate(0))));
    }

    #[test]
    fn test_tick_period() {
        let config = ZoneConfig::default();
        assert_eq!(config.tick_period(), Duration::from_nanos(16_666_666));
        assert_eq!(config.ms_to_ticks(500), 30);
        assert_eq!(config.ms_to_ticks(1), 1);
    }
}
