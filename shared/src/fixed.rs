//! Scaled-integer vector math
//!
//! Every authoritative coordinate is stored as an `i32` count of
//! thousandths of a world unit. All arithmetic below stays in integers so
//! two machines running the same inputs produce bit-identical state, which
//! is what replay and cross-zone agreement rely on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Neg, Sub};

/// Fixed-point units per world unit (1 unit = 1000 fixed).
pub const FIXED_SCALE: i32 = 1000;

/// Converts whole world units into fixed-point units.
pub const fn units(value: i64) -> i64 {
    value * FIXED_SCALE as i64
}

/// Floor of the square root of `n`, exact for every input.
///
/// The float estimate is only a seed; the correction loops make the result
/// independent of the platform's floating point behaviour.
pub fn isqrt(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    let mut x = (n as f64).sqrt() as u128;
    let n = n as u128;
    while x * x > n {
        x -= 1;
    }
    while (x + 1) * (x + 1) <= n {
        x += 1;
    }
    x as u64
}

/// A 3D vector in fixed-point units. Y is up; X/Z span the ground plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FixedVec3 {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

fn saturate(value: i64) -> i32 {
    value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

impl FixedVec3 {
    pub const ZERO: FixedVec3 = FixedVec3 { x: 0, y: 0, z: 0 };

    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Builds a vector from world units, rounding to the nearest fixed unit.
    ///
    /// Only used at the edges (configuration, tests, debug output); nothing
    /// in the simulation converts back and forth.
    pub fn from_units(x: f32, y: f32, z: f32) -> Self {
        let scale = FIXED_SCALE as f64;
        Self {
            x: saturate((x as f64 * scale).round() as i64),
            y: saturate((y as f64 * scale).round() as i64),
            z: saturate((z as f64 * scale).round() as i64),
        }
    }

    pub fn to_units(&self) -> (f32, f32, f32) {
        let scale = FIXED_SCALE as f32;
        (
            self.x as f32 / scale,
            self.y as f32 / scale,
            self.z as f32 / scale,
        )
    }

    pub fn dot(&self, other: &FixedVec3) -> i64 {
        let sum = self.x as i128 * other.x as i128
            + self.y as i128 * other.y as i128
            + self.z as i128 * other.z as i128;
        sum.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    pub fn length_sq(&self) -> i64 {
        self.dot(self)
    }

    pub fn length(&self) -> i64 {
        isqrt(self.length_sq() as u64) as i64
    }

    pub fn distance_sq(&self, other: &FixedVec3) -> i64 {
        (*self - *other).length_sq()
    }

    /// Squared distance on the ground plane, ignoring height.
    pub fn horizontal_distance_sq(&self, other: &FixedVec3) -> i64 {
        let dx = self.x as i64 - other.x as i64;
        let dz = self.z as i64 - other.z as i64;
        dx * dx + dz * dz
    }

    /// Multiplies every axis by `num / den`, truncating toward zero.
    pub fn scale(self, num: i64, den: i64) -> Self {
        if den == 0 {
            return FixedVec3::ZERO;
        }
        let apply = |v: i32| saturate((v as i128 * num as i128 / den as i128) as i64);
        Self {
            x: apply(self.x),
            y: apply(self.y),
            z: apply(self.z),
        }
    }

    /// Shortens the vector to at most `max_len`, keeping its direction.
    pub fn clamp_length(self, max_len: i64) -> Self {
        let len = self.length();
        if len <= max_len {
            return self;
        }
        self.scale(max_len.max(0), len)
    }

    /// Point at `num / den` of the way from `a` to `b`.
    pub fn lerp(a: FixedVec3, b: FixedVec3, num: i64, den: i64) -> Self {
        if den == 0 {
            return a;
        }
        let step = |from: i32, to: i32| {
            let delta = to as i64 - from as i64;
            saturate(from as i64 + delta * num / den)
        };
        Self {
            x: step(a.x, b.x),
            y: step(a.y, b.y),
            z: step(a.z, b.z),
        }
    }

    /// Rounds every axis down to a multiple of `step` (toward negative infinity).
    pub fn quantize(&self, step: i32) -> Self {
        if step <= 1 {
            return *self;
        }
        let q = |v: i32| v.div_euclid(step) * step;
        Self {
            x: q(self.x),
            y: q(self.y),
            z: q(self.z),
        }
    }

    pub fn clamp_axes(&self, min: &FixedVec3, max: &FixedVec3) -> Self {
        Self {
            x: self.x.clamp(min.x, max.x),
            y: self.y.clamp(min.y, max.y),
            z: self.z.clamp(min.z, max.z),
        }
    }
}

impl Add for FixedVec3 {
    type Output = FixedVec3;

    fn add(self, rhs: FixedVec3) -> FixedVec3 {
        FixedVec3 {
            x: self.x.saturating_add(rhs.x),
            y: self.y.saturating_add(rhs.y),
            z: self.z.saturating_add(rhs.z),
        }
    }
}

impl Sub for FixedVec3 {
    type Output = FixedVec3;

    fn sub(self, rhs: FixedVec3) -> FixedVec3 {
        FixedVec3 {
            x: self.x.saturating_sub(rhs.x),
            y: self.y.saturating_sub(rhs.y),
            z: self.z.saturating_sub(rhs.z),
        }
    }
}

impl Neg for FixedVec3 {
    type Output = FixedVec3;

    fn neg(self) -> FixedVec3 {
        FixedVec3 {
            x: self.x.saturating_neg(),
            y: self.y.saturating_neg(),
            z: self.z.saturating_neg(),
        }
    }
}

impl fmt::Display for FixedVec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (x, y, z) = self.to_units();
        write!(f, "({:.3}, {:.3}, {:.3})", x, y, z)
    }
}
