//! Uniform-grid spatial index over the ground plane
//!
//! Entities are bucketed by their X/Z cell. Queries visit only the cells that
//! overlap the query's bounding rectangle and then filter every candidate
//! with the exact region test, so results match a full scan exactly.

use shared::{EntityId, FixedVec3};
use std::collections::HashMap;

/// Distance (fixed units) by which a query result may differ from an
/// exhaustive scan. Candidates are always filtered exactly, so none.
pub const QUERY_QUANTIZATION_TOLERANCE: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Points within `radius` of `center` (inclusive, full 3D distance).
    Sphere { center: FixedVec3, radius: i64 },
    /// Points inside the box, bounds inclusive.
    Box { min: FixedVec3, max: FixedVec3 },
}

impl Region {
    pub fn contains(&self, p: &FixedVec3) -> bool {
        match self {
            Region::Sphere { center, radius } => {
                let r = (*radius).max(0) as i128;
                (p.distance_sq(center) as i128) <= r * r
            }
            Region::Box { min, max } => {
                p.x >= min.x
                    && p.x <= max.x
                    && p.y >= min.y
                    && p.y <= max.y
                    && p.z >= min.z
                    && p.z <= max.z
            }
        }
    }

    /// Ground-plane bounding rectangle as `(min_x, min_z, max_x, max_z)`.
    fn ground_bounds(&self) -> (i64, i64, i64, i64) {
        match self {
            Region::Sphere { center, radius } => {
                let r = (*radius).max(0);
                (
                    center.x as i64 - r,
                    center.z as i64 - r,
                    center.x as i64 + r,
                    center.z as i64 + r,
                )
            }
            Region::Box { min, max } => (min.x as i64, min.z as i64, max.x as i64, max.z as i64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CellCoord {
    x: i64,
    z: i64,
}

#[derive(Debug, Clone, Copy)]
struct Location {
    cell: CellCoord,
    position: FixedVec3,
}

pub struct SpatialIndex {
    cell_size: i64,
    cells: HashMap<CellCoord, Vec<EntityId>>,
    locations: HashMap<EntityId, Location>,
}

impl SpatialIndex {
    pub fn new(cell_size: i64) -> Self {
        Self {
            cell_size: cell_size.max(1),
            cells: HashMap::new(),
            locations: HashMap::new(),
        }
    }

    pub fn cell_size(&self) -> i64 {
        self.cell_size
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn occupied_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn position(&self, id: EntityId) -> Option<FixedVec3> {
        self.locations.get(&id).map(|l| l.position)
    }

    fn cell_of(&self, p: &FixedVec3) -> CellCoord {
        CellCoord {
            x: (p.x as i64).div_euclid(self.cell_size),
            z: (p.z as i64).div_euclid(self.cell_size),
        }
    }

    /// Adds or moves `id`. Returns false if it was already present.
    pub fn insert(&mut self, id: EntityId, position: FixedVec3) -> bool {
        if self.locations.contains_key(&id) {
            self.update(id, position);
            return false;
        }
        let cell = self.cell_of(&position);
        self.cells.entry(cell).or_default().push(id);
        self.locations.insert(id, Location { cell, position });
        true
    }

    pub fn remove(&mut self, id: EntityId) -> bool {
        match self.locations.remove(&id) {
            Some(location) => {
                self.detach(id, location.cell);
                true
            }
            None => false,
        }
    }

    /// Records a new position. The entity is only rehashed when it crosses a
    /// cell boundary; returns whether that happened.
    pub fn update(&mut self, id: EntityId, position: FixedVec3) -> bool {
        let new_cell = self.cell_of(&position);
        let old_cell = match self.locations.get_mut(&id) {
            Some(location) => {
                location.position = position;
                if location.cell == new_cell {
                    return false;
                }
                let old = location.cell;
                location.cell = new_cell;
                old
            }
            None => return false,
        };

        self.detach(id, old_cell);
        self.cells.entry(new_cell).or_default().push(id);
        true
    }

    fn detach(&mut self, id: EntityId, cell: CellCoord) {
        if let Some(bucket) = self.cells.get_mut(&cell) {
            if let Some(index) = bucket.iter().position(|e| *e == id) {
                bucket.swap_remove(index);
            }
            if bucket.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }

    /// Appends every entity inside `region` to `out`, sorted by id.
    ///
    /// `out` is cleared first; callers keep it around between ticks so the
    /// query does not allocate once it has grown.
    pub fn query(&self, region: &Region, out: &mut Vec<EntityId>) {
        out.clear();
        let (min_x, min_z, max_x, max_z) = region.ground_bounds();
        let lo_x = min_x.div_euclid(self.cell_size);
        let lo_z = min_z.div_euclid(self.cell_size);
        let hi_x = max_x.div_euclid(self.cell_size);
        let hi_z = max_z.div_euclid(self.cell_size);

        let span = (hi_x - lo_x + 1).saturating_mul(hi_z - lo_z + 1);
        if span as u64 > self.cells.len() as u64 {
            // Region covers more cells than are occupied; walk occupied ones.
            for (cell, bucket) in &self.cells {
                if cell.x < lo_x || cell.x > hi_x || cell.z < lo_z || cell.z > hi_z {
                    continue;
                }
                self.collect(bucket, region, out);
            }
        } else {
            for cx in lo_x..=hi_x {
                for cz in lo_z..=hi_z {
                    if let Some(bucket) = self.cells.get(&CellCoord { x: cx, z: cz }) {
                        self.collect(bucket, region, out);
                    }
                }
            }
        }
        out.sort_unstable();
    }

    fn collect(&self, bucket: &[EntityId], region: &Region, out: &mut Vec<EntityId>) {
        for id in bucket {
            if let Some(location) = self.locations.get(id) {
                if region.contains(&location.position) {
                    out.push(*id);
                }
            }
        }
    }

    /// Re-buckets every entity under a new cell size.
    pub fn rebuild(&mut self, cell_size: i64) {
        self.cell_size = cell_size.max(1);
        self.cells.clear();
        let entries: Vec<(EntityId, FixedVec3)> = self
            .locations
            .iter()
            .map(|(id, l)| (*id, l.position))
            .collect();
        for (id, position) in entries {
            let cell = self.cell_of(&position);
            self.cells.entry(cell).or_default().push(id);
            if let Some(location) = self.locations.get_mut(&id) {
                location.cell = cell;
            }
        }
    }

    /// O(n) reference scan used to check the index.
    pub fn brute_force(&self, region: &Region, out: &mut Vec<EntityId>) {
        out.clear();
        out.extend(
            self.locations
                .iter()
                .filter(|(_, l)| region.contains(&l.position))
                .map(|(id, _)| *id),
        );
        out.sort_unstable();
    }
}
