//! Positions and the spatial bucketing grid.
//!
//! Events sit on integer block positions ([`IntVec3`]); agents move
//! continuously ([`Vec3`]). The store buckets events into 16-block cells
//! addressed by [`CellKey`].

use serde::{Deserialize, Serialize};

/// Bit shift from block coordinates to cell coordinates (16-block cells).
pub const CELL_SHIFT: u32 = 4;

/// Edge length of one grid cell in blocks.
pub const CELL_SIZE: f64 = 16.0;

/// Integer block position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct IntVec3 {
    /// East-west coordinate.
    pub x: i32,
    /// Vertical coordinate.
    pub y: i32,
    /// North-south coordinate.
    pub z: i32,
}

impl IntVec3 {
    /// Create a block position.
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// The grid cell containing this block.
    pub const fn cell(self) -> CellKey {
        CellKey {
            x: self.x >> CELL_SHIFT,
            y: self.y >> CELL_SHIFT,
            z: self.z >> CELL_SHIFT,
        }
    }

    /// Center point of the block.
    pub fn center(self) -> Vec3 {
        Vec3::new(
            f64::from(self.x) + 0.5,
            f64::from(self.y) + 0.5,
            f64::from(self.z) + 0.5,
        )
    }

    /// Lower corner of the block, as a continuous point.
    pub fn to_vec3(self) -> Vec3 {
        Vec3::new(f64::from(self.x), f64::from(self.y), f64::from(self.z))
    }
}

/// Continuous world position.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    /// East-west coordinate.
    pub x: f64,
    /// Vertical coordinate.
    pub y: f64,
    /// North-south coordinate.
    pub z: f64,
}

impl Vec3 {
    /// Create a point.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to `other`.
    pub fn distance(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dz.mul_add(dz, dx.mul_add(dx, dy * dy)).sqrt()
    }

    /// Distance to `other` ignoring the vertical axis.
    pub fn horizontal_distance(self, other: Self) -> f64 {
        (self.x - other.x).hypot(self.z - other.z)
    }

    /// `self + (other - self) * t`.
    pub fn lerp(self, other: Self, t: f64) -> Self {
        Self::new(
            (other.x - self.x).mul_add(t, self.x),
            (other.y - self.y).mul_add(t, self.y),
            (other.z - self.z).mul_add(t, self.z),
        )
    }

    /// The block containing this point.
    ///
    /// Coordinates outside the `i32` range saturate.
    #[allow(clippy::cast_possible_truncation)]
    pub fn block(self) -> IntVec3 {
        IntVec3::new(
            self.x.floor() as i32,
            self.y.floor() as i32,
            self.z.floor() as i32,
        )
    }

    /// Whether every component is finite.
    pub const fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Address of a 16×16×16 grid cell within one world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellKey {
    /// Cell x (`block.x >> 4`).
    pub x: i32,
    /// Cell y (`block.y >> 4`).
    pub y: i32,
    /// Cell z (`block.z >> 4`).
    pub z: i32,
}

impl CellKey {
    /// The 3×3×3 block of cells centered on this one, including itself.
    pub fn neighborhood(self) -> impl Iterator<Item = Self> {
        (-1_i32..=1).flat_map(move |dx| {
            (-1_i32..=1).flat_map(move |dy| {
                (-1_i32..=1).map(move |dz| Self {
                    x: self.x.saturating_add(dx),
                    y: self.y.saturating_add(dy),
                    z: self.z.saturating_add(dz),
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_uses_arithmetic_shift() {
        assert_eq!(IntVec3::new(0, 15, 16).cell(), CellKey { x: 0, y: 0, z: 1 });
        assert_eq!(IntVec3::new(-1, -16, -17).cell(), CellKey { x: -1, y: -1, z: -2 });
    }

    #[test]
    fn neighborhood_has_27_distinct_cells() {
        let cells: std::collections::HashSet<CellKey> =
            CellKey { x: 0, y: 0, z: 0 }.neighborhood().collect();
        assert_eq!(cells.len(), 27);
        assert!(cells.contains(&CellKey { x: -1, y: 1, z: 0 }));
    }

    #[test]
    fn horizontal_distance_ignores_height() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(3.0, 100.0, 4.0);
        assert!((a.horizontal_distance(b) - 5.0).abs() < 1e-9);
        assert!(a.distance(b) > 100.0);
    }

    #[test]
    fn block_floors_negative_coordinates() {
        assert_eq!(Vec3::new(-0.5, 2.9, -3.0).block(), IntVec3::new(-1, 2, -3));
    }
}
