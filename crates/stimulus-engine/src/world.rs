//! Demonstration world: a flat plane partitioned by walls with doorways.
//!
//! Walls stand on every `x` and `z` plane that is a multiple of
//! `wall_spacing`. Each wall alternates material by its index and has a
//! two-block doorway in the middle of every span, so sound both leaks
//! through openings and is muffled by solid sections.

use stimulus_core::attenuation::{Material, ObstructionError, ObstructionQuery, RaycastHit};
use stimulus_types::{IntVec3, Vec3, WorldId};

/// Samples per block when marching a ray.
const SAMPLES_PER_BLOCK: f64 = 4.0;

/// Upper bound on samples for one ray.
const MAX_SAMPLES: f64 = 4096.0;

/// Wall layout of the demo world.
#[derive(Debug, Clone)]
pub struct WalledWorld {
    world_id: WorldId,
    wall_spacing: i32,
    floor_y: i32,
    wall_height: i32,
}

impl WalledWorld {
    /// A world named `world_id` with walls every `wall_spacing` blocks.
    pub fn new(world_id: WorldId, wall_spacing: i32) -> Self {
        Self {
            world_id,
            wall_spacing: wall_spacing.max(2),
            floor_y: 64,
            wall_height: 4,
        }
    }

    /// The world's identifier.
    pub const fn world_id(&self) -> &WorldId {
        &self.world_id
    }

    /// Floor level agents stand on.
    pub const fn floor_y(&self) -> i32 {
        self.floor_y
    }

    /// Material of the block at `pos`, or `None` for open space.
    pub fn material_at(&self, pos: IntVec3) -> Option<Material> {
        if pos.y < self.floor_y || pos.y >= self.floor_y.saturating_add(self.wall_height) {
            return None;
        }
        let on_x = pos.x.rem_euclid(self.wall_spacing) == 0;
        let on_z = pos.z.rem_euclid(self.wall_spacing) == 0;
        if !on_x && !on_z {
            return None;
        }
        // Doorway in the middle of each span along the wall.
        let along = if on_x { pos.z } else { pos.x };
        let mid = self.wall_spacing.div_euclid(2);
        let offset = along.rem_euclid(self.wall_spacing);
        if offset == mid || offset == mid.saturating_sub(1) {
            return None;
        }
        let index = if on_x {
            pos.x.div_euclid(self.wall_spacing)
        } else {
            pos.z.div_euclid(self.wall_spacing)
        };
        Some(match index.rem_euclid(3) {
            0 => Material::Stone,
            1 => Material::Wood,
            _ => Material::Glass,
        })
    }
}

impl ObstructionQuery for WalledWorld {
    fn raycast(
        &self,
        world: &WorldId,
        start: Vec3,
        end: Vec3,
    ) -> Result<Option<RaycastHit>, ObstructionError> {
        if world != &self.world_id {
            return Err(ObstructionError::WorldUnavailable(world.clone()));
        }
        let length = start.distance(end);
        if !length.is_finite() {
            return Err(ObstructionError::Host {
                message: String::from("non-finite ray"),
            });
        }
        let origin = start.block();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let samples = (length * SAMPLES_PER_BLOCK).ceil().clamp(1.0, MAX_SAMPLES) as u32;
        for i in 1..=samples {
            let block = start.lerp(end, f64::from(i) / f64::from(samples)).block();
            if block == origin {
                continue;
            }
            if let Some(material) = self.material_at(block) {
                return Ok(Some(RaycastHit {
                    position: block,
                    material,
                }));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn world() -> WalledWorld {
        WalledWorld::new(WorldId::parse("demo").unwrap(), 16)
    }

    #[test]
    fn walls_have_doorways() {
        let w = world();
        assert_eq!(w.material_at(IntVec3::new(16, 64, 3)), Some(Material::Wood));
        assert_eq!(w.material_at(IntVec3::new(16, 64, 8)), None);
        assert_eq!(w.material_at(IntVec3::new(16, 64, 7)), None);
        assert_eq!(w.material_at(IntVec3::new(5, 64, 5)), None);
        assert_eq!(w.material_at(IntVec3::new(16, 90, 3)), None);
    }

    #[test]
    fn ray_through_wall_hits_it() {
        let w = world();
        let id = w.world_id().clone();
        let hit = w
            .raycast(&id, Vec3::new(10.5, 65.5, 3.5), Vec3::new(20.5, 65.5, 3.5))
            .unwrap()
            .unwrap();
        assert_eq!(hit.position, IntVec3::new(16, 65, 3));
    }

    #[test]
    fn ray_through_doorway_is_clear() {
        let w = world();
        let id = w.world_id().clone();
        let hit = w
            .raycast(&id, Vec3::new(10.5, 65.5, 8.5), Vec3::new(20.5, 65.5, 8.5))
            .unwrap();
        assert!(hit.is_none());
    }

    #[test]
    fn unknown_world_is_an_error() {
        let w = world();
        let other = WorldId::parse("nether").unwrap();
        assert!(w.raycast(&other, Vec3::new(0.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0)).is_err());
    }
}
