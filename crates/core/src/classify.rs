use std::collections::HashSet;

use glam::DVec3;

use crate::cloud::Cloud;
use crate::ellipsoid::Ellipsoid;
use crate::grid::RayGrid;

/// How far past an ellipsoid a ray must travel to count as seeing through it.
pub const PASS_DISTANCE: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RayOutcome {
    Miss,
    Hit,
    PassThrough,
}

/// Intersects the segment `start..end` with the ellipsoid, working in the
/// ellipsoid's unit-sphere frame.
pub fn intersect(ellipsoid: &Ellipsoid, start: DVec3, end: DVec3) -> RayOutcome {
    let dir = end - start;
    let ray = ellipsoid.eigen_mat * dir;
    let ray_length_sqr = ray.length_squared();
    if ray_length_sqr <= 0.0 || !ray_length_sqr.is_finite() {
        return RayOutcome::Miss;
    }
    let to = ellipsoid.eigen_mat * (ellipsoid.pos - start);

    let mut d = to.dot(ray) / ray_length_sqr;
    let dist2 = (to - ray * d).length_squared();
    if dist2 > 1.0 {
        return RayOutcome::Miss;
    }
    let along_dist = (1.0 - dist2).sqrt();
    let ray_length = ray_length_sqr.sqrt();
    d *= ray_length;
    if ray_length < d - along_dist {
        // stops short of the ellipsoid
        return RayOutcome::Miss;
    }

    let ratio = PASS_DISTANCE / dir.length();
    if ray_length * (1.0 - ratio) > d + along_dist {
        RayOutcome::PassThrough
    } else {
        RayOutcome::Hit
    }
}

/// Hit and pass-through evidence gathered for one ellipsoid.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub hits: usize,
    /// Pass-through ray ids in grid traversal order.
    pub pass_throughs: Vec<u32>,
    pub first_hit_time: f64,
    pub last_hit_time: f64,
}

impl Default for Classification {
    fn default() -> Self {
        Self {
            hits: 0,
            pass_throughs: Vec::new(),
            first_hit_time: f64::INFINITY,
            last_hit_time: f64::NEG_INFINITY,
        }
    }
}

impl Classification {
    pub fn num_rays(&self) -> usize {
        self.hits + self.pass_throughs.len()
    }

    /// Fraction of intersecting rays that stopped at the surface.
    pub fn opacity(&self) -> Option<f64> {
        let total = self.num_rays();
        (total > 0).then(|| self.hits as f64 / total as f64)
    }
}

/// Ids of the rays indexed in the voxels overlapping the ellipsoid's box, in
/// cell order, each listed once.
pub fn candidate_rays(grid: &RayGrid, ellipsoid: &Ellipsoid) -> Vec<u32> {
    let mut ray_ids = Vec::new();
    let Some((lo, hi)) = grid.voxel_range(ellipsoid.pos, ellipsoid.extents) else {
        return ray_ids;
    };
    let mut tested = HashSet::new();
    for x in lo.x..=hi.x {
        for y in lo.y..=hi.y {
            for z in lo.z..=hi.z {
                for &id in grid.cell(glam::IVec3::new(x, y, z)) {
                    if tested.insert(id) {
                        ray_ids.push(id);
                    }
                }
            }
        }
    }
    ray_ids
}

/// Classifies every ray of `rays` near the ellipsoid, using `grid` (built
/// over `rays`) to find candidates.
pub fn classify(grid: &RayGrid, ellipsoid: &Ellipsoid, rays: &Cloud) -> Classification {
    let mut result = Classification::default();
    for id in candidate_rays(grid, ellipsoid) {
        let idx = id as usize;
        match intersect(ellipsoid, rays.starts[idx], rays.ends[idx]) {
            RayOutcome::Miss => {}
            RayOutcome::PassThrough => result.pass_throughs.push(id),
            RayOutcome::Hit => {
                result.hits += 1;
                result.first_hit_time = result.first_hit_time.min(rays.times[idx]);
                result.last_hit_time = result.last_hit_time.max(rays.times[idx]);
            }
        }
    }
    result
}
