use std::collections::HashSet;
use std::f64::consts::SQRT_2;

use glam::{DVec3, IVec3};

use crate::cloud::Cloud;

/// Width of the buckets that decide whether two rays are the same ray.
pub const RAY_MATCH_WIDTH: f64 = 0.01;

pub fn voxel_key(point: DVec3, voxel_width: f64) -> IVec3 {
    let scaled = (point / voxel_width).floor();
    IVec3::new(scaled.x as i32, scaled.y as i32, scaled.z as i32)
}

/// Appends to `indices` the first point of every voxel not already in
/// `voxel_set`. The set persists across calls so chunked input decimates
/// globally; `indices` is cleared first so it can be reused per chunk.
pub fn voxel_subsample(
    points: &[DVec3],
    voxel_width: f64,
    indices: &mut Vec<usize>,
    voxel_set: &mut HashSet<IVec3>,
) {
    indices.clear();
    for (idx, point) in points.iter().enumerate() {
        if voxel_set.insert(voxel_key(*point, voxel_width)) {
            indices.push(idx);
        }
    }
}

/// Start and end quantised into 1 cm buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RayKey([i32; 6]);

impl RayKey {
    pub fn new(start: DVec3, end: DVec3) -> Self {
        let s = voxel_key(start, RAY_MATCH_WIDTH);
        let e = voxel_key(end, RAY_MATCH_WIDTH);
        Self([s.x, s.y, s.z, e.x, e.y, e.z])
    }
}

#[derive(Debug, Default, Clone)]
pub struct RayLookup {
    keys: HashSet<RayKey>,
}

impl RayLookup {
    pub fn from_cloud(cloud: &Cloud) -> Self {
        let mut keys = HashSet::with_capacity(cloud.len());
        for (start, end) in cloud.starts.iter().zip(&cloud.ends) {
            keys.insert(RayKey::new(*start, *end));
        }
        Self { keys }
    }

    pub fn contains(&self, key: &RayKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Finest and coarsest levels of [`LengthVoxels`], about 1 mm and 34 km.
const MIN_LENGTH_LEVEL: i32 = -20;
const MAX_LENGTH_LEVEL: i32 = 50;

/// Voxel sets for decimating by ray length. Voxels at level `l` are
/// `sqrt(2)^l` wide and each ray is keyed at the level matching
/// `length * spacing_per_length`, so long rays are kept more sparsely.
///
/// Selection takes two passes: [`observe`] every ray, then [`keep`] every
/// ray in the same order. A ray is dropped when a shorter ray ended in the
/// coarser voxel it falls in.
///
/// [`observe`]: LengthVoxels::observe
/// [`keep`]: LengthVoxels::keep
#[derive(Debug, Clone)]
pub struct LengthVoxels {
    spacing_per_length: f64,
    occupied: Vec<HashSet<IVec3>>,
    /// Voxels that contain a finer occupied voxel.
    covered: Vec<HashSet<IVec3>>,
    selecting: bool,
}

impl LengthVoxels {
    pub fn new(spacing_per_length: f64) -> Self {
        let levels = (MAX_LENGTH_LEVEL - MIN_LENGTH_LEVEL + 1) as usize;
        Self {
            spacing_per_length,
            occupied: vec![HashSet::new(); levels],
            covered: vec![HashSet::new(); levels],
            selecting: false,
        }
    }

    fn level_key(&self, start: DVec3, end: DVec3) -> (usize, IVec3) {
        let spacing = start.distance(end) * self.spacing_per_length;
        let level = ((2.0 * spacing).ln() / SQRT_2.ln()).round() as i32;
        let level = level.clamp(MIN_LENGTH_LEVEL, MAX_LENGTH_LEVEL);
        let key = voxel_key(end, SQRT_2.powi(level));
        ((level - MIN_LENGTH_LEVEL) as usize, key)
    }

    /// First pass: occupies the ray's voxel and covers its coarser parents.
    pub fn observe(&mut self, start: DVec3, end: DVec3) {
        let (level, key) = self.level_key(start, end);
        if self.covered[level].contains(&key) || !self.occupied[level].insert(key) {
            return;
        }
        let mut scale = SQRT_2;
        for coarser in level + 1..self.covered.len() {
            let parent = voxel_key(key.as_dvec3(), scale);
            if !self.covered[coarser].insert(parent) {
                break;
            }
            scale *= SQRT_2;
        }
    }

    /// Second pass: whether the ray is the first uncovered one in its voxel.
    pub fn keep(&mut self, start: DVec3, end: DVec3) -> bool {
        if !self.selecting {
            self.occupied.iter_mut().for_each(HashSet::clear);
            self.selecting = true;
        }
        let (level, key) = self.level_key(start, end);
        !self.covered[level].contains(&key) && self.occupied[level].insert(key)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use glam::{DVec3, IVec3};

    use super::{voxel_key, voxel_subsample, LengthVoxels, RayKey};

    #[test]
    fn voxel_key_floors_negative_coordinates() {
        assert_eq!(voxel_key(DVec3::new(-0.01, 0.5, 1.0), 1.0), IVec3::new(-1, 0, 1));
    }

    #[test]
    fn subsample_set_persists_across_chunks() {
        let mut set = HashSet::new();
        let mut indices = Vec::new();
        voxel_subsample(&[DVec3::ZERO, DVec3::splat(0.05)], 0.1, &mut indices, &mut set);
        assert_eq!(indices, vec![0]);
        voxel_subsample(&[DVec3::splat(0.01), DVec3::splat(0.5)], 0.1, &mut indices, &mut set);
        assert_eq!(indices, vec![1]);
    }

    #[test]
    fn ray_key_tolerates_sub_centimetre_noise() {
        let a = RayKey::new(DVec3::new(0.001, 0.0, 0.0), DVec3::new(1.002, 0.0, 0.0));
        let b = RayKey::new(DVec3::new(0.004, 0.0, 0.0), DVec3::new(1.006, 0.0, 0.0));
        let c = RayKey::new(DVec3::new(0.004, 0.0, 0.0), DVec3::new(1.016, 0.0, 0.0));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn shorter_rays_suppress_longer_ones_at_the_same_place() {
        let end = DVec3::splat(0.05);
        let rays = [
            (end + DVec3::new(0.0, 0.0, 20.0), end),
            (end + DVec3::new(0.0, 0.0, 1.0), end),
            (DVec3::new(0.06, 0.05, 1.05), DVec3::new(0.06, 0.05, 0.05)),
            (DVec3::new(10.0, 0.5, 20.5), DVec3::new(10.0, 0.5, 0.5)),
            (DVec3::new(10.3, 0.5, 20.5), DVec3::new(10.3, 0.5, 0.5)),
        ];
        let mut voxels = LengthVoxels::new(0.05);
        for (start, end) in rays {
            voxels.observe(start, end);
        }
        let kept: Vec<bool> = rays.iter().map(|(start, end)| voxels.keep(*start, *end)).collect();
        assert_eq!(kept, vec![false, true, false, true, false]);
    }
}
