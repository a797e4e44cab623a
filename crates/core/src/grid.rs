use std::collections::HashMap;

use glam::{DVec3, IVec3};

use crate::cloud::{Aabb, Cloud};

/// Uniform voxel index from voxel coordinate to the ids of every ray whose
/// segment passes through that voxel. Built once per pass, then read only.
#[derive(Debug, Clone)]
pub struct RayGrid {
    bounds: Aabb,
    voxel_width: f64,
    dims: IVec3,
    cells: HashMap<IVec3, Vec<u32>>,
}

impl RayGrid {
    pub fn new(bounds: Aabb, voxel_width: f64) -> Self {
        let voxel_width = if voxel_width.is_finite() && voxel_width > 0.0 {
            voxel_width
        } else {
            1.0
        };
        // one extra layer so points on `bounds.max` have a voxel
        let cells = (bounds.size() / voxel_width).floor() + DVec3::ONE;
        Self {
            bounds,
            voxel_width,
            dims: IVec3::new(cells.x as i32, cells.y as i32, cells.z as i32),
            cells: HashMap::new(),
        }
    }

    /// Indexes every ray of `cloud`. Returns `None` for an empty cloud.
    pub fn build(cloud: &Cloud, voxel_width: f64) -> Option<Self> {
        let bounds = cloud.bounds()?;
        let mut grid = Self::new(bounds, voxel_width);
        grid.fill(cloud);
        Some(grid)
    }

    pub fn fill(&mut self, cloud: &Cloud) {
        tracing::debug!("filling grid with {} rays", cloud.len());
        let mut voxels = Vec::new();
        for (idx, (start, end)) in cloud.starts.iter().zip(&cloud.ends).enumerate() {
            voxels.clear();
            self.walk_voxels(*start, *end, |voxel| voxels.push(voxel));
            for voxel in &voxels {
                self.cells.entry(*voxel).or_default().push(idx as u32);
            }
        }
        tracing::debug!(
            "grid {:?} holds {} occupied cells of width {}",
            self.dims,
            self.cells.len(),
            self.voxel_width
        );
    }

    pub fn voxel_of(&self, point: DVec3) -> IVec3 {
        let scaled = ((point - self.bounds.min) / self.voxel_width).floor();
        IVec3::new(scaled.x as i32, scaled.y as i32, scaled.z as i32)
    }

    pub fn cell(&self, voxel: IVec3) -> &[u32] {
        self.cells.get(&voxel).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Visits the voxels crossed by the segment from `start` to `end`, in
    /// order. Each step moves one voxel along the axis whose next boundary is
    /// nearest (ties go x, then y, then z), so the sequence is 6-connected.
    /// The walk stops at the end voxel, or once it has moved further from the
    /// start voxel than the end voxel is.
    pub fn walk_voxels(&self, start: DVec3, end: DVec3, mut visit: impl FnMut(IVec3)) {
        let dir = end - start;
        let sign = DVec3::new(step_sign(dir.x), step_sign(dir.y), step_sign(dir.z));
        let start_index = self.voxel_of(start);
        let end_index = self.voxel_of(end);
        let length_sqr = index_distance_sqr(end_index, start_index);
        let mut index = start_index;
        loop {
            visit(index);
            if index == end_index || index_distance_sqr(index, start_index) > length_sqr {
                break;
            }
            let mid = self.bounds.min + self.voxel_width * (index.as_dvec3() + DVec3::splat(0.5));
            let next_boundary = mid + 0.5 * self.voxel_width * sign;
            let delta = next_boundary - start;
            let d = DVec3::new(
                axis_param(delta.x, dir.x),
                axis_param(delta.y, dir.y),
                axis_param(delta.z, dir.z),
            );
            if d.x <= d.y && d.x <= d.z {
                index.x += sign.x as i32;
            } else if d.y <= d.z {
                index.y += sign.y as i32;
            } else {
                index.z += sign.z as i32;
            }
        }
    }

    /// Clamped voxel range covering the box `centre ± extents`, or `None` when
    /// the box lies outside the grid.
    pub fn voxel_range(&self, centre: DVec3, extents: DVec3) -> Option<(IVec3, IVec3)> {
        let b_min = (centre - extents - self.bounds.min) / self.voxel_width;
        let b_max = (centre + extents - self.bounds.min) / self.voxel_width;
        if b_max.cmplt(DVec3::ZERO).any() || b_min.cmpge(self.dims.as_dvec3()).any() {
            return None;
        }
        let lo = IVec3::new(b_min.x as i32, b_min.y as i32, b_min.z as i32).max(IVec3::ZERO);
        let hi = IVec3::new(b_max.x as i32, b_max.y as i32, b_max.z as i32).min(self.dims - IVec3::ONE);
        Some((lo, hi))
    }
}

fn step_sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else {
        -1.0
    }
}

fn axis_param(delta: f64, dir: f64) -> f64 {
    if dir == 0.0 {
        f64::INFINITY
    } else {
        delta / dir
    }
}

fn index_distance_sqr(a: IVec3, b: IVec3) -> i64 {
    let d = (a - b).as_i64vec3();
    d.x * d.x + d.y * d.y + d.z * d.z
}
