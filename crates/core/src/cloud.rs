use std::collections::HashSet;

use glam::{DAffine3, DVec3, IVec3};
use serde::{Deserialize, Serialize};

use crate::error::CloudError;
use crate::voxel::{voxel_key, voxel_subsample};

const SPACING_VOXEL_WIDTH: f64 = 0.25;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rgba {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub alpha: u8,
}

impl Rgba {
    pub const fn new(red: u8, green: u8, blue: u8, alpha: u8) -> Self {
        Self {
            red,
            green,
            blue,
            alpha,
        }
    }

    pub const fn grey(value: u8) -> Self {
        Self::new(value, value, value, 255)
    }

    /// Unbounded rays carry a zero alpha.
    pub const fn unbounded() -> Self {
        Self::new(0, 0, 0, 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub start: DVec3,
    pub end: DVec3,
    pub time: f64,
    pub colour: Rgba,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl Aabb {
    pub fn from_point(point: DVec3) -> Self {
        Self {
            min: point,
            max: point,
        }
    }

    pub fn include(&mut self, point: DVec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn union(self, other: Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    pub fn contains(&self, point: DVec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    /// The part of the segment from `start` to `end` inside the box, or
    /// `None` when it misses. Ends that are already inside are returned
    /// unchanged.
    pub fn clip_segment(&self, start: DVec3, end: DVec3) -> Option<(DVec3, DVec3)> {
        let dir = end - start;
        let (mut near, mut far) = (0.0f64, 1.0f64);
        for axis in 0..3 {
            let (from, step) = (start[axis], dir[axis]);
            if step == 0.0 {
                if from < self.min[axis] || from > self.max[axis] {
                    return None;
                }
                continue;
            }
            let a = (self.min[axis] - from) / step;
            let b = (self.max[axis] - from) / step;
            near = near.max(a.min(b));
            far = far.min(a.max(b));
            if near > far {
                return None;
            }
        }
        let clipped_start = if near > 0.0 { start + dir * near } else { start };
        let clipped_end = if far < 1.0 { start + dir * far } else { end };
        Some((clipped_start, clipped_end))
    }
}

/// Structure-of-arrays ray cloud. The four arrays are index aligned; every
/// mutation here touches all of them together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cloud {
    pub starts: Vec<DVec3>,
    pub ends: Vec<DVec3>,
    pub times: Vec<f64>,
    pub colours: Vec<Rgba>,
}

impl Cloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(count: usize) -> Self {
        Self {
            starts: Vec::with_capacity(count),
            ends: Vec::with_capacity(count),
            times: Vec::with_capacity(count),
            colours: Vec::with_capacity(count),
        }
    }

    pub fn len(&self) -> usize {
        self.ends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }

    pub fn validate(&self) -> Result<(), CloudError> {
        let count = self.ends.len();
        if self.starts.len() != count || self.times.len() != count || self.colours.len() != count {
            return Err(CloudError::InconsistentArrays {
                starts: self.starts.len(),
                ends: self.ends.len(),
                times: self.times.len(),
                colours: self.colours.len(),
            });
        }
        Ok(())
    }

    pub fn add_ray(&mut self, start: DVec3, end: DVec3, time: f64, colour: Rgba) {
        self.starts.push(start);
        self.ends.push(end);
        self.times.push(time);
        self.colours.push(colour);
    }

    /// Copies ray `index` of `other` onto the end of this cloud.
    pub fn push_from(&mut self, other: &Cloud, index: usize) {
        self.add_ray(
            other.starts[index],
            other.ends[index],
            other.times[index],
            other.colours[index],
        );
    }

    pub fn ray(&self, index: usize) -> Ray {
        Ray {
            start: self.starts[index],
            end: self.ends[index],
            time: self.times[index],
            colour: self.colours[index],
        }
    }

    pub fn ray_bounded(&self, index: usize) -> bool {
        self.colours[index].alpha != 0
    }

    pub fn num_bounded(&self) -> usize {
        self.colours.iter().filter(|colour| colour.alpha != 0).count()
    }

    pub fn clear(&mut self) {
        self.starts.clear();
        self.ends.clear();
        self.times.clear();
        self.colours.clear();
    }

    pub fn truncate(&mut self, len: usize) {
        self.starts.truncate(len);
        self.ends.truncate(len);
        self.times.truncate(len);
        self.colours.truncate(len);
    }

    pub fn extend_from(&mut self, other: &Cloud) {
        self.starts.extend_from_slice(&other.starts);
        self.ends.extend_from_slice(&other.ends);
        self.times.extend_from_slice(&other.times);
        self.colours.extend_from_slice(&other.colours);
    }

    /// Compacts the cloud in place so that it holds only the rays at `indices`,
    /// which must be strictly increasing.
    pub fn retain_indices(&mut self, indices: &[usize]) {
        for (dst, &src) in indices.iter().enumerate() {
            debug_assert!(src >= dst);
            self.starts[dst] = self.starts[src];
            self.ends[dst] = self.ends[src];
            self.times[dst] = self.times[src];
            self.colours[dst] = self.colours[src];
        }
        self.truncate(indices.len());
    }

    /// Bounds over every ray start and end, bounded or not.
    pub fn bounds(&self) -> Option<Aabb> {
        let mut iter = self.starts.iter().chain(self.ends.iter());
        let mut bounds = Aabb::from_point(*iter.next()?);
        for point in iter {
            bounds.include(*point);
        }
        Some(bounds)
    }

    /// Bounds over the starts and ends of bounded rays only.
    pub fn bounded_bounds(&self) -> Option<Aabb> {
        let mut bounds: Option<Aabb> = None;
        for idx in 0..self.len() {
            if !self.ray_bounded(idx) {
                continue;
            }
            let ray = Aabb::from_point(self.starts[idx]).union(Aabb::from_point(self.ends[idx]));
            bounds = Some(match bounds {
                Some(bounds) => bounds.union(ray),
                None => ray,
            });
        }
        bounds
    }

    pub fn first_time(&self) -> Option<f64> {
        self.times.first().copied()
    }

    pub fn time_range(&self) -> Option<(f64, f64)> {
        let mut iter = self.times.iter().copied();
        let first = iter.next()?;
        Some(iter.fold((first, first), |(min, max), time| (min.min(time), max.max(time))))
    }

    pub fn remove_unbounded_rays(&mut self) {
        let valids: Vec<usize> = (0..self.len()).filter(|&idx| self.ray_bounded(idx)).collect();
        self.retain_indices(&valids);
    }

    /// Keeps the first ray whose end point lands in each voxel of `voxel_width`.
    pub fn decimate(&mut self, voxel_width: f64) {
        let mut subsample = Vec::new();
        let mut voxel_set = HashSet::new();
        voxel_subsample(&self.ends, voxel_width, &mut subsample, &mut voxel_set);
        self.retain_indices(&subsample);
    }

    /// Splits the rays in two; rays for which `is_second` holds go to the second cloud.
    pub fn split(&self, mut is_second: impl FnMut(&Cloud, usize) -> bool) -> (Cloud, Cloud) {
        let mut first = Cloud::new();
        let mut second = Cloud::new();
        for idx in 0..self.len() {
            if is_second(self, idx) {
                second.push_from(self, idx);
            } else {
                first.push_from(self, idx);
            }
        }
        (first, second)
    }

    pub fn transform(&mut self, pose: &DAffine3, time_delta: f64) {
        for idx in 0..self.len() {
            self.starts[idx] = pose.transform_point3(self.starts[idx]);
            self.ends[idx] = pose.transform_point3(self.ends[idx]);
            self.times[idx] += time_delta;
        }
    }

    /// Average end-point spacing, estimated from how many 25 cm voxels the
    /// bounded end points occupy. Points are assumed to sample 2D surfaces.
    pub fn estimate_point_spacing(&self) -> f64 {
        let mut occupied: HashSet<IVec3> = HashSet::new();
        let mut num_points = 0usize;
        for idx in 0..self.len() {
            if !self.ray_bounded(idx) {
                continue;
            }
            num_points += 1;
            occupied.insert(voxel_key(self.ends[idx], SPACING_VOXEL_WIDTH));
        }
        if num_points == 0 {
            return SPACING_VOXEL_WIDTH;
        }
        let width = SPACING_VOXEL_WIDTH * (occupied.len() as f64 / num_points as f64).sqrt();
        tracing::debug!("estimated point spacing: {width}");
        width
    }
}

#[cfg(test)]
mod tests {
    use glam::{DAffine3, DVec3};

    use super::{Aabb, Cloud, Rgba};

    fn sample_cloud() -> Cloud {
        let mut cloud = Cloud::new();
        cloud.add_ray(DVec3::ZERO, DVec3::new(1.0, 0.0, 0.0), 0.0, Rgba::grey(200));
        cloud.add_ray(DVec3::ZERO, DVec3::new(5.0, 5.0, 0.0), 1.0, Rgba::unbounded());
        cloud.add_ray(DVec3::ZERO, DVec3::new(0.0, 2.0, 0.0), 2.0, Rgba::grey(100));
        cloud
    }

    #[test]
    fn remove_unbounded_keeps_arrays_aligned() {
        let mut cloud = sample_cloud();
        cloud.remove_unbounded_rays();
        assert!(cloud.validate().is_ok());
        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud.times, vec![0.0, 2.0]);
        assert_eq!(cloud.colours[1], Rgba::grey(100));
    }

    #[test]
    fn bounded_bounds_ignore_unbounded_rays() {
        let cloud = sample_cloud();
        let bounded = cloud.bounded_bounds().unwrap();
        assert_eq!(bounded.max, DVec3::new(1.0, 2.0, 0.0));
        let all = cloud.bounds().unwrap();
        assert_eq!(all.max, DVec3::new(5.0, 5.0, 0.0));
    }

    #[test]
    fn clip_segment_keeps_the_inside_part() {
        let unit = Aabb {
            min: DVec3::ZERO,
            max: DVec3::ONE,
        };
        let (start, end) = (DVec3::new(-0.5, 0.5, 0.5), DVec3::new(0.5, 0.5, 0.5));
        assert_eq!(
            unit.clip_segment(start, end),
            Some((DVec3::new(0.0, 0.5, 0.5), end))
        );
        let (start, end) = (DVec3::new(0.5, -1.0, 0.5), DVec3::new(0.5, 3.0, 0.5));
        assert_eq!(
            unit.clip_segment(start, end),
            Some((DVec3::new(0.5, 0.0, 0.5), DVec3::new(0.5, 1.0, 0.5)))
        );
        let inside = (DVec3::splat(0.25), DVec3::splat(0.75));
        assert_eq!(unit.clip_segment(inside.0, inside.1), Some(inside));
        assert_eq!(unit.clip_segment(DVec3::new(2.0, 0.0, 0.0), DVec3::new(2.0, 1.0, 0.0)), None);
        assert_eq!(unit.clip_segment(DVec3::new(-1.0, 2.0, 0.5), DVec3::new(2.0, 1.5, 0.5)), None);
    }

    #[test]
    fn validate_reports_misaligned_arrays() {
        let mut cloud = sample_cloud();
        cloud.times.pop();
        assert!(cloud.validate().is_err());
    }

    #[test]
    fn decimate_keeps_first_ray_per_voxel() {
        let mut cloud = Cloud::new();
        cloud.add_ray(DVec3::ZERO, DVec3::new(0.01, 0.01, 0.01), 0.0, Rgba::grey(1));
        cloud.add_ray(DVec3::ZERO, DVec3::new(0.02, 0.02, 0.02), 1.0, Rgba::grey(2));
        cloud.add_ray(DVec3::ZERO, DVec3::new(1.5, 0.0, 0.0), 2.0, Rgba::grey(3));
        cloud.decimate(0.1);
        assert_eq!(cloud.times, vec![0.0, 2.0]);
    }

    #[test]
    fn split_routes_by_predicate() {
        let cloud = sample_cloud();
        let (bounded, unbounded) = cloud.split(|cloud, idx| !cloud.ray_bounded(idx));
        assert_eq!(bounded.len(), 2);
        assert_eq!(unbounded.len(), 1);
    }

    #[test]
    fn transform_moves_rays_and_shifts_time() {
        let mut cloud = sample_cloud();
        cloud.transform(&DAffine3::from_translation(DVec3::new(0.0, 0.0, 1.0)), 10.0);
        assert_eq!(cloud.starts[0], DVec3::new(0.0, 0.0, 1.0));
        assert_eq!(cloud.ends[0], DVec3::new(1.0, 0.0, 1.0));
        assert_eq!(cloud.times[2], 12.0);
    }

    #[test]
    fn point_spacing_shrinks_with_density() {
        let mut sparse = Cloud::new();
        let mut dense = Cloud::new();
        for i in 0..20 {
            let x = i as f64;
            sparse.add_ray(DVec3::ZERO, DVec3::new(x, 0.0, 0.0), 0.0, Rgba::grey(1));
            for j in 0..10 {
                let offset = j as f64 * 0.01;
                dense.add_ray(DVec3::ZERO, DVec3::new(x, offset, 0.0), 0.0, Rgba::grey(1));
            }
        }
        assert!((sparse.estimate_point_spacing() - 0.25).abs() < 1.0e-12);
        assert!(dense.estimate_point_spacing() < sparse.estimate_point_spacing());
    }
}
