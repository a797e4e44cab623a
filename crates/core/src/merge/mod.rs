//! Transient detection and multi-cloud merging.
//!
//! Every entry point runs the same stages: index each cloud's rays in a
//! [`RayGrid`], fit an [`Ellipsoid`] to each end point, cast rays against the
//! ellipsoids and let the [`MergeType`] policy decide which rays or surfaces
//! are transient. Whatever survives is emitted in input order.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::cloud::{Cloud, Rgba};
use crate::ellipsoid::{generate_ellipsoids_with_radius, Ellipsoid, DEFAULT_NEIGHBOUR_RADIUS};
use crate::grid::RayGrid;
use crate::progress::{report_progress, report_stage, MergeStage};
use crate::transient::{
    into_flags, mark_intersected_ellipsoids, transient_flags, DecisionParams, MergeType,
};
use crate::voxel::{RayKey, RayLookup};

/// Grid voxels span this many estimated point spacings.
const GRID_WIDTH_IN_SPACINGS: f64 = 4.0;

/// Output of [`find_transients`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransientSplit {
    pub transient: Cloud,
    pub fixed: Cloud,
}

/// Output of [`combine`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Combined {
    pub merged: Cloud,
    pub differences: Cloud,
}

/// Policy and thresholds shared by every merge operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeEngine {
    pub merge_type: MergeType,
    pub num_rays: f64,
    pub neighbour_radius: f64,
}

impl MergeEngine {
    pub fn new(merge_type: MergeType, num_rays: f64) -> Self {
        Self {
            merge_type,
            num_rays,
            neighbour_radius: DEFAULT_NEIGHBOUR_RADIUS,
        }
    }

    pub fn with_neighbour_radius(mut self, radius: f64) -> Self {
        self.neighbour_radius = radius;
        self
    }

    fn params(&self, num_rays: f64, self_transient: bool) -> DecisionParams {
        DecisionParams {
            merge_type: self.merge_type,
            num_rays,
            self_transient,
        }
    }

    /// Splits `cloud` into rays that belong to moving or removed objects and
    /// rays of the persistent scene, judging every surface against the
    /// cloud's own rays over time.
    pub fn find_transients(&self, cloud: &Cloud, colour_cloud: bool) -> TransientSplit {
        tracing::info!("finding transients in {} rays", cloud.len());
        report_stage(MergeStage::Loaded);
        let Some(grid) = build_grid(cloud) else {
            return TransientSplit::default();
        };
        report_stage(MergeStage::GridsBuilt);

        let mut ellipsoids = generate_ellipsoids_with_radius(cloud, self.neighbour_radius);
        report_stage(MergeStage::EllipsoidsBuilt);

        let flags = transient_flags(cloud.len());
        mark_intersected_ellipsoids(
            cloud,
            &grid,
            &mut ellipsoids,
            &flags,
            &self.params(self.num_rays, true),
        );
        report_stage(MergeStage::Classified);

        let flags = into_flags(flags);
        report_stage(MergeStage::Decided);

        let mut split = TransientSplit::default();
        for (idx, ellipsoid) in ellipsoids.iter().enumerate() {
            let colour = if colour_cloud {
                diagnostic_colour(ellipsoid, cloud.colours[idx])
            } else {
                cloud.colours[idx]
            };
            let target = if ellipsoid.transient || flags[idx] {
                &mut split.transient
            } else {
                &mut split.fixed
            };
            target.add_ray(cloud.starts[idx], cloud.ends[idx], cloud.times[idx], colour);
        }
        tracing::info!(
            "{} transient, {} fixed rays",
            split.transient.len(),
            split.fixed.len()
        );
        report_stage(MergeStage::Emitted);
        split
    }

    /// Merges the edits that `first` and `second` each made to `base`.
    ///
    /// Rays present in both clouds are kept once. Those and the rays that
    /// match `base` are removed from `first` and `second`, which are left
    /// holding only their own edits. Conflicting edits are then resolved by
    /// the merge type.
    pub fn three_way_merge(&self, base: &Cloud, first: &mut Cloud, second: &mut Cloud) -> Cloud {
        report_stage(MergeStage::Loaded);
        let base_lookup = RayLookup::from_cloud(base);
        let lookups = [RayLookup::from_cloud(first), RayLookup::from_cloud(second)];
        tracing::debug!(
            "ray lookup sizes {}, {}, base {}",
            lookups[0].len(),
            lookups[1].len(),
            base_lookup.len()
        );

        // later-starting scan wins shared rays
        let preferred = match (first.first_time(), second.first_time()) {
            (Some(first_time), Some(second_time)) if first_time > second_time => 0,
            _ => 1,
        };
        let mut merged = Cloud::new();
        for (c, cloud) in [&mut *first, &mut *second].into_iter().enumerate() {
            let other = &lookups[1 - c];
            let mut changed = Vec::with_capacity(cloud.len());
            for idx in 0..cloud.len() {
                let key = RayKey::new(cloud.starts[idx], cloud.ends[idx]);
                if other.contains(&key) {
                    // shared by both sides, kept once and not contested
                    if c == preferred {
                        merged.push_from(cloud, idx);
                    }
                } else if !base_lookup.contains(&key) {
                    changed.push(idx);
                }
            }
            cloud.retain_indices(&changed);
        }
        tracing::info!("{} unaltered rays moved into the merged cloud", merged.len());
        tracing::info!(
            "{} and {} changed rays to combine",
            first.len(),
            second.len()
        );

        let edits = [&*first, &*second];
        if self.merge_type == MergeType::All {
            for cloud in edits {
                merged.extend_from(cloud);
            }
            report_stage(MergeStage::Emitted);
            return merged;
        }

        let flags = self.cross_classify(&edits);
        for (cloud, flags) in edits.iter().zip(&flags) {
            let before = merged.len();
            for (idx, transient) in flags.iter().enumerate() {
                if !transient {
                    merged.push_from(cloud, idx);
                }
            }
            let fixed = merged.len() - before;
            tracing::info!("{} transients, {fixed} fixed rays", cloud.len() - fixed);
        }
        report_stage(MergeStage::Emitted);
        merged
    }

    /// Merges any number of scans of one scene with no common ancestor.
    /// A ray is a difference when some other cloud's rays remove it or the
    /// surface it ends on. `all` decides like `max` here.
    pub fn combine(&self, clouds: &[Cloud]) -> Combined {
        report_stage(MergeStage::Loaded);
        let mut combined = Combined::default();
        let refs: Vec<&Cloud> = clouds.iter().collect();
        let flags = self.cross_classify(&refs);
        for (cloud, flags) in clouds.iter().zip(&flags) {
            let mut transients = 0;
            for (idx, &transient) in flags.iter().enumerate() {
                if transient {
                    transients += 1;
                    combined.differences.push_from(cloud, idx);
                } else {
                    combined.merged.push_from(cloud, idx);
                }
            }
            tracing::info!(
                "{transients} transients, {} fixed rays",
                cloud.len() - transients
            );
        }
        report_stage(MergeStage::Emitted);
        combined
    }

    /// Casts every cloud's rays against every other cloud's ellipsoids and
    /// returns the transient flags per cloud, index aligned with its rays.
    fn cross_classify(&self, clouds: &[&Cloud]) -> Vec<Vec<bool>> {
        let grids: Vec<Option<RayGrid>> = clouds.iter().map(|cloud| build_grid(cloud)).collect();
        report_stage(MergeStage::GridsBuilt);

        let mut ellipsoids: Vec<Vec<Ellipsoid>> = clouds
            .iter()
            .map(|cloud| generate_ellipsoids_with_radius(cloud, self.neighbour_radius))
            .collect();
        report_stage(MergeStage::EllipsoidsBuilt);

        let flags: Vec<Vec<AtomicBool>> = clouds
            .iter()
            .map(|cloud| transient_flags(cloud.len()))
            .collect();
        let opacity_only = self.params(0.0, false);
        let cross = self.params(self.num_rays, false);
        for (c, surfaces) in ellipsoids.iter_mut().enumerate() {
            let Some(own_grid) = &grids[c] else {
                continue;
            };
            mark_intersected_ellipsoids(clouds[c], own_grid, surfaces, &flags[c], &opacity_only);
            for (d, other) in clouds.iter().enumerate() {
                if d == c {
                    continue;
                }
                if let Some(grid) = &grids[d] {
                    mark_intersected_ellipsoids(other, grid, surfaces, &flags[d], &cross);
                }
            }
            for (flag, ellipsoid) in flags[c].iter().zip(surfaces.iter()) {
                if ellipsoid.transient {
                    flag.store(true, Ordering::Relaxed);
                }
            }
            report_progress((c + 1) as f32 / clouds.len() as f32);
        }
        report_stage(MergeStage::Classified);

        let flags = flags.into_iter().map(into_flags).collect();
        report_stage(MergeStage::Decided);
        flags
    }
}

/// Indexes `cloud` with voxels a few point spacings wide. `None` for an
/// empty cloud.
fn build_grid(cloud: &Cloud) -> Option<RayGrid> {
    let voxel_width = GRID_WIDTH_IN_SPACINGS * cloud.estimate_point_spacing();
    RayGrid::build(cloud, voxel_width)
}

/// Encodes the ellipsoid statistics in a ray colour: red for curvature,
/// green for how often the surface was seen through, blue for opacity.
pub fn diagnostic_colour(ellipsoid: &Ellipsoid, colour: Rgba) -> Rgba {
    let num_gone = ellipsoid.num_gone as f64;
    Rgba {
        red: ((1.0 - ellipsoid.planarity) * 255.0) as u8,
        green: (num_gone / (num_gone + 10.0) * 255.0) as u8,
        blue: (ellipsoid.opacity * 255.0) as u8,
        alpha: colour.alpha,
    }
}

pub fn find_transients(
    cloud: &Cloud,
    merge_type: MergeType,
    num_rays: f64,
    colour_cloud: bool,
) -> TransientSplit {
    MergeEngine::new(merge_type, num_rays).find_transients(cloud, colour_cloud)
}

pub fn three_way_merge(
    base: &Cloud,
    first: &mut Cloud,
    second: &mut Cloud,
    merge_type: MergeType,
    num_rays: f64,
) -> Cloud {
    MergeEngine::new(merge_type, num_rays).three_way_merge(base, first, second)
}

pub fn combine(clouds: &[Cloud], merge_type: MergeType, num_rays: f64) -> Combined {
    MergeEngine::new(merge_type, num_rays).combine(clouds)
}

#[cfg(test)]
mod tests;
