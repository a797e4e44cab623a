use glam::{DMat3, DVec3};

use crate::cloud::Cloud;
use crate::math::{dmat3_is_finite, eigen_decomposition_symmetric, outer};
use crate::neighbors::PointIndex;
use crate::parallel;

pub const NEIGHBOUR_SEARCH_SIZE: usize = 16;
pub const MIN_NEIGHBOURS: usize = 4;
pub const DEFAULT_NEIGHBOUR_RADIUS: f64 = 1.0;

/// Roughly matches the envelope of a uniformly dense ellipsoid of points.
const ELLIPSOID_SCALE: f64 = 1.7;
const EIGENVALUE_FLOOR: f64 = 1.0e-10;

/// Local surface model around one ray end point, index aligned with the
/// cloud it was built from. Zero `extents` marks it undefined.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipsoid {
    pub pos: DVec3,
    /// Rows are the principal axes divided by their radii, so it maps world
    /// offsets from `pos` into the unit sphere.
    pub eigen_mat: DMat3,
    /// Half-widths of the world axis-aligned box around the ellipsoid.
    pub extents: DVec3,
    pub time: f64,
    pub opacity: f64,
    pub num_rays: u32,
    pub num_gone: u32,
    pub transient: bool,
    pub planarity: f64,
}

impl Ellipsoid {
    pub fn undefined(pos: DVec3, time: f64) -> Self {
        Self {
            pos,
            eigen_mat: DMat3::ZERO,
            extents: DVec3::ZERO,
            time,
            opacity: 1.0,
            num_rays: 0,
            num_gone: 0,
            transient: false,
            planarity: 0.0,
        }
    }

    pub fn is_defined(&self) -> bool {
        self.extents != DVec3::ZERO
    }

    /// Fits an ellipsoid to `points`. Summation runs over the points in
    /// sorted order, so the result does not depend on their order. Returns
    /// `None` when the scatter is non-finite or collapses to a point.
    pub fn fit(points: &[DVec3], time: f64) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let mut sorted = points.to_vec();
        sorted.sort_by(|a, b| {
            a.x.total_cmp(&b.x)
                .then(a.y.total_cmp(&b.y))
                .then(a.z.total_cmp(&b.z))
        });
        let count = sorted.len() as f64;
        let centroid = sorted.iter().fold(DVec3::ZERO, |sum, p| sum + *p) / count;
        let mut scatter = DMat3::ZERO;
        for point in &sorted {
            let offset = *point - centroid;
            scatter += outer(offset, offset);
        }
        scatter = scatter * (1.0 / count);
        if !dmat3_is_finite(scatter) {
            return None;
        }

        let (values, vectors) = eigen_decomposition_symmetric(scatter);
        if values.z <= EIGENVALUE_FLOOR {
            return None;
        }
        let radii = DVec3::new(
            ELLIPSOID_SCALE * values.x.max(EIGENVALUE_FLOOR).sqrt(),
            ELLIPSOID_SCALE * values.y.max(EIGENVALUE_FLOOR).sqrt(),
            ELLIPSOID_SCALE * values.z.max(EIGENVALUE_FLOOR).sqrt(),
        );
        let eigen_mat = DMat3::from_cols(
            vectors.x_axis / radii.x,
            vectors.y_axis / radii.y,
            vectors.z_axis / radii.z,
        )
        .transpose();
        let scaled = [
            vectors.x_axis * radii.x,
            vectors.y_axis * radii.y,
            vectors.z_axis * radii.z,
        ];
        let extents = DVec3::new(
            scaled.iter().map(|axis| axis.x * axis.x).sum::<f64>().sqrt(),
            scaled.iter().map(|axis| axis.y * axis.y).sum::<f64>().sqrt(),
            scaled.iter().map(|axis| axis.z * axis.z).sum::<f64>().sqrt(),
        );

        Some(Self {
            pos: centroid,
            eigen_mat,
            extents,
            time,
            opacity: 1.0,
            num_rays: 0,
            num_gone: 0,
            transient: false,
            planarity: (radii.y - radii.x) / radii.y,
        })
    }
}

pub fn generate_ellipsoids(cloud: &Cloud) -> Vec<Ellipsoid> {
    generate_ellipsoids_with_radius(cloud, DEFAULT_NEIGHBOUR_RADIUS)
}

/// One ellipsoid per ray, fitted to the end point and its nearest bounded
/// neighbours within `max_radius`.
pub fn generate_ellipsoids_with_radius(cloud: &Cloud, max_radius: f64) -> Vec<Ellipsoid> {
    tracing::info!("generating {} ellipsoids", cloud.len());
    let max_radius = if max_radius.is_finite() && max_radius > 0.0 {
        max_radius
    } else {
        DEFAULT_NEIGHBOUR_RADIUS
    };
    let index = PointIndex::build(&cloud.ends);

    let ellipsoids = parallel::map_indexed(cloud.len(), |idx| {
        let undefined = Ellipsoid::undefined(cloud.ends[idx], cloud.times[idx]);
        if !cloud.ray_bounded(idx) {
            return undefined;
        }
        let mut points: Vec<DVec3> = index
            .knn(idx, NEIGHBOUR_SEARCH_SIZE, max_radius)
            .iter()
            .filter(|neighbor| cloud.ray_bounded(neighbor.index))
            .map(|neighbor| cloud.ends[neighbor.index])
            .collect();
        if points.len() < MIN_NEIGHBOURS {
            return undefined;
        }
        points.push(cloud.ends[idx]);
        Ellipsoid::fit(&points, cloud.times[idx]).unwrap_or(undefined)
    });

    let defined = ellipsoids.iter().filter(|e| e.is_defined()).count();
    tracing::debug!("{defined} of {} ellipsoids are defined", ellipsoids.len());
    ellipsoids
}

#[cfg(test)]
mod tests {
    use glam::DVec3;

    use crate::cloud::{Cloud, Rgba};

    use super::{generate_ellipsoids, Ellipsoid};

    fn wall_points() -> Vec<DVec3> {
        let mut points = Vec::new();
        for y in -2..=2 {
            for z in -2..=2 {
                points.push(DVec3::new(0.0, y as f64 * 0.05, z as f64 * 0.05));
            }
        }
        points
    }

    #[test]
    fn planar_points_give_flat_ellipsoid() {
        let ellipsoid = Ellipsoid::fit(&wall_points(), 3.0).unwrap();
        assert!(ellipsoid.is_defined());
        assert!(ellipsoid.pos.length() < 1.0e-12);
        assert!(ellipsoid.planarity > 0.99);
        assert!(ellipsoid.extents.x < 1.0e-4);
        assert!(ellipsoid.extents.y > 0.1);
        assert_eq!(ellipsoid.opacity, 1.0);
        assert!(!ellipsoid.transient);
        // a point on the wall plane maps inside the unit sphere
        let local = ellipsoid.eigen_mat * DVec3::new(0.0, 0.05, 0.05);
        assert!(local.length() < 1.0);
    }

    #[test]
    fn fit_ignores_point_order() {
        let points = wall_points();
        let mut reversed = points.clone();
        reversed.reverse();
        assert_eq!(Ellipsoid::fit(&points, 0.0), Ellipsoid::fit(&reversed, 0.0));
    }

    #[test]
    fn generation_ignores_ray_order() {
        let mut cloud = Cloud::new();
        for idx in 0..200 {
            let t = idx as f64;
            let end = DVec3::new(
                (t * 0.37).sin() * 0.02,
                (t * 0.13).cos() * 0.4,
                (t * 0.071).sin() * 0.4,
            );
            cloud.add_ray(DVec3::new(-2.0, 0.0, 0.0), end, t, Rgba::grey(255));
        }
        let mut reversed = Cloud::new();
        for idx in (0..cloud.len()).rev() {
            reversed.push_from(&cloud, idx);
        }

        let forward = generate_ellipsoids(&cloud);
        let mut backward = generate_ellipsoids(&reversed);
        backward.reverse();
        assert!(forward.iter().any(Ellipsoid::is_defined));
        assert_eq!(forward, backward);
    }

    #[test]
    fn coincident_points_are_degenerate() {
        assert!(Ellipsoid::fit(&[DVec3::ONE; 6], 0.0).is_none());
    }

    #[test]
    fn sparse_and_unbounded_rays_get_undefined_ellipsoids() {
        let mut cloud = Cloud::new();
        let start = DVec3::new(-2.0, 0.0, 0.0);
        for point in wall_points() {
            cloud.add_ray(start, point, 1.0, Rgba::grey(255));
        }
        cloud.add_ray(start, DVec3::new(0.0, 0.0, 0.01), 2.0, Rgba::unbounded());
        cloud.add_ray(start, DVec3::new(0.0, 30.0, 0.0), 3.0, Rgba::grey(255));

        let ellipsoids = generate_ellipsoids(&cloud);
        assert_eq!(ellipsoids.len(), cloud.len());
        assert!(ellipsoids[..25].iter().all(Ellipsoid::is_defined));
        assert!(!ellipsoids[25].is_defined());
        assert!(!ellipsoids[26].is_defined());
        assert_eq!(ellipsoids[26].time, 3.0);
    }
}
