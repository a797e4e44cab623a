//! Nearest-neighbour queries over ray end points.

use glam::DVec3;
use rstar::{PointDistance, RTree, RTreeObject, AABB};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub dist2: f64,
}

/// A point stored in the tree together with its index in the source slice.
#[derive(Debug, Clone, Copy)]
struct IndexedPoint {
    position: [f64; 3],
    index: usize,
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 3]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.position)
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[f64; 3]) -> f64 {
        let dx = self.position[0] - point[0];
        let dy = self.position[1] - point[1];
        let dz = self.position[2] - point[2];
        dx * dx + dy * dy + dz * dz
    }
}

/// R-tree over a point slice for exact k-nearest queries.
pub struct PointIndex<'a> {
    points: &'a [DVec3],
    tree: RTree<IndexedPoint>,
}

impl<'a> PointIndex<'a> {
    pub fn build(points: &'a [DVec3]) -> Self {
        let indexed = points
            .iter()
            .enumerate()
            .map(|(index, point)| IndexedPoint {
                position: point.to_array(),
                index,
            })
            .collect();
        Self {
            points,
            tree: RTree::bulk_load(indexed),
        }
    }

    /// Up to `k` nearest points to point `index` within `max_radius`, nearest
    /// first, excluding `index` itself. Equal distances order by index.
    pub fn knn(&self, index: usize, k: usize, max_radius: f64) -> Vec<Neighbor> {
        let query = self.points[index].to_array();
        let max_dist2 = max_radius * max_radius;
        let mut found: Vec<Neighbor> = Vec::with_capacity(k + 1);
        for candidate in self.tree.nearest_neighbor_iter(&query) {
            let dist2 = candidate.distance_2(&query);
            if dist2 > max_dist2 {
                break;
            }
            // keep collecting ties with the k-th neighbour so the index order decides
            if found.len() >= k && dist2 > found[found.len() - 1].dist2 {
                break;
            }
            if candidate.index != index {
                found.push(Neighbor {
                    index: candidate.index,
                    dist2,
                });
            }
        }
        found.sort_by(|a, b| a.dist2.total_cmp(&b.dist2).then(a.index.cmp(&b.index)));
        found.truncate(k);
        found
    }
}

#[cfg(test)]
mod tests {
    use glam::DVec3;

    use super::PointIndex;

    fn brute_force(points: &[DVec3], index: usize, k: usize, radius: f64) -> Vec<usize> {
        let mut all: Vec<(f64, usize)> = points
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != index)
            .map(|(idx, p)| (p.distance_squared(points[index]), idx))
            .filter(|(d, _)| *d <= radius * radius)
            .collect();
        all.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        all.into_iter().take(k).map(|(_, idx)| idx).collect()
    }

    #[test]
    fn knn_matches_brute_force() {
        let mut points = Vec::new();
        for i in 0..400 {
            let t = i as f64;
            points.push(DVec3::new(
                (t * 0.37).sin() * 2.0,
                (t * 0.13).cos() * 1.5,
                (t * 0.071).sin() * 0.5,
            ));
        }
        let index = PointIndex::build(&points);
        for query in [0, 17, 123, 399] {
            let found: Vec<usize> = index.knn(query, 16, 1.0).iter().map(|n| n.index).collect();
            assert_eq!(found, brute_force(&points, query, 16, 1.0));
        }
    }

    #[test]
    fn equidistant_neighbours_order_by_index() {
        // a planar grid, where many neighbours tie on distance
        let mut points = Vec::new();
        for i in 0..9 {
            for j in 0..9 {
                points.push(DVec3::new(4.0, i as f64 * 0.05, j as f64 * 0.05));
            }
        }
        let index = PointIndex::build(&points);
        for query in [0, 40, 80] {
            let found: Vec<usize> = index.knn(query, 16, 1.0).iter().map(|n| n.index).collect();
            assert_eq!(found, brute_force(&points, query, 16, 1.0));
        }
    }

    #[test]
    fn knn_respects_max_radius() {
        let points = vec![
            DVec3::ZERO,
            DVec3::new(0.5, 0.0, 0.0),
            DVec3::new(2.0, 0.0, 0.0),
        ];
        let found = PointIndex::build(&points).knn(0, 16, 1.0);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].index, 1);
    }
}
