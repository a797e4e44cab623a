use glam::DVec3;

use crate::cloud::{Cloud, Rgba};
use crate::ellipsoid::generate_ellipsoids;
use crate::grid::RayGrid;
use crate::transient::{mark_intersected_ellipsoids, transient_flags, DecisionParams, MergeType};

use super::{combine, find_transients, three_way_merge, MergeEngine};

const SPACING: f64 = 0.05;

/// Rays from `start` to a 1 m square wall at `x`, sampled every 5 cm, with
/// times counting up from `time`. Cells for which `skip` holds are left out.
fn wall(x: f64, time: f64, start: DVec3, skip: impl Fn(i32, i32) -> bool) -> Cloud {
    let mut cloud = Cloud::new();
    for i in -10..=10 {
        for j in -10..=10 {
            if skip(i, j) {
                continue;
            }
            let end = DVec3::new(x, i as f64 * SPACING, j as f64 * SPACING);
            let time = time + cloud.len() as f64 * 0.001;
            cloud.add_ray(start, end, time, Rgba::grey(200));
        }
    }
    cloud
}

/// 25 cm square object at x = 2, scanned from the origin.
fn patch(time: f64) -> Cloud {
    let mut cloud = Cloud::new();
    for i in -2..=2 {
        for j in -2..=2 {
            let end = DVec3::new(2.0, i as f64 * SPACING, j as f64 * SPACING);
            cloud.add_ray(DVec3::ZERO, end, time, Rgba::grey(90));
        }
    }
    cloud
}

/// The part of a wall at x = 4 hidden by [`patch`] when seen from the origin.
fn shadowed(i: i32, j: i32) -> bool {
    i.abs() <= 4 && j.abs() <= 4
}

/// Scan of the wall at x = 4 with the patch standing in front of it. The
/// patch rays are timestamped two seconds after the wall rays.
fn wall_with_patch(time: f64) -> Cloud {
    let mut cloud = wall(4.0, time, DVec3::ZERO, shadowed);
    cloud.extend_from(&patch(time + 2.0));
    cloud
}

fn count_ending_at_x(cloud: &Cloud, x: f64) -> usize {
    cloud.ends.iter().filter(|end| (end.x - x).abs() < 1.0e-9).count()
}

#[test]
fn static_wall_has_no_transients() {
    let cloud = wall(2.0, 1.0, DVec3::ZERO, |_, _| false);
    for merge_type in MergeType::ALL {
        let split = find_transients(&cloud, merge_type, 1.0, false);
        assert!(split.transient.is_empty(), "{merge_type}");
        assert_eq!(split.fixed, cloud);
    }
}

#[test]
fn oldest_drops_ray_that_crossed_the_wall_later() {
    let mut cloud = wall(2.0, 1.0, DVec3::ZERO, |_, _| false);
    let moving_end = DVec3::new(4.0, 0.01, 0.02);
    cloud.add_ray(DVec3::ZERO, moving_end, 5.0, Rgba::grey(255));

    let split = find_transients(&cloud, MergeType::Oldest, 1.0, false);
    assert_eq!(split.transient.len(), 1);
    assert_eq!(split.transient.ends[0], moving_end);
    assert_eq!(split.fixed.len(), cloud.len() - 1);
    assert_eq!(count_ending_at_x(&split.fixed, 2.0), cloud.len() - 1);
}

#[test]
fn newest_drops_ray_that_crossed_before_the_wall_appeared() {
    let mut cloud = wall(2.0, 1.0, DVec3::ZERO, |_, _| false);
    let moving_end = DVec3::new(4.0, 0.01, 0.02);
    cloud.add_ray(DVec3::ZERO, moving_end, 0.5, Rgba::grey(255));

    let split = find_transients(&cloud, MergeType::Newest, 1.0, false);
    assert_eq!(split.transient.len(), 1);
    assert_eq!(split.transient.ends[0], moving_end);
    assert_eq!(count_ending_at_x(&split.fixed, 2.0), cloud.len() - 1);
}

#[test]
fn newest_drops_wall_seen_through_afterwards() {
    let mut cloud = wall(2.0, 1.0, DVec3::ZERO, |_, _| false);
    let moving_end = DVec3::new(4.0, 0.01, 0.02);
    cloud.add_ray(DVec3::ZERO, moving_end, 5.0, Rgba::grey(255));

    let split = find_transients(&cloud, MergeType::Newest, 1.0, false);
    assert_eq!(count_ending_at_x(&split.fixed, 4.0), 1);
    assert!(!split.transient.is_empty());
    assert_eq!(count_ending_at_x(&split.transient, 2.0), split.transient.len());
}

#[test]
fn colour_cloud_encodes_surface_statistics() {
    let cloud = wall(2.0, 1.0, DVec3::ZERO, |_, _| false);
    let split = find_transients(&cloud, MergeType::Min, 1.0, true);
    assert_eq!(split.fixed.len(), cloud.len());
    let centre = split
        .fixed
        .ends
        .iter()
        .position(|end| end.y.abs() < 1.0e-9 && end.z.abs() < 1.0e-9)
        .unwrap();
    let colour = split.fixed.colours[centre];
    // flat, never seen through, fully opaque
    assert!(colour.red < 5);
    assert_eq!(colour.green, 0);
    assert!(colour.blue > 250);
    assert_eq!(colour.alpha, 255);
}

#[test]
fn opacity_stays_in_unit_range() {
    let mut cloud = wall_with_patch(3.0);
    cloud.extend_from(&wall(4.0, 1.0, DVec3::new(0.0, 0.02, 0.0), |_, _| false));
    let grid = RayGrid::build(&cloud, 4.0 * cloud.estimate_point_spacing()).unwrap();
    let mut ellipsoids = generate_ellipsoids(&cloud);
    let flags = transient_flags(cloud.len());
    let params = DecisionParams {
        merge_type: MergeType::Min,
        num_rays: 0.0,
        self_transient: false,
    };
    mark_intersected_ellipsoids(&cloud, &grid, &mut ellipsoids, &flags, &params);

    let defined: Vec<_> = ellipsoids.iter().filter(|e| e.is_defined()).collect();
    assert!(!defined.is_empty());
    assert!(defined.iter().all(|e| (0.0..=1.0).contains(&e.opacity)));
    // the patch is seen through by the older scan
    assert!(defined.iter().any(|e| e.opacity < 1.0));
}

#[test]
fn cloud_is_never_transient_against_itself() {
    let mut cloud = wall_with_patch(3.0);
    cloud.extend_from(&wall(4.0, 1.0, DVec3::ZERO, |_, _| false));

    let combined = combine(&[cloud.clone(), cloud.clone()], MergeType::Min, 1.0e9);
    assert!(combined.differences.is_empty());
    assert_eq!(combined.merged.len(), 2 * cloud.len());

    let split = find_transients(&cloud, MergeType::Min, 1.0e9, false);
    assert!(split.transient.is_empty());
}

#[test]
fn unchanged_clouds_merge_to_base() {
    let base = wall_with_patch(1.0);
    let mut first = base.clone();
    let mut second = base.clone();
    let merged = three_way_merge(&base, &mut first, &mut second, MergeType::Min, 1.0);
    assert_eq!(merged, base);
    assert!(first.is_empty());
    assert!(second.is_empty());
}

#[test]
fn edits_from_one_side_are_applied() {
    let base = wall(4.0, 1.0, DVec3::ZERO, |_, _| false);
    // the first cloud adds an object, hiding part of the wall
    let mut first = wall(4.0, 1.0, DVec3::ZERO, |_, _| false);
    let hidden: Vec<usize> = (0..first.len())
        .filter(|&idx| {
            let end = first.ends[idx];
            end.y.abs() < 0.21 && end.z.abs() < 0.21
        })
        .collect();
    let visible: Vec<usize> = (0..first.len()).filter(|idx| !hidden.contains(idx)).collect();
    first.retain_indices(&visible);
    first.extend_from(&patch(3.0));
    let mut second = base.clone();

    let merged = three_way_merge(&base, &mut first, &mut second, MergeType::Min, 1.0);
    assert_eq!(first.len(), 25);
    assert!(second.is_empty());
    assert_eq!(merged.len(), base.len() - hidden.len() + 25);
    assert_eq!(count_ending_at_x(&merged, 2.0), 25);
}

#[test]
fn conflicting_edits_follow_merge_type() {
    let base = wall(4.0, 1.0, DVec3::ZERO, |_, _| false);
    let rescan = wall(4.0, 2.0, DVec3::new(0.0, 0.02, 0.0), |_, _| false);

    let mut first = wall_with_patch(1.0);
    let mut second = rescan.clone();
    // the rescan saw through the object before it was placed
    let merged = three_way_merge(&base, &mut first, &mut second, MergeType::Oldest, 1.0);
    assert_eq!(count_ending_at_x(&merged, 2.0), 0);
    assert_eq!(merged.len(), rescan.len());

    let mut first = wall_with_patch(1.0);
    let mut second = rescan.clone();
    let merged = three_way_merge(&base, &mut first, &mut second, MergeType::Newest, 1.0);
    assert_eq!(count_ending_at_x(&merged, 2.0), 25);
    let kept_rescan = count_ending_at_x(&merged, 4.0);
    assert!(kept_rescan > 0 && kept_rescan < rescan.len());

    let mut first = wall_with_patch(1.0);
    let mut second = rescan.clone();
    let merged = three_way_merge(&base, &mut first, &mut second, MergeType::All, 1.0);
    assert_eq!(merged.len(), 25 + rescan.len());
}

#[test]
fn combine_separates_unconfirmed_object() {
    let clouds = [
        wall(4.0, 1.0, DVec3::ZERO, |_, _| false),
        wall(4.0, 2.0, DVec3::ZERO, |_, _| false),
        wall_with_patch(3.0),
    ];
    let combined = combine(&clouds, MergeType::Min, 1.0);
    assert_eq!(combined.differences.len(), 25);
    assert_eq!(count_ending_at_x(&combined.differences, 2.0), 25);
    assert_eq!(
        combined.merged.len(),
        clouds.iter().map(Cloud::len).sum::<usize>() - 25
    );
    assert_eq!(count_ending_at_x(&combined.merged, 2.0), 0);
}

#[test]
fn combine_all_decides_like_max() {
    let clouds = [
        wall(4.0, 1.0, DVec3::ZERO, |_, _| false),
        wall(4.0, 2.0, DVec3::ZERO, |_, _| false),
        wall_with_patch(3.0),
    ];
    let all = combine(&clouds, MergeType::All, 1.0);
    assert_eq!(all, combine(&clouds, MergeType::Max, 1.0));
    assert!(!all.differences.is_empty());
}

#[test]
fn combine_max_keeps_object_and_thins_rays_through_it() {
    let clouds = [
        wall(4.0, 1.0, DVec3::ZERO, |_, _| false),
        wall(4.0, 2.0, DVec3::ZERO, |_, _| false),
        wall_with_patch(3.0),
    ];
    let total: usize = clouds.iter().map(Cloud::len).sum();
    let combined = combine(&clouds, MergeType::Max, 1.0);
    assert_eq!(count_ending_at_x(&combined.merged, 2.0), 25);
    assert!(!combined.differences.is_empty());
    // only wall rays that crossed the object are removed
    assert_eq!(
        count_ending_at_x(&combined.differences, 4.0),
        combined.differences.len()
    );
    assert!(combined.differences.len() < clouds[0].len() + clouds[1].len());
    assert_eq!(combined.merged.len() + combined.differences.len(), total);
}

#[test]
fn max_drops_ray_that_crossed_the_wall_later() {
    let mut cloud = wall(2.0, 1.0, DVec3::ZERO, |_, _| false);
    let moving_end = DVec3::new(4.0, 0.01, 0.02);
    cloud.add_ray(DVec3::ZERO, moving_end, 5.0, Rgba::grey(255));

    let split = find_transients(&cloud, MergeType::Max, 1.0, false);
    assert_eq!(split.transient.len(), 1);
    assert_eq!(split.transient.ends[0], moving_end);
    assert_eq!(count_ending_at_x(&split.fixed, 2.0), cloud.len() - 1);
}

#[test]
fn identical_edits_on_empty_base_are_kept_once() {
    let wall = wall(4.0, 1.0, DVec3::ZERO, |_, _| false);
    let mut first = wall.clone();
    let mut second = wall.clone();
    let merged = three_way_merge(&Cloud::new(), &mut first, &mut second, MergeType::All, 1.0);
    assert_eq!(merged, wall);
    assert_eq!(merged.len(), 441);
    assert!(first.is_empty());
    assert!(second.is_empty());
}

#[test]
fn empty_clouds_contribute_nothing() {
    let wall = wall(4.0, 1.0, DVec3::ZERO, |_, _| false);
    let combined = combine(&[Cloud::new(), wall.clone()], MergeType::Min, 1.0);
    assert_eq!(combined.merged, wall);
    assert!(combined.differences.is_empty());

    let split = find_transients(&Cloud::new(), MergeType::Min, 1.0, false);
    assert!(split.transient.is_empty() && split.fixed.is_empty());

    let mut first = wall.clone();
    let mut second = Cloud::new();
    let merged = three_way_merge(&Cloud::new(), &mut first, &mut second, MergeType::Max, 1.0);
    assert_eq!(merged, wall);
}

#[test]
fn engine_neighbour_radius_limits_fitting() {
    let cloud = wall(2.0, 1.0, DVec3::ZERO, |_, _| false);
    // neighbours 5 cm apart are out of reach, so nothing can be judged
    let engine = MergeEngine::new(MergeType::Min, 1.0).with_neighbour_radius(0.01);
    let split = engine.find_transients(&cloud, true);
    assert!(split.transient.is_empty());
    assert!(split.fixed.colours.iter().all(|colour| colour.red == 255));
}
