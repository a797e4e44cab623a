use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::classify::{classify, Classification};
use crate::cloud::Cloud;
use crate::ellipsoid::Ellipsoid;
use crate::error::CloudError;
use crate::grid::RayGrid;
use crate::parallel;

/// Offset that keeps the bias-corrected hit count positive for a single hit.
const HIT_BIAS_EPSILON: f64 = 1.0e-8;

/// Conflict policy used when a surface and the rays crossing it disagree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeType {
    /// Keep whichever observation came first.
    Oldest,
    /// Keep whichever observation came last.
    Newest,
    /// Remove contested surfaces.
    #[default]
    Min,
    /// Keep contested surfaces and thin out the rays that cross them.
    Max,
    /// Keep every change. Outside a merge this decides like `Max`.
    All,
}

impl MergeType {
    pub const ALL: [MergeType; 5] = [
        MergeType::Oldest,
        MergeType::Newest,
        MergeType::Min,
        MergeType::Max,
        MergeType::All,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MergeType::Oldest => "oldest",
            MergeType::Newest => "newest",
            MergeType::Min => "min",
            MergeType::Max => "max",
            MergeType::All => "all",
        }
    }
}

impl fmt::Display for MergeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeType {
    type Err = CloudError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        MergeType::ALL
            .into_iter()
            .find(|merge_type| merge_type.as_str() == value)
            .ok_or_else(|| {
                CloudError::Settings(format!(
                    "unknown merge type '{value}', expected oldest, newest, min, max or all"
                ))
            })
    }
}

/// Running sum that fires once per whole unit of accumulated opacity, so
/// roughly `opacity` of a sequence is selected, spread evenly along it.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpacityAccumulator {
    value: f64,
}

impl OpacityAccumulator {
    pub fn step(&mut self, opacity: f64) -> bool {
        self.value += opacity;
        if self.value >= 1.0 {
            self.value -= 1.0;
            true
        } else {
            false
        }
    }
}

/// What to do with one ellipsoid's evidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionParams {
    pub merge_type: MergeType,
    /// Pass-through count needed to trust a change, before opacity weighting.
    /// Zero only records opacity.
    pub num_rays: f64,
    /// Evidence comes from the ellipsoid's own cloud, so pass-throughs are
    /// split around the hit time span.
    pub self_transient: bool,
}

/// Updates the ellipsoid from its classification and returns the ids of
/// pass-through rays that should be flagged transient. May also set
/// `ellipsoid.transient`.
pub fn decide(
    ellipsoid: &mut Ellipsoid,
    evidence: &Classification,
    times: &[f64],
    params: &DecisionParams,
) -> Vec<u32> {
    let num_pass = evidence.pass_throughs.len();
    ellipsoid.num_rays = evidence.num_rays() as u32;
    if params.num_rays == 0.0 || params.self_transient {
        if let Some(opacity) = evidence.opacity() {
            ellipsoid.opacity = opacity;
        }
    }
    if ellipsoid.num_rays == 0 || ellipsoid.opacity == 0.0 || params.num_rays == 0.0 {
        return Vec::new();
    }

    let mut num_before = 0usize;
    let mut num_after = 0usize;
    if params.self_transient {
        let mut misses = 0usize;
        for &id in &evidence.pass_throughs {
            let time = times[id as usize];
            if time > evidence.last_hit_time {
                num_after += 1;
            } else if time < evidence.first_hit_time {
                num_before += 1;
            } else {
                misses += 1;
            }
        }
        // one fewer hit gives an unbiased opacity estimate
        let h = evidence.hits as f64 + HIT_BIAS_EPSILON - 1.0;
        ellipsoid.opacity = h / (h + misses as f64);
        ellipsoid.num_gone = (num_before + num_after) as u32;
    } else if let Some(&first) = evidence.pass_throughs.first() {
        if times[first as usize] > ellipsoid.time {
            num_after = num_pass;
        } else {
            num_before = num_pass;
        }
    }

    let sequence_length = params.num_rays / ellipsoid.opacity;
    let remove_ellipsoid = match params.merge_type {
        MergeType::Oldest | MergeType::Newest => {
            if (num_before.max(num_after) as f64) < sequence_length {
                return Vec::new();
            }
            if params.merge_type == MergeType::Oldest {
                num_before as f64 >= sequence_length
            } else {
                num_after as f64 >= sequence_length
            }
        }
        MergeType::Min | MergeType::Max | MergeType::All => {
            // sum rather than max picks out objects seen through on both sides
            if ((num_before + num_after) as f64) < sequence_length {
                return Vec::new();
            }
            params.merge_type == MergeType::Min
        }
    };
    if remove_ellipsoid {
        ellipsoid.transient = true;
        return Vec::new();
    }

    let mut accumulator = OpacityAccumulator::default();
    let mut removed = Vec::new();
    for &id in &evidence.pass_throughs {
        if !accumulator.step(ellipsoid.opacity) {
            continue;
        }
        let time = times[id as usize];
        if !params.self_transient
            || time < evidence.first_hit_time
            || time > evidence.last_hit_time
        {
            removed.push(id);
        }
    }
    removed
}

/// One transient flag per ray, settable from many ellipsoids at once.
pub fn transient_flags(len: usize) -> Vec<AtomicBool> {
    (0..len).map(|_| AtomicBool::new(false)).collect()
}

pub fn into_flags(flags: Vec<AtomicBool>) -> Vec<bool> {
    flags.into_iter().map(AtomicBool::into_inner).collect()
}

/// Casts `rays` (indexed by `grid`) against every defined ellipsoid and
/// applies the decision to each. Rays to remove are flagged in `transients`,
/// surfaces to remove get `transient` set. Ellipsoids already marked
/// transient are skipped.
pub fn mark_intersected_ellipsoids(
    rays: &Cloud,
    grid: &RayGrid,
    ellipsoids: &mut [Ellipsoid],
    transients: &[AtomicBool],
    params: &DecisionParams,
) {
    tracing::info!(
        "marking intersected ellipsoids, num_rays: {}, merge_type: {}",
        params.num_rays,
        params.merge_type
    );
    parallel::for_each_indexed_mut(ellipsoids, |_, ellipsoid| {
        if ellipsoid.transient || !ellipsoid.is_defined() {
            return;
        }
        let evidence = classify(grid, ellipsoid, rays);
        for id in decide(ellipsoid, &evidence, &rays.times, params) {
            transients[id as usize].store(true, Ordering::Relaxed);
        }
    });
}
