use std::fmt::Write as _;
use std::path::Path;

use glam::{DQuat, DVec3};

use crate::cloud::Cloud;
use crate::error::CloudError;

const HEADER: &str = "%time x y z q0 q1 q2 q3 userfields";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryNode {
    pub time: f64,
    pub position: DVec3,
    pub rotation: DQuat,
}

/// Timed sensor poses, ordered by time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trajectory {
    pub nodes: Vec<TrajectoryNode>,
}

impl Trajectory {
    pub fn new(nodes: Vec<TrajectoryNode>) -> Self {
        Self { nodes }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Parses whitespace separated `time x y z qw qx qy qz` rows. Lines
    /// starting with `%` or `#` are comments; extra columns are ignored.
    pub fn parse(text: &str) -> Result<Self, CloudError> {
        let mut nodes = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('%') || line.starts_with('#') {
                continue;
            }
            let values = line
                .split_whitespace()
                .take(8)
                .map(|token| token.parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| {
                    CloudError::Format(format!("trajectory line {}: {err}", line_no + 1))
                })?;
            if values.len() < 8 {
                return Err(CloudError::Format(format!(
                    "trajectory line {} has {} of 8 values",
                    line_no + 1,
                    values.len()
                )));
            }
            nodes.push(TrajectoryNode {
                time: values[0],
                position: DVec3::new(values[1], values[2], values[3]),
                rotation: DQuat::from_xyzw(values[5], values[6], values[7], values[4]),
            });
        }
        if nodes.windows(2).any(|pair| pair[1].time < pair[0].time) {
            tracing::warn!("trajectory times are not in order, sorting");
            nodes.sort_by(|a, b| a.time.total_cmp(&b.time));
        }
        Ok(Self { nodes })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CloudError> {
        let path = path.as_ref();
        tracing::info!("loading trajectory {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|err| CloudError::load(path, err))?;
        Self::parse(&text).map_err(|err| err.in_file(path))
    }

    pub fn to_text(&self) -> String {
        let mut text = String::from(HEADER);
        text.push('\n');
        for node in &self.nodes {
            let p = node.position;
            let q = node.rotation;
            let _ = writeln!(
                text,
                "{} {} {} {} {} {} {} {}",
                node.time, p.x, p.y, p.z, q.w, q.x, q.y, q.z
            );
        }
        text
    }

    /// Sensor position at `time`, linearly interpolated between the
    /// bracketing nodes and held at the ends. `None` without nodes.
    pub fn position_at(&self, time: f64) -> Option<DVec3> {
        let first = self.nodes.first()?;
        if self.nodes.len() == 1 {
            return Some(first.position);
        }
        let upper = self
            .nodes
            .partition_point(|node| node.time < time)
            .clamp(1, self.nodes.len() - 1);
        let prev = &self.nodes[upper - 1];
        let next = &self.nodes[upper];
        let span = next.time - prev.time;
        let blend = if span > 0.0 {
            ((time - prev.time) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Some(prev.position + (next.position - prev.position) * blend)
    }
}

impl Cloud {
    /// Replaces every ray start with the sensor position at the ray's time.
    pub fn calculate_starts(&mut self, trajectory: &Trajectory) -> Result<(), CloudError> {
        if trajectory.is_empty() {
            return Err(CloudError::Format(
                "cannot calculate ray starts from an empty trajectory".to_string(),
            ));
        }
        for idx in 0..self.len() {
            if let Some(start) = trajectory.position_at(self.times[idx]) {
                self.starts[idx] = start;
            }
        }
        Ok(())
    }
}
