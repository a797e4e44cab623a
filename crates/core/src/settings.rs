use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ellipsoid::DEFAULT_NEIGHBOUR_RADIUS;
use crate::error::CloudError;
use crate::merge::MergeEngine;
use crate::stream::DEFAULT_CHUNK_SIZE;
use crate::transient::MergeType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSettings {
    pub merge_type: MergeType,
    pub num_rays: f64,
    pub colour_cloud: bool,
    pub chunk_size: usize,
    pub max_neighbour_radius: f64,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            merge_type: MergeType::Min,
            num_rays: 2.0,
            colour_cloud: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_neighbour_radius: DEFAULT_NEIGHBOUR_RADIUS,
        }
    }
}

impl MergeSettings {
    pub fn from_json(text: &str) -> Result<Self, CloudError> {
        let settings: Self =
            serde_json::from_str(text).map_err(|err| CloudError::Settings(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CloudError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| CloudError::load(path, err))?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, CloudError> {
        serde_json::to_string_pretty(self).map_err(|err| CloudError::Settings(err.to_string()))
    }

    pub fn validate(&self) -> Result<(), CloudError> {
        if !self.num_rays.is_finite() || self.num_rays < 0.0 {
            return Err(CloudError::Settings(format!(
                "num_rays must be a non-negative number, got {}",
                self.num_rays
            )));
        }
        if self.chunk_size == 0 {
            return Err(CloudError::Settings("chunk_size must be positive".to_string()));
        }
        if !self.max_neighbour_radius.is_finite() || self.max_neighbour_radius <= 0.0 {
            return Err(CloudError::Settings(format!(
                "max_neighbour_radius must be positive, got {}",
                self.max_neighbour_radius
            )));
        }
        Ok(())
    }

    pub fn engine(&self) -> MergeEngine {
        MergeEngine::new(self.merge_type, self.num_rays)
            .with_neighbour_radius(self.max_neighbour_radius)
    }
}
