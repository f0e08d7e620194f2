use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{TResult, TrackerError};
use crate::geo_filter::{GeoDistanceFilter, DEFAULT_MAX_JUMP_M};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Fix-to-fix deltas at or above this many meters are discarded
    pub max_fix_jump_m: f64,
    /// Bound of the merged sensor/timer event queue
    pub intake_capacity: usize,
    pub data_dir: PathBuf,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_fix_jump_m: DEFAULT_MAX_JUMP_M,
            intake_capacity: 256,
            data_dir: PathBuf::from("run_tracker_sessions"),
        }
    }
}

impl TrackerConfig {
    /// Read a JSON config file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> TResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            TrackerError::InvalidConfig(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config: TrackerConfig = serde_json::from_str(&text).map_err(|e| {
            TrackerError::InvalidConfig(format!("Cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TResult<()> {
        if !(self.max_fix_jump_m.is_finite() && self.max_fix_jump_m > 0.0) {
            return Err(TrackerError::InvalidConfig(format!(
                "max_fix_jump_m must be a positive number, got {}",
                self.max_fix_jump_m
            )));
        }
        if self.intake_capacity == 0 {
            return Err(TrackerError::InvalidConfig(
                "intake_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn distance_filter(&self) -> GeoDistanceFilter {
        GeoDistanceFilter::new(self.max_fix_jump_m)
    }
}
