//! Node configuration.
//!
//! Every field has a serde default so a partial TOML file (or an empty one)
//! yields a usable configuration.  The struct is immutable once a node is
//! built from it.

use std::time::Duration;

use gridbridge_mapping::EngineParams;
use gridbridge_types::{BridgeError, Point2};
use serde::{Deserialize, Serialize};

/// Upper bound for `map_pub_period` and `transform_timeout` (one day).
pub const MAX_WAIT_SECONDS: f64 = 86_400.0;

/// Runtime parameters of a bridge node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Bus source name of the scan stream to consume.
    #[serde(default = "default_scan_topic")]
    pub scan_topic: String,

    /// Scans buffered for the ingestion task before the oldest are dropped.
    #[serde(default = "default_scan_queue")]
    pub scan_subscriber_queue_size: usize,

    #[serde(default = "default_map_frame")]
    pub map_frame: String,

    #[serde(default = "default_odom_frame")]
    pub odom_frame: String,

    #[serde(default = "default_base_frame")]
    pub base_frame: String,

    #[serde(default)]
    pub pub_odometry: bool,

    #[serde(default)]
    pub pub_map_odom_transform: bool,

    #[serde(default)]
    pub pub_map_scanmatch_transform: bool,

    /// Child frame of the map → scan-match transform.
    #[serde(default = "default_scanmatch_frame")]
    pub tf_map_scanmatch_transform_frame_name: String,

    /// Log per-scan processing time.
    #[serde(default)]
    pub output_timing: bool,

    /// Seconds between map publication cycles.
    #[serde(default = "default_map_pub_period")]
    pub map_pub_period: f64,

    /// Metres per cell at the finest level.
    #[serde(default = "default_map_resolution")]
    pub map_resolution: f32,

    /// Cells per side at the finest level.
    #[serde(default = "default_map_size")]
    pub map_size: usize,

    #[serde(default = "default_map_start")]
    pub map_start_x: f32,

    #[serde(default = "default_map_start")]
    pub map_start_y: f32,

    #[serde(default = "default_map_levels")]
    pub map_multi_res_levels: usize,

    /// How many levels (finest first) get their own map publisher.
    #[serde(default = "default_map_pub_levels")]
    pub map_pub_levels: usize,

    #[serde(default = "default_update_factor_free")]
    pub update_factor_free: f32,

    #[serde(default = "default_update_factor_occupied")]
    pub update_factor_occupied: f32,

    /// Metres.
    #[serde(default = "default_distance_thresh")]
    pub map_update_distance_thresh: f32,

    /// Radians.
    #[serde(default = "default_angle_thresh")]
    pub map_update_angle_thresh: f32,

    /// Seconds to wait for a transform before giving up on a scan.
    #[serde(default = "default_transform_timeout")]
    pub transform_timeout: f64,
}

fn default_scan_topic() -> String {
    "laser_scan".to_string()
}
fn default_scan_queue() -> usize {
    5
}
fn default_map_frame() -> String {
    "map".to_string()
}
fn default_odom_frame() -> String {
    "odom_hector".to_string()
}
fn default_base_frame() -> String {
    "base_link".to_string()
}
fn default_scanmatch_frame() -> String {
    "scanmatcher_frame".to_string()
}
fn default_map_pub_period() -> f64 {
    2.0
}
fn default_map_resolution() -> f32 {
    0.05
}
fn default_map_size() -> usize {
    1024
}
fn default_map_start() -> f32 {
    0.5
}
fn default_map_levels() -> usize {
    3
}
fn default_map_pub_levels() -> usize {
    1
}
fn default_update_factor_free() -> f32 {
    0.4
}
fn default_update_factor_occupied() -> f32 {
    0.9
}
fn default_distance_thresh() -> f32 {
    0.4
}
fn default_angle_thresh() -> f32 {
    0.9
}
fn default_transform_timeout() -> f64 {
    0.5
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            scan_topic: default_scan_topic(),
            scan_subscriber_queue_size: default_scan_queue(),
            map_frame: default_map_frame(),
            odom_frame: default_odom_frame(),
            base_frame: default_base_frame(),
            pub_odometry: false,
            pub_map_odom_transform: false,
            pub_map_scanmatch_transform: false,
            tf_map_scanmatch_transform_frame_name: default_scanmatch_frame(),
            output_timing: false,
            map_pub_period: default_map_pub_period(),
            map_resolution: default_map_resolution(),
            map_size: default_map_size(),
            map_start_x: default_map_start(),
            map_start_y: default_map_start(),
            map_multi_res_levels: default_map_levels(),
            map_pub_levels: default_map_pub_levels(),
            update_factor_free: default_update_factor_free(),
            update_factor_occupied: default_update_factor_occupied(),
            map_update_distance_thresh: default_distance_thresh(),
            map_update_angle_thresh: default_angle_thresh(),
            transform_timeout: default_transform_timeout(),
        }
    }
}

impl NodeConfig {
    /// Engine parameters derived from the map settings.
    pub fn engine_params(&self) -> EngineParams {
        EngineParams {
            resolution: self.map_resolution,
            size: self.map_size,
            start: Point2::new(self.map_start_x, self.map_start_y),
            levels: self.map_multi_res_levels,
            update_factor_free: self.update_factor_free,
            update_factor_occupied: self.update_factor_occupied,
            min_dist_diff: self.map_update_distance_thresh,
            min_angle_diff: self.map_update_angle_thresh,
        }
    }

    /// Zero for values [`Self::validate`] rejects.
    pub fn map_pub_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.map_pub_period).unwrap_or_default()
    }

    /// Zero for values [`Self::validate`] rejects.
    pub fn transform_wait(&self) -> Duration {
        Duration::try_from_secs_f64(self.transform_timeout).unwrap_or_default()
    }

    /// Number of map publishers to start, never more than the engine has
    /// levels and never fewer than one.
    pub fn published_levels(&self) -> usize {
        self.map_pub_levels.clamp(1, self.map_multi_res_levels.max(1))
    }

    /// Reject values no node can run with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.scan_topic.trim().is_empty() {
            return Err(BridgeError::InvalidConfig("scan_topic must not be empty".to_string()));
        }
        for (name, frame) in [
            ("map_frame", &self.map_frame),
            ("odom_frame", &self.odom_frame),
            ("base_frame", &self.base_frame),
        ] {
            if frame.trim().is_empty() {
                return Err(BridgeError::InvalidConfig(format!("{name} must not be empty")));
            }
        }
        if !(self.map_pub_period > 0.0 && self.map_pub_period <= MAX_WAIT_SECONDS)
            || self.map_pub_interval().is_zero()
        {
            return Err(BridgeError::InvalidConfig(format!(
                "map_pub_period must be in (0, {MAX_WAIT_SECONDS}] s and at least 1 ns, got {}",
                self.map_pub_period
            )));
        }
        if !(self.transform_timeout >= 0.0 && self.transform_timeout <= MAX_WAIT_SECONDS) {
            return Err(BridgeError::InvalidConfig(format!(
                "transform_timeout must be in [0, {MAX_WAIT_SECONDS}] s, got {}",
                self.transform_timeout
            )));
        }
        self.engine_params().validate()
    }
}
