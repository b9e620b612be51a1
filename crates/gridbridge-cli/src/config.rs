//! Node configuration on disk: `~/.gridbridge/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use gridbridge_runtime::NodeConfig;
use tracing::warn;

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    File(PathBuf),
    /// No file at the path; built-in defaults.
    Defaults,
    /// The file exists but could not be read or parsed; built-in defaults.
    Fallback(String),
}

/// Return the path to `~/.gridbridge/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".gridbridge").join("config.toml")
}

/// Read the file at `path`.  `Ok(None)` when it does not exist.
pub fn load_from(path: &Path) -> Result<Option<NodeConfig>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: NodeConfig =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Effective configuration: file (or defaults), then environment overrides.
/// An unreadable file is reported through the returned source and a warning,
/// never as an error.
pub fn resolve(path: &Path) -> (NodeConfig, ConfigSource) {
    let (mut cfg, source) = match load_from(path) {
        Ok(Some(cfg)) => (cfg, ConfigSource::File(path.to_path_buf())),
        Ok(None) => (NodeConfig::default(), ConfigSource::Defaults),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config unusable; falling back to defaults");
            (NodeConfig::default(), ConfigSource::Fallback(e))
        }
    };
    apply_env_overrides(&mut cfg);
    (cfg, source)
}

/// Apply `GRIDBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `GRIDBRIDGE_SCAN_TOPIC` | `scan_topic` |
/// | `GRIDBRIDGE_MAP_PUB_PERIOD` | `map_pub_period` |
/// | `GRIDBRIDGE_MAP_RESOLUTION` | `map_resolution` |
/// | `GRIDBRIDGE_MAP_SIZE` | `map_size` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut NodeConfig) {
    if let Ok(v) = std::env::var("GRIDBRIDGE_SCAN_TOPIC") {
        cfg.scan_topic = v;
    }
    if let Ok(v) = std::env::var("GRIDBRIDGE_MAP_PUB_PERIOD")
        && let Ok(period) = v.parse::<f64>()
    {
        cfg.map_pub_period = period;
    }
    if let Ok(v) = std::env::var("GRIDBRIDGE_MAP_RESOLUTION")
        && let Ok(resolution) = v.parse::<f32>()
    {
        cfg.map_resolution = resolution;
    }
    if let Ok(v) = std::env::var("GRIDBRIDGE_MAP_SIZE")
        && let Ok(size) = v.parse::<usize>()
    {
        cfg.map_size = size;
    }
}

/// Write `cfg` to `path`, creating the parent directory.
pub fn save_to(cfg: &NodeConfig, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}

/// Rendered form of `cfg` as it would be written to disk.
pub fn render(cfg: &NodeConfig) -> Result<String, String> {
    toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_points_to_gridbridge_dir() {
        let p = config_path_for_home("/home/operator");
        assert_eq!(p, PathBuf::from("/home/operator/.gridbridge/config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn roundtrip_custom_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = NodeConfig {
            map_size: 512,
            pub_odometry: true,
            base_frame: "base_footprint".to_string(),
            ..NodeConfig::default()
        };
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "map_multi_res_levels = 2\noutput_timing = true\n").expect("write");

        let (cfg, source) = resolve(&path);
        assert_eq!(source, ConfigSource::File(path.clone()));
        assert_eq!(cfg.map_multi_res_levels, 2);
        assert!(cfg.output_timing);
        assert_eq!(cfg.odom_frame, "odom_hector");
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "map_size = \"huge\"").expect("write");

        let (cfg, source) = resolve(&path);
        assert!(matches!(source, ConfigSource::Fallback(_)));
        assert_eq!(cfg.map_multi_res_levels, NodeConfig::default().map_multi_res_levels);
    }

    #[test]
    fn env_override_changes_scan_topic() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("GRIDBRIDGE_SCAN_TOPIC", "front_scan") };
        let mut cfg = NodeConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.scan_topic, "front_scan");
        unsafe { std::env::remove_var("GRIDBRIDGE_SCAN_TOPIC") };
    }

    #[test]
    fn env_override_changes_resolution_and_period() {
        // SAFETY: no other test touches these variables.
        unsafe {
            std::env::set_var("GRIDBRIDGE_MAP_RESOLUTION", "0.025");
            std::env::set_var("GRIDBRIDGE_MAP_PUB_PERIOD", "0.5");
        }
        let mut cfg = NodeConfig::default();
        apply_env_overrides(&mut cfg);
        assert!((cfg.map_resolution - 0.025).abs() < 1e-6);
        assert!((cfg.map_pub_period - 0.5).abs() < 1e-9);
        unsafe {
            std::env::remove_var("GRIDBRIDGE_MAP_RESOLUTION");
            std::env::remove_var("GRIDBRIDGE_MAP_PUB_PERIOD");
        }
    }

    #[test]
    fn env_override_ignores_invalid_size() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("GRIDBRIDGE_MAP_SIZE", "not-a-size") };
        let mut cfg = NodeConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.map_size, 1024);
        unsafe { std::env::remove_var("GRIDBRIDGE_MAP_SIZE") };
    }

    #[test]
    fn rendered_config_parses_back() {
        let text = render(&NodeConfig::default()).expect("render");
        assert!(text.contains("scan_topic = \"laser_scan\""));
        let parsed: NodeConfig = toml::from_str(&text).expect("parse");
        assert_eq!(parsed, NodeConfig::default());
    }
}
