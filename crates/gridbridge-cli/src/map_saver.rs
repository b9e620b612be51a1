//! Map export as a binary PGM image plus a JSON metadata sidecar.
//!
//! `<prefix>.pgm` holds one byte per cell, top row first (the grid's last
//! row), so north is up in image viewers.  `<prefix>.json` carries what is
//! needed to place the image back in the world.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gridbridge_mapping::GridLevel;
use gridbridge_middleware::EventBus;
use gridbridge_runtime::{CycleOutcome, MapPublisher};
use gridbridge_types::msgs::{CELL_FREE, CELL_OCCUPIED};
use gridbridge_types::{BridgeError, OccupancyGrid};
use serde::{Deserialize, Serialize};

pub const PIXEL_FREE: u8 = 254;
pub const PIXEL_OCCUPIED: u8 = 0;
pub const PIXEL_UNKNOWN: u8 = 205;

/// Contents of the `.json` sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSidecar {
    /// Image file name, relative to the sidecar.
    pub image: String,
    pub frame_id: String,
    pub stamp: DateTime<Utc>,
    pub resolution: f32,
    pub width: u32,
    pub height: u32,
    /// `[x, y, yaw]` of the lower-left pixel's corner.
    pub origin: [f32; 3],
}

fn pixel(value: i8) -> u8 {
    match value {
        CELL_FREE => PIXEL_FREE,
        CELL_OCCUPIED => PIXEL_OCCUPIED,
        _ => PIXEL_UNKNOWN,
    }
}

/// Encode `grid` as a complete P5 file.
pub fn encode_pgm(grid: &OccupancyGrid) -> Vec<u8> {
    let width = grid.info.width as usize;
    let height = grid.info.height as usize;
    let header = format!("P5\n{width} {height}\n255\n");

    let mut out = Vec::with_capacity(header.len() + width * height);
    out.extend_from_slice(header.as_bytes());
    for row in grid.data.chunks(width.max(1)).take(height).rev() {
        out.extend(row.iter().map(|&v| pixel(v)));
    }
    out
}

pub fn sidecar(grid: &OccupancyGrid, image: &str) -> MapSidecar {
    let origin = grid.info.origin;
    MapSidecar {
        image: image.to_string(),
        frame_id: grid.header.frame_id.clone(),
        stamp: grid.header.stamp,
        resolution: grid.info.resolution,
        width: grid.info.width,
        height: grid.info.height,
        origin: [origin.x, origin.y, origin.theta],
    }
}

/// Current contents of `grid`, converted by one extra publisher cycle so
/// updates made after the last periodic publication are included.  `None`
/// when the level was never written.
pub fn final_map(grid: GridLevel, bus: &EventBus, frame_id: &str) -> Option<Arc<OccupancyGrid>> {
    match MapPublisher::new(0, grid, bus.clone(), frame_id).cycle(Utc::now()) {
        CycleOutcome::Converted(msg) | CycleOutcome::Heartbeat(msg) => Some(msg),
        CycleOutcome::Skipped => None,
    }
}

/// `<prefix>.<ext>`, keeping any dots already in the prefix.
fn with_suffix(prefix: &Path, ext: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Write `<prefix>.pgm` and `<prefix>.json`; returns both paths.
pub fn save_map(grid: &OccupancyGrid, prefix: &Path) -> Result<(PathBuf, PathBuf), BridgeError> {
    let expected = grid.info.width as usize * grid.info.height as usize;
    if grid.data.len() != expected {
        return Err(BridgeError::Serialization(format!(
            "grid holds {} cells, header says {}x{}",
            grid.data.len(),
            grid.info.width,
            grid.info.height
        )));
    }

    let image_path = with_suffix(prefix, "pgm");
    let sidecar_path = with_suffix(prefix, "json");
    if let Some(parent) = image_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| BridgeError::Io(e.to_string()))?;
    }

    let image_name = image_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let meta = serde_json::to_string_pretty(&sidecar(grid, &image_name))
        .map_err(|e| BridgeError::Serialization(e.to_string()))?;

    fs::write(&image_path, encode_pgm(grid)).map_err(|e| BridgeError::Io(e.to_string()))?;
    fs::write(&sidecar_path, meta).map_err(|e| BridgeError::Io(e.to_string()))?;
    Ok((image_path, sidecar_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridbridge_mapping::{LogOddsParams, OccupancyGridMap};
    use gridbridge_middleware::Topic;
    use gridbridge_types::msgs::CELL_UNKNOWN;
    use gridbridge_types::{EventPayload, Header, MapMetaData, Point2, Pose2D};

    fn blank_level() -> GridLevel {
        let params = LogOddsParams::from_factors(0.4, 0.9).unwrap();
        GridLevel::new(OccupancyGridMap::new(4, 4, 0.05, Point2::new(0.5, 0.5), params))
    }

    fn grid_2x3() -> OccupancyGrid {
        OccupancyGrid {
            header: Header::new(Utc::now(), "map"),
            info: MapMetaData {
                map_load_time: Utc::now(),
                resolution: 0.05,
                width: 2,
                height: 3,
                origin: Pose2D::new(-0.025, -0.025, 0.0),
            },
            // rows bottom to top: [free, occ], [unknown, free], [occ, occ]
            data: vec![
                CELL_FREE,
                CELL_OCCUPIED,
                CELL_UNKNOWN,
                CELL_FREE,
                CELL_OCCUPIED,
                CELL_OCCUPIED,
            ]
            .into(),
        }
    }

    #[test]
    fn pgm_header_and_flipped_rows() {
        let bytes = encode_pgm(&grid_2x3());
        let header = b"P5\n2 3\n255\n";
        assert_eq!(&bytes[..header.len()], header);
        assert_eq!(
            &bytes[header.len()..],
            &[
                PIXEL_OCCUPIED,
                PIXEL_OCCUPIED,
                PIXEL_UNKNOWN,
                PIXEL_FREE,
                PIXEL_FREE,
                PIXEL_OCCUPIED
            ]
        );
    }

    #[test]
    fn save_writes_image_and_sidecar() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let prefix = dir.path().join("maps").join("office");
        let (image, meta) = save_map(&grid_2x3(), &prefix).expect("save");

        assert_eq!(image, dir.path().join("maps/office.pgm"));
        assert_eq!(fs::read(&image).unwrap().len(), 11 + 6);

        let sidecar: MapSidecar = serde_json::from_str(&fs::read_to_string(meta).unwrap()).unwrap();
        assert_eq!(sidecar.image, "office.pgm");
        assert_eq!((sidecar.width, sidecar.height), (2, 3));
        assert!((sidecar.origin[0] + 0.025).abs() < 1e-6);
        assert_eq!(sidecar.frame_id, "map");
    }

    #[test]
    fn dotted_prefix_keeps_its_suffix() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let (image, meta) = save_map(&grid_2x3(), &dir.path().join("run.v2")).expect("save");
        assert_eq!(image, dir.path().join("run.v2.pgm"));
        assert_eq!(meta, dir.path().join("run.v2.json"));
        assert!(image.exists() && meta.exists());

        let sidecar: MapSidecar = serde_json::from_str(&fs::read_to_string(meta).unwrap()).unwrap();
        assert_eq!(sidecar.image, "run.v2.pgm");
    }

    #[test]
    fn inconsistent_grid_is_rejected() {
        let mut grid = grid_2x3();
        grid.data = grid.data[..5].into();
        let dir = tempfile::tempdir().expect("tmp dir");
        let err = save_map(&grid, &dir.path().join("bad")).unwrap_err();
        assert!(matches!(err, BridgeError::Serialization(_)));
        assert!(!dir.path().join("bad.pgm").exists());
    }

    #[test]
    fn final_map_includes_updates_after_last_publication() {
        let bus = EventBus::default();
        let level = blank_level();
        level.mutate(|g| g.mark_free(0, 0));
        let mut periodic = MapPublisher::new(0, level.clone(), bus.clone(), "map");
        assert!(matches!(periodic.cycle(Utc::now()), CycleOutcome::Converted(_)));

        level.mutate(|g| g.mark_occupied(3, 3));
        let grid = final_map(level, &bus, "map").expect("map");
        assert_eq!(grid.data[0], CELL_FREE);
        assert_eq!(grid.data[15], CELL_OCCUPIED);

        let latched = bus.latched(Topic::Map, "map").expect("latched");
        assert!(matches!(latched.payload, EventPayload::Map { grid: ref g, .. } if g.data[15] == CELL_OCCUPIED));
    }

    #[test]
    fn final_map_of_untouched_level_is_none() {
        assert!(final_map(blank_level(), &EventBus::default(), "map").is_none());
    }
}
