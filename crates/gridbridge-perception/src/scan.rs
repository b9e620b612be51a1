//! Range scan → engine point set.
//!
//! The mapping engine works in map-cell units, so every admitted sample is
//! projected into the sensor plane and multiplied by the engine's
//! `scale_to_map` (cells per metre) in one pass.

use gridbridge_types::{BridgeError, Point2, PointSet, RangeScan};

/// Readings within this distance of `range_max` are treated as saturated
/// "no return" values and dropped.
pub const MAX_RANGE_MARGIN: f32 = 0.1;

/// Convert `scan` into a [`PointSet`] in engine scale around a zero origin.
///
/// A sample is admitted only if `range_min < d < range_max - MAX_RANGE_MARGIN`;
/// everything else (including NaN and infinities) is silently skipped, so the
/// result may be empty.
///
/// # Errors
///
/// [`BridgeError::MalformedScan`] when the angular or range bounds are not
/// finite, or `scale_to_map` is not a positive finite number.
pub fn scan_to_points(scan: &RangeScan, scale_to_map: f32) -> Result<PointSet, BridgeError> {
    validate(scan, scale_to_map)?;

    let max_admitted = scan.range_max - MAX_RANGE_MARGIN;
    let mut points = PointSet::with_capacity(scan.ranges.len());

    for (i, &dist) in scan.ranges.iter().enumerate() {
        if !(dist > scan.range_min && dist < max_admitted) {
            continue;
        }
        let angle = scan.angle_min + i as f32 * scan.angle_increment;
        let scaled = dist * scale_to_map;
        points.push(Point2::new(angle.cos() * scaled, angle.sin() * scaled));
    }

    Ok(points)
}

fn validate(scan: &RangeScan, scale_to_map: f32) -> Result<(), BridgeError> {
    let bounds = [
        ("angle_min", scan.angle_min),
        ("angle_increment", scan.angle_increment),
        ("range_min", scan.range_min),
        ("range_max", scan.range_max),
    ];
    if let Some((name, value)) = bounds.iter().find(|(_, v)| !v.is_finite()) {
        return Err(BridgeError::MalformedScan(format!(
            "{name} is not finite ({value}) in scan from '{}'",
            scan.header.frame_id
        )));
    }
    if !(scale_to_map.is_finite() && scale_to_map > 0.0) {
        return Err(BridgeError::MalformedScan(format!(
            "scale_to_map must be positive and finite, got {scale_to_map}"
        )));
    }
    Ok(())
}
