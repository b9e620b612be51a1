//! Recorded-session playback onto the bus.
//!
//! One JSON object per line, tagged by `kind`:
//!
//! ```text
//! {"kind":"tf_static","transform":{"header":{...},"child_frame_id":"laser","transform":{...}}}
//! {"kind":"tf","transform":{...}}
//! {"kind":"scan","scan":{"header":{...},"angle_min":-1.57,...,"ranges":[1.2,null,...]}}
//! ```
//!
//! Scans are published under the record's `topic`, or under the node's scan
//! topic when it is omitted.  Blank lines and lines starting with `#` are
//! ignored.

use std::io::BufRead;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gridbridge_middleware::{EventBus, Topic};
use gridbridge_types::{BridgeError, Event, EventPayload, RangeScan, StampedTransform};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Source name used for replayed transforms.
const REPLAY_SOURCE: &str = "replay";

/// Slowest accepted playback rate; `0` still means unpaced.
pub const MIN_RATE: f64 = 1e-3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayRecord {
    Scan {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        scan: RangeScan,
    },
    Tf {
        transform: StampedTransform,
    },
    TfStatic {
        transform: StampedTransform,
    },
}

impl ReplayRecord {
    pub fn stamp(&self) -> DateTime<Utc> {
        match self {
            ReplayRecord::Scan { scan, .. } => scan.header.stamp,
            ReplayRecord::Tf { transform } | ReplayRecord::TfStatic { transform } => {
                transform.header.stamp
            }
        }
    }

    fn into_event(self, scan_topic: &str) -> (Topic, Event) {
        match self {
            ReplayRecord::Scan { topic, scan } => {
                let source = topic.unwrap_or_else(|| scan_topic.to_string());
                (Topic::Scan, Event::new(source, EventPayload::Scan(scan)))
            }
            ReplayRecord::Tf { transform } => (
                Topic::Tf,
                Event::new(REPLAY_SOURCE, EventPayload::Transform(transform)),
            ),
            ReplayRecord::TfStatic { transform } => (
                Topic::TfStatic,
                Event::new(REPLAY_SOURCE, EventPayload::Transform(transform)),
            ),
        }
    }
}

/// Parse every record in `reader`.  Fails on the first bad line, naming it.
pub fn read_records(reader: impl BufRead) -> Result<Vec<ReplayRecord>, BridgeError> {
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| BridgeError::Io(e.to_string()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let record = serde_json::from_str(trimmed)
            .map_err(|e| BridgeError::Serialization(format!("line {}: {}", index + 1, e)))?;
        records.push(record);
    }
    Ok(records)
}

/// `--rate` parser: `0` or a finite rate of at least [`MIN_RATE`].
pub fn parse_rate(raw: &str) -> Result<f64, String> {
    let rate: f64 = raw.parse().map_err(|e| format!("not a number: {e}"))?;
    if rate == 0.0 || (rate.is_finite() && rate >= MIN_RATE) {
        Ok(rate)
    } else {
        Err(format!("rate must be 0 or a finite value >= {MIN_RATE}, got {raw}"))
    }
}

/// Wall-clock wait between two records at playback `rate` (1.0 = recorded
/// speed).  `None` when unpaced or when the stamps do not advance.  Rates
/// below [`MIN_RATE`] pace as [`MIN_RATE`].
pub fn pace_delay(prev: DateTime<Utc>, next: DateTime<Utc>, rate: f64) -> Option<Duration> {
    if !(rate.is_finite() && rate > 0.0) {
        return None;
    }
    let gap = (next - prev).to_std().ok()?;
    if gap.is_zero() {
        return None;
    }
    Duration::try_from_secs_f64(gap.as_secs_f64() / rate.max(MIN_RATE)).ok()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub scans: u64,
    pub transforms: u64,
    /// `true` when playback stopped on shutdown before the last record.
    pub interrupted: bool,
}

/// Publish `records` in order, paced by their stamps at `rate` (0 = as fast
/// as possible), until done or `shutdown` turns `true`.
pub async fn replay(
    records: Vec<ReplayRecord>,
    bus: &EventBus,
    scan_topic: &str,
    rate: f64,
    mut shutdown: watch::Receiver<bool>,
) -> ReplayStats {
    let mut stats = ReplayStats::default();
    let mut prev_stamp: Option<DateTime<Utc>> = None;
    info!(records = records.len(), rate, "replay started");

    for record in records {
        let stamp = record.stamp();
        if let Some(delay) = prev_stamp.and_then(|prev| pace_delay(prev, stamp, rate)) {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
        if *shutdown.borrow() {
            stats.interrupted = true;
            break;
        }
        prev_stamp = Some(stamp);

        let (topic, event) = record.into_event(scan_topic);
        match topic {
            Topic::Scan => stats.scans += 1,
            _ => stats.transforms += 1,
        }
        let delivered = bus.publish_to(topic, event);
        if delivered == 0 {
            warn!(?topic, "replayed record had no subscribers");
        }
        debug!(?topic, %stamp, "record replayed");
    }

    info!(scans = stats.scans, transforms = stats.transforms, interrupted = stats.interrupted, "replay finished");
    stats
}
