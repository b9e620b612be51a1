//! Scan ingestion: the single sequential consumer of the scan stream.
//!
//! Per scan:
//!
//! 1. Wait (bounded) for the sensor frame to become resolvable in the base
//!    frame.  On failure the scan is dropped and nothing is published.
//! 2. Convert the ranges into engine-scale points.
//! 3. Feed the engine, seeded with its own last pose.
//! 4. Publish pose, odometry and transforms.
//!
//! The resolver wait is a blocking condvar wait, so the async loop hands each
//! scan to [`tokio::task::spawn_blocking`] together with the ingestor and
//! takes the ingestor back when the scan is done.

use std::sync::Arc;
use std::time::{Duration, Instant};

use gridbridge_mapping::MappingEngine;
use gridbridge_middleware::TopicSubscriber;
use gridbridge_perception::{TransformResolver, scan_to_points};
use gridbridge_types::{BridgeError, EventPayload, PointSet, PoseWithCovarianceStamped, RangeScan};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::pose_publisher::PosePublisher;

/// Result of processing one scan.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// The engine was updated and the pose published.
    Updated {
        pose: PoseWithCovarianceStamped,
        elapsed: Duration,
    },
    /// The sensor transform was not available; no update, no output.
    Skipped(BridgeError),
}

/// Counters reported when ingestion stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub processed: u64,
    pub skipped: u64,
}

pub struct ScanIngestor {
    engine: Box<dyn MappingEngine>,
    resolver: Arc<dyn TransformResolver>,
    poses: PosePublisher,
    config: Arc<NodeConfig>,
}

impl ScanIngestor {
    pub fn new(
        engine: Box<dyn MappingEngine>,
        resolver: Arc<dyn TransformResolver>,
        poses: PosePublisher,
        config: Arc<NodeConfig>,
    ) -> Self {
        Self {
            engine,
            resolver,
            poses,
            config,
        }
    }

    pub fn engine(&self) -> &dyn MappingEngine {
        self.engine.as_ref()
    }

    /// Process one scan synchronously; may block up to the transform timeout.
    pub fn process(&mut self, scan: &RangeScan) -> IngestOutcome {
        let started = Instant::now();
        let cfg = &self.config;

        // The transform only gates the scan; points stay in the sensor frame.
        if let Err(e) = self.resolver.resolve(
            &cfg.base_frame,
            &scan.header.frame_id,
            scan.header.stamp,
            cfg.transform_wait(),
        ) {
            info!(
                base_frame = %cfg.base_frame,
                scan_frame = %scan.header.frame_id,
                error = %e,
                "could not transform scan into base frame; skipping"
            );
            return IngestOutcome::Skipped(e);
        }

        let points = match scan_to_points(scan, self.engine.scale_to_map()) {
            Ok(points) => points,
            Err(e) => {
                warn!(error = %e, "malformed scan; updating with no points");
                PointSet::new()
            }
        };

        let seed = self.engine.last_pose();
        self.engine.update(&points, seed);

        let elapsed = started.elapsed();
        if cfg.output_timing {
            info!(elapsed_ms = elapsed.as_secs_f64() * 1000.0, points = points.len(), "scan iteration");
        }

        let pose = self.poses.publish(
            self.engine.last_pose(),
            self.engine.last_covariance(),
            scan.header.stamp,
        );
        IngestOutcome::Updated { pose, elapsed }
    }

    /// Consume `scans` until the stream closes or `shutdown` turns `true`.
    /// A scan already being processed always finishes.
    pub async fn run(
        mut self,
        mut scans: TopicSubscriber,
        mut shutdown: watch::Receiver<bool>,
    ) -> IngestStats {
        let mut stats = IngestStats::default();
        info!(topic = %scans.name(), "scan ingestion started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let event = tokio::select! {
                event = scans.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            let EventPayload::Scan(scan) = event.payload else {
                debug!(source = %event.source, "non-scan payload on scan topic");
                continue;
            };

            let joined = tokio::task::spawn_blocking(move || {
                let outcome = self.process(&scan);
                (self, outcome)
            })
            .await;
            let outcome = match joined {
                Ok((ingestor, outcome)) => {
                    self = ingestor;
                    outcome
                }
                Err(e) => {
                    error!(error = %e, "scan processing task failed; ingestion stopped");
                    return stats;
                }
            };

            match outcome {
                IngestOutcome::Updated { .. } => stats.processed += 1,
                IngestOutcome::Skipped(_) => stats.skipped += 1,
            }
        }

        info!(processed = stats.processed, skipped = stats.skipped, "scan ingestion stopped");
        stats
    }
}
