//! # gridbridge-runtime
//!
//! Wires scans and transforms from the event bus into a mapping engine and
//! publishes what it produces.
//!
//! - [`config`] – [`NodeConfig`] and its defaults.
//! - [`ingest`] – [`ScanIngestor`]: transform gate, conversion, engine update.
//! - [`pose_publisher`] – pose, odometry and `map → odom` output.
//! - [`map_publisher`] – periodic occupancy-grid publication per level.
//! - [`node`] – [`BridgeNode`] assembly and the [`NodeHandle`] lifecycle.
//! - [`telemetry`] – `tracing` subscriber with optional OTLP export.

pub mod config;
pub mod ingest;
pub mod map_publisher;
pub mod node;
pub mod pose_publisher;
pub mod telemetry;

pub use config::NodeConfig;
pub use ingest::{IngestOutcome, IngestStats, ScanIngestor};
pub use map_publisher::{CycleOutcome, MapPublisher, PublisherStats};
pub use node::{BridgeNode, NodeHandle, NodeReport, node_bus};
pub use pose_publisher::PosePublisher;
