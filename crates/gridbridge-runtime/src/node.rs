//! Node assembly: one engine, one ingestion task, one transform listener and
//! one map publisher per published level, all sharing a single [`EventBus`].
//!
//! # Example
//!
//! ```rust,no_run
//! use gridbridge_runtime::{BridgeNode, NodeConfig, node_bus};
//!
//! # async fn demo() -> Result<(), gridbridge_types::BridgeError> {
//! let config = NodeConfig::default();
//! let bus = node_bus(&config);
//! let handle = BridgeNode::new(config, bus.clone())?.start();
//! // ... publish scans and transforms on `bus` ...
//! let report = handle.shutdown().await;
//! println!("processed {} scans", report.ingest.processed);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use gridbridge_mapping::{GridLevel, MappingEngine, MultiResolutionEngine};
use gridbridge_middleware::{EventBus, Topic, TopicReceiver};
use gridbridge_perception::TfBuffer;
use gridbridge_types::{BridgeError, EventPayload};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::ingest::{IngestStats, ScanIngestor};
use crate::map_publisher::{MapPublisher, PublisherStats};
use crate::pose_publisher::PosePublisher;

/// Channel capacity for every topic other than scans.
const BUS_CAPACITY: usize = 256;

/// A bus sized for `config`: the scan topic buffers
/// `scan_subscriber_queue_size` scans, everything else [`BUS_CAPACITY`].
pub fn node_bus(config: &NodeConfig) -> EventBus {
    EventBus::with_scan_queue(BUS_CAPACITY, config.scan_subscriber_queue_size)
}

/// A configured node that has not been started yet.
pub struct BridgeNode {
    config: Arc<NodeConfig>,
    bus: EventBus,
    tf: Arc<TfBuffer>,
    engine: Box<dyn MappingEngine>,
}

impl BridgeNode {
    /// Validate `config` and build the default multi-resolution engine.
    pub fn new(config: NodeConfig, bus: EventBus) -> Result<Self, BridgeError> {
        config.validate()?;
        let engine = MultiResolutionEngine::new(config.engine_params())?;
        Self::with_engine(config, bus, Box::new(engine))
    }

    /// Build a node around a caller-supplied engine.
    pub fn with_engine(
        config: NodeConfig,
        bus: EventBus,
        engine: Box<dyn MappingEngine>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            bus,
            tf: Arc::new(TfBuffer::new()),
            engine,
        })
    }

    pub fn tf_buffer(&self) -> Arc<TfBuffer> {
        Arc::clone(&self.tf)
    }

    /// Subscribe to every input, publish the map metadata and spawn all
    /// tasks.  Must be called inside a Tokio runtime.
    pub fn start(self) -> NodeHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cfg = Arc::clone(&self.config);

        let levels: Vec<GridLevel> = (0..self.engine.map_levels())
            .filter_map(|i| self.engine.grid_level(i))
            .collect();

        // Subscribe before spawning so nothing published after `start`
        // returns is missed.
        let scans = self.bus.subscribe_named(Topic::Scan, cfg.scan_topic.clone());
        let tf_rx = self.bus.subscribe_to(Topic::Tf);
        let tf_static_rx = self.bus.subscribe_to(Topic::TfStatic);

        let tf_listener = tokio::spawn(listen_transforms(
            Arc::clone(&self.tf),
            tf_rx,
            tf_static_rx,
            shutdown_rx.clone(),
        ));

        let published = cfg.published_levels().min(levels.len());
        let mut publishers = Vec::with_capacity(published);
        for (index, level) in levels.iter().take(published).enumerate() {
            let publisher = MapPublisher::new(index, level.clone(), self.bus.clone(), cfg.map_frame.clone());
            if index == 0 {
                let info = publisher.publish_metadata();
                debug!(width = info.width, height = info.height, resolution = info.resolution, "map metadata published");
            }
            publishers.push(tokio::spawn(
                publisher.run(cfg.map_pub_interval(), shutdown_rx.clone()),
            ));
        }

        let poses = PosePublisher::new(self.bus.clone(), Arc::clone(&cfg), self.tf.clone());
        let ingestor = ScanIngestor::new(self.engine, self.tf.clone(), poses, Arc::clone(&cfg));
        let ingest = tokio::spawn(ingestor.run(scans, shutdown_rx));

        info!(
            scan_topic = %cfg.scan_topic,
            levels = levels.len(),
            published_levels = published,
            "bridge node started"
        );

        NodeHandle {
            shutdown: shutdown_tx,
            ingest,
            publishers,
            tf_listener,
            levels,
            tf: self.tf,
        }
    }
}

/// Feed transform traffic into the buffer until shutdown.
async fn listen_transforms(
    tf: Arc<TfBuffer>,
    mut dynamic: TopicReceiver,
    mut fixed: TopicReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let (received, is_static) = tokio::select! {
            r = dynamic.recv() => (r, false),
            r = fixed.recv() => (r, true),
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };
        match received {
            Ok(event) => {
                if let EventPayload::Transform(msg) = event.payload {
                    if is_static {
                        tf.set_static_transform(&msg);
                    } else {
                        tf.set_transform(&msg);
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(dropped = n, is_static, "transform listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Final counters of a stopped node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeReport {
    pub ingest: IngestStats,
    /// One entry per published level, finest first.
    pub publishers: Vec<PublisherStats>,
}

/// Running node.  Drop without calling [`NodeHandle::shutdown`] leaves the
/// tasks running until the runtime stops.
pub struct NodeHandle {
    shutdown: watch::Sender<bool>,
    ingest: JoinHandle<IngestStats>,
    publishers: Vec<JoinHandle<PublisherStats>>,
    tf_listener: JoinHandle<()>,
    levels: Vec<GridLevel>,
    tf: Arc<TfBuffer>,
}

impl NodeHandle {
    /// Read handle to one engine level.
    pub fn grid_level(&self, level: usize) -> Option<GridLevel> {
        self.levels.get(level).cloned()
    }

    pub fn tf_buffer(&self) -> Arc<TfBuffer> {
        Arc::clone(&self.tf)
    }

    /// Signal every task and wait for all of them.  In-flight cycles finish.
    pub async fn shutdown(self) -> NodeReport {
        // Every receiver may already be gone; that is fine.
        let _ = self.shutdown.send(true);

        let ingest = self.ingest.await.unwrap_or_else(|e| {
            error!(error = %e, "ingestion task failed");
            IngestStats::default()
        });
        let mut publishers = Vec::with_capacity(self.publishers.len());
        for task in self.publishers {
            publishers.push(task.await.unwrap_or_else(|e| {
                error!(error = %e, "map publisher task failed");
                PublisherStats::default()
            }));
        }
        if let Err(e) = self.tf_listener.await {
            error!(error = %e, "transform listener task failed");
        }
        info!(processed = ingest.processed, skipped = ingest.skipped, "bridge node stopped");
        NodeReport { ingest, publishers }
    }
}
