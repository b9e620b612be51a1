//! Periodic occupancy-grid publication for one resolution level.
//!
//! Each cycle compares the level's dirty version (lock-free) against the
//! version it last converted:
//!
//! | version | cached message | action |
//! |---|---|---|
//! | unchanged | yes | restamp and republish (heartbeat, no lock) |
//! | unchanged | no | nothing (no map before the first grid update) |
//! | changed | – | convert under the read lock, then publish |
//!
//! The publish call always happens after the read guard is dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gridbridge_mapping::{CellState, GridLevel};
use gridbridge_middleware::{EventBus, Topic};
use gridbridge_types::msgs::{CELL_FREE, CELL_OCCUPIED, CELL_UNKNOWN};
use gridbridge_types::{Event, EventPayload, Header, MapMetaData, OccupancyGrid};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Bus source name of the one-shot metadata message.
pub const MAP_METADATA_TOPIC: &str = "map_metadata";

/// `map` for level 0, `map_<level>` otherwise.
pub fn map_topic_name(level: usize) -> String {
    if level == 0 {
        "map".to_string()
    } else {
        format!("map_{level}")
    }
}

/// What a single [`MapPublisher::cycle`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The grid changed and was converted afresh.
    Converted(Arc<OccupancyGrid>),
    /// The previous message was restamped and sent again.
    Heartbeat(Arc<OccupancyGrid>),
    /// Nothing to publish yet.
    Skipped,
}

/// Counters reported when the publisher stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub conversions: u64,
    pub heartbeats: u64,
}

pub struct MapPublisher {
    level: usize,
    grid: GridLevel,
    bus: EventBus,
    frame_id: String,
    topic: String,
    map_load_time: DateTime<Utc>,
    last_version: u64,
    cached: Option<Arc<OccupancyGrid>>,
    stats: PublisherStats,
}

impl MapPublisher {
    pub fn new(level: usize, grid: GridLevel, bus: EventBus, frame_id: impl Into<String>) -> Self {
        Self {
            level,
            grid,
            bus,
            frame_id: frame_id.into(),
            topic: map_topic_name(level),
            map_load_time: Utc::now(),
            last_version: 0,
            cached: None,
            stats: PublisherStats::default(),
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn stats(&self) -> PublisherStats {
        self.stats
    }

    /// Geometry of this level as advertised to consumers.
    pub fn metadata(&self) -> MapMetaData {
        let grid = self.grid.read();
        MapMetaData {
            map_load_time: self.map_load_time,
            resolution: grid.cell_length(),
            width: grid.width() as u32,
            height: grid.height() as u32,
            origin: grid.published_origin(),
        }
    }

    /// Publish [`Self::metadata`] once on the latched metadata topic.
    pub fn publish_metadata(&self) -> MapMetaData {
        let info = self.metadata();
        self.bus.publish_to(
            Topic::MapMetadata,
            Event::new(MAP_METADATA_TOPIC, EventPayload::MapMetadata(info.clone())),
        );
        info
    }

    /// Run one publication cycle stamped `now`.
    pub fn cycle(&mut self, now: DateTime<Utc>) -> CycleOutcome {
        if self.grid.version() == self.last_version {
            let Some(cached) = self.cached.as_ref() else {
                return CycleOutcome::Skipped;
            };
            let msg = Arc::new(OccupancyGrid {
                header: Header::new(now, cached.header.frame_id.clone()),
                info: cached.info.clone(),
                data: Arc::clone(&cached.data),
            });
            self.cached = Some(Arc::clone(&msg));
            self.stats.heartbeats += 1;
            self.send(Arc::clone(&msg));
            return CycleOutcome::Heartbeat(msg);
        }

        let (data, info, version) = {
            let grid = self.grid.read();
            let mut data = vec![CELL_UNKNOWN; grid.len()];
            for (i, cell) in data.iter_mut().enumerate() {
                match grid.state_at(i) {
                    CellState::Free => *cell = CELL_FREE,
                    CellState::Occupied => *cell = CELL_OCCUPIED,
                    CellState::Unknown => {}
                }
            }
            let info = MapMetaData {
                map_load_time: self.map_load_time,
                resolution: grid.cell_length(),
                width: grid.width() as u32,
                height: grid.height() as u32,
                origin: grid.published_origin(),
            };
            (data, info, self.grid.version())
        };

        self.last_version = version;
        let msg = Arc::new(OccupancyGrid {
            header: Header::new(now, self.frame_id.clone()),
            info,
            data: data.into(),
        });
        self.cached = Some(Arc::clone(&msg));
        self.stats.conversions += 1;
        debug!(level = self.level, version, "map converted");
        self.send(Arc::clone(&msg));
        CycleOutcome::Converted(msg)
    }

    fn send(&self, grid: Arc<OccupancyGrid>) {
        self.bus.publish_to(
            Topic::Map,
            Event::new(
                self.topic.clone(),
                EventPayload::Map {
                    level: self.level,
                    grid,
                },
            ),
        );
    }

    /// Cycle every `period` until `shutdown` turns `true` (or its sender is
    /// dropped).  A started cycle always completes.
    pub async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) -> PublisherStats {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(level = self.level, topic = %self.topic, period_ms = period.as_millis() as u64, "map publisher started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.cycle(Utc::now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(
            level = self.level,
            conversions = self.stats.conversions,
            heartbeats = self.stats.heartbeats,
            "map publisher stopped"
        );
        self.stats
    }
}
