//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.  A subscriber that falls behind loses the oldest messages,
//! which is exactly the bounded-queue behaviour wanted for scan input.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Scan`] | Raw range scans from the sensor driver |
//! | [`Topic::Tf`] | Time-varying frame transforms (odometry, map corrections) |
//! | [`Topic::TfStatic`] | Fixed mounting transforms (sensor → base) |
//! | [`Topic::Pose`] | Scan-matched pose estimates |
//! | [`Topic::Odometry`] | Optional odometry view of the pose estimate |
//! | [`Topic::Map`] | Occupancy grids, one source name per resolution level |
//! | [`Topic::MapMetadata`] | Grid geometry, published once at startup |
//!
//! `Map` and `MapMetadata` are *latched*: the bus remembers the last event
//! per source so late joiners can fetch it with [`EventBus::latched`].

use std::collections::HashMap;
use std::sync::Arc;

use gridbridge_types::Event;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Enumeration of all routing topics on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Scan,
    Tf,
    TfStatic,
    Pose,
    Odometry,
    Map,
    MapMetadata,
}

impl Topic {
    fn is_latched(self) -> bool {
        matches!(self, Topic::Map | Topic::MapMetadata)
    }
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    scan: broadcast::Sender<Event>,
    tf: broadcast::Sender<Event>,
    tf_static: broadcast::Sender<Event>,
    pose: broadcast::Sender<Event>,
    odometry: broadcast::Sender<Event>,
    map: broadcast::Sender<Event>,
    map_metadata: broadcast::Sender<Event>,
    latched: Arc<Mutex<HashMap<(Topic, String), Event>>>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity on every topic.
    pub fn new(capacity: usize) -> Self {
        Self::with_scan_queue(capacity, capacity)
    }

    /// Create a bus whose scan topic buffers at most `scan_queue` scans per
    /// subscriber; all other topics use `capacity`.
    ///
    /// Both values are clamped to at least 1.
    pub fn with_scan_queue(capacity: usize, scan_queue: usize) -> Self {
        let capacity = capacity.max(1);
        let (scan, _) = broadcast::channel(scan_queue.max(1));
        let (tf, _) = broadcast::channel(capacity);
        let (tf_static, _) = broadcast::channel(capacity);
        let (pose, _) = broadcast::channel(capacity);
        let (odometry, _) = broadcast::channel(capacity);
        let (map, _) = broadcast::channel(capacity);
        let (map_metadata, _) = broadcast::channel(capacity);
        Self {
            scan,
            tf,
            tf_static,
            pose,
            odometry,
            map,
            map_metadata,
            latched: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event.
    /// Zero receivers is a normal condition, not an error.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        if topic.is_latched() {
            self.latched
                .lock()
                .insert((topic, event.source.clone()), event.clone());
        }
        match self.topic_sender(topic).send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                trace!(?topic, source = %event.source, "no subscribers");
                0
            }
        }
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Subscribe to `topic`, delivering only events whose `source` equals
    /// `name` (e.g. the configured scan topic).
    pub fn subscribe_named(&self, topic: Topic, name: impl Into<String>) -> TopicSubscriber {
        TopicSubscriber {
            name: name.into(),
            receiver: self.subscribe_to(topic),
        }
    }

    /// Last event published on a latched topic under `source`.
    pub fn latched(&self, topic: Topic, source: &str) -> Option<Event> {
        self.latched
            .lock()
            .get(&(topic, source.to_string()))
            .cloned()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Scan => &self.scan,
            Topic::Tf => &self.tf,
            Topic::TfStatic => &self.tf_static,
            Topic::Pose => &self.pose,
            Topic::Odometry => &self.odometry,
            Topic::Map => &self.map,
            Topic::MapMetadata => &self.map_metadata,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking poll.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

// ---------------------------------------------------------------------------
// Source-name subscriber
// ---------------------------------------------------------------------------

/// A subscriber that only delivers events whose `source` matches a name.
pub struct TopicSubscriber {
    name: String,
    receiver: TopicReceiver,
}

impl TopicSubscriber {
    /// Wait for the next event that matches this subscriber's name filter.
    ///
    /// Lag is logged and skipped.  Returns `None` when the bus is closed and
    /// no further events will arrive.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.source == self.name => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = %self.name, dropped = n, "subscriber lagged; oldest messages dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gridbridge_types::{EventPayload, Header, MapMetaData, Pose2D, RangeScan};

    fn scan_event(source: &str, first_range: f32) -> Event {
        Event::new(
            source,
            EventPayload::Scan(RangeScan {
                header: Header::new(Utc::now(), "laser"),
                angle_min: 0.0,
                angle_max: 0.1,
                angle_increment: 0.1,
                range_min: 0.1,
                range_max: 10.0,
                ranges: vec![first_range],
            }),
        )
    }

    fn metadata_event() -> Event {
        Event::new(
            "map_metadata",
            EventPayload::MapMetadata(MapMetaData {
                map_load_time: Utc::now(),
                resolution: 0.05,
                width: 4,
                height: 4,
                origin: Pose2D::zero(),
            }),
        )
    }

    #[tokio::test]
    async fn topic_multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut subscriber1 = bus.subscribe_to(Topic::Scan);
        let mut subscriber2 = bus.subscribe_to(Topic::Scan);

        let event = scan_event("laser_scan", 1.0);
        assert_eq!(bus.publish_to(Topic::Scan, event.clone()), 2);

        assert_eq!(subscriber1.recv().await?.id, event.id);
        assert_eq!(subscriber2.recv().await?.id, event.id);
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.publish_to(Topic::Pose, scan_event("slam_out_pose", 1.0)), 0);
    }

    #[tokio::test]
    async fn subscriber_does_not_receive_other_topic_events() {
        let bus = EventBus::default();
        let mut pose_sub = bus.subscribe_to(Topic::Pose);
        bus.publish_to(Topic::Scan, scan_event("laser_scan", 1.0));

        let result = tokio::time::timeout(std::time::Duration::from_millis(50), pose_sub.recv()).await;
        assert!(result.is_err(), "Pose subscriber must not receive a Scan event");
    }

    #[tokio::test]
    async fn named_subscriber_filters_by_source() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_named(Topic::Scan, "front_scan");

        bus.publish_to(Topic::Scan, scan_event("rear_scan", 1.0));
        let wanted = scan_event("front_scan", 2.0);
        bus.publish_to(Topic::Scan, wanted.clone());

        let got = sub.recv().await.expect("event");
        assert_eq!(got.id, wanted.id);
        assert_eq!(sub.name(), "front_scan");
    }

    #[tokio::test]
    async fn scan_queue_drops_oldest_for_slow_subscriber() {
        let bus = EventBus::with_scan_queue(64, 2);
        let mut slow = bus.subscribe_to(Topic::Scan);
        for i in 0..5 {
            bus.publish_to(Topic::Scan, scan_event("laser_scan", i as f32));
        }
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        // The two newest scans survive.
        let next = slow.recv().await.expect("queued scan");
        match next.payload {
            EventPayload::Scan(scan) => assert_eq!(scan.ranges[0], 3.0),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn named_subscriber_skips_lag() {
        let bus = EventBus::with_scan_queue(64, 1);
        let mut sub = bus.subscribe_named(Topic::Scan, "laser_scan");
        for i in 0..3 {
            bus.publish_to(Topic::Scan, scan_event("laser_scan", i as f32));
        }
        let got = sub.recv().await.expect("latest scan");
        match got.payload {
            EventPayload::Scan(scan) => assert_eq!(scan.ranges[0], 2.0),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn latched_topic_remembers_last_event() {
        let bus = EventBus::default();
        assert!(bus.latched(Topic::MapMetadata, "map_metadata").is_none());
        let event = metadata_event();
        bus.publish_to(Topic::MapMetadata, event.clone());
        let latched = bus.latched(Topic::MapMetadata, "map_metadata").expect("latched");
        assert_eq!(latched.id, event.id);
        // Non-latched topics keep nothing.
        bus.publish_to(Topic::Scan, scan_event("laser_scan", 1.0));
        assert!(bus.latched(Topic::Scan, "laser_scan").is_none());
    }
}
