//! End-to-end: transforms and scans in on the bus, pose and maps out.

use std::time::Duration;

use chrono::Utc;
use gridbridge_middleware::{EventBus, Topic, TopicReceiver};
use gridbridge_runtime::{BridgeNode, NodeConfig, node_bus};
use gridbridge_types::msgs::{CELL_FREE, CELL_OCCUPIED};
use gridbridge_types::{Event, EventPayload, Header, RangeScan, StampedTransform, Transform3D};

fn small_config() -> NodeConfig {
    NodeConfig {
        map_size: 128,
        map_multi_res_levels: 2,
        map_pub_levels: 2,
        map_pub_period: 0.05,
        pub_map_scanmatch_transform: true,
        ..NodeConfig::default()
    }
}

/// Scan from the centre of a 4 m square room.
fn room_scan() -> RangeScan {
    let rays = 360;
    let increment = std::f32::consts::TAU / rays as f32;
    let angle_min = -std::f32::consts::PI;
    let ranges = (0..rays)
        .map(|i| {
            let a = angle_min + i as f32 * increment;
            2.0 / a.cos().abs().max(a.sin().abs())
        })
        .collect();
    RangeScan {
        header: Header::new(Utc::now(), "laser"),
        angle_min,
        angle_max: angle_min + increment * (rays - 1) as f32,
        angle_increment: increment,
        range_min: 0.1,
        range_max: 10.0,
        ranges,
    }
}

fn mount_laser(bus: &EventBus) {
    bus.publish_to(
        Topic::TfStatic,
        Event::new(
            "tf_static",
            EventPayload::Transform(StampedTransform::new(
                Utc::now(),
                "base_link",
                "laser",
                Transform3D::identity(),
            )),
        ),
    );
}

async fn next(rx: &mut TopicReceiver) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event within timeout")
        .expect("bus open")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scans_produce_pose_and_maps() {
    let config = small_config();
    let bus = node_bus(&config);
    let mut pose_rx = bus.subscribe_to(Topic::Pose);
    let mut map_rx = bus.subscribe_to(Topic::Map);
    let mut tf_rx = bus.subscribe_to(Topic::Tf);

    let handle = BridgeNode::new(config, bus.clone()).unwrap().start();
    mount_laser(&bus);

    bus.publish_to(Topic::Scan, Event::new("laser_scan", EventPayload::Scan(room_scan())));
    let EventPayload::Pose(pose) = next(&mut pose_rx).await.payload else {
        panic!("expected pose");
    };
    assert_eq!(pose.header.frame_id, "map");
    assert!(pose.pose.x.abs() < 0.1 && pose.pose.y.abs() < 0.1, "{:?}", pose.pose);

    let EventPayload::Transform(scanmatch) = next(&mut tf_rx).await.payload else {
        panic!("expected transform");
    };
    assert_eq!(scanmatch.child_frame_id, "scanmatcher_frame");

    // A second scan from the same spot is matched, not mapped.
    bus.publish_to(Topic::Scan, Event::new("laser_scan", EventPayload::Scan(room_scan())));
    next(&mut pose_rx).await;

    let mut seen_levels = [false; 2];
    while !seen_levels.iter().all(|s| *s) {
        let event = next(&mut map_rx).await;
        let EventPayload::Map { level, grid } = event.payload else {
            panic!("expected map");
        };
        seen_levels[level] = true;
        assert_eq!(event.source, if level == 0 { "map" } else { "map_1" });
        assert_eq!(grid.info.width as usize, 128 >> level);
        assert!(grid.data.contains(&CELL_FREE));
        assert!(grid.data.contains(&CELL_OCCUPIED));
    }

    let metadata = bus.latched(Topic::MapMetadata, "map_metadata").expect("latched metadata");
    match metadata.payload {
        EventPayload::MapMetadata(info) => {
            assert_eq!((info.width, info.height), (128, 128));
            assert!((info.resolution - 0.05).abs() < 1e-6);
        }
        other => panic!("unexpected payload {other:?}"),
    }

    assert_eq!(handle.grid_level(0).expect("level 0").version(), 1);

    let report = handle.shutdown().await;
    assert_eq!(report.ingest.processed, 2);
    assert_eq!(report.ingest.skipped, 0);
    assert_eq!(report.publishers.len(), 2);
    assert!(report.publishers.iter().all(|p| p.conversions == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unmounted_sensor_is_skipped() {
    let config = NodeConfig {
        transform_timeout: 0.05,
        ..small_config()
    };
    let bus = node_bus(&config);
    let mut pose_rx = bus.subscribe_to(Topic::Pose);
    let handle = BridgeNode::new(config, bus.clone()).unwrap().start();

    bus.publish_to(Topic::Scan, Event::new("laser_scan", EventPayload::Scan(room_scan())));
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(pose_rx.try_recv().is_err());

    let report = handle.shutdown().await;
    assert_eq!(report.ingest.processed, 0);
    assert_eq!(report.ingest.skipped, 1);
    assert!(report.publishers.iter().all(|p| p.conversions == 0 && p.heartbeats == 0));
}

#[test]
fn invalid_config_is_rejected() {
    let config = NodeConfig {
        update_factor_free: 0.7,
        ..NodeConfig::default()
    };
    let bus = node_bus(&config);
    assert!(BridgeNode::new(config, bus).is_err());
}
