//! Pose, odometry and frame-correction output for each processed scan.
//!
//! The message builders are pure functions; [`PosePublisher`] wires them to
//! the bus according to the node's publication flags.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gridbridge_middleware::{EventBus, Topic};
use gridbridge_perception::TransformResolver;
use gridbridge_types::msgs::Covariance6;
use gridbridge_types::{
    Covariance3, Event, EventPayload, Header, Odometry, Pose2D, PoseWithCovarianceStamped,
    StampedTransform, Transform3D,
};
use tracing::{error, trace};

use crate::config::NodeConfig;

/// Bus source name of the pose stream.
pub const POSE_TOPIC: &str = "slam_out_pose";
/// Bus source name of the odometry stream.
pub const ODOM_TOPIC: &str = "odom";
/// Bus source name of transforms produced by the node.
pub const TF_SOURCE: &str = "gridbridge";

/// Indices of x, y and yaw inside a 6×6 (x, y, z, roll, pitch, yaw) covariance.
const PLANAR_AXES: [usize; 3] = [0, 1, 5];

/// Build the pose message for one scan.  The 3×3 planar covariance lands on
/// the x/y/yaw rows and columns; every other entry is zero.
pub fn emit_pose(
    pose: Pose2D,
    covariance: Covariance3,
    stamp: DateTime<Utc>,
    frame: &str,
) -> PoseWithCovarianceStamped {
    let mut full: Covariance6 = [[0.0; 6]; 6];
    for (r, &i) in PLANAR_AXES.iter().enumerate() {
        for (c, &j) in PLANAR_AXES.iter().enumerate() {
            full[i][j] = f64::from(covariance[r][c]);
        }
    }
    PoseWithCovarianceStamped {
        header: Header::new(stamp, frame),
        pose,
        covariance: full,
    }
}

/// Odometry view of `pose_msg` with `child_frame` as the moving frame.
pub fn emit_odometry(pose_msg: &PoseWithCovarianceStamped, child_frame: &str) -> Odometry {
    Odometry {
        header: pose_msg.header.clone(),
        child_frame_id: child_frame.to_string(),
        pose: pose_msg.pose,
        covariance: pose_msg.covariance,
    }
}

/// `map → odom` correction: `pose_tf ∘ odom_to_base⁻¹`, identity when the
/// odometry transform could not be resolved.
pub fn compose_map_to_odom(pose_tf: Transform3D, odom_to_base: Option<Transform3D>) -> Transform3D {
    match odom_to_base {
        Some(odom_to_base) => pose_tf.compose(odom_to_base.inverse()),
        None => pose_tf,
    }
}

/// Publishes everything derived from the engine's latest pose.
pub struct PosePublisher {
    bus: EventBus,
    config: Arc<NodeConfig>,
    resolver: Arc<dyn TransformResolver>,
}

impl PosePublisher {
    pub fn new(bus: EventBus, config: Arc<NodeConfig>, resolver: Arc<dyn TransformResolver>) -> Self {
        Self { bus, config, resolver }
    }

    /// Emit the pose (always), odometry and transforms (per flags) for a scan
    /// stamped `stamp`.  Returns the pose message.
    pub fn publish(
        &self,
        pose: Pose2D,
        covariance: Covariance3,
        stamp: DateTime<Utc>,
    ) -> PoseWithCovarianceStamped {
        let cfg = &self.config;
        let pose_msg = emit_pose(pose, covariance, stamp, &cfg.map_frame);
        self.bus
            .publish_to(Topic::Pose, Event::new(POSE_TOPIC, EventPayload::Pose(pose_msg.clone())));

        if cfg.pub_odometry {
            let odom = emit_odometry(&pose_msg, &cfg.base_frame);
            self.bus
                .publish_to(Topic::Odometry, Event::new(ODOM_TOPIC, EventPayload::Odometry(odom)));
        }

        let pose_tf = pose.to_transform();

        if cfg.pub_map_odom_transform {
            let odom_to_base = match self.resolver.resolve(
                &cfg.odom_frame,
                &cfg.base_frame,
                stamp,
                cfg.transform_wait(),
            ) {
                Ok(tf) => Some(tf),
                Err(e) => {
                    error!(error = %e, "transform failed while publishing map->odom; using identity");
                    None
                }
            };
            let map_to_odom = compose_map_to_odom(pose_tf, odom_to_base);
            self.send_transform(StampedTransform::new(
                stamp,
                cfg.map_frame.clone(),
                cfg.odom_frame.clone(),
                map_to_odom,
            ));
        }

        if cfg.pub_map_scanmatch_transform {
            self.send_transform(StampedTransform::new(
                stamp,
                cfg.map_frame.clone(),
                cfg.tf_map_scanmatch_transform_frame_name.clone(),
                pose_tf,
            ));
        }

        pose_msg
    }

    fn send_transform(&self, tf: StampedTransform) {
        trace!(parent = %tf.header.frame_id, child = %tf.child_frame_id, "sending transform");
        self.bus
            .publish_to(Topic::Tf, Event::new(TF_SOURCE, EventPayload::Transform(tf)));
    }
}
