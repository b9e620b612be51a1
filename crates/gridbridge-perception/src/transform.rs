//! Time-indexed transform buffer.
//!
//! Keeps a graph of named frames whose edges carry either a fixed (static)
//! transform or a short, time-ordered history of samples.  A lookup walks the
//! graph breadth-first from the target frame to the source frame, following
//! edges in either direction (inverting when walking child → parent), and
//! evaluates each edge at the requested stamp by interpolating between the
//! two surrounding samples.
//!
//! Lookups that cannot be answered *yet* (the frame is unknown, or the stamp
//! is newer than the latest sample) block on a condition variable until new
//! data arrives or the caller's timeout elapses.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use chrono::Utc;
//! use gridbridge_perception::transform::{TfBuffer, TransformResolver};
//! use gridbridge_types::{Quaternion, StampedTransform, Transform3D, Vec3};
//!
//! let tf = TfBuffer::new();
//! tf.set_static_transform(&StampedTransform::new(
//!     Utc::now(),
//!     "base_link",
//!     "laser",
//!     Transform3D::new(Vec3::new(0.2, 0.0, 0.1), Quaternion::identity()),
//! ));
//!
//! let t = tf
//!     .resolve("base_link", "laser", Utc::now(), Duration::from_millis(10))
//!     .unwrap();
//! assert!((t.translation.x - 0.2).abs() < 1e-5);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use gridbridge_types::{BridgeError, StampedTransform, Transform3D};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

/// How far back in time each dynamic edge keeps samples.
pub const DEFAULT_CACHE_SECONDS: i64 = 10;

// ────────────────────────────────────────────────────────────────────────────
// Resolver seam
// ────────────────────────────────────────────────────────────────────────────

/// Anything that can answer "where is `source_frame` in `target_frame` at
/// `stamp`", waiting at most `timeout` for the answer to become available.
///
/// The returned transform is `T_target_source`: it maps points expressed in
/// `source_frame` into `target_frame`.
pub trait TransformResolver: Send + Sync {
    fn resolve(
        &self,
        target_frame: &str,
        source_frame: &str,
        stamp: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Transform3D, BridgeError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Edge storage
// ────────────────────────────────────────────────────────────────────────────

enum Lookup {
    Found(Transform3D),
    /// Might succeed once more data arrives.
    Pending(String),
    /// Can never succeed for this stamp.
    Failed(String),
}

#[derive(Default)]
struct EdgeHistory {
    fixed: Option<Transform3D>,
    samples: VecDeque<(DateTime<Utc>, Transform3D)>,
}

impl EdgeHistory {
    fn insert(&mut self, stamp: DateTime<Utc>, tf: Transform3D, cache: TimeDelta) {
        let pos = self.samples.partition_point(|(t, _)| *t <= stamp);
        if pos > 0 && self.samples[pos - 1].0 == stamp {
            self.samples[pos - 1].1 = tf;
        } else {
            self.samples.insert(pos, (stamp, tf));
        }
        if let Some(&(newest, _)) = self.samples.back() {
            let horizon = newest - cache;
            while self.samples.front().is_some_and(|(t, _)| *t < horizon) {
                self.samples.pop_front();
            }
        }
    }

    fn at(&self, stamp: DateTime<Utc>) -> Lookup {
        if let Some(tf) = self.fixed {
            return Lookup::Found(tf);
        }
        let (Some(&(oldest, _)), Some(&(newest, newest_tf))) =
            (self.samples.front(), self.samples.back())
        else {
            return Lookup::Pending("no samples yet".to_string());
        };
        if stamp > newest {
            return Lookup::Pending(format!("latest sample at {newest} is older than {stamp}"));
        }
        if stamp == newest {
            return Lookup::Found(newest_tf);
        }
        if stamp < oldest {
            return Lookup::Failed(format!("{stamp} predates retained history starting at {oldest}"));
        }

        let after = self.samples.partition_point(|(t, _)| *t <= stamp);
        let (t0, tf0) = self.samples[after - 1];
        if t0 == stamp {
            return Lookup::Found(tf0);
        }
        let (t1, tf1) = self.samples[after];
        let span = (t1 - t0).num_nanoseconds().unwrap_or(i64::MAX) as f64;
        let offset = (stamp - t0).num_nanoseconds().unwrap_or(0) as f64;
        let ratio = if span > 0.0 { (offset / span) as f32 } else { 0.0 };
        Lookup::Found(tf0.interpolate(tf1, ratio))
    }
}

#[derive(Default)]
struct FrameGraph {
    /// Keyed by (parent, child).
    edges: HashMap<(String, String), EdgeHistory>,
    /// Undirected adjacency used for path search.
    neighbours: HashMap<String, HashSet<String>>,
}

impl FrameGraph {
    fn edge_mut(&mut self, parent: &str, child: &str) -> &mut EdgeHistory {
        self.neighbours
            .entry(parent.to_string())
            .or_default()
            .insert(child.to_string());
        self.neighbours
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string());
        self.edges
            .entry((parent.to_string(), child.to_string()))
            .or_default()
    }

    /// Transform of the hop `from → to` expressed as `T_from_to`.
    fn hop(&self, from: &str, to: &str, stamp: DateTime<Utc>) -> Lookup {
        if let Some(edge) = self.edges.get(&(from.to_string(), to.to_string())) {
            return edge.at(stamp);
        }
        match self.edges.get(&(to.to_string(), from.to_string())) {
            Some(edge) => match edge.at(stamp) {
                Lookup::Found(tf) => Lookup::Found(tf.inverse()),
                other => other,
            },
            None => Lookup::Failed(format!("no edge between {from} and {to}")),
        }
    }

    fn path(&self, target: &str, source: &str) -> Option<Vec<String>> {
        let mut queue = VecDeque::from([target.to_string()]);
        let mut came_from: HashMap<String, String> = HashMap::new();
        let mut visited = HashSet::from([target.to_string()]);

        while let Some(current) = queue.pop_front() {
            if current == source {
                let mut path = vec![current];
                while let Some(prev) = came_from.get(path.last()?) {
                    path.push(prev.clone());
                }
                path.reverse();
                return Some(path);
            }
            for next in self.neighbours.get(&current).into_iter().flatten() {
                if visited.insert(next.clone()) {
                    came_from.insert(next.clone(), current.clone());
                    queue.push_back(next.clone());
                }
            }
        }
        None
    }

    fn lookup(&self, target: &str, source: &str, stamp: DateTime<Utc>) -> Lookup {
        if target == source {
            return Lookup::Found(Transform3D::identity());
        }
        let Some(path) = self.path(target, source) else {
            return Lookup::Pending(format!("frames {target} and {source} are not connected"));
        };
        let mut accumulated = Transform3D::identity();
        for pair in path.windows(2) {
            match self.hop(&pair[0], &pair[1], stamp) {
                Lookup::Found(tf) => accumulated = accumulated.compose(tf),
                other => return other,
            }
        }
        Lookup::Found(accumulated)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TfBuffer
// ────────────────────────────────────────────────────────────────────────────

/// Thread-safe transform buffer shared between the transform listener (which
/// feeds it) and scan ingestion (which queries it).
pub struct TfBuffer {
    graph: Mutex<FrameGraph>,
    updated: Condvar,
    cache: TimeDelta,
}

impl TfBuffer {
    pub fn new() -> Self {
        Self::with_cache_duration(TimeDelta::seconds(DEFAULT_CACHE_SECONDS))
    }

    pub fn with_cache_duration(cache: TimeDelta) -> Self {
        Self {
            graph: Mutex::new(FrameGraph::default()),
            updated: Condvar::new(),
            cache,
        }
    }

    /// Record one sample of a time-varying edge and wake any waiting lookup.
    pub fn set_transform(&self, msg: &StampedTransform) {
        trace!(parent = %msg.header.frame_id, child = %msg.child_frame_id, "tf sample");
        let cache = self.cache;
        self.graph
            .lock()
            .edge_mut(&msg.header.frame_id, &msg.child_frame_id)
            .insert(msg.header.stamp, msg.transform, cache);
        self.updated.notify_all();
    }

    /// Record a fixed edge, valid at every stamp.
    pub fn set_static_transform(&self, msg: &StampedTransform) {
        debug!(parent = %msg.header.frame_id, child = %msg.child_frame_id, "static tf");
        self.graph
            .lock()
            .edge_mut(&msg.header.frame_id, &msg.child_frame_id)
            .fixed = Some(msg.transform);
        self.updated.notify_all();
    }

    /// Non-blocking check.
    pub fn can_transform(&self, target_frame: &str, source_frame: &str, stamp: DateTime<Utc>) -> bool {
        matches!(
            self.graph.lock().lookup(target_frame, source_frame, stamp),
            Lookup::Found(_)
        )
    }

    /// Every frame name seen so far, sorted.
    pub fn frames(&self) -> Vec<String> {
        let mut frames: Vec<String> = self.graph.lock().neighbours.keys().cloned().collect();
        frames.sort();
        frames
    }
}

impl Default for TfBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformResolver for TfBuffer {
    fn resolve(
        &self,
        target_frame: &str,
        source_frame: &str,
        stamp: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Transform3D, BridgeError> {
        let started = Instant::now();
        // `None` when the timeout lies beyond the clock's range.
        let deadline = started.checked_add(timeout);
        let mut graph = self.graph.lock();
        let mut expired = false;

        loop {
            match graph.lookup(target_frame, source_frame, stamp) {
                Lookup::Found(tf) => return Ok(tf),
                Lookup::Failed(reason) => {
                    return Err(BridgeError::TransformUnavailable {
                        target: target_frame.to_string(),
                        source_frame: source_frame.to_string(),
                        reason,
                    });
                }
                Lookup::Pending(reason) if expired => {
                    trace!(target_frame, source_frame, %reason, "transform wait expired");
                    return Err(BridgeError::TransformTimeout {
                        target: target_frame.to_string(),
                        source_frame: source_frame.to_string(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Lookup::Pending(_) => match deadline {
                    Some(deadline) => {
                        expired = Instant::now() >= deadline
                            || self.updated.wait_until(&mut graph, deadline).timed_out();
                    }
                    None => self.updated.wait(&mut graph),
                },
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use gridbridge_types::{Quaternion, Vec3};
    use std::f32::consts::FRAC_PI_2;
    use std::sync::Arc;
    use std::thread;

    fn shift_x(x: f32) -> Transform3D {
        Transform3D::new(Vec3::new(x, 0.0, 0.0), Quaternion::identity())
    }

    fn short() -> Duration {
        Duration::from_millis(20)
    }

    #[test]
    fn same_frame_is_identity_even_when_unknown() {
        let tf = TfBuffer::new();
        let t = tf.resolve("map", "map", Utc::now(), short()).unwrap();
        assert_eq!(t, Transform3D::identity());
    }

    #[test]
    fn static_edge_resolves_at_any_stamp() {
        let tf = TfBuffer::new();
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        tf.set_static_transform(&StampedTransform::new(epoch, "base_link", "laser", shift_x(0.3)));
        let t = tf.resolve("base_link", "laser", Utc::now(), short()).unwrap();
        assert!((t.translation.x - 0.3).abs() < 1e-5);
    }

    #[test]
    fn reverse_traversal_inverts_edge() {
        let tf = TfBuffer::new();
        let now = Utc::now();
        tf.set_static_transform(&StampedTransform::new(
            now,
            "base_link",
            "laser",
            Transform3D::new(Vec3::new(1.0, 0.0, 0.0), Quaternion::from_yaw(FRAC_PI_2)),
        ));
        let forward = tf.resolve("base_link", "laser", now, short()).unwrap();
        let back = tf.resolve("laser", "base_link", now, short()).unwrap();
        let round = forward.compose(back);
        assert!(round.translation.x.abs() < 1e-5);
        assert!(round.rotation.yaw().abs() < 1e-5);
        // base origin seen from the laser: one metre "behind" a 90° turn.
        assert!((back.translation.y - 1.0).abs() < 1e-5);
    }

    #[test]
    fn chain_through_shared_parent() {
        // odom → base_link → laser, looked up as odom ← laser and laser ← odom.
        let tf = TfBuffer::new();
        let now = Utc::now();
        tf.set_transform(&StampedTransform::new(now, "odom", "base_link", shift_x(2.0)));
        tf.set_static_transform(&StampedTransform::new(now, "base_link", "laser", shift_x(0.5)));

        let t = tf.resolve("odom", "laser", now, short()).unwrap();
        assert!((t.translation.x - 2.5).abs() < 1e-5);
        let inv = tf.resolve("laser", "odom", now, short()).unwrap();
        assert!((inv.translation.x + 2.5).abs() < 1e-5);
        assert_eq!(tf.frames(), vec!["base_link", "laser", "odom"]);
    }

    #[test]
    fn dynamic_edge_interpolates_between_samples() {
        let tf = TfBuffer::new();
        let t0 = Utc::now();
        let t1 = t0 + TimeDelta::milliseconds(100);
        tf.set_transform(&StampedTransform::new(t0, "odom", "base_link", shift_x(0.0)));
        tf.set_transform(&StampedTransform::new(
            t1,
            "odom",
            "base_link",
            Transform3D::new(Vec3::new(1.0, 0.0, 0.0), Quaternion::from_yaw(FRAC_PI_2)),
        ));

        let mid = tf
            .resolve("odom", "base_link", t0 + TimeDelta::milliseconds(50), short())
            .unwrap();
        assert!((mid.translation.x - 0.5).abs() < 1e-4);
        assert!((mid.rotation.yaw() - FRAC_PI_2 / 2.0).abs() < 1e-4);

        let exact = tf.resolve("odom", "base_link", t1, short()).unwrap();
        assert!((exact.translation.x - 1.0).abs() < 1e-5);
    }

    #[test]
    fn out_of_order_samples_are_sorted() {
        let tf = TfBuffer::new();
        let t0 = Utc::now();
        let t1 = t0 + TimeDelta::milliseconds(100);
        tf.set_transform(&StampedTransform::new(t1, "odom", "base_link", shift_x(1.0)));
        tf.set_transform(&StampedTransform::new(t0, "odom", "base_link", shift_x(0.0)));
        let q = tf
            .resolve("odom", "base_link", t0 + TimeDelta::milliseconds(25), short())
            .unwrap();
        assert!((q.translation.x - 0.25).abs() < 1e-4);
    }

    #[test]
    fn unknown_frame_times_out() {
        let tf = TfBuffer::new();
        let started = Instant::now();
        let err = tf
            .resolve("base_link", "laser", Utc::now(), Duration::from_millis(50))
            .unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(50));
        match err {
            BridgeError::TransformTimeout {
                target,
                source_frame,
                waited_ms,
            } => {
                assert_eq!(target, "base_link");
                assert_eq!(source_frame, "laser");
                assert!(waited_ms >= 50);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn stamp_newer_than_latest_sample_times_out() {
        let tf = TfBuffer::new();
        let now = Utc::now();
        tf.set_transform(&StampedTransform::new(now, "odom", "base_link", shift_x(1.0)));
        assert!(!tf.can_transform("odom", "base_link", now + TimeDelta::seconds(1)));
        let err = tf
            .resolve("odom", "base_link", now + TimeDelta::seconds(1), short())
            .unwrap_err();
        assert!(matches!(err, BridgeError::TransformTimeout { .. }));
    }

    #[test]
    fn wait_returns_once_sample_arrives() {
        let tf = Arc::new(TfBuffer::new());
        let stamp = Utc::now();
        let writer = {
            let tf = Arc::clone(&tf);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                tf.set_transform(&StampedTransform::new(stamp, "odom", "base_link", shift_x(4.0)));
            })
        };
        let t = tf
            .resolve("odom", "base_link", stamp, Duration::from_secs(2))
            .unwrap();
        assert!((t.translation.x - 4.0).abs() < 1e-5);
        writer.join().unwrap();
    }

    #[test]
    fn unbounded_timeout_waits_for_sample() {
        let tf = Arc::new(TfBuffer::new());
        let stamp = Utc::now();
        let writer = {
            let tf = Arc::clone(&tf);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                tf.set_static_transform(&StampedTransform::new(stamp, "base_link", "laser", shift_x(0.2)));
            })
        };
        let t = tf.resolve("base_link", "laser", stamp, Duration::MAX).unwrap();
        assert!((t.translation.x - 0.2).abs() < 1e-5);
        writer.join().unwrap();
    }

    #[test]
    fn stamp_older_than_history_fails_immediately() {
        let tf = TfBuffer::with_cache_duration(TimeDelta::seconds(1));
        let t0 = Utc::now();
        tf.set_transform(&StampedTransform::new(t0, "odom", "base_link", shift_x(0.0)));
        tf.set_transform(&StampedTransform::new(
            t0 + TimeDelta::seconds(5),
            "odom",
            "base_link",
            shift_x(1.0),
        ));

        let started = Instant::now();
        let err = tf
            .resolve("odom", "base_link", t0, Duration::from_secs(5))
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(err, BridgeError::TransformUnavailable { .. }));
    }
}
