//! `gridbridge-middleware` – in-process transport.
//!
//! Routes scans, transforms, pose estimates and maps between the bridge node
//! and its producers/consumers without caring about the data's meaning.
//!
//! # Modules
//!
//! - [`bus`] – Headless, typed, topic-based publish/subscribe event bus built
//!   on Tokio broadcast channels.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver, TopicSubscriber};
