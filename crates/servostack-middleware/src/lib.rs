//! `servostack-middleware` – scene traffic between the tracker, the stacking
//! runtime and the external collision-scene consumer.
//!
//! # Modules
//!
//! - [`bus`] – Typed, topic-based publish/subscribe [`SceneBus`] built on
//!   Tokio broadcast channels.

pub mod bus;

pub use bus::{SceneBus, SceneEvent, ScenePayload, Topic, TopicReceiver};
