//! `servostack-perception` – sensor inputs of the visual-servo loop.
//!
//! # Modules
//!
//! - [`feed`] – [`PerceptionFeed`][feed::PerceptionFeed]: centroid, range and
//!   camera-intrinsics channels, consumed one sample at a time through a
//!   [`PerceptionReceiver`][feed::PerceptionReceiver].
//! - [`transform`] – [`TfEngine`][transform::TfEngine] and the shared
//!   [`TfBuffer`][transform::TfBuffer]: a graph of named reference frames
//!   implementing [`FrameTransformProvider`][transform::FrameTransformProvider].

pub mod feed;
pub mod transform;

pub use feed::{PerceptionFeed, PerceptionReceiver, PerceptionSample};
pub use transform::{FrameTransformProvider, TfBuffer, TfEngine, Transform3D};
