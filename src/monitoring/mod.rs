//! Monitoring Module
//!
//! - [`ExecutionTimeline`]: per-step scheduler events and the lane chart
//!   printed after a run

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
