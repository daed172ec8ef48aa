//! Monitoring Module
//!
//! Tracks job events during a planning run.
//!
//! - [`ExecutionTimeline`]: submit/finish timing for Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
