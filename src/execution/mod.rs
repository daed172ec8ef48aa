//! Workflow Execution Module
//!
//! Plans workflow hierarchies and hands their jobs to an execution
//! collaborator.
//!
//! # Architecture
//!
//! - [`binding`]: Catalog resolution and job binding
//! - [`service`]: The execution collaborator interface and its implementations
//! - [`engine`]: Recursive planner/submission driver
//! - [`report`]: Level and run reports

pub mod binding;
pub mod engine;
pub mod report;
pub mod service;

pub use binding::{bind_job, resolve_job, BoundFile, InputSource, JobBinding, JobResolution, StagingTransfer};
pub use engine::Planner;
pub use report::{JobReport, LevelReport, RunReport};
pub use service::{DryRunService, ExecutionService, JobHandle, SharedFsService};
