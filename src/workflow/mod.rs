//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating one level of a workflow hierarchy.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (File, Job, SubWorkflowJob, Workflow)
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Build-time job checks
//! - [`graph`]: Dependency inference and ordering
//! - [`state`]: Level phases and job status

pub mod graph;
pub mod model;
pub mod parser;
pub mod state;
pub mod validator;

pub use graph::DependencyGraph;
pub use model::{Arg, File, Job, JobNode, PlannerOptions, SubWorkflowJob, Workflow, WorkflowRef};
pub use parser::{load_workflow, parse_workflow, save_workflow};
pub use state::{JobStatus, LevelPhase, LevelState};
pub use validator::validate_workflow;
