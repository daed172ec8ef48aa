//! Hierflow - Hierarchical Workflow Planner
//!
//! Plans and submits scientific workflows made of jobs whose dependencies
//! are inferred from the files they read and write. A job may itself be a
//! whole nested workflow, planned recursively with its own catalogs and
//! output locations.
//!
//! # Architecture
//!
//! - [`workflow`]: Workflow model, YAML documents, dependency inference
//! - [`catalog`]: Replica, transformation and output-map catalogs
//! - [`execution`]: Job binding, the execution collaborator and the planner
//! - [`monitoring`]: Job event timeline
//! - [`config`]: Planner settings
//! - [`error`]: Planning error taxonomy
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hierflow::catalog::{ReplicaCatalog, Transformation, TransformationCatalog};
//! use hierflow::config::PlannerConfig;
//! use hierflow::execution::{DryRunService, Planner};
//! use hierflow::workflow::{File, Job, Workflow};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let input = File::new("input.txt");
//!     let k1 = File::new("k1.txt");
//!
//!     let mut workflow = Workflow::new("root");
//!     workflow.add_job(
//!         Job::new("keg")
//!             .args(["-i".into(), (&input).into(), "-o".into(), (&k1).into()])
//!             .input(input)
//!             .output(k1),
//!     )?;
//!
//!     let mut replicas = ReplicaCatalog::new();
//!     replicas.add_replica("input.txt", "local", "/data/input.txt")?;
//!     let transformations = TransformationCatalog::from_entries(vec![Transformation::new(
//!         "keg",
//!         "local",
//!         "/usr/bin/pegasus-keg",
//!         true,
//!     )])?;
//!
//!     let planner = Planner::new(PlannerConfig::default(), Arc::new(DryRunService::new()))
//!         .with_replicas(replicas)
//!         .with_transformations(transformations);
//!     let report = planner.run(workflow).await;
//!     assert!(report.is_success());
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use config::PlannerConfig;
pub use error::{HierarchyPath, PlanError};
pub use execution::{Planner, RunReport};
pub use workflow::model::{File, Job, SubWorkflowJob, Workflow};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Hierflow";
