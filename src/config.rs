//! Planner Configuration
//!
//! [`PlannerConfig`] holds the run-wide settings; [`LevelSettings`] is what a
//! single hierarchy level is planned with, derived from its parent's settings
//! and the planner options of the sub-workflow job that spawned it.

use std::env;
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;

use crate::workflow::PlannerOptions;

/// Default site for execution and storage.
pub const DEFAULT_SITE: &str = "local";

/// Directory (under the working directory) holding run reports.
pub const REPORT_DIR: &str = ".hierflow";

/// Run-wide planner settings.
#[derive(Debug, Clone, Serialize)]
pub struct PlannerConfig {
    /// Site jobs run on unless they or their sub-workflow options say otherwise
    pub execution_site: String,
    /// Site the top level's outputs land on by default
    pub storage_site: String,
    /// Directory default output locations are placed under
    pub storage_root: PathBuf,
    /// Maximum jobs in flight per level
    pub max_parallel: usize,
    pub dry_run: bool,
    pub run_id: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            execution_site: DEFAULT_SITE.to_string(),
            storage_site: DEFAULT_SITE.to_string(),
            storage_root: cwd.join("output"),
            max_parallel: num_cpus::get(),
            dry_run: false,
            run_id: format!("hierflow-{}", Utc::now().timestamp()),
        }
    }
}

impl PlannerConfig {
    pub fn with_execution_site(mut self, site: impl Into<String>) -> Self {
        self.execution_site = site.into();
        self
    }

    pub fn with_storage_site(mut self, site: impl Into<String>) -> Self {
        self.storage_site = site.into();
        self
    }

    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = root.into();
        self
    }

    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Settings one level is planned with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelSettings {
    pub execution_site: String,
    pub storage_site: String,
    pub storage_root: PathBuf,
    pub verbosity: u8,
    pub max_parallel: usize,
    /// Planner arguments handed down by the parent
    pub planner_args: Vec<String>,
}

impl LevelSettings {
    pub fn root(config: &PlannerConfig) -> Self {
        Self {
            execution_site: config.execution_site.clone(),
            storage_site: config.storage_site.clone(),
            storage_root: config.storage_root.clone(),
            verbosity: 0,
            max_parallel: config.max_parallel.max(1),
            planner_args: Vec::new(),
        }
    }

    /// Settings for a nested level spawned with `options`.
    ///
    /// The first output site becomes the nested storage site; everything the
    /// options leave unset is inherited.
    pub fn child(&self, options: &PlannerOptions) -> Self {
        Self {
            execution_site: options
                .execution_site
                .clone()
                .unwrap_or_else(|| self.execution_site.clone()),
            storage_site: options
                .output_sites
                .first()
                .cloned()
                .unwrap_or_else(|| self.storage_site.clone()),
            storage_root: self.storage_root.clone(),
            verbosity: options.verbosity,
            max_parallel: self.max_parallel,
            planner_args: options.args.clone(),
        }
    }

    /// Whether per-job resolution details are logged at info level.
    pub fn is_verbose(&self) -> bool {
        self.verbosity >= 2
    }
}
