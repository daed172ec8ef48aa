//! Planning Reports
//!
//! A [`LevelReport`] is produced for every level the driver planned, nested
//! inside the report of the sub-workflow job that spawned it. Failures are
//! kept where they happened, so the top-level report can print each one
//! with its full path, e.g. `root > subwf1 > k3-job: UnresolvedReplica`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;

use super::binding::JobBinding;
use crate::catalog::OutputMap;
use crate::config::LevelSettings;
use crate::error::{HierarchyPath, PlanError, Result};
use crate::workflow::{JobStatus, LevelPhase};

/// Outcome of one job of a level.
#[derive(Serialize, Debug, Clone)]
pub struct JobReport {
    pub id: String,
    pub path: HierarchyPath,
    pub sub_workflow: bool,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PlanError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding: Option<JobBinding>,
    /// Report of the nested level, for sub-workflow jobs that started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nested: Option<Box<LevelReport>>,
}

impl JobReport {
    pub(crate) fn pending(id: &str, path: HierarchyPath, sub_workflow: bool) -> Self {
        Self {
            id: id.to_string(),
            path,
            sub_workflow,
            status: JobStatus::Pending,
            error: None,
            binding: None,
            nested: None,
        }
    }
}

/// Outcome of one planned level.
#[derive(Serialize, Debug, Clone)]
pub struct LevelReport {
    pub name: String,
    pub path: HierarchyPath,
    pub phase: LevelPhase,
    pub phases: Vec<LevelPhase>,
    pub settings: LevelSettings,
    /// Structural and resolution errors of the level
    pub errors: Vec<PlanError>,
    pub output_map: OutputMap,
    pub jobs: Vec<JobReport>,
}

impl LevelReport {
    pub fn is_success(&self) -> bool {
        self.phase == LevelPhase::Completed
    }

    pub fn job(&self, id: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// The nested level spawned by sub-workflow job `id`.
    pub fn nested(&self, id: &str) -> Option<&LevelReport> {
        self.job(id).and_then(|j| j.nested.as_deref())
    }

    /// Follows a chain of sub-workflow job ids down the hierarchy.
    pub fn find_level(&self, ids: &[&str]) -> Option<&LevelReport> {
        match ids.split_first() {
            None => Some(self),
            Some((first, rest)) => self.nested(first)?.find_level(rest),
        }
    }

    /// The failures of this level, each nested failure still wrapped.
    pub fn failures(&self) -> Vec<PlanError> {
        let mut failures = self.errors.clone();
        for job in &self.jobs {
            if let Some(error) = &job.error {
                if !failures.contains(error) {
                    failures.push(error.clone());
                }
            }
        }
        failures
    }

    /// One line per root-cause failure across the hierarchy.
    ///
    /// A failed sub-workflow job is expanded into its nested level's chains
    /// instead of being listed itself.
    pub fn failure_chains(&self) -> Vec<String> {
        let mut chains: Vec<String> = self
            .errors
            .iter()
            .filter(|e| !self.jobs.iter().any(|j| j.error.as_ref() == Some(*e)))
            .map(|e| match e.job().and_then(|id| self.job(id)) {
                Some(job) => format!("{}: {}", job.path, e),
                None => format!("{}: {}", self.path, e),
            })
            .collect();

        for job in &self.jobs {
            match (&job.nested, &job.error) {
                (Some(nested), Some(PlanError::NestedPlanningFailed { .. })) => {
                    chains.extend(nested.failure_chains());
                }
                (_, Some(error)) => chains.push(format!("{}: {}", job.path, error)),
                _ => {}
            }
        }
        chains
    }

    /// Every job report in the hierarchy, depth first.
    pub fn all_jobs(&self) -> Vec<&JobReport> {
        let mut jobs = Vec::new();
        for job in &self.jobs {
            jobs.push(job);
            if let Some(nested) = &job.nested {
                jobs.extend(nested.all_jobs());
            }
        }
        jobs
    }

    /// Paths of every job that ended with `status`, across the hierarchy.
    pub fn jobs_with_status(&self, status: JobStatus) -> Vec<String> {
        self.all_jobs()
            .into_iter()
            .filter(|j| j.status == status)
            .map(|j| j.path.to_string())
            .collect()
    }
}

/// Result of a whole planning run.
#[derive(Serialize, Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub root: LevelReport,
    /// Job durations in milliseconds, keyed by job path
    pub durations_ms: BTreeMap<String, u128>,
}

impl RunReport {
    /// True only when every job at every level completed.
    pub fn is_success(&self) -> bool {
        self.root.is_success()
    }

    pub fn failed_jobs(&self) -> Vec<String> {
        self.root.jobs_with_status(JobStatus::Failed)
    }

    pub fn cancelled_jobs(&self) -> Vec<String> {
        self.root.jobs_with_status(JobStatus::Cancelled)
    }

    pub fn failure_chains(&self) -> Vec<String> {
        self.root.failure_chains()
    }

    /// Writes the report as pretty JSON to `<dir>/<run id>.json`.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| {
            PlanError::InvalidDocument(format!(
                "Failed to create report directory '{}': {}",
                dir.display(),
                e
            ))
        })?;

        let path = dir.join(format!("{}.json", self.run_id));
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PlanError::InvalidDocument(format!("Failed to serialize report: {}", e)))?;
        fs::write(&path, json).map_err(|e| {
            PlanError::InvalidDocument(format!(
                "Failed to write report '{}': {}",
                path.display(),
                e
            ))
        })?;

        info!("Run report saved to: {}", path.display());
        Ok(path)
    }
}
