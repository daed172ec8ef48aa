//! Planning Errors
//!
//! Every failure the planner can report, grouped by when it is detected:
//!
//! - **Build-time** (structural, abort the whole level before submission):
//!   [`PlanError::CycleDetected`], [`PlanError::AmbiguousProducer`],
//!   [`PlanError::DuplicateCatalogEntry`], [`PlanError::OutputMapConflict`],
//!   [`PlanError::DuplicateJobId`], [`PlanError::UndeclaredArgumentFile`],
//!   [`PlanError::InvalidDocument`]
//! - **Resolution-time** (collected per job, reported in batch):
//!   [`PlanError::UnresolvedReplica`], [`PlanError::UnresolvedTransformation`]
//! - **Runtime** (scoped to the failing job's dependent subgraph):
//!   [`PlanError::SubmissionFailed`], [`PlanError::NestedPlanningFailed`],
//!   [`PlanError::UpstreamFailed`], [`PlanError::Cancelled`]

use std::fmt;

use serde::{Serialize, Serializer};

/// Position of a level (or job) in the workflow hierarchy, e.g.
/// `root > subwf1 > k3-job`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct HierarchyPath(Vec<String>);

impl HierarchyPath {
    /// Path of a top-level workflow.
    pub fn root(name: impl Into<String>) -> Self {
        Self(vec![name.into()])
    }

    /// Returns a new path with `segment` appended.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for HierarchyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" > "))
    }
}

impl Serialize for HierarchyPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Errors raised by the execution collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("job exited with failure: {0}")]
    JobFailed(String),

    #[error("transfer of '{path}' from '{from}' to '{to}' failed: {reason}")]
    Transfer {
        path: String,
        from: String,
        to: String,
        reason: String,
    },

    #[error("unknown job handle: {0}")]
    UnknownHandle(u64),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ExecutionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Planner error taxonomy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("CycleDetected: jobs {jobs:?} form a dependency cycle")]
    CycleDetected { jobs: Vec<String> },

    #[error("AmbiguousProducer: '{lfn}' is produced by both '{first}' and '{second}'")]
    AmbiguousProducer {
        lfn: String,
        first: String,
        second: String,
    },

    #[error("UnresolvedReplica: job '{job}' input '{lfn}' has no replica (site '{site}')")]
    UnresolvedReplica {
        job: String,
        lfn: String,
        site: String,
    },

    #[error("UnresolvedTransformation: job '{job}' needs '{transformation}' on site '{site}'")]
    UnresolvedTransformation {
        job: String,
        transformation: String,
        site: String,
    },

    #[error("DuplicateCatalogEntry: {catalog} already has '{name}' for site '{site}'")]
    DuplicateCatalogEntry {
        catalog: &'static str,
        name: String,
        site: String,
    },

    #[error("OutputMapConflict: '{lfn}' is mapped more than once at one level")]
    OutputMapConflict { lfn: String },

    #[error("DuplicateJobId: '{0}' appears more than once")]
    DuplicateJobId(String),

    #[error("UndeclaredArgumentFile: job '{job}' passes '{lfn}' without declaring it as input or output")]
    UndeclaredArgumentFile { job: String, lfn: String },

    #[error("InvalidDocument: {0}")]
    InvalidDocument(String),

    #[error("SubmissionFailed: job '{job}' at {path}: {source}")]
    SubmissionFailed {
        job: String,
        path: HierarchyPath,
        #[source]
        source: ExecutionError,
    },

    #[error("NestedPlanningFailed: {path} ({} failure(s))", .failures.len())]
    NestedPlanningFailed {
        path: HierarchyPath,
        failures: Vec<PlanError>,
    },

    #[error("UpstreamFailed: job '{job}' depends on failed job '{upstream}'")]
    UpstreamFailed { job: String, upstream: String },

    #[error("Cancelled")]
    Cancelled,
}

impl PlanError {
    /// Structural errors abort the whole level before anything is submitted.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::CycleDetected { .. }
                | Self::AmbiguousProducer { .. }
                | Self::DuplicateCatalogEntry { .. }
                | Self::OutputMapConflict { .. }
                | Self::DuplicateJobId(_)
                | Self::UndeclaredArgumentFile { .. }
                | Self::InvalidDocument(_)
        )
    }

    /// Id of the job the error is about, if any.
    pub fn job(&self) -> Option<&str> {
        match self {
            Self::UnresolvedReplica { job, .. }
            | Self::UnresolvedTransformation { job, .. }
            | Self::UndeclaredArgumentFile { job, .. }
            | Self::SubmissionFailed { job, .. }
            | Self::UpstreamFailed { job, .. } => Some(job),
            _ => None,
        }
    }

    /// Short kind name, used in failure chains.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CycleDetected { .. } => "CycleDetected",
            Self::AmbiguousProducer { .. } => "AmbiguousProducer",
            Self::UnresolvedReplica { .. } => "UnresolvedReplica",
            Self::UnresolvedTransformation { .. } => "UnresolvedTransformation",
            Self::DuplicateCatalogEntry { .. } => "DuplicateCatalogEntry",
            Self::OutputMapConflict { .. } => "OutputMapConflict",
            Self::DuplicateJobId(_) => "DuplicateJobId",
            Self::UndeclaredArgumentFile { .. } => "UndeclaredArgumentFile",
            Self::InvalidDocument(_) => "InvalidDocument",
            Self::SubmissionFailed { .. } => "SubmissionFailed",
            Self::NestedPlanningFailed { .. } => "NestedPlanningFailed",
            Self::UpstreamFailed { .. } => "UpstreamFailed",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl Serialize for PlanError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T, E = PlanError> = std::result::Result<T, E>;
