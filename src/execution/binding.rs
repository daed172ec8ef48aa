//! Job Binding
//!
//! Resolution happens in two steps:
//!
//! 1. [`resolve_job`] runs while a level is planned. Each required input is
//!    either pending (produced by another job of the same level) or bound to
//!    a replica, preferring one on the job's site. The transformation is
//!    bound in place or staged in. Every failure of a job is collected.
//! 2. [`bind_job`] runs when the job is dispatched, after all of its
//!    producers completed. Pending inputs are taken from the level's
//!    registry of produced artifacts, outputs from the level's output map,
//!    and the argument list is rendered with physical paths.

use std::collections::HashMap;

use log::{debug, log, Level};
use serde::Serialize;

use crate::catalog::{OutputMap, ReplicaCatalog, ResolvedTransformation, Staging, TransformationCatalog};
use crate::error::{HierarchyPath, PlanError, Result};
use crate::workflow::{Arg, DependencyGraph, Job, JobNode};

/// A logical file bound to a physical location.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BoundFile {
    pub lfn: String,
    pub pfn: String,
    pub site: String,
}

impl BoundFile {
    pub fn new(lfn: impl Into<String>, pfn: impl Into<String>, site: impl Into<String>) -> Self {
        Self {
            lfn: lfn.into(),
            pfn: pfn.into(),
            site: site.into(),
        }
    }
}

/// A copy between sites the driver performs around a job.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StagingTransfer {
    /// Logical name (or transformation name) being moved
    pub name: String,
    pub path: String,
    pub from_site: String,
    pub to_site: String,
}

/// Where a required input comes from.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    Replica(BoundFile),
    /// Produced by `producer` in the same level; bound once it completes
    Pending { producer: String },
}

/// Planning-time resolution of one job.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct JobResolution {
    pub job_id: String,
    pub site: String,
    pub inputs: Vec<(String, InputSource)>,
    /// `None` for sub-workflow jobs
    pub transformation: Option<ResolvedTransformation>,
}

impl JobResolution {
    pub fn source(&self, lfn: &str) -> Option<&InputSource> {
        self.inputs.iter().find(|(name, _)| name == lfn).map(|(_, s)| s)
    }

    /// Physical location of a required input, given what the level has
    /// produced so far.
    pub fn locate(&self, lfn: &str, produced: &HashMap<String, BoundFile>) -> Option<BoundFile> {
        match self.source(lfn)? {
            InputSource::Replica(file) => Some(file.clone()),
            InputSource::Pending { .. } => produced.get(lfn).cloned(),
        }
    }

    pub fn pending_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().filter_map(|(lfn, source)| match source {
            InputSource::Pending { .. } => Some(lfn.as_str()),
            InputSource::Replica(_) => None,
        })
    }
}

/// Resolves every required input and the transformation of `node` for a
/// run on `site`.
///
/// All failures of the job are returned together.
pub fn resolve_job(
    node: &JobNode,
    site: &str,
    graph: &DependencyGraph,
    replicas: &ReplicaCatalog,
    transformations: &TransformationCatalog,
    verbose: bool,
) -> std::result::Result<JobResolution, Vec<PlanError>> {
    let level = if verbose { Level::Info } else { Level::Debug };
    let mut errors = Vec::new();
    let mut inputs = Vec::new();

    for file in node.required_inputs() {
        let lfn = file.lfn();

        if let Some(producer) = graph.producer_of(lfn) {
            log!(level, "Job '{}': input '{}' pending on '{}'", node.id(), lfn, producer);
            inputs.push((
                lfn.to_string(),
                InputSource::Pending {
                    producer: producer.to_string(),
                },
            ));
            continue;
        }

        match replicas.resolve(lfn, site) {
            Some(entry) => {
                log!(
                    level,
                    "Job '{}': input '{}' -> {} ({})",
                    node.id(),
                    lfn,
                    entry.pfn,
                    entry.site
                );
                inputs.push((
                    lfn.to_string(),
                    InputSource::Replica(BoundFile::new(lfn, &entry.pfn, &entry.site)),
                ));
            }
            None => errors.push(PlanError::UnresolvedReplica {
                job: node.id().to_string(),
                lfn: lfn.to_string(),
                site: site.to_string(),
            }),
        }
    }

    let transformation = match node {
        JobNode::Job(job) => match transformations.resolve(&job.transformation, site) {
            Some(resolved) => {
                log!(
                    level,
                    "Job '{}': transformation '{}' -> {} ({:?})",
                    job.id,
                    resolved.name,
                    resolved.pfn,
                    resolved.staging
                );
                Some(resolved)
            }
            None => {
                errors.push(PlanError::UnresolvedTransformation {
                    job: job.id.clone(),
                    transformation: job.transformation.clone(),
                    site: site.to_string(),
                });
                None
            }
        },
        JobNode::SubWorkflow(_) => None,
    };

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(JobResolution {
        job_id: node.id().to_string(),
        site: site.to_string(),
        inputs,
        transformation,
    })
}

/// A job ready for the execution collaborator.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct JobBinding {
    pub job_id: String,
    /// Hierarchy path of the job itself
    pub path: HierarchyPath,
    pub site: String,
    pub transformation: ResolvedTransformation,
    /// Rendered arguments, file references replaced by physical paths
    pub arguments: Vec<String>,
    pub inputs: Vec<BoundFile>,
    pub outputs: Vec<BoundFile>,
    pub stage_in: Vec<StagingTransfer>,
    pub stage_out: Vec<StagingTransfer>,
}

impl JobBinding {
    pub fn executable(&self) -> &str {
        &self.transformation.pfn
    }

    /// Executable followed by the rendered arguments.
    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.executable().to_string())
            .chain(self.arguments.iter().cloned())
            .collect()
    }
}

/// Binds a plain job for dispatch.
pub fn bind_job(
    job: &Job,
    resolution: &JobResolution,
    produced: &HashMap<String, BoundFile>,
    output_map: &OutputMap,
    path: &HierarchyPath,
) -> Result<JobBinding> {
    let site = resolution.site.clone();
    let transformation = resolution.transformation.clone().ok_or_else(|| {
        PlanError::UnresolvedTransformation {
            job: job.id.clone(),
            transformation: job.transformation.clone(),
            site: site.clone(),
        }
    })?;

    let mut stage_in = Vec::new();
    if let Staging::StageIn { from_site } = &transformation.staging {
        stage_in.push(StagingTransfer {
            name: transformation.name.clone(),
            path: transformation.pfn.clone(),
            from_site: from_site.clone(),
            to_site: site.clone(),
        });
    }

    let mut inputs = Vec::with_capacity(job.inputs.len());
    for file in &job.inputs {
        let bound = resolution
            .locate(file.lfn(), produced)
            .ok_or_else(|| PlanError::UnresolvedReplica {
                job: job.id.clone(),
                lfn: file.lfn().to_string(),
                site: site.clone(),
            })?;
        if bound.site != site {
            stage_in.push(StagingTransfer {
                name: bound.lfn.clone(),
                path: bound.pfn.clone(),
                from_site: bound.site.clone(),
                to_site: site.clone(),
            });
        }
        inputs.push(bound);
    }

    let mut outputs = Vec::with_capacity(job.outputs.len());
    let mut stage_out = Vec::new();
    for file in &job.outputs {
        let target = output_map.get(file.lfn()).ok_or_else(|| {
            PlanError::InvalidDocument(format!(
                "No output location for '{}' of job '{}'",
                file,
                job.id
            ))
        })?;
        if target.site != site {
            stage_out.push(StagingTransfer {
                name: file.lfn().to_string(),
                path: target.pfn.clone(),
                from_site: site.clone(),
                to_site: target.site.clone(),
            });
        }
        outputs.push(BoundFile::new(file.lfn(), &target.pfn, &target.site));
    }

    let arguments = job
        .args
        .iter()
        .map(|arg| match arg {
            Arg::Literal(text) => text.clone(),
            Arg::File(file) => inputs
                .iter()
                .chain(&outputs)
                .find(|b| b.lfn == file.lfn())
                .map(|b| b.pfn.clone())
                .unwrap_or_else(|| file.lfn().to_string()),
        })
        .collect();

    debug!(
        "Bound job '{}' on '{}': {} stage-in, {} stage-out",
        job.id,
        site,
        stage_in.len(),
        stage_out.len()
    );

    Ok(JobBinding {
        job_id: job.id.clone(),
        path: path.clone(),
        site,
        transformation,
        arguments,
        inputs,
        outputs,
        stage_in,
        stage_out,
    })
}
