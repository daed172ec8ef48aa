//! Workflow Validation
//!
//! Build-time checks on a single level, run before the dependency graph is
//! inferred:
//! - Job ids are present and unique
//! - Plain jobs name a transformation
//! - Every file passed as an argument is a declared input or output
//! - Sub-workflow options are well formed and inline sub-workflows produce
//!   every output they declare
//!
//! All problems are collected so one run reports them together.

use std::collections::HashSet;

use log::{debug, info, warn};

use super::model::{JobNode, Workflow, WorkflowRef};
use crate::error::PlanError;

/// Validates a single job's fields.
fn validate_job(job: &JobNode) -> Vec<PlanError> {
    let mut errors = Vec::new();

    if job.id().trim().is_empty() {
        errors.push(PlanError::InvalidDocument(
            "Job has empty or whitespace-only id".to_string(),
        ));
        return errors;
    }

    let declared: HashSet<&str> = job
        .inputs()
        .iter()
        .chain(job.outputs())
        .map(|f| f.lfn())
        .collect();

    for file in job.args().iter().filter_map(|a| a.as_file()) {
        if !declared.contains(file.lfn()) {
            errors.push(PlanError::UndeclaredArgumentFile {
                job: job.id().to_string(),
                lfn: file.lfn().to_string(),
            });
        }
    }

    match job {
        JobNode::Job(plain) => {
            if plain.transformation.trim().is_empty() {
                errors.push(PlanError::InvalidDocument(format!(
                    "Job '{}' has no transformation specified",
                    plain.id
                )));
            }
        }
        JobNode::SubWorkflow(sub) => {
            if let WorkflowRef::File(lfn) = &sub.workflow {
                if lfn.trim().is_empty() {
                    errors.push(PlanError::InvalidDocument(format!(
                        "Sub-workflow job '{}' references no workflow document",
                        sub.id
                    )));
                }
            }
            if let Some(map_file) = &sub.options.output_map_file {
                if !sub.inputs.iter().any(|f| f.lfn() == map_file) {
                    errors.push(PlanError::InvalidDocument(format!(
                        "Sub-workflow job '{}': output map file '{}' is not a declared input",
                        sub.id, map_file
                    )));
                }
            }
            if let WorkflowRef::Inline(nested) = &sub.workflow {
                for file in sub.unproduced_outputs(nested) {
                    errors.push(PlanError::InvalidDocument(format!(
                        "Sub-workflow job '{}' declares output '{}' that '{}' never produces",
                        sub.id, file, nested.name
                    )));
                }
            }
            if sub.outputs.is_empty() {
                debug!(
                    "Sub-workflow job '{}' exposes no outputs to its parent",
                    sub.id
                );
            }
        }
    }

    if job.inputs().is_empty() && job.outputs().is_empty() {
        debug!("Job '{}' has no file dependencies", job.id());
    }

    errors
}

/// Validates one workflow level.
///
/// Returns every structural problem found; an empty list means the level
/// may proceed to graph construction. Nested inline workflows are validated
/// when their own level is planned.
pub fn validate_workflow(workflow: &Workflow) -> Vec<PlanError> {
    info!(
        "Validating workflow '{}' with {} jobs",
        workflow.name,
        workflow.jobs.len()
    );

    let mut errors = Vec::new();

    if workflow.name.trim().is_empty() {
        errors.push(PlanError::InvalidDocument(
            "Workflow has an empty name".to_string(),
        ));
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for job in &workflow.jobs {
        if !job.id().is_empty() && !seen_ids.insert(job.id()) {
            errors.push(PlanError::DuplicateJobId(job.id().to_string()));
        }
        errors.extend(validate_job(job));
    }

    if workflow.is_empty() {
        warn!("Workflow '{}' has no jobs", workflow.name);
    }

    errors
}
