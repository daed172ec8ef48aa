//! Workflow Parser
//!
//! Loads and saves workflow documents (one YAML document per level).
//! Dependencies are never stored in a document; they are inferred from file
//! names when the level is planned.

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::Workflow;
use crate::error::{PlanError, Result};

/// Parses a workflow document from YAML text.
pub fn parse_workflow(yaml_content: &str) -> Result<Workflow> {
    let mut workflow: Workflow = serde_yaml::from_str(yaml_content).map_err(|e| {
        PlanError::InvalidDocument(format!(
            "Failed to parse workflow YAML: {}. Check the file format.",
            e
        ))
    })?;

    workflow.assign_missing_ids();

    info!(
        "Parsed workflow '{}': {} jobs, {} replicas, {} transformations",
        workflow.name,
        workflow.jobs.len(),
        workflow.replica_catalog.len(),
        workflow.transformation_catalog.len()
    );
    Ok(workflow)
}

/// Loads a workflow from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use hierflow::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("root.yml")?;
///     println!("Loaded {} jobs", workflow.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        PlanError::InvalidDocument(format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        ))
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    parse_workflow(&yaml_content)
}

/// Saves a workflow to a YAML file.
pub fn save_workflow(workflow: &Workflow, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let yaml_content = serde_yaml::to_string(workflow)
        .map_err(|e| PlanError::InvalidDocument(format!("Failed to serialize workflow: {}", e)))?;
    fs::write(path, yaml_content).map_err(|e| {
        PlanError::InvalidDocument(format!(
            "Failed to write workflow file '{}': {}",
            path.display(),
            e
        ))
    })?;
    info!("Workflow saved to: {}", path.display());
    Ok(())
}
