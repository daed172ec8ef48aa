//! Execution Collaborator
//!
//! The planner never runs jobs itself. It hands bound jobs to an
//! [`ExecutionService`], awaits their completion and asks it to move files
//! between sites.
//!
//! Two services ship with the crate:
//!
//! - [`DryRunService`]: prints each binding and reports it completed
//! - [`SharedFsService`]: runs executables locally; all sites share one
//!   filesystem, so transfers only prepare directories

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::{debug, error, info};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::binding::JobBinding;
use crate::error::ExecutionError;
use crate::workflow::JobStatus;

/// Opaque id of a submitted job.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(pub u64);

/// External system that runs jobs and moves files between sites.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    /// Accepts a bound job for execution.
    async fn submit(&self, binding: &JobBinding) -> Result<JobHandle, ExecutionError>;

    /// Waits until the job finishes; returns `Completed` or `Failed`.
    async fn wait(&self, handle: JobHandle) -> Result<JobStatus, ExecutionError>;

    /// Copies `path` from `from_site` to `to_site`.
    async fn transfer(&self, path: &str, from_site: &str, to_site: &str)
        -> Result<(), ExecutionError>;
}

/// Prints jobs instead of running them.
#[derive(Debug, Default)]
pub struct DryRunService {
    next_handle: AtomicU64,
}

impl DryRunService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionService for DryRunService {
    async fn submit(&self, binding: &JobBinding) -> Result<JobHandle, ExecutionError> {
        let handle = JobHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);

        println!();
        println!("[DRY RUN] Job: {}", binding.path);
        println!("  Site: {}", binding.site);
        println!("  Command: {}", binding.command_line().join(" "));
        for input in &binding.inputs {
            println!("  Input: {} -> {} ({})", input.lfn, input.pfn, input.site);
        }
        for output in &binding.outputs {
            println!("  Output: {} -> {} ({})", output.lfn, output.pfn, output.site);
        }

        Ok(handle)
    }

    async fn wait(&self, handle: JobHandle) -> Result<JobStatus, ExecutionError> {
        debug!("[DRY RUN] Handle {} completed", handle.0);
        Ok(JobStatus::Completed)
    }

    async fn transfer(
        &self,
        path: &str,
        from_site: &str,
        to_site: &str,
    ) -> Result<(), ExecutionError> {
        println!("[DRY RUN] Transfer: {} ({} -> {})", path, from_site, to_site);
        Ok(())
    }
}

/// Runs executables as local processes.
#[derive(Debug)]
pub struct SharedFsService {
    working_dir: Option<PathBuf>,
    next_handle: AtomicU64,
    running: Mutex<HashMap<u64, (String, Child)>>,
}

impl SharedFsService {
    pub fn new() -> Self {
        Self {
            working_dir: None,
            next_handle: AtomicU64::new(0),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Runs jobs in `dir` instead of the current directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn full_path(&self, path: &str) -> PathBuf {
        match &self.working_dir {
            Some(dir) => dir.join(path),
            None => PathBuf::from(path),
        }
    }

    fn ensure_parent(&self, path: &Path) -> Result<(), ExecutionError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                debug!("Created directory: {}", parent.display());
            }
        }
        Ok(())
    }
}

impl Default for SharedFsService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionService for SharedFsService {
    async fn submit(&self, binding: &JobBinding) -> Result<JobHandle, ExecutionError> {
        for output in &binding.outputs {
            self.ensure_parent(&self.full_path(&output.pfn))?;
        }

        let mut cmd = Command::new(binding.executable());
        cmd.args(&binding.arguments)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| {
            ExecutionError::Rejected(format!("cannot start '{}': {}", binding.executable(), e))
        })?;

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        info!("Started job '{}' (handle {})", binding.path, id);
        self.running
            .lock()
            .await
            .insert(id, (binding.path.to_string(), child));
        Ok(JobHandle(id))
    }

    async fn wait(&self, handle: JobHandle) -> Result<JobStatus, ExecutionError> {
        let (name, child) = self
            .running
            .lock()
            .await
            .remove(&handle.0)
            .ok_or(ExecutionError::UnknownHandle(handle.0))?;

        let output = child.wait_with_output().await?;
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if !stdout.trim().is_empty() {
                debug!("Job '{}' output:\n{}", name, stdout);
            }
            return Ok(JobStatus::Completed);
        }

        error!(
            "Job '{}' failed with exit code: {:?}",
            name,
            output.status.code()
        );
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            error!("stderr:\n{}", stderr);
        }
        Ok(JobStatus::Failed)
    }

    async fn transfer(
        &self,
        path: &str,
        from_site: &str,
        to_site: &str,
    ) -> Result<(), ExecutionError> {
        debug!("Transfer {} ({} -> {}) on shared filesystem", path, from_site, to_site);
        self.ensure_parent(&self.full_path(path))
            .map_err(|e| ExecutionError::Transfer {
                path: path.to_string(),
                from: from_site.to_string(),
                to: to_site.to_string(),
                reason: e.to_string(),
            })
    }
}
