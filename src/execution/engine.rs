//! Planner / Submission Driver
//!
//! Plans one workflow level at a time and recurses into sub-workflow jobs.
//! Every level moves through
//! `UNPLANNED -> GRAPH_BUILT -> CATALOGS_RESOLVED -> ORDERED -> SUBMITTED`
//! and ends `COMPLETED`, `FAILED` or `CANCELLED`:
//!
//! 1. Validate jobs, extend the inherited catalog views with the level's
//!    embedded entries, infer the dependency graph. Any structural error
//!    fails the level before anything is submitted.
//! 2. Resolve every job against the catalogs, collecting all failures.
//!    Jobs that resolved keep going.
//! 3. Compute the level's output map; a map supplied by the parent wins
//!    for the names it covers.
//! 4. Dispatch jobs whose producers all completed, up to `max_parallel` at
//!    a time. A sub-workflow job is one more in-flight node whose
//!    completion is the nested level's outcome.
//!
//! A failure only fails the jobs downstream of it. Cancellation stops new
//! dispatches and marks everything not yet completed as cancelled, nested
//! levels included.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use super::binding::{bind_job, resolve_job, BoundFile, JobBinding, JobResolution};
use super::report::{JobReport, LevelReport, RunReport};
use super::service::ExecutionService;
use crate::catalog::{
    OutputMap, OutputMapEntry, ReplicaCatalog, ReplicaEntry, Transformation, TransformationCatalog,
};
use crate::config::{LevelSettings, PlannerConfig};
use crate::error::{ExecutionError, HierarchyPath, PlanError, Result};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::workflow::{
    load_workflow, validate_workflow, DependencyGraph, Job, JobNode, JobStatus, LevelPhase,
    LevelState, SubWorkflowJob, Workflow, WorkflowRef,
};

/// Recursive workflow planner.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use hierflow::catalog::{ReplicaCatalog, TransformationCatalog};
/// use hierflow::config::PlannerConfig;
/// use hierflow::execution::{DryRunService, Planner};
/// use hierflow::workflow::load_workflow;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("root.yml")?;
///     let planner = Planner::new(PlannerConfig::default(), Arc::new(DryRunService::new()))
///         .with_replicas(ReplicaCatalog::load("replicas.yml")?)
///         .with_transformations(TransformationCatalog::load("transformations.yml")?);
///
///     let report = planner.run(workflow).await;
///     println!("success: {}", report.is_success());
///     Ok(())
/// }
/// ```
pub struct Planner {
    config: PlannerConfig,
    service: Arc<dyn ExecutionService>,
    replicas: Arc<ReplicaCatalog>,
    transformations: Arc<TransformationCatalog>,
    output_map: OutputMap,
    timeline: Mutex<ExecutionTimeline>,
    cancel: CancellationToken,
}

/// Everything one level is planned with.
struct LevelContext {
    workflow: Workflow,
    path: HierarchyPath,
    replicas: Arc<ReplicaCatalog>,
    transformations: Arc<TransformationCatalog>,
    /// Output locations supplied by the parent
    overrides: OutputMap,
    settings: LevelSettings,
    cancel: CancellationToken,
}

enum JobOutcome {
    /// Outputs registered at the level's output locations
    Completed(Vec<BoundFile>),
    Failed(PlanError),
    Cancelled,
}

struct Finished {
    index: usize,
    outcome: JobOutcome,
    nested: Option<LevelReport>,
}

/// Mutable bookkeeping of a level being planned.
struct LevelRun {
    name: String,
    path: HierarchyPath,
    state: LevelState,
    settings: LevelSettings,
    errors: Vec<PlanError>,
    output_map: OutputMap,
    jobs: Vec<JobReport>,
}

impl LevelRun {
    fn new(workflow: &Workflow, path: &HierarchyPath, settings: &LevelSettings) -> Self {
        let jobs = workflow
            .jobs
            .iter()
            .map(|job| JobReport::pending(job.id(), path.child(job.id()), job.is_sub_workflow()))
            .collect();
        Self {
            name: workflow.name.clone(),
            path: path.clone(),
            state: LevelState::new(),
            settings: settings.clone(),
            errors: Vec::new(),
            output_map: OutputMap::new(),
            jobs,
        }
    }

    fn advance(&mut self, phase: LevelPhase) {
        if self.state.advance(phase) {
            debug!("Level '{}' -> {:?}", self.path, phase);
        }
    }

    /// Fails `index` and every job downstream of it that has not run.
    fn fail_job(&mut self, graph: &DependencyGraph, index: usize, error: PlanError) {
        self.jobs[index].status = JobStatus::Failed;
        self.jobs[index].error = Some(error);

        let upstream = graph.id_at(index).to_string();
        let mut descendants: Vec<usize> = graph.descendants_of(index).into_iter().collect();
        descendants.sort_unstable();
        for d in descendants {
            let job = &mut self.jobs[d];
            if job.status == JobStatus::Pending {
                debug!("Job '{}' will not run: upstream '{}' failed", job.path, upstream);
                job.status = JobStatus::Failed;
                job.error = Some(PlanError::UpstreamFailed {
                    job: job.id.clone(),
                    upstream: upstream.clone(),
                });
            }
        }
    }

    fn status(&self, index: usize) -> JobStatus {
        self.jobs[index].status
    }

    fn finish(mut self, phase: LevelPhase) -> LevelReport {
        self.advance(phase);
        match self.state.phase() {
            LevelPhase::Completed => info!("Level '{}' completed", self.path),
            LevelPhase::Cancelled => warn!("Level '{}' cancelled", self.path),
            _ => error!("Level '{}' failed", self.path),
        }
        LevelReport {
            name: self.name,
            path: self.path,
            phase: self.state.phase(),
            phases: self.state.history().collect(),
            settings: self.settings,
            errors: self.errors,
            output_map: self.output_map,
            jobs: self.jobs,
        }
    }

    /// Ends a level that never reached submission.
    fn abort(mut self, errors: Vec<PlanError>) -> LevelReport {
        for error in &errors {
            error!("Level '{}': {}", self.path, error);
        }
        for job in &mut self.jobs {
            job.status = JobStatus::Failed;
        }
        self.errors.extend(errors);
        self.finish(LevelPhase::Failed)
    }

    fn cancel_all(mut self) -> LevelReport {
        for job in &mut self.jobs {
            job.status = JobStatus::Cancelled;
        }
        self.finish(LevelPhase::Cancelled)
    }
}

fn extend_replicas(
    parent: &Arc<ReplicaCatalog>,
    entries: &[ReplicaEntry],
) -> Result<Arc<ReplicaCatalog>> {
    if entries.is_empty() {
        return Ok(Arc::clone(parent));
    }
    let mut view = ReplicaCatalog::overlay(Arc::clone(parent));
    for entry in entries {
        view.add(entry.clone())?;
    }
    Ok(Arc::new(view))
}

fn extend_transformations(
    parent: &Arc<TransformationCatalog>,
    entries: &[Transformation],
) -> Result<Arc<TransformationCatalog>> {
    if entries.is_empty() {
        return Ok(Arc::clone(parent));
    }
    let mut view = TransformationCatalog::overlay(Arc::clone(parent));
    for entry in entries {
        view.add(entry.clone())?;
    }
    Ok(Arc::new(view))
}

fn push_unique(errors: &mut Vec<PlanError>, error: PlanError) {
    if !errors.contains(&error) {
        errors.push(error);
    }
}

impl Planner {
    /// Creates a planner with empty catalogs.
    pub fn new(config: PlannerConfig, service: Arc<dyn ExecutionService>) -> Self {
        Self {
            config,
            service,
            replicas: Arc::new(ReplicaCatalog::new()),
            transformations: Arc::new(TransformationCatalog::new()),
            output_map: OutputMap::new(),
            timeline: Mutex::new(ExecutionTimeline::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_replicas(mut self, catalog: ReplicaCatalog) -> Self {
        self.replicas = Arc::new(catalog);
        self
    }

    pub fn with_transformations(mut self, catalog: TransformationCatalog) -> Self {
        self.transformations = Arc::new(catalog);
        self
    }

    /// Output locations for the top level that take precedence over its
    /// own map.
    pub fn with_output_map(mut self, map: OutputMap) -> Self {
        self.output_map = map;
        self
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Token that cancels the run when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Snapshot of the job timeline so far.
    pub fn timeline(&self) -> ExecutionTimeline {
        self.timeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, path: &HierarchyPath, event: EventType) {
        self.timeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_event(path.to_string(), event);
    }

    /// Plans and runs `workflow` and every level nested in it.
    pub async fn run(&self, workflow: Workflow) -> RunReport {
        let started_at = Utc::now();
        info!(
            "Run '{}': planning '{}' (execution site: {}, max parallel: {})",
            self.config.run_id, workflow.name, self.config.execution_site, self.config.max_parallel
        );

        let ctx = LevelContext {
            path: HierarchyPath::root(&workflow.name),
            workflow,
            replicas: Arc::clone(&self.replicas),
            transformations: Arc::clone(&self.transformations),
            overrides: self.output_map.clone(),
            settings: LevelSettings::root(&self.config),
            cancel: self.cancel.child_token(),
        };
        let root = self.plan_level(ctx).await;

        RunReport {
            run_id: self.config.run_id.clone(),
            dry_run: self.config.dry_run,
            started_at,
            finished_at: Utc::now(),
            root,
            durations_ms: self.timeline().durations(),
        }
    }

    fn plan_level(&self, ctx: LevelContext) -> BoxFuture<'_, LevelReport> {
        async move { self.plan_level_inner(ctx).await }.boxed()
    }

    async fn plan_level_inner(&self, ctx: LevelContext) -> LevelReport {
        let LevelContext {
            workflow,
            path,
            replicas,
            transformations,
            overrides,
            settings,
            cancel,
        } = ctx;
        let mut run = LevelRun::new(&workflow, &path, &settings);

        info!("Planning level '{}' ({} jobs)", path, workflow.len());
        if !settings.planner_args.is_empty() {
            debug!("Level '{}' planner args: {:?}", path, settings.planner_args);
        }
        if cancel.is_cancelled() {
            return run.cancel_all();
        }

        // Build-time checks
        let mut structural = validate_workflow(&workflow);
        let replicas = extend_replicas(&replicas, &workflow.replica_catalog).unwrap_or_else(|e| {
            push_unique(&mut structural, e);
            Arc::clone(&replicas)
        });
        let transformations =
            extend_transformations(&transformations, &workflow.transformation_catalog).unwrap_or_else(|e| {
                push_unique(&mut structural, e);
                Arc::clone(&transformations)
            });
        let explicit = OutputMap::from_records(&workflow.output_map).unwrap_or_else(|e| {
            push_unique(&mut structural, e);
            OutputMap::new()
        });
        let graph = match DependencyGraph::build(&workflow) {
            Ok(graph) if structural.is_empty() => graph,
            Ok(_) => return run.abort(structural),
            Err(e) => {
                push_unique(&mut structural, e);
                return run.abort(structural);
            }
        };
        run.advance(LevelPhase::GraphBuilt);

        // Resolution, all failures collected
        let mut resolutions: Vec<Option<JobResolution>> = vec![None; workflow.len()];
        let mut unresolved = Vec::new();
        for &i in graph.order_indices() {
            let node = &workflow.jobs[i];
            let site = job_site(node, &settings);
            match resolve_job(node, &site, &graph, &replicas, &transformations, settings.is_verbose()) {
                Ok(resolution) => resolutions[i] = Some(resolution),
                Err(errors) => {
                    for error in &errors {
                        warn!("Level '{}': {}", path, error);
                    }
                    unresolved.push((i, errors[0].clone()));
                    run.errors.extend(errors);
                }
            }
        }
        run.advance(LevelPhase::CatalogsResolved);

        let own_map = OutputMap::build(
            workflow.declared_outputs(),
            &explicit,
            &settings.storage_root,
            &settings.storage_site,
        );
        let output_map = OutputMap::layered(&overrides, &own_map);
        run.output_map = output_map.clone();
        debug!("Level '{}' dispatch order: {:?}", path, graph.topological_order());
        run.advance(LevelPhase::Ordered);

        run.advance(LevelPhase::Submitted);
        for (i, error) in unresolved {
            run.fail_job(&graph, i, error);
        }

        let mut produced: HashMap<String, BoundFile> = HashMap::new();
        let mut in_flight: FuturesUnordered<BoxFuture<'_, Finished>> = FuturesUnordered::new();

        loop {
            if !cancel.is_cancelled() {
                for &i in graph.order_indices() {
                    if in_flight.len() >= settings.max_parallel {
                        break;
                    }
                    if run.status(i) != JobStatus::Pending
                        || !graph
                            .upstream_of(i)
                            .iter()
                            .all(|&u| run.status(u) == JobStatus::Completed)
                    {
                        continue;
                    }
                    let Some(resolution) = resolutions[i].take() else {
                        continue;
                    };

                    let job_path = run.jobs[i].path.clone();
                    let dispatched = match &workflow.jobs[i] {
                        JobNode::Job(job) => self
                            .dispatch_job(i, job, &resolution, &produced, &output_map, &job_path, &cancel)
                            .map(|(binding, future)| {
                                run.jobs[i].binding = Some(binding);
                                future
                            }),
                        JobNode::SubWorkflow(sub) => self.dispatch_sub_workflow(
                            i,
                            sub,
                            &resolution,
                            &produced,
                            SubWorkflowScope {
                                replicas: &replicas,
                                transformations: &transformations,
                                settings: &settings,
                                output_map: &output_map,
                                path: &job_path,
                                cancel: &cancel,
                            },
                        ),
                    };

                    match dispatched {
                        Ok(future) => {
                            self.record(&job_path, EventType::Submitted);
                            run.jobs[i].status = JobStatus::Running;
                            in_flight.push(future);
                        }
                        Err(e) => {
                            error!("Job '{}' could not be dispatched: {}", job_path, e);
                            run.fail_job(&graph, i, e);
                        }
                    }
                }
            }

            let Some(Finished {
                index,
                outcome,
                nested,
            }) = in_flight.next().await
            else {
                break;
            };

            run.jobs[index].nested = nested.map(Box::new);
            let job_path = run.jobs[index].path.clone();
            match outcome {
                JobOutcome::Completed(files) => {
                    info!("Job '{}' completed", job_path);
                    self.record(&job_path, EventType::Completed);
                    run.jobs[index].status = JobStatus::Completed;
                    for file in files {
                        debug!("Registered {} -> {} ({})", file.lfn, file.pfn, file.site);
                        produced.insert(file.lfn.clone(), file);
                    }
                }
                JobOutcome::Failed(e) => {
                    error!("Job '{}' failed: {}", job_path, e);
                    self.record(&job_path, EventType::Failed);
                    run.fail_job(&graph, index, e);
                }
                JobOutcome::Cancelled => {
                    warn!("Job '{}' cancelled", job_path);
                    self.record(&job_path, EventType::Cancelled);
                    run.jobs[index].status = JobStatus::Cancelled;
                }
            }
        }

        for job in run.jobs.iter_mut().filter(|j| j.status == JobStatus::Pending) {
            job.status = JobStatus::Cancelled;
        }

        // A failure outranks a later cancellation.
        let phase = if run.jobs.iter().all(|j| j.status == JobStatus::Completed) {
            LevelPhase::Completed
        } else if run.jobs.iter().any(|j| j.status == JobStatus::Failed) || !cancel.is_cancelled() {
            LevelPhase::Failed
        } else {
            LevelPhase::Cancelled
        };
        run.finish(phase)
    }

    /// Binds a plain job and returns the future that runs it.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_job(
        &self,
        index: usize,
        job: &Job,
        resolution: &JobResolution,
        produced: &HashMap<String, BoundFile>,
        output_map: &OutputMap,
        path: &HierarchyPath,
        cancel: &CancellationToken,
    ) -> Result<(JobBinding, BoxFuture<'_, Finished>)> {
        let binding = bind_job(job, resolution, produced, output_map, path)?;
        info!("Submitting job '{}' on '{}'", path, binding.site);

        let cancel = cancel.clone();
        let owned = binding.clone();
        let future = async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => JobOutcome::Cancelled,
                result = self.execute(&owned) => match result {
                    Ok(()) => JobOutcome::Completed(owned.outputs.clone()),
                    Err(source) => JobOutcome::Failed(PlanError::SubmissionFailed {
                        job: owned.job_id.clone(),
                        path: owned.path.clone(),
                        source,
                    }),
                },
            };
            Finished {
                index,
                outcome,
                nested: None,
            }
        }
        .boxed();

        Ok((binding, future))
    }

    /// Stage-in, submit, wait, stage-out.
    async fn execute(&self, binding: &JobBinding) -> std::result::Result<(), ExecutionError> {
        for transfer in &binding.stage_in {
            debug!(
                "Stage in '{}': {} ({} -> {})",
                transfer.name, transfer.path, transfer.from_site, transfer.to_site
            );
            self.service
                .transfer(&transfer.path, &transfer.from_site, &transfer.to_site)
                .await?;
        }

        let handle = self.service.submit(binding).await?;
        match self.service.wait(handle).await? {
            JobStatus::Completed => {}
            status => {
                return Err(ExecutionError::JobFailed(format!(
                    "job '{}' finished as {:?}",
                    binding.job_id, status
                )))
            }
        }

        for transfer in &binding.stage_out {
            debug!(
                "Stage out '{}': {} ({} -> {})",
                transfer.name, transfer.path, transfer.from_site, transfer.to_site
            );
            self.service
                .transfer(&transfer.path, &transfer.from_site, &transfer.to_site)
                .await?;
        }
        Ok(())
    }

    /// Prepares the nested level of a sub-workflow job and returns the
    /// future that plans it.
    fn dispatch_sub_workflow(
        &self,
        index: usize,
        sub: &SubWorkflowJob,
        resolution: &JobResolution,
        produced: &HashMap<String, BoundFile>,
        scope: SubWorkflowScope<'_>,
    ) -> Result<BoxFuture<'_, Finished>> {
        let locate = |lfn: &str| {
            resolution
                .locate(lfn, produced)
                .ok_or_else(|| PlanError::UnresolvedReplica {
                    job: sub.id.clone(),
                    lfn: lfn.to_string(),
                    site: resolution.site.clone(),
                })
        };

        let workflow = match &sub.workflow {
            WorkflowRef::Inline(workflow) => (**workflow).clone(),
            WorkflowRef::File(lfn) => load_workflow(&locate(lfn)?.pfn)?,
        };
        if let Some(missing) = sub.unproduced_outputs(&workflow).first() {
            return Err(PlanError::InvalidDocument(format!(
                "Sub-workflow job '{}' declares output '{}' that '{}' never produces",
                sub.id, missing, workflow.name
            )));
        }
        let settings = scope.settings.child(&sub.options);

        let mut overrides = OutputMap::from_records(&sub.options.output_map_override)?;
        if let Some(lfn) = &sub.options.output_map_file {
            let from_file = OutputMap::load(&locate(lfn)?.pfn, &settings.storage_site)?;
            for record in from_file.records() {
                overrides.insert(record)?;
            }
        }

        // Declared outputs land where the parent will look for them.
        let mut parent_targets = OutputMap::new();
        for file in &sub.outputs {
            if let Some(target) = scope.output_map.get(file.lfn()) {
                parent_targets.insert(OutputMapEntry::new(file.lfn(), &target.pfn, &target.site))?;
            }
        }
        let overrides = OutputMap::layered(&parent_targets, &overrides);

        let mut view = ReplicaCatalog::overlay(Arc::clone(scope.replicas));
        let mut registered: Vec<&BoundFile> = produced.values().collect();
        registered.sort_by(|a, b| a.lfn.cmp(&b.lfn));
        for file in registered {
            view.add(ReplicaEntry::new(&file.lfn, &file.site, &file.pfn))?;
        }

        // The parent only learns about the outputs it declared.
        let outputs: Vec<BoundFile> = sub
            .outputs
            .iter()
            .filter_map(|f| {
                scope
                    .output_map
                    .get(f.lfn())
                    .map(|t| BoundFile::new(f.lfn(), &t.pfn, &t.site))
            })
            .collect();

        info!(
            "Submitting sub-workflow job '{}' (nested '{}', verbosity {})",
            scope.path, workflow.name, settings.verbosity
        );
        let ctx = LevelContext {
            workflow,
            path: scope.path.clone(),
            replicas: Arc::new(view),
            transformations: Arc::clone(scope.transformations),
            overrides,
            settings,
            cancel: scope.cancel.child_token(),
        };

        let future = async move {
            let report = self.plan_level(ctx).await;
            let outcome = match report.phase {
                LevelPhase::Completed => JobOutcome::Completed(outputs),
                LevelPhase::Cancelled => JobOutcome::Cancelled,
                _ => JobOutcome::Failed(PlanError::NestedPlanningFailed {
                    path: report.path.clone(),
                    failures: report.failures(),
                }),
            };
            Finished {
                index,
                outcome,
                nested: Some(report),
            }
        }
        .boxed();

        Ok(future)
    }
}

/// Parent-level state a sub-workflow job is dispatched with.
struct SubWorkflowScope<'a> {
    replicas: &'a Arc<ReplicaCatalog>,
    transformations: &'a Arc<TransformationCatalog>,
    settings: &'a LevelSettings,
    output_map: &'a OutputMap,
    path: &'a HierarchyPath,
    cancel: &'a CancellationToken,
}

/// Site a node runs on (plain jobs) or resolves its inputs for
/// (sub-workflow jobs).
fn job_site(node: &JobNode, settings: &LevelSettings) -> String {
    let pinned = match node {
        JobNode::Job(job) => job.site.clone(),
        JobNode::SubWorkflow(sub) => sub.options.execution_site.clone(),
    };
    pinned.unwrap_or_else(|| settings.execution_site.clone())
}
