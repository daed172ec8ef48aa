//! End-to-end planning of a two-level hierarchy: `root` runs `subwf1`
//! (k1, ls1, k3) and then `subwf2` (k2), where k3 is an artifact the root
//! never hears about.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::{tempdir, TempDir};
use tokio::sync::Barrier;

use hierflow::catalog::{
    OutputMap, OutputMapEntry, ReplicaCatalog, ReplicaEntry, Transformation, TransformationCatalog,
};
use hierflow::config::PlannerConfig;
use hierflow::error::{ExecutionError, PlanError};
use hierflow::execution::{DryRunService, ExecutionService, JobBinding, JobHandle, Planner, SharedFsService};
use hierflow::monitoring::EventType;
use hierflow::workflow::{
    save_workflow, DependencyGraph, File, Job, JobNode, JobStatus, LevelPhase, SubWorkflowJob, Workflow,
};

/// In-memory collaborator that records every call.
#[derive(Default)]
struct Recorder {
    failing: HashSet<String>,
    blocking: HashSet<String>,
    barrier: Option<Arc<Barrier>>,
    next: AtomicU64,
    handles: Mutex<HashMap<u64, String>>,
    submitted: Mutex<Vec<JobBinding>>,
    transfers: Mutex<Vec<(String, String, String)>>,
}

impl Recorder {
    fn submitted_ids(&self) -> Vec<String> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.job_id.clone())
            .collect()
    }

    fn binding(&self, job_id: &str) -> JobBinding {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.job_id == job_id)
            .cloned()
            .unwrap_or_else(|| panic!("job '{}' was not submitted", job_id))
    }
}

#[async_trait]
impl ExecutionService for Recorder {
    async fn submit(&self, binding: &JobBinding) -> Result<JobHandle, ExecutionError> {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().unwrap().insert(id, binding.job_id.clone());
        self.submitted.lock().unwrap().push(binding.clone());
        Ok(JobHandle(id))
    }

    async fn wait(&self, handle: JobHandle) -> Result<JobStatus, ExecutionError> {
        let job = self
            .handles
            .lock()
            .unwrap()
            .get(&handle.0)
            .cloned()
            .ok_or(ExecutionError::UnknownHandle(handle.0))?;

        if self.blocking.contains(&job) {
            std::future::pending::<()>().await;
        }
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        if self.failing.contains(&job) {
            Ok(JobStatus::Failed)
        } else {
            Ok(JobStatus::Completed)
        }
    }

    async fn transfer(&self, path: &str, from_site: &str, to_site: &str) -> Result<(), ExecutionError> {
        self.transfers.lock().unwrap().push((
            path.to_string(),
            from_site.to_string(),
            to_site.to_string(),
        ));
        Ok(())
    }
}

struct Scenario {
    dir: TempDir,
    replicas: ReplicaCatalog,
    transformations: TransformationCatalog,
    output_map: OutputMap,
    root: Workflow,
}

impl Scenario {
    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn config(&self) -> PlannerConfig {
        PlannerConfig::default()
            .with_storage_root(self.path("output"))
            .with_max_parallel(4)
    }

    fn planner(&self, service: Arc<dyn ExecutionService>) -> Planner {
        Planner::new(self.config(), service)
            .with_replicas(self.replicas.clone())
            .with_transformations(self.transformations.clone())
            .with_output_map(self.output_map.clone())
    }
}

fn pfn(dir: &Path, name: &str) -> String {
    dir.join(name).to_string_lossy().into_owned()
}

fn keg_job(id: &str, input: &str, output: &str) -> Job {
    let input = File::new(input);
    let output = File::new(output);
    Job::new("keg")
        .with_id(id)
        .args(vec!["-i".into(), (&input).into(), "-o".into(), (&output).into(), "-T".into(), "5".into()])
        .input(input)
        .output(output)
}

/// Writes the documents and catalogs of the hierarchy into a temp dir.
/// `k3_input` is what k3 reads.
fn scenario(k3_input: &str) -> Scenario {
    let dir = tempdir().unwrap();
    let base = dir.path();

    fs::write(base.join("input.txt"), "test input file\n").unwrap();
    fs::write(
        base.join("output.map"),
        format!(
            "k1.txt {} pool=\"local\"\nk2.txt {} pool=\"local\"\n",
            pfn(base, "newoutput/k1.txt"),
            pfn(base, "newoutput/k2.txt")
        ),
    )
    .unwrap();
    fs::write(
        base.join("output_sw1.map"),
        format!("k3.txt {} pool=\"local\"\n", pfn(base, "newoutput/k3.txt")),
    )
    .unwrap();

    let mut wf1 = Workflow::new("subworkflow-1");
    wf1.add_jobs(vec![
        keg_job("k1", "input.txt", "k1.txt"),
        Job::new("ls").with_id("ls1").arg("-alh").on_site("condorpool"),
        keg_job("k3", k3_input, "k3.txt"),
    ])
    .unwrap();
    save_workflow(&wf1, base.join("subwf1.yml")).unwrap();

    let mut wf2 = Workflow::new("subworkflow-2");
    wf2.add_job(keg_job("k2", "k1.txt", "k2.txt")).unwrap();
    save_workflow(&wf2, base.join("subwf2.yml")).unwrap();

    let mut rc = ReplicaCatalog::new();
    for name in ["input.txt", "subwf1.yml", "subwf2.yml", "output_sw1.map"] {
        rc.add_replica(name, "local", pfn(base, name)).unwrap();
    }
    rc.save(base.join("replicas.yml")).unwrap();

    let tc = TransformationCatalog::from_entries(vec![
        Transformation::new("keg", "local", "/usr/bin/pegasus-keg", true),
        Transformation::new("ls", "condorpool", "/bin/ls", false),
        Transformation::new("cat", "condorpool", "/bin/cat", false),
    ])
    .unwrap();
    tc.save(base.join("transformations.yml")).unwrap();

    let mut root = Workflow::new("root");
    root.add_job(
        SubWorkflowJob::new("subwf1.yml")
            .with_id("subwf1")
            .input("input.txt")
            .output_map_file("output_sw1.map")
            .output("k1.txt")
            .verbosity(3)
            .output_sites(["local"])
            .planner_arg("-Dpegasus.dir.storage.mapper.replica.file=output_sw1.map"),
    )
    .unwrap();
    root.add_job(
        SubWorkflowJob::new("subwf2.yml")
            .with_id("subwf2")
            .input("k1.txt")
            .output("k2.txt"),
    )
    .unwrap();

    Scenario {
        replicas: ReplicaCatalog::load(base.join("replicas.yml")).unwrap(),
        transformations: TransformationCatalog::load(base.join("transformations.yml")).unwrap(),
        output_map: OutputMap::load(base.join("output.map"), "local").unwrap(),
        root,
        dir,
    }
}

#[tokio::test]
async fn test_hidden_artifact_stays_in_nested_level() {
    let s = scenario("input.txt");
    let service = Arc::new(Recorder::default());
    let report = s.planner(service.clone()).run(s.root.clone()).await;

    assert!(report.is_success(), "chains: {:?}", report.failure_chains());
    assert_eq!(report.root.phase, LevelPhase::Completed);

    // The root never maps k3
    assert!(report.root.output_map.contains("k1.txt"));
    assert!(report.root.output_map.contains("k2.txt"));
    assert!(!report.root.output_map.contains("k3.txt"));

    // The nested level does, at the location from its override file
    let nested = report.root.find_level(&["subwf1"]).unwrap();
    assert_eq!(
        nested.output_map.get("k3.txt").unwrap().pfn,
        pfn(s.dir.path(), "newoutput/k3.txt")
    );
    // k1 is written where the root registers it
    assert_eq!(
        nested.output_map.get("k1.txt").unwrap().pfn,
        pfn(s.dir.path(), "newoutput/k1.txt")
    );
    assert_eq!(
        report.root.output_map.get("k1.txt").unwrap().pfn,
        pfn(s.dir.path(), "newoutput/k1.txt")
    );
    assert_eq!(
        service.binding("k1").outputs[0].pfn,
        pfn(s.dir.path(), "newoutput/k1.txt")
    );

    assert_eq!(nested.settings.verbosity, 3);
    assert_eq!(
        nested.settings.planner_args,
        vec!["-Dpegasus.dir.storage.mapper.replica.file=output_sw1.map"]
    );

    let mut submitted = service.submitted_ids();
    submitted.sort();
    assert_eq!(submitted, vec!["k1", "k2", "k3", "ls1"]);
}

#[tokio::test]
async fn test_boundary_edge_between_sub_workflow_jobs() {
    let s = scenario("input.txt");
    let graph = DependencyGraph::build(&s.root).unwrap();

    assert_eq!(graph.edges(), vec![("subwf1", "subwf2")]);
    assert_eq!(graph.producer_of("k1.txt"), Some("subwf1"));
    // Nothing inside subwf1 is visible at this level
    assert_eq!(graph.producer_of("k3.txt"), None);

    let service = Arc::new(Recorder::default());
    let report = s.planner(service.clone()).run(s.root.clone()).await;
    assert!(report.is_success());

    // subwf2's k2 reads k1 where the root registered it
    let k2 = service.binding("k2");
    assert_eq!(k2.inputs[0].pfn, pfn(s.dir.path(), "newoutput/k1.txt"));
    assert_eq!(k2.path.to_string(), "root > subwf2 > k2");

    let ids = service.submitted_ids();
    let pos = |id: &str| ids.iter().position(|s| s == id).unwrap();
    assert!(pos("k1") < pos("k2"));
}

#[tokio::test]
async fn test_nested_failure_keeps_full_path() {
    let s = scenario("missing.txt");
    let service = Arc::new(Recorder::default());
    let report = s.planner(service.clone()).run(s.root.clone()).await;

    assert!(!report.is_success());
    assert_eq!(report.root.phase, LevelPhase::Failed);

    let nested = report.root.find_level(&["subwf1"]).unwrap();
    assert_eq!(nested.phase, LevelPhase::Failed);
    // Siblings of k3 inside subwf1 still ran
    assert_eq!(nested.job("k1").unwrap().status, JobStatus::Completed);
    assert_eq!(nested.job("ls1").unwrap().status, JobStatus::Completed);

    match &report.root.job("subwf1").unwrap().error {
        Some(PlanError::NestedPlanningFailed { path, failures }) => {
            assert_eq!(path.to_string(), "root > subwf1");
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].kind(), "UnresolvedReplica");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(
        report.root.job("subwf2").unwrap().error,
        Some(PlanError::UpstreamFailed {
            job: "subwf2".to_string(),
            upstream: "subwf1".to_string(),
        })
    );

    let chains = report.failure_chains();
    assert_eq!(chains.len(), 2);
    assert!(chains[0].starts_with("root > subwf1 > k3: UnresolvedReplica"));
    assert!(chains[1].starts_with("root > subwf2: UpstreamFailed"));

    assert!(!service.submitted_ids().contains(&"k2".to_string()));
    assert_eq!(
        report.failed_jobs(),
        vec!["root > subwf1", "root > subwf1 > k3", "root > subwf2"]
    );
}

#[tokio::test]
async fn test_submission_failure_inside_nested_level() {
    let s = scenario("input.txt");
    let service = Arc::new(Recorder {
        failing: ["k3".to_string()].into_iter().collect(),
        ..Default::default()
    });
    let report = s.planner(service.clone()).run(s.root.clone()).await;

    let nested = report.root.find_level(&["subwf1"]).unwrap();
    match &nested.job("k3").unwrap().error {
        Some(PlanError::SubmissionFailed { job, path, source }) => {
            assert_eq!(job, "k3");
            assert_eq!(path.to_string(), "root > subwf1 > k3");
            assert!(matches!(source, ExecutionError::JobFailed(_)));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(report.root.job("subwf2").unwrap().status, JobStatus::Failed);

    let chains = report.failure_chains();
    assert!(chains[0].starts_with("root > subwf1 > k3: SubmissionFailed: job 'k3' at root > subwf1 > k3"));
    assert!(chains[0].contains("job exited with failure"));
}

#[tokio::test]
async fn test_failure_outranks_later_cancellation() {
    let s = scenario("input.txt");
    let service = Arc::new(Recorder {
        failing: ["k3".to_string()].into_iter().collect(),
        blocking: ["k1".to_string()].into_iter().collect(),
        ..Default::default()
    });
    let planner = s.planner(service.clone());

    let token = planner.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let report = tokio::time::timeout(Duration::from_secs(5), planner.run(s.root.clone()))
        .await
        .expect("cancelled run should finish");

    let nested = report.root.find_level(&["subwf1"]).unwrap();
    assert_eq!(nested.job("k3").unwrap().status, JobStatus::Failed);
    assert_eq!(nested.job("k1").unwrap().status, JobStatus::Cancelled);
    assert_eq!(nested.phase, LevelPhase::Failed);

    assert!(matches!(
        report.root.job("subwf1").unwrap().error,
        Some(PlanError::NestedPlanningFailed { .. })
    ));
    assert_eq!(report.root.phase, LevelPhase::Failed);
    assert!(report
        .failure_chains()
        .iter()
        .any(|c| c.starts_with("root > subwf1 > k3: SubmissionFailed")));
}

#[tokio::test]
async fn test_sub_workflow_must_produce_declared_outputs() {
    let s = scenario("input.txt");
    let mut root = s.root.clone();
    if let Some(JobNode::SubWorkflow(sub)) = root.jobs.first_mut() {
        sub.outputs.push(File::new("ghost.txt"));
    }

    let service = Arc::new(Recorder::default());
    let report = s.planner(service.clone()).run(root).await;

    let subwf1 = report.root.job("subwf1").unwrap();
    assert_eq!(subwf1.status, JobStatus::Failed);
    match &subwf1.error {
        Some(PlanError::InvalidDocument(msg)) => assert!(msg.contains("ghost.txt")),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(subwf1.nested.is_none());
    assert_eq!(report.root.job("subwf2").unwrap().status, JobStatus::Failed);
    assert!(service.submitted_ids().is_empty());
}

/// A job downstream of a sub-workflow reads the file the nested level wrote.
#[cfg(unix)]
#[tokio::test]
async fn test_nested_output_readable_downstream() {
    let dir = tempdir().unwrap();
    let k1 = File::new("k1.txt");
    let copy = File::new("copy.txt");

    let mut inner = Workflow::new("subworkflow-1");
    inner
        .add_job(
            Job::new("sh")
                .with_id("writer")
                .args(vec!["-c".into(), "echo data > \"$0\"".into(), (&k1).into()])
                .output(k1.clone()),
        )
        .unwrap();

    let mut root = Workflow::new("root");
    root.add_job(SubWorkflowJob::new(inner).with_id("subwf1").output(k1.clone()))
        .unwrap();
    root.add_job(
        Job::new("sh")
            .with_id("consumer")
            .args(vec!["-c".into(), "cat \"$0\" > \"$1\"".into(), (&k1).into(), (&copy).into()])
            .input(k1)
            .output(copy),
    )
    .unwrap();

    let parent_k1 = pfn(dir.path(), "newoutput/k1.txt");
    let planner = Planner::new(
        PlannerConfig::default()
            .with_storage_root(dir.path().join("output"))
            .with_max_parallel(2),
        Arc::new(SharedFsService::new()),
    )
    .with_transformations(
        TransformationCatalog::from_entries(vec![Transformation::new("sh", "local", "/bin/sh", false)])
            .unwrap(),
    )
    .with_output_map(OutputMap::from_records(&[OutputMapEntry::new("k1.txt", &parent_k1, "local")]).unwrap());

    let report = planner.run(root).await;

    assert!(report.is_success(), "chains: {:?}", report.failure_chains());
    assert_eq!(fs::read_to_string(&parent_k1).unwrap(), "data\n");
    assert!(!dir.path().join("output/k1.txt").exists());
    assert_eq!(
        fs::read_to_string(dir.path().join("output/copy.txt")).unwrap(),
        "data\n"
    );
}

#[tokio::test]
async fn test_cancellation_reaches_nested_levels() {
    let s = scenario("input.txt");
    let service = Arc::new(Recorder {
        blocking: ["k1".to_string()].into_iter().collect(),
        ..Default::default()
    });
    let planner = s.planner(service.clone());

    let token = planner.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let report = tokio::time::timeout(Duration::from_secs(5), planner.run(s.root.clone()))
        .await
        .expect("cancelled run should finish");

    assert_eq!(report.root.phase, LevelPhase::Cancelled);
    let nested = report.root.find_level(&["subwf1"]).unwrap();
    assert_eq!(nested.phase, LevelPhase::Cancelled);
    assert_eq!(nested.job("k1").unwrap().status, JobStatus::Cancelled);
    assert_eq!(nested.job("k3").unwrap().status, JobStatus::Completed);
    assert_eq!(report.root.job("subwf1").unwrap().status, JobStatus::Cancelled);
    assert_eq!(report.root.job("subwf2").unwrap().status, JobStatus::Cancelled);
    assert!(report.failed_jobs().is_empty());
}

#[tokio::test]
async fn test_independent_jobs_dispatched_concurrently() {
    let mut wf = Workflow::new("pair");
    wf.add_job(Job::new("ls").arg("-alh")).unwrap();
    wf.add_job(Job::new("ls").arg("-l")).unwrap();

    let graph = DependencyGraph::build(&wf).unwrap();
    assert_eq!(graph.edge_count(), 0);
    assert!(graph.independent("ID0000001", "ID0000002"));

    // Each wait blocks until both jobs are waiting
    let service = Arc::new(Recorder {
        barrier: Some(Arc::new(Barrier::new(2))),
        ..Default::default()
    });
    let planner = Planner::new(
        PlannerConfig::default().with_execution_site("condorpool").with_max_parallel(4),
        service.clone(),
    )
    .with_transformations(
        TransformationCatalog::from_entries(vec![Transformation::new("ls", "condorpool", "/bin/ls", false)])
            .unwrap(),
    );

    let report = tokio::time::timeout(Duration::from_secs(5), planner.run(wf))
        .await
        .expect("independent jobs should run concurrently");
    assert!(report.is_success());
    assert_eq!(service.submitted_ids().len(), 2);
}

#[tokio::test]
async fn test_staging_transfers_are_performed() {
    let mut wf = Workflow::new("staged");
    wf.add_job(keg_job("remote", "input.txt", "out.txt").on_site("condorpool"))
        .unwrap();

    let service = Arc::new(Recorder::default());
    let planner = Planner::new(
        PlannerConfig::default().with_storage_root("/archive"),
        service.clone(),
    )
    .with_replicas(
        ReplicaCatalog::from_entries(vec![ReplicaEntry::new("input.txt", "local", "/data/input.txt")]).unwrap(),
    )
    .with_transformations(
        TransformationCatalog::from_entries(vec![Transformation::new("keg", "local", "/usr/bin/pegasus-keg", true)])
            .unwrap(),
    );

    let report = planner.run(wf).await;
    assert!(report.is_success());

    let transfers = service.transfers.lock().unwrap().clone();
    assert_eq!(
        transfers,
        vec![
            ("/usr/bin/pegasus-keg".to_string(), "local".to_string(), "condorpool".to_string()),
            ("/data/input.txt".to_string(), "local".to_string(), "condorpool".to_string()),
            ("/archive/out.txt".to_string(), "condorpool".to_string(), "local".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_replica_tie_break_is_deterministic() {
    let s = scenario("input.txt");
    let mut replicas = s.replicas.clone();
    replicas.add_replica("input.txt", "remote-b", "/b/input.txt").unwrap();
    replicas.add_replica("input.txt", "remote-a", "/a/input.txt").unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let service = Arc::new(Recorder::default());
        let planner = Planner::new(s.config().with_execution_site("condorpool"), service.clone())
            .with_replicas(replicas.clone())
            .with_transformations(s.transformations.clone());
        let mut wf = Workflow::new("tie");
        wf.add_job(keg_job("k", "input.txt", "k.txt")).unwrap();
        planner.run(wf).await;
        seen.push(service.binding("k").inputs[0].clone());
    }

    // No replica on condorpool: the first registered entry wins every time
    assert!(seen.iter().all(|b| b.site == "local"));
    assert!(seen.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn test_duplicate_catalog_entry_in_nested_document() {
    let s = scenario("input.txt");
    let mut inner = Workflow::new("inner");
    inner.add_replica("x.txt", "local", "/one/x.txt");
    inner.add_replica("x.txt", "local", "/two/x.txt");
    inner.add_job(keg_job("kx", "x.txt", "y.txt")).unwrap();

    let mut root = Workflow::new("root");
    root.add_job(SubWorkflowJob::new(inner).with_id("inner")).unwrap();
    root.add_job(keg_job("sibling", "input.txt", "z.txt")).unwrap();

    let service = Arc::new(Recorder::default());
    let report = s.planner(service.clone()).run(root).await;

    let nested = report.root.find_level(&["inner"]).unwrap();
    assert_eq!(nested.phase, LevelPhase::Failed);
    assert_eq!(nested.errors[0].kind(), "DuplicateCatalogEntry");
    assert_eq!(service.submitted_ids(), vec!["sibling"]);
    assert_eq!(report.root.job("sibling").unwrap().status, JobStatus::Completed);

    let duplicate = ReplicaCatalog::from_entries(vec![
        ReplicaEntry::new("x.txt", "local", "/one/x.txt"),
        ReplicaEntry::new("x.txt", "local", "/two/x.txt"),
    ]);
    assert!(matches!(duplicate, Err(PlanError::DuplicateCatalogEntry { .. })));
}

#[tokio::test]
async fn test_conflicting_override_sources() {
    let s = scenario("input.txt");
    let mut root = s.root.clone();
    if let Some(JobNode::SubWorkflow(sub)) = root.jobs.first_mut() {
        sub.options
            .output_map_override
            .push(OutputMapEntry::new("k3.txt", "/elsewhere/k3.txt", "local"));
    }

    let service = Arc::new(Recorder::default());
    let report = s.planner(service.clone()).run(root).await;

    assert_eq!(
        report.root.job("subwf1").unwrap().error,
        Some(PlanError::OutputMapConflict {
            lfn: "k3.txt".to_string()
        })
    );
    assert!(service.submitted_ids().is_empty());
}

#[tokio::test]
async fn test_dry_run_plans_whole_hierarchy() {
    let s = scenario("input.txt");
    let planner = s.planner(Arc::new(DryRunService::new()));
    let report = planner.run(s.root.clone()).await;

    assert!(report.is_success());
    assert_eq!(report.root.all_jobs().len(), 6);
    let timeline = planner.timeline();
    assert!(timeline.events().iter().any(|e| e.job == "root > subwf1 > k3"));
    assert_eq!(timeline.jobs_ending_with(EventType::Completed).len(), 6);

    let saved = report.save(s.path(".hierflow")).unwrap();
    assert!(saved.exists());
}
