//! Workflow Data Model
//!
//! Core data structures for one level of a workflow hierarchy: file
//! references, jobs, sub-workflow jobs and the workflow that owns them.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: root
//! replica_catalog:
//!   - { lfn: input.txt, site: local, pfn: /data/input.txt }
//!   - { lfn: subwf1.yml, site: local, pfn: /data/subwf1.yml }
//! jobs:
//!   - type: subworkflow
//!     id: subwf1
//!     workflow: subwf1.yml
//!     inputs: input.txt
//!     outputs: k1.txt
//!     options:
//!       verbosity: 3
//!       output_sites: [local]
//!
//!   - type: job
//!     id: report
//!     transformation: cat
//!     args: [{ lfn: k1.txt }]
//!     inputs: k1.txt
//! ```

use std::collections::HashSet;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{OutputMapEntry, ReplicaEntry, Transformation};
use crate::error::{PlanError, Result};

/// Handle for a logical file name. A key, never a value: it owns no data.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct File {
    lfn: String,
}

impl File {
    pub fn new(lfn: impl Into<String>) -> Self {
        Self {
            lfn: lfn.into().trim().to_string(),
        }
    }

    /// The logical file name.
    pub fn lfn(&self) -> &str {
        &self.lfn
    }
}

impl From<&str> for File {
    fn from(lfn: &str) -> Self {
        Self::new(lfn)
    }
}

impl From<String> for File {
    fn from(lfn: String) -> Self {
        Self::new(lfn)
    }
}

impl std::fmt::Display for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.lfn)
    }
}

/// One command-line argument: either literal text or a file reference that
/// is replaced by the file's bound physical path at submission time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(from = "RawArg", into = "RawArg")]
pub enum Arg {
    Literal(String),
    File(File),
}

impl Arg {
    pub fn as_file(&self) -> Option<&File> {
        match self {
            Self::File(file) => Some(file),
            Self::Literal(_) => None,
        }
    }
}

/// Wire form of [`Arg`]; YAML numbers and booleans become literal text.
#[derive(Serialize, Deserialize, Clone)]
#[serde(untagged)]
enum RawArg {
    File { lfn: String },
    Text(String),
    Number(serde_json::Number),
    Flag(bool),
}

impl From<RawArg> for Arg {
    fn from(raw: RawArg) -> Self {
        match raw {
            RawArg::File { lfn } => Arg::File(File::new(lfn)),
            RawArg::Text(text) => Arg::Literal(text),
            RawArg::Number(n) => Arg::Literal(n.to_string()),
            RawArg::Flag(b) => Arg::Literal(b.to_string()),
        }
    }
}

impl From<Arg> for RawArg {
    fn from(arg: Arg) -> Self {
        match arg {
            Arg::Literal(text) => RawArg::Text(text),
            Arg::File(file) => RawArg::File { lfn: file.lfn },
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Literal(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Literal(s)
    }
}

impl From<File> for Arg {
    fn from(file: File) -> Self {
        Arg::File(file)
    }
}

impl From<&File> for Arg {
    fn from(file: &File) -> Self {
        Arg::File(file.clone())
    }
}

impl From<i64> for Arg {
    fn from(n: i64) -> Self {
        Arg::Literal(n.to_string())
    }
}

impl From<i32> for Arg {
    fn from(n: i32) -> Self {
        Arg::Literal(n.to_string())
    }
}

impl From<f64> for Arg {
    fn from(n: f64) -> Self {
        Arg::Literal(n.to_string())
    }
}

/// Deserializes either a single file name or a list of them.
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<File>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![File::new(s)]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(File::new(s)),
                _ => Err(de::Error::custom("Expected file name in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected file name or array of file names")),
    }
}

/// Deserializes a site list, keeping the first occurrence of each name.
fn unique_sites<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let sites = Vec::<String>::deserialize(deserializer)?;
    let mut seen = HashSet::new();
    Ok(sites
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect())
}

fn push_unique(files: &mut Vec<File>, file: File) {
    if !files.contains(&file) {
        files.push(file);
    }
}

/// A bound invocation of a transformation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Job {
    /// Unique within its workflow; assigned automatically when left empty
    #[serde(default)]
    pub id: String,

    /// Name of the executable in the transformation catalog
    pub transformation: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Arg>,

    #[serde(deserialize_with = "single_or_vec", default)]
    pub inputs: Vec<File>,

    #[serde(deserialize_with = "single_or_vec", default)]
    pub outputs: Vec<File>,

    /// Site override; the level's execution site is used otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
}

impl Job {
    /// Creates a job invoking `transformation`.
    ///
    /// # Example
    ///
    /// ```
    /// use hierflow::workflow::{File, Job};
    ///
    /// let input = File::new("input.txt");
    /// let k1 = File::new("k1.txt");
    /// let job = Job::new("keg")
    ///     .with_id("k1")
    ///     .args(["-i".into(), (&input).into(), "-o".into(), (&k1).into(), "-T".into(), 5.into()])
    ///     .input(input)
    ///     .output(k1);
    /// assert_eq!(job.args.len(), 6);
    /// ```
    pub fn new(transformation: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            transformation: transformation.into().trim().to_string(),
            args: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            site: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into().trim().to_string();
        self
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = Arg>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn input(mut self, file: impl Into<File>) -> Self {
        push_unique(&mut self.inputs, file.into());
        self
    }

    pub fn inputs(mut self, files: impl IntoIterator<Item = File>) -> Self {
        for file in files {
            push_unique(&mut self.inputs, file);
        }
        self
    }

    pub fn output(mut self, file: impl Into<File>) -> Self {
        push_unique(&mut self.outputs, file.into());
        self
    }

    pub fn outputs(mut self, files: impl IntoIterator<Item = File>) -> Self {
        for file in files {
            push_unique(&mut self.outputs, file);
        }
        self
    }

    /// Pins this job to a site.
    pub fn on_site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }
}

/// Where a sub-workflow's document comes from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum WorkflowRef {
    /// Logical file name of a YAML document, resolved through the replica catalog
    File(String),
    Inline(Box<Workflow>),
}

impl From<Workflow> for WorkflowRef {
    fn from(workflow: Workflow) -> Self {
        WorkflowRef::Inline(Box::new(workflow))
    }
}

impl From<&str> for WorkflowRef {
    fn from(lfn: &str) -> Self {
        WorkflowRef::File(lfn.trim().to_string())
    }
}

/// Options handed to the planner when a nested level is planned.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PlannerOptions {
    #[serde(default)]
    pub verbosity: u8,

    /// Sites outputs are staged to; the first one is the nested storage site
    #[serde(default, deserialize_with = "unique_sites", skip_serializing_if = "Vec::is_empty")]
    pub output_sites: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_site: Option<String>,

    /// Output map records that take precedence over the nested level's own map
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_map_override: Vec<OutputMapEntry>,

    /// Input file holding more override records (`lfn pfn pool="site"` lines)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_map_file: Option<String>,

    /// Extra planner arguments, carried through to the nested report
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// A job whose "transformation" is a whole nested workflow.
///
/// To the parent this is one opaque node: its declared `outputs` are the only
/// products the parent ever learns about.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubWorkflowJob {
    #[serde(default)]
    pub id: String,

    pub workflow: WorkflowRef,

    #[serde(deserialize_with = "single_or_vec", default)]
    pub inputs: Vec<File>,

    #[serde(deserialize_with = "single_or_vec", default)]
    pub outputs: Vec<File>,

    #[serde(default)]
    pub options: PlannerOptions,
}

impl SubWorkflowJob {
    pub fn new(workflow: impl Into<WorkflowRef>) -> Self {
        Self {
            id: String::new(),
            workflow: workflow.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            options: PlannerOptions::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into().trim().to_string();
        self
    }

    pub fn input(mut self, file: impl Into<File>) -> Self {
        push_unique(&mut self.inputs, file.into());
        self
    }

    pub fn output(mut self, file: impl Into<File>) -> Self {
        push_unique(&mut self.outputs, file.into());
        self
    }

    pub fn verbosity(mut self, verbosity: u8) -> Self {
        self.options.verbosity = verbosity;
        self
    }

    pub fn output_sites<I, S>(mut self, sites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for site in sites {
            let site = site.into();
            if !self.options.output_sites.contains(&site) {
                self.options.output_sites.push(site);
            }
        }
        self
    }

    pub fn execution_site(mut self, site: impl Into<String>) -> Self {
        self.options.execution_site = Some(site.into());
        self
    }

    pub fn map_output(
        mut self,
        lfn: impl Into<String>,
        pfn: impl Into<String>,
        site: impl Into<String>,
    ) -> Self {
        self.options
            .output_map_override
            .push(OutputMapEntry::new(lfn, pfn, site));
        self
    }

    /// Reads additional override records from `file` (declared as an input).
    pub fn output_map_file(mut self, file: impl Into<File>) -> Self {
        let file = file.into();
        self.options.output_map_file = Some(file.lfn().to_string());
        push_unique(&mut self.inputs, file);
        self
    }

    pub fn planner_arg(mut self, arg: impl Into<String>) -> Self {
        self.options.args.push(arg.into());
        self
    }

    /// Declared outputs that no job of `nested` produces.
    pub fn unproduced_outputs<'a>(&'a self, nested: &Workflow) -> Vec<&'a File> {
        let produced: HashSet<&str> = nested.declared_outputs().into_iter().map(|f| f.lfn()).collect();
        self.outputs
            .iter()
            .filter(|f| !produced.contains(f.lfn()))
            .collect()
    }
}

/// A node of a workflow level.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobNode {
    Job(Job),
    SubWorkflow(SubWorkflowJob),
}

impl JobNode {
    pub fn id(&self) -> &str {
        match self {
            Self::Job(job) => &job.id,
            Self::SubWorkflow(sub) => &sub.id,
        }
    }

    fn set_id(&mut self, id: String) {
        match self {
            Self::Job(job) => job.id = id,
            Self::SubWorkflow(sub) => sub.id = id,
        }
    }

    pub fn inputs(&self) -> &[File] {
        match self {
            Self::Job(job) => &job.inputs,
            Self::SubWorkflow(sub) => &sub.inputs,
        }
    }

    pub fn outputs(&self) -> &[File] {
        match self {
            Self::Job(job) => &job.outputs,
            Self::SubWorkflow(sub) => &sub.outputs,
        }
    }

    pub fn args(&self) -> &[Arg] {
        match self {
            Self::Job(job) => &job.args,
            Self::SubWorkflow(_) => &[],
        }
    }

    /// Every file this node needs before it can run: declared inputs plus,
    /// for a sub-workflow, its document and override map file.
    pub fn required_inputs(&self) -> Vec<File> {
        let mut files = self.inputs().to_vec();
        if let Self::SubWorkflow(sub) = self {
            if let WorkflowRef::File(lfn) = &sub.workflow {
                push_unique(&mut files, File::new(lfn.as_str()));
            }
            if let Some(lfn) = &sub.options.output_map_file {
                push_unique(&mut files, File::new(lfn.as_str()));
            }
        }
        files
    }

    pub fn is_sub_workflow(&self) -> bool {
        matches!(self, Self::SubWorkflow(_))
    }
}

impl From<Job> for JobNode {
    fn from(job: Job) -> Self {
        JobNode::Job(job)
    }
}

impl From<SubWorkflowJob> for JobNode {
    fn from(sub: SubWorkflowJob) -> Self {
        JobNode::SubWorkflow(sub)
    }
}

/// One level of the hierarchy: jobs plus the catalog entries the level
/// contributes to its own (and its children's) catalog views.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Workflow {
    pub name: String,

    #[serde(default)]
    pub jobs: Vec<JobNode>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replica_catalog: Vec<ReplicaEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transformation_catalog: Vec<Transformation>,

    /// Explicit output locations for this level
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_map: Vec<OutputMapEntry>,
}

impl Workflow {
    /// Creates a new empty workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: Vec::new(),
            replica_catalog: Vec::new(),
            transformation_catalog: Vec::new(),
            output_map: Vec::new(),
        }
    }

    /// Adds a job, assigning `ID0000001`-style ids to jobs that have none.
    ///
    /// Returns the id the job was stored under.
    pub fn add_job(&mut self, job: impl Into<JobNode>) -> Result<String> {
        let mut job = job.into();
        if job.id().is_empty() {
            let id = self.next_auto_id();
            job.set_id(id);
        }
        if self.jobs.iter().any(|j| j.id() == job.id()) {
            return Err(PlanError::DuplicateJobId(job.id().to_string()));
        }
        let id = job.id().to_string();
        self.jobs.push(job);
        Ok(id)
    }

    pub fn add_jobs<I, J>(&mut self, jobs: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = J>,
        J: Into<JobNode>,
    {
        jobs.into_iter().map(|job| self.add_job(job)).collect()
    }

    /// Fills in ids for jobs loaded from a document without one.
    pub fn assign_missing_ids(&mut self) {
        for index in 0..self.jobs.len() {
            if self.jobs[index].id().is_empty() {
                let id = self.next_auto_id();
                self.jobs[index].set_id(id);
            }
        }
    }

    fn next_auto_id(&self) -> String {
        let taken: HashSet<&str> = self.jobs.iter().map(|j| j.id()).collect();
        (1..)
            .map(|n| format!("ID{:07}", n))
            .find(|candidate| !taken.contains(candidate.as_str()))
            .unwrap_or_default()
    }

    pub fn add_replica(
        &mut self,
        lfn: impl Into<String>,
        site: impl Into<String>,
        pfn: impl Into<String>,
    ) -> &mut Self {
        self.replica_catalog.push(ReplicaEntry::new(lfn, site, pfn));
        self
    }

    pub fn add_transformation(&mut self, transformation: Transformation) -> &mut Self {
        self.transformation_catalog.push(transformation);
        self
    }

    pub fn map_output(
        &mut self,
        lfn: impl Into<String>,
        pfn: impl Into<String>,
        site: impl Into<String>,
    ) -> &mut Self {
        self.output_map.push(OutputMapEntry::new(lfn, pfn, site));
        self
    }

    pub fn get_job(&self, id: &str) -> Option<&JobNode> {
        self.jobs.iter().find(|j| j.id() == id)
    }

    /// All outputs declared by the jobs of this level, in declaration order.
    pub fn declared_outputs(&self) -> Vec<&File> {
        let mut seen = HashSet::new();
        self.jobs
            .iter()
            .flat_map(|j| j.outputs())
            .filter(|f| seen.insert(f.lfn()))
            .collect()
    }

    /// Returns the number of jobs in this level.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns true if the level has no jobs.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
