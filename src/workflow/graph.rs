//! Dependency Inference
//!
//! Edges are never declared: job A precedes job B iff some output of A is
//! (by logical name) a required input of B, within the same level. Names
//! that no job of the level produces are external inputs and must come from
//! the replica catalog.
//!
//! Construction indexes producers first (one pass over outputs), then wires
//! edges (one pass over inputs), then orders the jobs with Kahn's algorithm,
//! which also detects cycles.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use log::{debug, info};

use super::model::Workflow;
use crate::error::{PlanError, Result};

/// The dependency graph of one workflow level.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    producers: HashMap<String, usize>,
    upstream: Vec<BTreeSet<usize>>,
    downstream: Vec<BTreeSet<usize>>,
    external: Vec<Vec<String>>,
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Infers the graph of `workflow`.
    ///
    /// Fails with [`PlanError::AmbiguousProducer`] when two jobs produce the
    /// same name and with [`PlanError::CycleDetected`] when the edges loop.
    pub fn build(workflow: &Workflow) -> Result<Self> {
        let count = workflow.jobs.len();
        let ids: Vec<String> = workflow.jobs.iter().map(|j| j.id().to_string()).collect();

        let mut index = HashMap::with_capacity(count);
        for (i, id) in ids.iter().enumerate() {
            if index.insert(id.clone(), i).is_some() {
                return Err(PlanError::DuplicateJobId(id.clone()));
            }
        }

        let mut producers: HashMap<String, usize> = HashMap::new();
        for (i, job) in workflow.jobs.iter().enumerate() {
            for file in job.outputs() {
                if let Some(&first) = producers.get(file.lfn()) {
                    if first != i {
                        return Err(PlanError::AmbiguousProducer {
                            lfn: file.lfn().to_string(),
                            first: ids[first].clone(),
                            second: ids[i].clone(),
                        });
                    }
                }
                producers.insert(file.lfn().to_string(), i);
            }
        }

        let mut upstream = vec![BTreeSet::new(); count];
        let mut downstream = vec![BTreeSet::new(); count];
        let mut external = vec![Vec::new(); count];

        for (i, job) in workflow.jobs.iter().enumerate() {
            for file in job.required_inputs() {
                match producers.get(file.lfn()) {
                    Some(&producer) => {
                        upstream[i].insert(producer);
                        downstream[producer].insert(i);
                    }
                    None => external[i].push(file.lfn().to_string()),
                }
            }
        }

        let mut graph = Self {
            ids,
            index,
            producers,
            upstream,
            downstream,
            external,
            order: Vec::new(),
        };
        graph.order = graph.topological_sort()?;

        info!(
            "Dependency graph for '{}': {} jobs, {} edges",
            workflow.name,
            count,
            graph.edge_count()
        );
        Ok(graph)
    }

    /// Kahn's algorithm, seeded in declaration order so the result is stable.
    fn topological_sort(&self) -> Result<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.upstream.iter().map(|u| u.len()).collect();
        let mut queue: VecDeque<usize> = (0..self.ids.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.ids.len());

        while let Some(current) = queue.pop_front() {
            order.push(current);
            for &next in &self.downstream[current] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != self.ids.len() {
            let jobs: Vec<String> = (0..self.ids.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.ids[i].clone())
                .collect();
            return Err(PlanError::CycleDetected { jobs });
        }

        debug!(
            "Topological order: {:?}",
            order.iter().map(|&i| &self.ids[i]).collect::<Vec<_>>()
        );
        Ok(order)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.downstream.iter().map(|d| d.len()).sum()
    }

    /// All edges `(producer, consumer)`, in topological order of producers.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.order
            .iter()
            .flat_map(|&from| {
                self.downstream[from]
                    .iter()
                    .map(move |&to| (self.ids[from].as_str(), self.ids[to].as_str()))
            })
            .collect()
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => self.downstream[a].contains(&b),
            _ => false,
        }
    }

    /// Job of this level that produces `lfn`, if any.
    pub fn producer_of(&self, lfn: &str) -> Option<&str> {
        self.producers.get(lfn).map(|&i| self.ids[i].as_str())
    }

    pub fn topological_order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.ids[i].as_str()).collect()
    }

    /// Jobs with no upstream dependency.
    pub fn roots(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|&&i| self.upstream[i].is_empty())
            .map(|&i| self.ids[i].as_str())
            .collect()
    }

    pub fn upstream(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| self.upstream[i].iter().map(|&u| self.ids[u].as_str()).collect())
            .unwrap_or_default()
    }

    pub fn downstream(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| self.downstream[i].iter().map(|&d| self.ids[d].as_str()).collect())
            .unwrap_or_default()
    }

    /// Required inputs of `id` that no job of this level produces.
    pub fn external_inputs(&self, id: &str) -> &[String] {
        self.index
            .get(id)
            .map(|&i| self.external[i].as_slice())
            .unwrap_or(&[])
    }

    /// True when no path connects the two jobs in either direction, so they
    /// may be dispatched concurrently.
    pub fn independent(&self, a: &str, b: &str) -> bool {
        match (self.index.get(a), self.index.get(b)) {
            (Some(&x), Some(&y)) if x != y => {
                !self.descendants_of(x).contains(&y) && !self.descendants_of(y).contains(&x)
            }
            _ => false,
        }
    }

    /// Groups jobs into waves; every job of a wave depends only on earlier
    /// waves.
    pub fn levels(&self) -> Vec<Vec<&str>> {
        let mut depth = vec![0usize; self.ids.len()];
        for &i in &self.order {
            depth[i] = self.upstream[i]
                .iter()
                .map(|&u| depth[u] + 1)
                .max()
                .unwrap_or(0);
        }

        let mut levels: Vec<Vec<&str>> = Vec::new();
        for &i in &self.order {
            if levels.len() <= depth[i] {
                levels.resize_with(depth[i] + 1, Vec::new);
            }
            levels[depth[i]].push(self.ids[i].as_str());
        }
        levels
    }

    pub(crate) fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub(crate) fn id_at(&self, index: usize) -> &str {
        &self.ids[index]
    }

    pub(crate) fn order_indices(&self) -> &[usize] {
        &self.order
    }

    pub(crate) fn upstream_of(&self, index: usize) -> &BTreeSet<usize> {
        &self.upstream[index]
    }

    pub(crate) fn producer_index(&self, lfn: &str) -> Option<usize> {
        self.producers.get(lfn).copied()
    }

    /// Every job reachable downstream of `index`.
    pub(crate) fn descendants_of(&self, index: usize) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut stack: Vec<usize> = self.downstream[index].iter().copied().collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.downstream[next].iter().copied());
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{Job, SubWorkflowJob};

    fn chain() -> Workflow {
        let mut wf = Workflow::new("chain");
        wf.add_job(Job::new("keg").with_id("a").input("input.txt").output("x.txt"))
            .unwrap();
        wf.add_job(Job::new("keg").with_id("b").input("x.txt").output("y.txt"))
            .unwrap();
        wf.add_job(Job::new("keg").with_id("c").input("y.txt").output("z.txt"))
            .unwrap();
        wf
    }

    #[test]
    fn test_edges_from_shared_names() {
        let graph = DependencyGraph::build(&chain()).unwrap();

        assert_eq!(graph.edges(), vec![("a", "b"), ("b", "c")]);
        assert_eq!(graph.topological_order(), vec!["a", "b", "c"]);
        assert_eq!(graph.producer_of("y.txt"), Some("b"));
        assert_eq!(graph.external_inputs("a"), &["input.txt".to_string()]);
        assert!(graph.external_inputs("b").is_empty());
    }

    #[test]
    fn test_order_respects_edges_when_declared_backwards() {
        let mut wf = Workflow::new("backwards");
        wf.add_job(Job::new("keg").with_id("late").input("mid.txt")).unwrap();
        wf.add_job(Job::new("keg").with_id("early").output("mid.txt")).unwrap();

        let graph = DependencyGraph::build(&wf).unwrap();
        assert_eq!(graph.topological_order(), vec!["early", "late"]);
    }

    #[test]
    fn test_manufactured_cycle_detected() {
        let mut wf = Workflow::new("cycle");
        wf.add_job(Job::new("keg").with_id("A").input("Y").output("X")).unwrap();
        wf.add_job(Job::new("keg").with_id("B").input("X").output("Y")).unwrap();

        let err = DependencyGraph::build(&wf).unwrap_err();
        assert_eq!(
            err,
            PlanError::CycleDetected {
                jobs: vec!["A".to_string(), "B".to_string()]
            }
        );
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let mut wf = Workflow::new("self");
        wf.add_job(Job::new("keg").with_id("A").input("X").output("X")).unwrap();
        assert!(matches!(
            DependencyGraph::build(&wf),
            Err(PlanError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_ambiguous_producer() {
        let mut wf = Workflow::new("ambiguous");
        wf.add_job(Job::new("keg").with_id("a").output("k1.txt")).unwrap();
        wf.add_job(Job::new("keg").with_id("b").output("k1.txt")).unwrap();

        let err = DependencyGraph::build(&wf).unwrap_err();
        assert_eq!(
            err,
            PlanError::AmbiguousProducer {
                lfn: "k1.txt".to_string(),
                first: "a".to_string(),
                second: "b".to_string(),
            }
        );
    }

    #[test]
    fn test_independent_jobs_have_no_edge() {
        let mut wf = Workflow::new("pair");
        wf.add_job(Job::new("keg").with_id("left").input("l.in").output("l.out"))
            .unwrap();
        wf.add_job(Job::new("keg").with_id("right").input("r.in").output("r.out"))
            .unwrap();

        let graph = DependencyGraph::build(&wf).unwrap();
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.independent("left", "right"));
        assert_eq!(graph.roots(), vec!["left", "right"]);
        assert_eq!(graph.levels(), vec![vec!["left", "right"]]);
    }

    #[test]
    fn test_transitive_dependency_is_not_independent() {
        let graph = DependencyGraph::build(&chain()).unwrap();
        assert!(!graph.independent("a", "c"));
        assert!(!graph.has_edge("a", "c"));
        assert_eq!(graph.levels(), vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_sub_workflow_boundary_edge() {
        let mut inner = Workflow::new("subworkflow-1");
        inner
            .add_job(Job::new("keg").with_id("k1").input("input.txt").output("k1.txt"))
            .unwrap();

        let mut root = Workflow::new("root");
        root.add_job(
            SubWorkflowJob::new(inner)
                .with_id("subwf1")
                .input("input.txt")
                .output("k1.txt"),
        )
        .unwrap();
        root.add_job(
            SubWorkflowJob::new("subwf2.yml")
                .with_id("subwf2")
                .input("k1.txt")
                .output("k2.txt"),
        )
        .unwrap();

        let graph = DependencyGraph::build(&root).unwrap();
        assert!(graph.has_edge("subwf1", "subwf2"));
        assert_eq!(graph.producer_of("k1.txt"), Some("subwf1"));
        assert_eq!(graph.external_inputs("subwf2"), &["subwf2.yml".to_string()]);
    }

    #[test]
    fn test_document_produced_upstream_creates_edge() {
        let mut root = Workflow::new("root");
        root.add_job(Job::new("gen").with_id("generate").output("inner.yml"))
            .unwrap();
        root.add_job(SubWorkflowJob::new("inner.yml").with_id("nested"))
            .unwrap();

        let graph = DependencyGraph::build(&root).unwrap();
        assert!(graph.has_edge("generate", "nested"));
    }

    #[test]
    fn test_empty_workflow() {
        let graph = DependencyGraph::build(&Workflow::new("empty")).unwrap();
        assert!(graph.is_empty());
        assert!(graph.topological_order().is_empty());
    }
}
