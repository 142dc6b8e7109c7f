//! In-memory task graph used by the scheduler.
//!
//! Hydrated once per `run()` from the persisted tasks and edges. Keeps
//! the full annotated graph (`nodes`) plus a working queue from which
//! already-successful tasks are pre-removed; the frontier is the set of
//! queue members whose in-queue in-degree is zero and which have not
//! been dispatched yet.

use std::collections::{HashMap, HashSet};

use super::status::Status;
use super::task::{Tags, Task};

/// A node in the scheduler graph, annotated with the fields the run loop
/// and the intermediate GC need.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub task_id: i64,
    pub status: Status,
    pub tags: Tags,
    pub stage_name: String,
    pub noop: bool,
    pub cleared_output_files: bool,
    pub dont_delete_output_files: bool,
}

impl DagNode {
    pub fn from_task(task: &Task, stage_name: &str) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            tags: task.tags.clone(),
            stage_name: stage_name.to_string(),
            noop: task.noop,
            cleared_output_files: task.cleared_output_files,
            dont_delete_output_files: task.dont_delete_output_files,
        }
    }
}

/// The scheduler: full graph, working queue, and dispatched set.
#[derive(Debug, Clone, Default)]
pub struct WorkflowDag {
    nodes: HashMap<i64, DagNode>,
    parents: HashMap<i64, Vec<i64>>,
    children: HashMap<i64, Vec<i64>>,
    /// Tasks still to be completed (successful tasks pre-removed).
    queue: HashSet<i64>,
    /// In-queue in-degree per queued task.
    in_degree: HashMap<i64, usize>,
    /// Dispatched but not yet completed.
    queued_tasks: HashSet<i64>,
}

impl WorkflowDag {
    /// Build the graph from hydrated tasks (with their stage names) and
    /// parent->child edges.
    pub fn hydrate<'a, I, E>(tasks: I, edges: E) -> Self
    where
        I: IntoIterator<Item = (&'a Task, &'a str)>,
        E: IntoIterator<Item = (i64, i64)>,
    {
        let mut dag = Self::default();
        for (task, stage_name) in tasks {
            dag.nodes.insert(task.id, DagNode::from_task(task, stage_name));
            dag.parents.entry(task.id).or_default();
            dag.children.entry(task.id).or_default();
        }
        for (parent, child) in edges {
            if dag.nodes.contains_key(&parent) && dag.nodes.contains_key(&child) {
                dag.children.entry(parent).or_default().push(child);
                dag.parents.entry(child).or_default().push(parent);
            }
        }

        dag.queue = dag
            .nodes
            .values()
            .filter(|n| n.status != Status::Successful)
            .map(|n| n.task_id)
            .collect();
        for &id in &dag.queue {
            let degree = dag.parents[&id]
                .iter()
                .filter(|p| dag.queue.contains(p))
                .count();
            dag.in_degree.insert(id, degree);
        }
        dag
    }

    pub fn node(&self, task_id: i64) -> Option<&DagNode> {
        self.nodes.get(&task_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The frontier: queue members with no unsatisfied parents that have
    /// not been dispatched. Sorted by id for deterministic logs; peers in
    /// a frontier carry no ordering guarantee beyond that.
    pub fn ready_tasks(&self) -> Vec<i64> {
        let mut ready: Vec<i64> = self
            .queue
            .iter()
            .filter(|id| self.in_degree.get(id).copied() == Some(0))
            .filter(|id| !self.queued_tasks.contains(id))
            .copied()
            .collect();
        ready.sort_unstable();
        ready
    }

    /// Record that a frontier member was dispatched.
    pub fn mark_queued(&mut self, task_id: i64) {
        self.queued_tasks.insert(task_id);
    }

    /// Remove a finished task from the working queue and stamp its final
    /// status on the full graph.
    pub fn complete_task(&mut self, task_id: i64, status: Status) {
        if let Some(node) = self.nodes.get_mut(&task_id) {
            node.status = status;
        }
        self.queued_tasks.remove(&task_id);
        if self.queue.remove(&task_id) {
            self.in_degree.remove(&task_id);
            for &child in &self.children[&task_id] {
                if let Some(degree) = self.in_degree.get_mut(&child) {
                    *degree = degree.saturating_sub(1);
                }
            }
        }
    }

    /// Stamp a status on the full graph without releasing the node from
    /// the working queue. Used for terminal failures: the failed task's
    /// descendants must never become ready.
    pub fn stamp_status(&mut self, task_id: i64, status: Status) {
        if let Some(node) = self.nodes.get_mut(&task_id) {
            node.status = status;
        }
    }

    /// Update the GC annotation on the full graph.
    pub fn mark_cleared(&mut self, task_id: i64) {
        if let Some(node) = self.nodes.get_mut(&task_id) {
            node.cleared_output_files = true;
        }
    }

    /// A task is intermediate iff it has at least one parent, at least
    /// one child, and at least one child already successful. Roots and
    /// leaves are never intermediate.
    pub fn is_intermediate(&self, task_id: i64) -> bool {
        let has_parents = self.parents.get(&task_id).is_some_and(|p| !p.is_empty());
        let children = match self.children.get(&task_id) {
            Some(c) if !c.is_empty() => c,
            _ => return false,
        };
        has_parents
            && children
                .iter()
                .any(|c| self.nodes[c].status == Status::Successful)
    }

    /// Intermediate tasks whose bytes are still on disk and eligible for
    /// reclamation.
    pub fn clearable_intermediates(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .nodes
            .values()
            .filter(|n| !n.cleared_output_files && !n.dont_delete_output_files)
            .filter(|n| self.is_intermediate(n.task_id))
            .map(|n| n.task_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Tasks still in the working queue.
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    pub fn is_drained(&self) -> bool {
        self.queue.is_empty()
    }

    /// Stalled: work remains, nothing is ready, and nothing is in
    /// flight. Only a cycle (or an edge to a failed subtree) produces
    /// this state once completions have drained.
    pub fn is_stalled(&self) -> bool {
        !self.queue.is_empty() && self.ready_tasks().is_empty() && self.queued_tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::domain::models::task::TaskSpec;

    fn make_task(id: i64, status: Status) -> Task {
        let mut task = TaskSpec::new(1, format!("echo {id}")).into_task(Utc::now());
        task.id = id;
        task.status = status;
        task
    }

    fn hydrate(tasks: &[Task], edges: &[(i64, i64)]) -> WorkflowDag {
        WorkflowDag::hydrate(tasks.iter().map(|t| (t, "stage")), edges.iter().copied())
    }

    #[test]
    fn linear_chain_frontier_advances_one_at_a_time() {
        let tasks: Vec<Task> = (1..=3).map(|i| make_task(i, Status::NoAttempt)).collect();
        let mut dag = hydrate(&tasks, &[(1, 2), (2, 3)]);

        assert_eq!(dag.ready_tasks(), vec![1]);
        dag.mark_queued(1);
        assert!(dag.ready_tasks().is_empty());

        dag.complete_task(1, Status::Successful);
        assert_eq!(dag.ready_tasks(), vec![2]);
        dag.complete_task(2, Status::Successful);
        dag.complete_task(3, Status::Successful);
        assert!(dag.is_drained());
    }

    #[test]
    fn diamond_exposes_both_branches_at_once() {
        let tasks: Vec<Task> = (1..=4).map(|i| make_task(i, Status::NoAttempt)).collect();
        let mut dag = hydrate(&tasks, &[(1, 2), (1, 3), (2, 4), (3, 4)]);

        assert_eq!(dag.ready_tasks(), vec![1]);
        dag.complete_task(1, Status::Successful);
        assert_eq!(dag.ready_tasks(), vec![2, 3]);

        dag.complete_task(2, Status::Successful);
        // 4 waits for both branches.
        assert_eq!(dag.ready_tasks(), vec![3]);
        dag.complete_task(3, Status::Successful);
        assert_eq!(dag.ready_tasks(), vec![4]);
    }

    #[test]
    fn successful_tasks_are_pre_removed_on_hydrate() {
        let tasks = vec![
            make_task(1, Status::Successful),
            make_task(2, Status::NoAttempt),
        ];
        let dag = hydrate(&tasks, &[(1, 2)]);
        assert_eq!(dag.remaining(), 1);
        assert_eq!(dag.ready_tasks(), vec![2]);
    }

    #[test]
    fn cycle_stalls_the_queue() {
        let tasks: Vec<Task> = (1..=3).map(|i| make_task(i, Status::NoAttempt)).collect();
        let dag = hydrate(&tasks, &[(1, 2), (2, 3), (3, 1)]);
        assert!(dag.ready_tasks().is_empty());
        assert!(dag.is_stalled());
        assert_eq!(dag.remaining(), 3);
    }

    #[test]
    fn stamped_failure_keeps_descendants_blocked() {
        let tasks: Vec<Task> = (1..=2).map(|i| make_task(i, Status::NoAttempt)).collect();
        let mut dag = hydrate(&tasks, &[(1, 2)]);

        dag.mark_queued(1);
        dag.stamp_status(1, Status::Failed);
        assert!(dag.ready_tasks().is_empty());
        assert!(!dag.is_drained());
        // Still in flight from the queue's perspective, so not stalled.
        assert!(!dag.is_stalled());
    }

    #[test]
    fn intermediate_classification() {
        let tasks: Vec<Task> = (1..=3).map(|i| make_task(i, Status::NoAttempt)).collect();
        let mut dag = hydrate(&tasks, &[(1, 2), (2, 3)]);

        dag.complete_task(1, Status::Successful);
        dag.complete_task(2, Status::Successful);
        // 3 not successful yet: nothing intermediate.
        assert!(dag.clearable_intermediates().is_empty());

        dag.complete_task(3, Status::Successful);
        // 2 has a parent and a successful child; 1 is a root, 3 a leaf.
        assert!(dag.is_intermediate(2));
        assert!(!dag.is_intermediate(1));
        assert!(!dag.is_intermediate(3));
        assert_eq!(dag.clearable_intermediates(), vec![2]);

        dag.mark_cleared(2);
        assert!(dag.clearable_intermediates().is_empty());
    }

    #[test]
    fn dont_delete_flag_excludes_from_gc() {
        let mut t2 = make_task(2, Status::Successful);
        t2.dont_delete_output_files = true;
        let tasks = vec![
            make_task(1, Status::Successful),
            t2,
            make_task(3, Status::Successful),
        ];
        let dag = hydrate(&tasks, &[(1, 2), (2, 3)]);
        assert!(dag.is_intermediate(2));
        assert!(dag.clearable_intermediates().is_empty());
    }
}
