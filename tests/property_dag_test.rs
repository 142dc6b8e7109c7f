//! Property tests for the scheduler graph.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use proptest::prelude::*;

use cascade::domain::models::dag::WorkflowDag;
use cascade::domain::models::{Status, Task, TaskSpec};

fn make_task(id: i64) -> Task {
    let mut task = TaskSpec::new(1, format!("echo {id}")).into_task(Utc::now());
    task.id = id;
    task
}

/// Random DAGs: nodes 1..=n, edges only from lower to higher ids, so
/// acyclicity holds by construction.
fn arb_dag(max_nodes: i64) -> impl Strategy<Value = (i64, Vec<(i64, i64)>)> {
    (2..=max_nodes).prop_flat_map(|n| {
        let edges = proptest::collection::vec(
            (1..=n, 1..=n).prop_filter_map("forward edges only", |(a, b)| {
                (a < b).then_some((a, b))
            }),
            0..(n as usize * 2),
        );
        (Just(n), edges)
    })
}

proptest! {
    #[test]
    fn every_acyclic_graph_drains_in_dependency_order((n, edges) in arb_dag(24)) {
        let tasks: Vec<Task> = (1..=n).map(make_task).collect();
        let mut dag = WorkflowDag::hydrate(
            tasks.iter().map(|t| (t, "stage")),
            edges.iter().copied(),
        );

        let parents: HashMap<i64, Vec<i64>> = {
            let mut m: HashMap<i64, Vec<i64>> = HashMap::new();
            for (p, c) in &edges {
                m.entry(*c).or_default().push(*p);
            }
            m
        };

        let mut completed: HashSet<i64> = HashSet::new();
        let mut order = Vec::new();
        while !dag.is_drained() {
            let ready = dag.ready_tasks();
            // Acyclic and nothing in flight: the frontier is never empty.
            prop_assert!(!ready.is_empty());
            for id in ready {
                // A ready task's parents are all complete.
                for parent in parents.get(&id).into_iter().flatten() {
                    prop_assert!(completed.contains(parent));
                }
                dag.complete_task(id, Status::Successful);
                completed.insert(id);
                order.push(id);
            }
        }

        // Every task drained exactly once.
        prop_assert_eq!(order.len() as i64, n);
        prop_assert_eq!(completed.len() as i64, n);
    }

    #[test]
    fn intermediates_always_have_parents_and_children((n, edges) in arb_dag(16)) {
        let mut tasks: Vec<Task> = (1..=n).map(make_task).collect();
        for task in &mut tasks {
            task.status = Status::Successful;
        }
        let dag = WorkflowDag::hydrate(
            tasks.iter().map(|t| (t, "stage")),
            edges.iter().copied(),
        );

        let has_parent: HashSet<i64> = edges.iter().map(|(_, c)| *c).collect();
        let has_child: HashSet<i64> = edges.iter().map(|(p, _)| *p).collect();

        for id in dag.clearable_intermediates() {
            prop_assert!(has_parent.contains(&id));
            prop_assert!(has_child.contains(&id));
        }
        // Roots and leaves are never eligible, regardless of status.
        for id in 1..=n {
            if !has_parent.contains(&id) || !has_child.contains(&id) {
                prop_assert!(!dag.is_intermediate(id));
            }
        }
    }
}
