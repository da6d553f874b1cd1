//! Dependency resolution over the step graph.
//!
//! All functions here are pure: they read step records or name graphs and
//! never touch storage.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::models::step::{StepStatus, WorkflowStep};

/// A step may run once every predecessor is COMPLETED. A step with no
/// dependencies is always eligible.
pub fn is_eligible(step: &WorkflowStep, statuses: &HashMap<String, StepStatus>) -> bool {
    step.depends_on
        .iter()
        .all(|dep| statuses.get(dep) == Some(&StepStatus::Completed))
}

/// Snapshot of `step id -> status` for a set of steps.
pub fn status_map(steps: &[WorkflowStep]) -> HashMap<String, StepStatus> {
    steps.iter().map(|s| (s.id.clone(), s.status)).collect()
}

/// Find one cycle in a `node -> dependencies` graph.
///
/// Nodes are visited in the given order so the reported cycle is stable.
/// Dependencies that are not themselves nodes are ignored.
pub fn find_cycle(graph: &[(String, Vec<String>)]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let index: HashMap<&str, usize> = graph
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (name.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; graph.len()];

    for start in 0..graph.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        // (node, next dependency to look at)
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        marks[start] = Mark::InProgress;

        while let Some(top) = stack.last_mut() {
            let (node, cursor) = *top;
            let deps = &graph[node].1;
            if cursor >= deps.len() {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            }
            top.1 += 1;
            let dep = &deps[cursor];

            let Some(&target) = index.get(dep.as_str()) else {
                continue;
            };
            match marks[target] {
                Mark::InProgress => {
                    let from = stack
                        .iter()
                        .position(|&(n, _)| n == target)
                        .unwrap_or(0);
                    return Some(
                        stack[from..]
                            .iter()
                            .map(|&(n, _)| graph[n].0.clone())
                            .collect(),
                    );
                }
                Mark::Unvisited => {
                    marks[target] = Mark::InProgress;
                    stack.push((target, 0));
                }
                Mark::Done => {}
            }
        }
    }
    None
}

/// Every step that transitively depends on `step_id`, in breadth-first order.
pub fn dependents_closure(step_id: &str, steps: &[WorkflowStep]) -> Vec<String> {
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        for dep in &step.depends_on {
            dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
        }
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut order = Vec::new();
    let mut queue: VecDeque<&str> = VecDeque::from([step_id]);
    while let Some(current) = queue.pop_front() {
        for &next in dependents.get(current).map(Vec::as_slice).unwrap_or(&[]) {
            if next != step_id && seen.insert(next) {
                order.push(next.to_string());
                queue.push_back(next);
            }
        }
    }
    order
}
