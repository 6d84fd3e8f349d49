//! Task selection.
//!
//! The scheduler holds the most recent tracker listing (already in
//! dotted-child order), gates on dependency closure, orders by priority
//! with the listing position as the stable tie-break, and enforces the
//! parallel admission rule: no selected task may transitively depend on
//! anything currently in flight.
//!
//! Listings contain only workable tasks, so a dependency id absent from
//! the snapshot is taken as closed; one present in the snapshot is not yet
//! closed and gates its dependents.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::tracker::Task;

#[derive(Default)]
pub struct Scheduler {
    /// Last tracker listing, in listing order.
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    /// Ids claimed by a worker and not yet closed or released.
    in_flight: HashSet<String>,
    /// Ids that failed this session under the `skip` policy.
    failed: HashSet<String>,
    /// Members of dependency cycles; never selected.
    cycle_members: HashSet<String>,
    /// Cycles already logged this session.
    reported_cycles: HashSet<String>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot with a fresh tracker listing and re-run cycle
    /// detection. Each distinct cycle is logged once per session.
    pub fn refresh(&mut self, tasks: Vec<Task>) {
        self.index = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        self.tasks = tasks;
        self.detect_cycles();
        self.in_flight.retain(|id| self.index.contains_key(id));
    }

    pub fn open_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn cycle_members(&self) -> &HashSet<String> {
        &self.cycle_members
    }

    /// A dependency is satisfied when it is no longer in the open listing.
    fn dependency_closed(&self, dep: &str) -> bool {
        !self.index.contains_key(dep)
    }

    fn is_eligible(&self, task: &Task, label_filter: Option<&str>) -> bool {
        if !task.status.is_workable() {
            return false;
        }
        if self.in_flight.contains(&task.id)
            || self.failed.contains(&task.id)
            || self.cycle_members.contains(&task.id)
        {
            return false;
        }
        if let Some(label) = label_filter {
            if !task.labels.iter().any(|l| l == label) {
                return false;
            }
        }
        task.dependencies.iter().all(|d| self.dependency_closed(d))
    }

    /// Eligible tasks ordered by `(priority asc, listing position asc)`.
    pub fn eligible(&self, label_filter: Option<&str>) -> Vec<&Task> {
        let mut out: Vec<(usize, &Task)> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| self.is_eligible(t, label_filter))
            .collect();
        out.sort_by_key(|(pos, t)| (t.priority, *pos));
        out.into_iter().map(|(_, t)| t).collect()
    }

    /// Transitive dependency closure of a task, following edges inside the
    /// snapshot.
    fn transitive_deps(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            let Some(&pos) = self.index.get(&current) else {
                continue;
            };
            for dep in &self.tasks[pos].dependencies {
                if seen.insert(dep.clone()) {
                    stack.push(dep.clone());
                }
            }
        }
        seen
    }

    /// Claim up to `k` tasks for execution. Greedy over the ordered
    /// eligible list; a task whose transitive dependency closure touches
    /// anything in flight (including tasks claimed earlier in this call)
    /// is passed over, so no two workers ever race on a dependency edge.
    pub fn claim(&mut self, k: usize) -> Vec<Task> {
        let mut selected: Vec<Task> = Vec::new();
        let candidates: Vec<Task> = self.eligible(None).into_iter().cloned().collect();

        for task in candidates {
            if selected.len() >= k {
                break;
            }
            let deps = self.transitive_deps(&task.id);
            if deps.iter().any(|d| self.in_flight.contains(d)) {
                continue;
            }
            self.in_flight.insert(task.id.clone());
            selected.push(task);
        }
        selected
    }

    /// Return a claimed task to the pool (retry later).
    pub fn release(&mut self, id: &str) {
        self.in_flight.remove(id);
    }

    /// Record a closure observed through the tracker.
    pub fn mark_closed(&mut self, id: &str) {
        self.in_flight.remove(id);
        if let Some(&pos) = self.index.get(id) {
            self.tasks[pos].status = crate::tracker::TaskStatus::Closed;
            self.tasks.remove(pos);
            self.index = self
                .tasks
                .iter()
                .enumerate()
                .map(|(i, t)| (t.id.clone(), i))
                .collect();
        }
    }

    /// Mark a task failed for this session; it will not be selected again
    /// until the next session.
    pub fn mark_failed(&mut self, id: &str) {
        self.in_flight.remove(id);
        self.failed.insert(id.to_string());
    }

    /// DFS colouring over the snapshot's dependency edges. Gray-hit nodes
    /// and everything on the stack above them form a cycle.
    fn detect_cycles(&mut self) {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let n = self.tasks.len();
        let mut color = vec![Color::White; n];
        let mut members: HashSet<usize> = HashSet::new();

        fn visit(
            node: usize,
            tasks: &[Task],
            index: &HashMap<String, usize>,
            color: &mut [Color],
            stack: &mut Vec<usize>,
            members: &mut HashSet<usize>,
        ) {
            color[node] = Color::Gray;
            stack.push(node);
            for dep in &tasks[node].dependencies {
                let Some(&next) = index.get(dep) else {
                    continue;
                };
                match color[next] {
                    Color::White => visit(next, tasks, index, color, stack, members),
                    Color::Gray => {
                        // Everything from `next` to the top of the stack is
                        // on the cycle.
                        if let Some(start) = stack.iter().position(|&s| s == next) {
                            for &member in &stack[start..] {
                                members.insert(member);
                            }
                        }
                    }
                    Color::Black => {}
                }
            }
            stack.pop();
            color[node] = Color::Black;
        }

        let mut stack = Vec::new();
        for node in 0..n {
            if color[node] == Color::White {
                visit(
                    node,
                    &self.tasks,
                    &self.index,
                    &mut color,
                    &mut stack,
                    &mut members,
                );
            }
        }

        self.cycle_members = members
            .iter()
            .map(|&i| self.tasks[i].id.clone())
            .collect();

        if !self.cycle_members.is_empty() {
            let mut ids: Vec<&str> = self.cycle_members.iter().map(String::as_str).collect();
            ids.sort();
            let key = ids.join(",");
            if self.reported_cycles.insert(key.clone()) {
                warn!(
                    "dependency cycle detected; tasks blocked until the cycle is broken: {}",
                    key
                );
            }
        }
    }
}
