//! Dependency resolution over a snapshot of the backlog.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use wave_core::{Issue, IssueId, IssueStatus};

/// Blocking edges keyed by the blocked issue. Ordered maps keep cycle
/// reports deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    pub blockers_by_issue: BTreeMap<IssueId, BTreeSet<IssueId>>,
}

impl DependencyGraph {
    pub fn from_issues(issues: &[Issue]) -> Self {
        let mut graph = Self::default();
        for issue in issues {
            graph.insert_issue(&issue.id, &issue.blocking_ids);
        }
        graph
    }

    pub fn insert_issue(&mut self, id: &IssueId, blockers: &[IssueId]) {
        let entry = self.blockers_by_issue.entry(id.clone()).or_default();
        entry.extend(blockers.iter().cloned());
    }

    pub fn add_edge(&mut self, issue: &IssueId, blocker: &IssueId) {
        self.blockers_by_issue
            .entry(issue.clone())
            .or_default()
            .insert(blocker.clone());
    }

    /// First cycle found, as a path that starts and ends on the same id.
    /// Ids without an entry (forward references) are leaves.
    pub fn find_cycle(&self) -> Option<Vec<IssueId>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            graph: &DependencyGraph,
            node: &IssueId,
            marks: &mut BTreeMap<IssueId, Mark>,
            path: &mut Vec<IssueId>,
        ) -> Option<Vec<IssueId>> {
            match marks.get(node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|id| id == node).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(node.clone());
                    return Some(cycle);
                }
                None => {}
            }
            marks.insert(node.clone(), Mark::Visiting);
            path.push(node.clone());
            if let Some(blockers) = graph.blockers_by_issue.get(node) {
                for blocker in blockers {
                    if let Some(cycle) = visit(graph, blocker, marks, path) {
                        return Some(cycle);
                    }
                }
            }
            path.pop();
            marks.insert(node.clone(), Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        for node in self.blockers_by_issue.keys() {
            let mut path = Vec::new();
            if let Some(cycle) = visit(self, node, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }
}

pub fn closed_ids(issues: &[Issue]) -> HashSet<IssueId> {
    issues
        .iter()
        .filter(|issue| issue.status == IssueStatus::Closed)
        .map(|issue| issue.id.clone())
        .collect()
}

/// Open issues whose blockers are all closed, ordered by priority, then
/// insertion sequence, then id.
pub fn ready_set(issues: &[Issue]) -> Vec<IssueId> {
    let closed = closed_ids(issues);
    let mut ready: Vec<&Issue> = issues
        .iter()
        .filter(|issue| issue.status == IssueStatus::Open)
        .filter(|issue| issue.dependencies_resolved(&closed))
        .collect();
    ready.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.seq.cmp(&b.seq))
            .then_with(|| a.id.cmp(&b.id))
    });
    ready.into_iter().map(|issue| issue.id.clone()).collect()
}

/// Blockers of `issue` that are not closed yet, in declared order.
pub fn unresolved_blockers(issue: &Issue, closed: &HashSet<IssueId>) -> Vec<IssueId> {
    issue
        .blocking_ids
        .iter()
        .filter(|id| !closed.contains(*id))
        .cloned()
        .collect()
}
