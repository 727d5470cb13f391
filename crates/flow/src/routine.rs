//! Routine graphs.
//!
//! A [`Routine`] is a validated DAG of tasks bound to one or more trigger
//! signals. Nodes are added through a [`RoutineBuilder`]; edges declare
//! sequential continuation (one successor) or fan-out (several). Only unique
//! tasks may have more than one predecessor, and their expected branch count
//! is the number of predecessors.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use crate::error::FlowError;
use crate::join::{JoinSpec, MergeRule};
use crate::task::Task;

/// Index of a task inside its routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub(crate) struct Node {
    pub task: Task,
    pub successors: Vec<NodeId>,
    /// In edge declaration order; the position is the merge slot.
    pub predecessors: Vec<NodeId>,
    pub join: Option<JoinSpec>,
}

/// A validated task graph.
#[derive(Debug)]
pub struct Routine {
    name: String,
    triggers: BTreeSet<String>,
    nodes: Vec<Node>,
    roots: Vec<NodeId>,
}

impl Routine {
    pub fn builder(name: impl Into<String>) -> RoutineBuilder {
        RoutineBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn triggers(&self) -> &BTreeSet<String> {
        &self.triggers
    }

    pub fn is_triggered_by(&self, signal: &str) -> bool {
        self.triggers.contains(signal)
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn task(&self, id: NodeId) -> &Task {
        &self.nodes[id.0].task
    }

    pub fn successors(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].successors
    }

    pub fn is_unique(&self, id: NodeId) -> bool {
        self.nodes[id.0].join.is_some()
    }

    /// Look a node up by task name.
    pub fn find(&self, task: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.task.name() == task)
            .map(NodeId)
    }

    pub(crate) fn join(&self, id: NodeId) -> Option<&JoinSpec> {
        self.nodes[id.0].join.as_ref()
    }

    /// Merge slot of the edge `from -> to`.
    pub(crate) fn slot(&self, from: NodeId, to: NodeId) -> usize {
        self.nodes[to.0]
            .predecessors
            .iter()
            .position(|p| *p == from)
            .unwrap_or(0)
    }
}

struct Draft {
    task: Task,
    merge: Option<MergeRule>,
}

/// Incrementally describes a routine; [`RoutineBuilder::build`] validates it.
pub struct RoutineBuilder {
    name: String,
    triggers: BTreeSet<String>,
    drafts: Vec<Draft>,
    edges: Vec<(NodeId, NodeId)>,
    roots: Vec<NodeId>,
}

impl RoutineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triggers: BTreeSet::new(),
            drafts: Vec::new(),
            edges: Vec::new(),
            roots: Vec::new(),
        }
    }

    /// Run this routine whenever `signal` is received.
    pub fn trigger(&mut self, signal: impl Into<String>) -> &mut Self {
        self.triggers.insert(signal.into());
        self
    }

    pub fn task(&mut self, task: Task) -> NodeId {
        self.drafts.push(Draft { task, merge: None });
        NodeId(self.drafts.len() - 1)
    }

    /// Add a unique (fan-in) task that runs once per run after all of its
    /// predecessors have arrived.
    pub fn unique(&mut self, task: Task, merge: MergeRule) -> NodeId {
        self.drafts.push(Draft {
            task,
            merge: Some(merge),
        });
        NodeId(self.drafts.len() - 1)
    }

    /// Sequential edge `from -> to`.
    pub fn then(&mut self, from: NodeId, to: NodeId) -> &mut Self {
        self.edges.push((from, to));
        self
    }

    /// Chain `ids` in order.
    pub fn sequence(&mut self, ids: &[NodeId]) -> &mut Self {
        for pair in ids.windows(2) {
            self.edges.push((pair[0], pair[1]));
        }
        self
    }

    /// Parallel branches from `from`, one per entry in `branches`.
    pub fn fan_out(&mut self, from: NodeId, branches: &[NodeId]) -> &mut Self {
        for &to in branches {
            self.edges.push((from, to));
        }
        self
    }

    /// Fan `branches` into the unique task `into`.
    pub fn fan_in(&mut self, branches: &[NodeId], into: NodeId) -> &mut Self {
        for &from in branches {
            self.edges.push((from, into));
        }
        self
    }

    /// Declare an explicit root. Without any, every node with no
    /// predecessors is a root, in insertion order.
    pub fn root(&mut self, id: NodeId) -> &mut Self {
        self.roots.push(id);
        self
    }

    pub fn build(self) -> Result<Routine, FlowError> {
        let name = self.name;
        let n = self.drafts.len();
        if n == 0 {
            return Err(FlowError::build(&name, "routine has no tasks"));
        }

        let mut seen = HashSet::new();
        for draft in &self.drafts {
            if !seen.insert(draft.task.name()) {
                return Err(FlowError::build(
                    &name,
                    format!("duplicate task name '{}'", draft.task.name()),
                ));
            }
        }

        let mut successors = vec![Vec::new(); n];
        let mut predecessors = vec![Vec::new(); n];
        let mut edge_set = HashSet::new();
        for &(from, to) in &self.edges {
            if from.0 >= n || to.0 >= n {
                return Err(FlowError::build(&name, format!("edge {from} -> {to} references an unknown node")));
            }
            if !edge_set.insert((from, to)) {
                return Err(FlowError::build(&name, format!("duplicate edge {from} -> {to}")));
            }
            successors[from.0].push(to);
            predecessors[to.0].push(from);
        }

        topological_order(&name, &successors, &predecessors)?;

        for (i, draft) in self.drafts.iter().enumerate() {
            let preds = predecessors[i].len();
            match draft.merge {
                None if preds > 1 => {
                    return Err(FlowError::build(
                        &name,
                        format!(
                            "task '{}' has {preds} predecessors but is not unique",
                            draft.task.name()
                        ),
                    ));
                }
                Some(_) if preds == 0 => {
                    return Err(FlowError::build(
                        &name,
                        format!("unique task '{}' has no predecessors", draft.task.name()),
                    ));
                }
                _ => {}
            }
        }

        let roots = if self.roots.is_empty() {
            (0..n).filter(|&i| predecessors[i].is_empty()).map(NodeId).collect()
        } else {
            let mut declared = Vec::new();
            for r in self.roots {
                if r.0 >= n {
                    return Err(FlowError::build(&name, format!("root {r} is not a node")));
                }
                if !predecessors[r.0].is_empty() {
                    return Err(FlowError::build(
                        &name,
                        format!("root '{}' has predecessors", self.drafts[r.0].task.name()),
                    ));
                }
                if !declared.contains(&r) {
                    declared.push(r);
                }
            }
            if let Some(orphan) = (0..n).find(|&i| predecessors[i].is_empty() && !declared.contains(&NodeId(i))) {
                return Err(FlowError::build(
                    &name,
                    format!("task '{}' is unreachable from the declared roots", self.drafts[orphan].task.name()),
                ));
            }
            declared
        };

        let names: Vec<&str> = self.drafts.iter().map(|d| d.task.name()).collect();
        let mut joins = Vec::with_capacity(n);
        for (i, draft) in self.drafts.iter().enumerate() {
            let Some(rule) = &draft.merge else {
                joins.push(None);
                continue;
            };
            let mut owners = HashMap::new();
            for (field, owner) in rule.owners() {
                let slot = predecessors[i]
                    .iter()
                    .position(|p| names[p.0] == owner.as_str())
                    .ok_or_else(|| {
                        FlowError::build(
                            &name,
                            format!(
                                "owner '{owner}' of field '{field}' is not a predecessor of '{}'",
                                draft.task.name()
                            ),
                        )
                    })?;
                owners.insert(field.clone(), slot);
            }
            joins.push(Some(JoinSpec {
                task: draft.task.name().to_string(),
                expected: predecessors[i].len(),
                owners,
            }));
        }

        let nodes = self
            .drafts
            .into_iter()
            .zip(successors)
            .zip(predecessors)
            .zip(joins)
            .map(|(((draft, successors), predecessors), join)| Node {
                task: draft.task,
                successors,
                predecessors,
                join,
            })
            .collect();

        Ok(Routine {
            name,
            triggers: self.triggers,
            nodes,
            roots,
        })
    }
}

/// Kahn's algorithm over node indices. Errors if the graph has a cycle.
fn topological_order(
    routine: &str,
    successors: &[Vec<NodeId>],
    predecessors: &[Vec<NodeId>],
) -> Result<Vec<NodeId>, FlowError> {
    let mut in_degree: Vec<usize> = predecessors.iter().map(Vec::len).collect();
    let mut queue: VecDeque<usize> = (0..in_degree.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted = Vec::with_capacity(in_degree.len());

    while let Some(node) = queue.pop_front() {
        sorted.push(NodeId(node));
        for next in &successors[node] {
            in_degree[next.0] -= 1;
            if in_degree[next.0] == 0 {
                queue.push_back(next.0);
            }
        }
    }

    if sorted.len() != in_degree.len() {
        let in_cycle: Vec<String> = (0..in_degree.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| NodeId(i).to_string())
            .collect();
        return Err(FlowError::build(
            routine,
            format!("cycle detected among nodes {}", in_cycle.join(", ")),
        ));
    }
    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::task::TaskScope;

    fn noop(name: &str) -> Task {
        Task::from_fn(name, |ctx: Context, _scope: TaskScope| async move { Ok(ctx) })
    }

    #[test]
    fn diamond_builds_with_expected_branches() {
        let mut b = Routine::builder("score");
        b.trigger("go");
        let prep = b.task(noop("prepare"));
        let t = b.task(noop("temp"));
        let h = b.task(noop("humidity"));
        let agg = b.unique(noop("aggregate"), MergeRule::first_non_null().owner("score", "humidity"));
        b.fan_out(prep, &[t, h]).fan_in(&[t, h], agg);

        let r = b.build().unwrap();
        assert_eq!(r.roots(), &[prep]);
        assert!(r.is_triggered_by("go"));
        let join = r.join(agg).unwrap();
        assert_eq!(join.expected, 2);
        assert_eq!(join.owners["score"], 1);
        assert_eq!(r.slot(h, agg), 1);
        assert_eq!(r.find("aggregate"), Some(agg));
    }

    #[test]
    fn cycle_is_rejected() {
        let mut b = Routine::builder("loop");
        let root = b.task(noop("root"));
        let a = b.task(noop("a"));
        let c = b.unique(noop("c"), MergeRule::first_non_null());
        b.then(root, a).then(a, c).then(c, a);
        // `a` now has two predecessors and sits on a cycle.
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("cycle"), "got: {err}");
    }

    #[test]
    fn convergence_requires_unique() {
        let mut b = Routine::builder("r");
        let a = b.task(noop("a"));
        let c = b.task(noop("c"));
        let d = b.task(noop("d"));
        b.then(a, d).then(c, d);
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("not unique"), "got: {err}");
    }

    #[test]
    fn unknown_owner_is_rejected() {
        let mut b = Routine::builder("r");
        let a = b.task(noop("a"));
        let u = b.unique(noop("u"), MergeRule::first_non_null().owner("x", "ghost"));
        b.then(a, u);
        assert!(b.build().unwrap_err().to_string().contains("ghost"));
    }

    #[test]
    fn duplicate_names_and_empty_routines_are_rejected() {
        assert!(Routine::builder("empty").build().is_err());

        let mut b = Routine::builder("dup");
        b.task(noop("a"));
        b.task(noop("a"));
        assert!(b.build().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn declared_roots_must_cover_every_entry() {
        let mut b = Routine::builder("r");
        let a = b.task(noop("a"));
        b.task(noop("b"));
        b.root(a);
        assert!(b.build().unwrap_err().to_string().contains("unreachable"));
    }
}
