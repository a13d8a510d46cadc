//! Graph planning - DAG construction and rejection of invalid flows
//!
//! Before the graph scheduler dispatches anything, the flow is planned:
//!
//! 1. every top-level element gets a node id (explicit ids win, steps fall
//!    back to disambiguated member names, blocks to `kind#n`),
//! 2. `dependsOn` edges are resolved to node indices; unknown targets are
//!    validation errors,
//! 3. cycles are rejected with `CyclicDependency`,
//! 4. overlapping `stateSet` declarations between elements that could run
//!    concurrently are rejected with `ConflictingWrites` - between
//!    unordered top-level nodes, between `parallel` siblings, and for
//!    `foreach`/`map-reduce` children that would write the same key from
//!    multiple instances.
//!
//! All of this happens before any member is invoked, so a flawed flow
//! fails fast with no side effects.

use crate::error::{EngineError, Result};
use crate::flow::{FlowElement, Step};
use std::collections::{HashMap, HashSet};

/// One top-level node of the planned DAG
#[derive(Debug, Clone)]
pub struct PlanNode {
    pub id: String,
    /// Index into the flow element list
    pub index: usize,
    /// Indices of nodes that must complete (or skip) first
    pub deps: Vec<usize>,
}

/// The planned top-level DAG
#[derive(Debug, Clone)]
pub struct GraphPlan {
    pub nodes: Vec<PlanNode>,
}

impl GraphPlan {
    /// Node indices whose dependencies are all in `done`.
    pub fn runnable(&self, done: &HashSet<usize>, dispatched: &HashSet<usize>) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(i, node)| {
                !dispatched.contains(i) && node.deps.iter().all(|d| done.contains(d))
            })
            .map(|(i, _)| i)
            .collect()
    }
}

fn element_kind(element: &FlowElement) -> &'static str {
    match element {
        FlowElement::Step(_) => "step",
        FlowElement::Parallel { .. } => "parallel",
        FlowElement::Branch { .. } => "branch",
        FlowElement::Foreach { .. } => "foreach",
        FlowElement::While { .. } => "while",
        FlowElement::Try { .. } => "try",
        FlowElement::Switch { .. } => "switch",
        FlowElement::MapReduce { .. } => "map-reduce",
    }
}

fn explicit_id(element: &FlowElement) -> Option<&String> {
    match element {
        FlowElement::Step(step) => step.id.as_ref(),
        FlowElement::Parallel { parallel } => parallel.id.as_ref(),
        FlowElement::Branch { branch } => branch.id.as_ref(),
        FlowElement::Foreach { foreach } => foreach.id.as_ref(),
        FlowElement::While { r#while } => r#while.id.as_ref(),
        FlowElement::Try { r#try } => r#try.id.as_ref(),
        FlowElement::Switch { switch } => switch.id.as_ref(),
        FlowElement::MapReduce { map_reduce } => map_reduce.id.as_ref(),
    }
}

/// Assign node ids across the top level of a flow.
pub fn assign_node_ids(flow: &[FlowElement]) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    flow.iter()
        .map(|element| {
            if let Some(id) = explicit_id(element) {
                return id.clone();
            }
            let base = match element {
                FlowElement::Step(step) => step.member_name().to_string(),
                other => element_kind(other).to_string(),
            };
            let count = counts.entry(base.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                base
            } else {
                format!("{base}#{count}")
            }
        })
        .collect()
}

/// All state keys an element (recursively) may write.
pub fn write_set(element: &FlowElement) -> HashSet<String> {
    fn step_writes(step: &Step, out: &mut HashSet<String>) {
        out.extend(step.state_set.iter().cloned());
    }
    fn collect(elements: &[FlowElement], out: &mut HashSet<String>) {
        for element in elements {
            match element {
                FlowElement::Step(step) => step_writes(step, out),
                FlowElement::Parallel { parallel } => collect(&parallel.children, out),
                FlowElement::Branch { branch } => {
                    collect(&branch.then, out);
                    if let Some(other) = &branch.r#else {
                        collect(other, out);
                    }
                }
                FlowElement::Foreach { foreach } => {
                    collect(std::slice::from_ref(&foreach.step), out)
                }
                FlowElement::While { r#while } => collect(&r#while.steps, out),
                FlowElement::Try { r#try } => {
                    collect(&r#try.steps, out);
                    if let Some(catch) = &r#try.catch {
                        collect(catch, out);
                    }
                    if let Some(finally) = &r#try.finally {
                        collect(finally, out);
                    }
                }
                FlowElement::Switch { switch } => {
                    for case in switch.cases.values() {
                        collect(case, out);
                    }
                    if let Some(default) = &switch.default {
                        collect(default, out);
                    }
                }
                FlowElement::MapReduce { map_reduce } => {
                    collect(std::slice::from_ref(&map_reduce.map), out);
                    collect(std::slice::from_ref(&map_reduce.reduce), out);
                }
            }
        }
    }
    let mut out = HashSet::new();
    collect(std::slice::from_ref(element), &mut out);
    out
}

/// Reject overlapping writes among elements that may run concurrently.
fn check_sibling_conflicts(
    elements: &[FlowElement],
    ids: &[String],
    concurrent: bool,
) -> Result<()> {
    if concurrent {
        for i in 0..elements.len() {
            for j in i + 1..elements.len() {
                let left = write_set(&elements[i]);
                if left.is_empty() {
                    continue;
                }
                let right = write_set(&elements[j]);
                if let Some(key) = left.intersection(&right).next() {
                    return Err(EngineError::ConflictingWrites {
                        key: key.clone(),
                        first: ids[i].clone(),
                        second: ids[j].clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Recursive conflict validation inside control blocks.
fn check_block_conflicts(element: &FlowElement, id: &str) -> Result<()> {
    match element {
        FlowElement::Step(_) => Ok(()),
        FlowElement::Parallel { parallel } => {
            let child_ids = assign_node_ids(&parallel.children);
            check_sibling_conflicts(&parallel.children, &child_ids, true)?;
            for (child, child_id) in parallel.children.iter().zip(&child_ids) {
                check_block_conflicts(child, child_id)?;
            }
            Ok(())
        }
        FlowElement::Branch { branch } => {
            for list in [Some(&branch.then), branch.r#else.as_ref()]
                .into_iter()
                .flatten()
            {
                let ids = assign_node_ids(list);
                for (child, child_id) in list.iter().zip(&ids) {
                    check_block_conflicts(child, child_id)?;
                }
            }
            Ok(())
        }
        FlowElement::Foreach { foreach } => {
            let writes = write_set(&foreach.step);
            if !writes.is_empty() && foreach.max_concurrency != Some(1) {
                let key = writes.into_iter().next().unwrap_or_default();
                return Err(EngineError::ConflictingWrites {
                    key,
                    first: format!("{id}[item]"),
                    second: format!("{id}[item]"),
                });
            }
            check_block_conflicts(&foreach.step, id)
        }
        FlowElement::While { r#while } => {
            let ids = assign_node_ids(&r#while.steps);
            for (child, child_id) in r#while.steps.iter().zip(&ids) {
                check_block_conflicts(child, child_id)?;
            }
            Ok(())
        }
        FlowElement::Try { r#try } => {
            for list in [
                Some(&r#try.steps),
                r#try.catch.as_ref(),
                r#try.finally.as_ref(),
            ]
            .into_iter()
            .flatten()
            {
                let ids = assign_node_ids(list);
                for (child, child_id) in list.iter().zip(&ids) {
                    check_block_conflicts(child, child_id)?;
                }
            }
            Ok(())
        }
        FlowElement::Switch { switch } => {
            for list in switch
                .cases
                .values()
                .chain(switch.default.as_ref().into_iter())
            {
                let ids = assign_node_ids(list);
                for (child, child_id) in list.iter().zip(&ids) {
                    check_block_conflicts(child, child_id)?;
                }
            }
            Ok(())
        }
        FlowElement::MapReduce { map_reduce } => {
            let writes = write_set(&map_reduce.map);
            if !writes.is_empty() && map_reduce.max_concurrency != Some(1) {
                let key = writes.into_iter().next().unwrap_or_default();
                return Err(EngineError::ConflictingWrites {
                    key,
                    first: format!("{id}[map]"),
                    second: format!("{id}[map]"),
                });
            }
            check_block_conflicts(&map_reduce.map, id)?;
            check_block_conflicts(&map_reduce.reduce, id)
        }
    }
}

/// Build and validate the top-level DAG.
pub fn plan(flow: &[FlowElement]) -> Result<GraphPlan> {
    let ids = assign_node_ids(flow);
    let index_of: HashMap<&str, usize> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    let mut nodes = Vec::with_capacity(flow.len());
    for (index, element) in flow.iter().enumerate() {
        let deps = match element {
            FlowElement::Step(step) => step
                .depends_on
                .iter()
                .map(|target| {
                    index_of.get(target.as_str()).copied().ok_or_else(|| {
                        EngineError::Validation(format!(
                            "step '{}' depends on unknown node '{target}'",
                            ids[index]
                        ))
                    })
                })
                .collect::<Result<Vec<usize>>>()?,
            _ => Vec::new(),
        };
        nodes.push(PlanNode {
            id: ids[index].clone(),
            index,
            deps,
        });
    }

    // Kahn's algorithm: anything left over sits on a cycle.
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.deps.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for &dep in &node.deps {
            dependents[dep].push(i);
        }
    }
    let mut queue: Vec<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut visited = 0usize;
    while let Some(node) = queue.pop() {
        visited += 1;
        for &dependent in &dependents[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push(dependent);
            }
        }
    }
    if visited != nodes.len() {
        let cyclic: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .map(|(i, _)| nodes[i].id.as_str())
            .collect();
        return Err(EngineError::CyclicDependency(cyclic.join(", ")));
    }

    // Unordered top-level pairs may run concurrently: their write sets
    // must be disjoint.
    let reachable = transitive_deps(&nodes);
    for i in 0..nodes.len() {
        for j in i + 1..nodes.len() {
            let ordered = reachable[i].contains(&j) || reachable[j].contains(&i);
            if ordered {
                continue;
            }
            let left = write_set(&flow[i]);
            if left.is_empty() {
                continue;
            }
            let right = write_set(&flow[j]);
            if let Some(key) = left.intersection(&right).next() {
                return Err(EngineError::ConflictingWrites {
                    key: key.clone(),
                    first: nodes[i].id.clone(),
                    second: nodes[j].id.clone(),
                });
            }
        }
    }

    for (element, id) in flow.iter().zip(&ids) {
        check_block_conflicts(element, id)?;
    }

    Ok(GraphPlan { nodes })
}

/// For each node, the set of nodes transitively reachable through deps
/// (in either role: ancestor sets).
fn transitive_deps(nodes: &[PlanNode]) -> Vec<HashSet<usize>> {
    let mut ancestors: Vec<HashSet<usize>> = vec![HashSet::new(); nodes.len()];
    // Nodes are acyclic here; iterate until stable (small graphs).
    let mut changed = true;
    while changed {
        changed = false;
        for i in 0..nodes.len() {
            let mut additions: HashSet<usize> = HashSet::new();
            for &dep in &nodes[i].deps {
                if ancestors[i].insert(dep) {
                    changed = true;
                }
                additions.extend(ancestors[dep].iter().copied());
            }
            for a in additions {
                if ancestors[i].insert(a) {
                    changed = true;
                }
            }
        }
    }
    ancestors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{ForeachBlock, ParallelBlock, WaitFor};
    use serde_json::json;

    fn step(member: &str) -> Step {
        Step::new(member)
    }

    fn step_with_deps(member: &str, deps: &[&str]) -> Step {
        let mut s = Step::new(member).with_id(member);
        s.depends_on = deps.iter().map(|d| d.to_string()).collect();
        s
    }

    #[test]
    fn test_plan_assigns_ids_and_deps() {
        let flow = vec![
            FlowElement::Step(step("fetch").with_id("fetch")),
            FlowElement::Step(step_with_deps("render", &["fetch"])),
        ];
        let plan = plan(&flow).unwrap();
        assert_eq!(plan.nodes[1].deps, vec![0]);
        assert_eq!(plan.nodes[0].id, "fetch");
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let flow = vec![FlowElement::Step(step_with_deps("a", &["ghost"]))];
        assert!(matches!(
            plan(&flow),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let flow = vec![
            FlowElement::Step(step_with_deps("a", &["b"])),
            FlowElement::Step(step_with_deps("b", &["a"])),
        ];
        assert!(matches!(
            plan(&flow),
            Err(EngineError::CyclicDependency(_))
        ));
    }

    #[test]
    fn test_unordered_nodes_with_same_write_rejected() {
        let mut a = step("a");
        a.state_set = vec!["k".to_string()];
        let mut b = step("b");
        b.state_set = vec!["k".to_string()];
        let flow = vec![FlowElement::Step(a), FlowElement::Step(b)];
        assert!(matches!(
            plan(&flow),
            Err(EngineError::ConflictingWrites { .. })
        ));
    }

    #[test]
    fn test_ordered_nodes_may_share_write_key() {
        let mut a = step("a");
        a.id = Some("a".to_string());
        a.state_set = vec!["k".to_string()];
        let mut b = step_with_deps("b", &["a"]);
        b.state_set = vec!["k".to_string()];
        let flow = vec![FlowElement::Step(a), FlowElement::Step(b)];
        assert!(plan(&flow).is_ok());
    }

    #[test]
    fn test_parallel_sibling_conflict_rejected() {
        let mut left = step("left");
        left.state_set = vec!["shared".to_string()];
        let mut right = step("right");
        right.state_set = vec!["shared".to_string()];
        let flow = vec![FlowElement::Parallel {
            parallel: ParallelBlock {
                id: None,
                wait_for: WaitFor::All,
                children: vec![FlowElement::Step(left), FlowElement::Step(right)],
                max_concurrency: None,
            },
        }];
        assert!(matches!(
            plan(&flow),
            Err(EngineError::ConflictingWrites { .. })
        ));
    }

    #[test]
    fn test_foreach_writer_rejected_unless_serialized() {
        let mut child = step("worker");
        child.state_set = vec!["acc".to_string()];
        let make = |max_concurrency| {
            vec![FlowElement::Foreach {
                foreach: ForeachBlock {
                    id: None,
                    items: json!("${input.items}"),
                    step: Box::new(FlowElement::Step(child.clone())),
                    max_concurrency,
                    break_when: None,
                },
            }]
        };
        assert!(matches!(
            plan(&make(None)),
            Err(EngineError::ConflictingWrites { .. })
        ));
        assert!(plan(&make(Some(1))).is_ok());
    }

    #[test]
    fn test_runnable_frontier() {
        let flow = vec![
            FlowElement::Step(step("a").with_id("a")),
            FlowElement::Step(step_with_deps("b", &["a"])),
            FlowElement::Step(step("c").with_id("c")),
        ];
        let plan = plan(&flow).unwrap();
        let done = HashSet::new();
        let dispatched = HashSet::new();
        let runnable = plan.runnable(&done, &dispatched);
        assert_eq!(runnable, vec![0, 2]);

        let done: HashSet<usize> = [0].into();
        let dispatched: HashSet<usize> = [0, 2].into();
        assert_eq!(plan.runnable(&done, &dispatched), vec![1]);
    }
}
