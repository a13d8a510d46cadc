//! Graph scheduler - DAG execution with control blocks
//!
//! Executes flows containing `parallel`, `branch`, `foreach`, `while`,
//! `try`, `switch`, and `map-reduce` blocks, plus `dependsOn` edges
//! between top-level nodes.
//!
//! # Scheduling model
//!
//! Cooperative and pull-based: the planned DAG (see [`super::plan`])
//! yields runnable nodes as their dependencies reach `completed` or
//! `skipped`; runnable nodes are dispatched onto a `FuturesUnordered`
//! ready set. Within blocks, concurrency is bounded by the block's
//! `maxConcurrency`; element lists inside `branch`/`while`/`try`/`switch`
//! arms run sequentially.
//!
//! # Cancellation
//!
//! Every node runs under a [`CancelScope`] child of its enclosing block's
//! scope. `parallel{waitFor:any}` cancels losing siblings on first
//! success; `all` cancels remaining siblings on first failure; a nested
//! suspension cancels and drains everything still in flight before the
//! frame is captured. `finally` arms run under a fresh scope so they
//! execute even when their block was cancelled.

use super::plan::{assign_node_ids, plan};
use super::scope::CancelScope;
use super::{execute_step, ExecutionContext, StepOutcome};
use crate::error::{EngineError, Result};
use crate::flow::{
    BranchBlock, Ensemble, FlowElement, ForeachBlock, MapReduceBlock, ParallelBlock, SwitchBlock,
    TryBlock, WaitFor, WhileBlock,
};
use crate::member::SuspendSignal;
use crate::template::Interpolator;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::collections::HashSet;

/// How one element (step or block) concluded
#[derive(Debug, Clone)]
enum ElementOutcome {
    /// The element finished; steps carry their output value
    Completed(Option<Value>),
    Skipped,
    /// A nested member suspended
    Suspended {
        step_id: String,
        signal: SuspendSignal,
    },
}

/// How a graph walk ended
#[derive(Debug, Clone)]
pub enum GraphOutcome {
    Completed,
    /// A member suspended; `completed` holds the top-level node ids that
    /// committed before the frame was captured.
    Suspended {
        step_id: String,
        signal: SuspendSignal,
        completed: Vec<String>,
    },
}

/// DAG walker over a planned flow
pub struct GraphScheduler;

impl GraphScheduler {
    /// Execute the flow. `already_completed` seeds node statuses on
    /// resumption; pass an empty set for a fresh run.
    pub async fn run(
        ctx: &ExecutionContext,
        ensemble: &Ensemble,
        scope: &CancelScope,
        already_completed: &HashSet<String>,
    ) -> Result<GraphOutcome> {
        let plan = plan(&ensemble.flow)?;
        let node_count = plan.nodes.len();

        let mut done: HashSet<usize> = HashSet::new();
        let mut dispatched: HashSet<usize> = HashSet::new();
        for (i, node) in plan.nodes.iter().enumerate() {
            if already_completed.contains(&node.id) {
                done.insert(i);
                dispatched.insert(i);
            }
        }

        let node_scopes: Vec<CancelScope> = (0..node_count).map(|_| scope.child()).collect();
        let mut inflight: FuturesUnordered<BoxFuture<'_, (usize, Result<ElementOutcome>)>> =
            FuturesUnordered::new();

        loop {
            for index in plan.runnable(&done, &dispatched) {
                dispatched.insert(index);
                let element = &ensemble.flow[index];
                let node_id = plan.nodes[index].id.clone();
                let node_scope = node_scopes[index].clone();
                inflight.push(Box::pin(async move {
                    let outcome =
                        execute_element(ctx, ensemble, element, &node_id, &node_scope, &[]).await;
                    (index, outcome)
                }));
            }

            let Some((index, result)) = inflight.next().await else {
                break;
            };

            match result {
                Ok(ElementOutcome::Completed(_)) | Ok(ElementOutcome::Skipped) => {
                    done.insert(index);
                }
                Ok(ElementOutcome::Suspended { step_id, signal }) => {
                    for node_scope in &node_scopes {
                        node_scope.cancel();
                    }
                    while inflight.next().await.is_some() {}
                    let completed = plan
                        .nodes
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| done.contains(i))
                        .map(|(_, n)| n.id.clone())
                        .collect();
                    return Ok(GraphOutcome::Suspended {
                        step_id,
                        signal,
                        completed,
                    });
                }
                Err(error) => {
                    // Default ensemble policy: first failing node aborts
                    // the run; siblings are cancelled and drained.
                    for node_scope in &node_scopes {
                        node_scope.cancel();
                    }
                    while inflight.next().await.is_some() {}
                    return Err(error);
                }
            }
        }
        Ok(GraphOutcome::Completed)
    }
}

/// Recursive element dispatch. Boxed because blocks contain elements.
fn execute_element<'a>(
    ctx: &'a ExecutionContext,
    ensemble: &'a Ensemble,
    element: &'a FlowElement,
    node_id: &'a str,
    scope: &'a CancelScope,
    locals: &'a [(String, Value)],
) -> BoxFuture<'a, Result<ElementOutcome>> {
    Box::pin(async move {
        match element {
            FlowElement::Step(step) => {
                match execute_step(ctx, ensemble, step, node_id, scope, locals).await? {
                    StepOutcome::Completed(value) => Ok(ElementOutcome::Completed(Some(value))),
                    StepOutcome::Skipped => Ok(ElementOutcome::Skipped),
                    StepOutcome::Suspended(signal) => Ok(ElementOutcome::Suspended {
                        step_id: node_id.to_string(),
                        signal,
                    }),
                }
            }
            FlowElement::Parallel { parallel } => {
                run_parallel(ctx, ensemble, parallel, scope, locals).await
            }
            FlowElement::Branch { branch } => {
                run_branch(ctx, ensemble, branch, scope, locals).await
            }
            FlowElement::Foreach { foreach } => {
                run_foreach(ctx, ensemble, foreach, node_id, scope, locals).await
            }
            FlowElement::While { r#while } => {
                run_while(ctx, ensemble, r#while, node_id, scope, locals).await
            }
            FlowElement::Try { r#try } => run_try(ctx, ensemble, r#try, scope, locals).await,
            FlowElement::Switch { switch } => {
                run_switch(ctx, ensemble, switch, scope, locals).await
            }
            FlowElement::MapReduce { map_reduce } => {
                run_map_reduce(ctx, ensemble, map_reduce, node_id, scope, locals).await
            }
        }
    })
}

/// Run an element list in declared order, stopping at the first failure
/// or suspension. Returns the last completed value.
async fn run_sequence<'a>(
    ctx: &'a ExecutionContext,
    ensemble: &'a Ensemble,
    elements: &'a [FlowElement],
    scope: &'a CancelScope,
    locals: &'a [(String, Value)],
) -> Result<ElementOutcome> {
    let ids = assign_node_ids(elements);
    let mut last = ElementOutcome::Completed(None);
    for (element, id) in elements.iter().zip(&ids) {
        match execute_element(ctx, ensemble, element, id, scope, locals).await? {
            ElementOutcome::Suspended { step_id, signal } => {
                return Ok(ElementOutcome::Suspended { step_id, signal })
            }
            outcome @ ElementOutcome::Completed(_) => last = outcome,
            ElementOutcome::Skipped => {}
        }
    }
    Ok(last)
}

async fn run_parallel<'a>(
    ctx: &'a ExecutionContext,
    ensemble: &'a Ensemble,
    block: &'a ParallelBlock,
    scope: &'a CancelScope,
    locals: &'a [(String, Value)],
) -> Result<ElementOutcome> {
    let children = &block.children;
    if children.is_empty() {
        return Ok(ElementOutcome::Completed(None));
    }
    let ids = assign_node_ids(children);
    let child_scopes: Vec<CancelScope> = children.iter().map(|_| scope.child()).collect();
    let limit = block.max_concurrency.unwrap_or(children.len()).max(1);

    let mut inflight: FuturesUnordered<BoxFuture<'_, (usize, Result<ElementOutcome>)>> =
        FuturesUnordered::new();
    let mut next = 0usize;
    let mut last_error: Option<EngineError> = None;

    let cancel_all = |scopes: &[CancelScope]| {
        for child_scope in scopes {
            child_scope.cancel();
        }
    };

    loop {
        while next < children.len() && inflight.len() < limit {
            let index = next;
            next += 1;
            let child = &children[index];
            let child_id = ids[index].clone();
            let child_scope = child_scopes[index].clone();
            inflight.push(Box::pin(async move {
                let outcome =
                    execute_element(ctx, ensemble, child, &child_id, &child_scope, locals).await;
                (index, outcome)
            }));
        }

        let Some((_, result)) = inflight.next().await else {
            break;
        };

        match (block.wait_for, result) {
            (_, Ok(ElementOutcome::Suspended { step_id, signal })) => {
                cancel_all(&child_scopes);
                while inflight.next().await.is_some() {}
                return Ok(ElementOutcome::Suspended { step_id, signal });
            }
            (WaitFor::All, Ok(_)) => {}
            (WaitFor::All, Err(error)) => {
                // First failure cancels the siblings and fails the block.
                cancel_all(&child_scopes);
                while inflight.next().await.is_some() {}
                return Err(error);
            }
            (WaitFor::Any, Ok(ElementOutcome::Completed(value))) => {
                // First success wins; losing siblings are cancelled.
                cancel_all(&child_scopes);
                while inflight.next().await.is_some() {}
                return Ok(ElementOutcome::Completed(value));
            }
            (WaitFor::Any, Ok(ElementOutcome::Skipped)) => {}
            (WaitFor::Any, Err(error)) => {
                last_error = Some(error);
            }
        }
    }

    match (block.wait_for, last_error) {
        (WaitFor::Any, Some(error)) => Err(error),
        _ => Ok(ElementOutcome::Completed(None)),
    }
}

async fn run_branch<'a>(
    ctx: &'a ExecutionContext,
    ensemble: &'a Ensemble,
    block: &'a BranchBlock,
    scope: &'a CancelScope,
    locals: &'a [(String, Value)],
) -> Result<ElementOutcome> {
    let interpolator = Interpolator::new();
    let block_scope = ctx.block_scope(locals).await;
    let condition = interpolator.resolve(&block.condition, &block_scope)?;

    if Interpolator::truthy(&condition) {
        run_sequence(ctx, ensemble, &block.then, scope, locals).await
    } else if let Some(other) = &block.r#else {
        run_sequence(ctx, ensemble, other, scope, locals).await
    } else {
        Ok(ElementOutcome::Skipped)
    }
}

async fn run_foreach<'a>(
    ctx: &'a ExecutionContext,
    ensemble: &'a Ensemble,
    block: &'a ForeachBlock,
    node_id: &'a str,
    scope: &'a CancelScope,
    locals: &'a [(String, Value)],
) -> Result<ElementOutcome> {
    let interpolator = Interpolator::new();
    let block_scope = ctx.block_scope(locals).await;
    let items = match interpolator.resolve(&block.items, &block_scope)? {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => {
            return Err(EngineError::Validation(format!(
                "foreach items resolved to {other} instead of an array"
            )))
        }
    };

    let results = run_items(
        ctx,
        ensemble,
        &block.step,
        node_id,
        &items,
        block.max_concurrency,
        block.break_when.as_ref(),
        scope,
        locals,
    )
    .await?;

    match results {
        ItemsOutcome::Suspended { step_id, signal } => {
            Ok(ElementOutcome::Suspended { step_id, signal })
        }
        ItemsOutcome::Completed(values) => {
            let collected = Value::Array(values);
            ctx.record_output(node_id, collected.clone());
            Ok(ElementOutcome::Completed(Some(collected)))
        }
    }
}

enum ItemsOutcome {
    Completed(Vec<Value>),
    Suspended {
        step_id: String,
        signal: SuspendSignal,
    },
}

/// Shared item-dispatch machinery of `foreach` and the map phase of
/// `map-reduce`: bounded instantiation of one child per item with
/// `${item}`/`${index}` bound, optional break condition, order-preserving
/// result collection.
#[allow(clippy::too_many_arguments)]
async fn run_items<'a>(
    ctx: &'a ExecutionContext,
    ensemble: &'a Ensemble,
    child: &'a FlowElement,
    node_id: &'a str,
    items: &'a [Value],
    max_concurrency: Option<usize>,
    break_when: Option<&'a Value>,
    scope: &'a CancelScope,
    locals: &'a [(String, Value)],
) -> Result<ItemsOutcome> {
    if items.is_empty() {
        return Ok(ItemsOutcome::Completed(Vec::new()));
    }

    let interpolator = Interpolator::new();
    let limit = max_concurrency.unwrap_or(items.len()).max(1);
    let instance_scopes: Vec<CancelScope> = items.iter().map(|_| scope.child()).collect();

    let mut results: Vec<Value> = vec![Value::Null; items.len()];
    let mut inflight: FuturesUnordered<BoxFuture<'_, (usize, Result<ElementOutcome>)>> =
        FuturesUnordered::new();
    let mut next = 0usize;
    let mut stop_issuing = false;
    let mut issued = 0usize;

    loop {
        while !stop_issuing && next < items.len() && inflight.len() < limit {
            if let Some(condition) = break_when {
                let block_scope = ctx.block_scope(locals).await;
                if Interpolator::truthy(&interpolator.resolve(condition, &block_scope)?) {
                    tracing::debug!(block = %node_id, issued = next, "break condition met");
                    stop_issuing = true;
                    break;
                }
            }

            let index = next;
            next += 1;
            issued += 1;

            let mut bindings = locals.to_vec();
            bindings.push(("item".to_string(), items[index].clone()));
            bindings.push(("index".to_string(), json!(index)));

            let instance_id = format!("{node_id}[{index}]");
            let instance_scope = instance_scopes[index].clone();
            inflight.push(Box::pin(async move {
                let outcome = execute_element(
                    ctx,
                    ensemble,
                    child,
                    &instance_id,
                    &instance_scope,
                    &bindings,
                )
                .await;
                (index, outcome)
            }));
        }

        let Some((index, result)) = inflight.next().await else {
            break;
        };

        match result {
            Ok(ElementOutcome::Completed(value)) => {
                results[index] = value.unwrap_or(Value::Null);
            }
            Ok(ElementOutcome::Skipped) => {}
            Ok(ElementOutcome::Suspended { step_id, signal }) => {
                for instance_scope in &instance_scopes {
                    instance_scope.cancel();
                }
                while inflight.next().await.is_some() {}
                return Ok(ItemsOutcome::Suspended { step_id, signal });
            }
            Err(error) => {
                for instance_scope in &instance_scopes {
                    instance_scope.cancel();
                }
                while inflight.next().await.is_some() {}
                return Err(error);
            }
        }
    }

    results.truncate(issued);
    Ok(ItemsOutcome::Completed(results))
}

async fn run_while<'a>(
    ctx: &'a ExecutionContext,
    ensemble: &'a Ensemble,
    block: &'a WhileBlock,
    node_id: &'a str,
    scope: &'a CancelScope,
    locals: &'a [(String, Value)],
) -> Result<ElementOutcome> {
    let interpolator = Interpolator::new();
    let mut iterations = 0usize;

    loop {
        let block_scope = ctx.block_scope(locals).await;
        let condition = interpolator.resolve(&block.condition, &block_scope)?;
        if !Interpolator::truthy(&condition) {
            return Ok(ElementOutcome::Completed(None));
        }

        if iterations >= block.max_iterations {
            return Err(EngineError::IterationLimit {
                block: node_id.to_string(),
                max_iterations: block.max_iterations,
            });
        }
        iterations += 1;

        match run_sequence(ctx, ensemble, &block.steps, scope, locals).await? {
            ElementOutcome::Suspended { step_id, signal } => {
                return Ok(ElementOutcome::Suspended { step_id, signal })
            }
            _ => {}
        }
    }
}

async fn run_try<'a>(
    ctx: &'a ExecutionContext,
    ensemble: &'a Ensemble,
    block: &'a TryBlock,
    scope: &'a CancelScope,
    locals: &'a [(String, Value)],
) -> Result<ElementOutcome> {
    let body_scope = scope.child();
    let body = run_sequence(ctx, ensemble, &block.steps, &body_scope, locals).await;

    let outcome = match body {
        Ok(ElementOutcome::Suspended { step_id, signal }) => {
            // Suspension is not an exit: the block resumes later, so
            // neither catch nor finally runs now.
            return Ok(ElementOutcome::Suspended { step_id, signal });
        }
        Ok(outcome) => Ok(outcome),
        Err(error) => {
            // Remaining body work is cancelled before the handler runs.
            body_scope.cancel();
            match &block.catch {
                Some(catch) => {
                    let bound_error = json!({
                        "kind": error.kind(),
                        "message": error.to_string(),
                        "step": error.step(),
                    });
                    let mut catch_locals = locals.to_vec();
                    catch_locals.push(("error".to_string(), bound_error));
                    run_sequence(ctx, ensemble, catch, scope, &catch_locals).await
                }
                None => Err(error),
            }
        }
    };

    // `finally` runs on every exit, including cancellation, so it gets a
    // fresh scope rather than the (possibly cancelled) block scope.
    if let Some(finally) = &block.finally {
        let finally_scope = CancelScope::new();
        match run_sequence(ctx, ensemble, finally, &finally_scope, locals).await? {
            ElementOutcome::Suspended { step_id, signal } => {
                return Ok(ElementOutcome::Suspended { step_id, signal })
            }
            _ => {}
        }
    }

    outcome
}

async fn run_switch<'a>(
    ctx: &'a ExecutionContext,
    ensemble: &'a Ensemble,
    block: &'a SwitchBlock,
    scope: &'a CancelScope,
    locals: &'a [(String, Value)],
) -> Result<ElementOutcome> {
    let interpolator = Interpolator::new();
    let block_scope = ctx.block_scope(locals).await;
    let resolved = interpolator.resolve(&block.value, &block_scope)?;

    // Case keys compare as strings
    let key = match &resolved {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    match block.cases.get(&key) {
        Some(case) => run_sequence(ctx, ensemble, case, scope, locals).await,
        None => match &block.default {
            Some(default) => run_sequence(ctx, ensemble, default, scope, locals).await,
            None => Ok(ElementOutcome::Skipped),
        },
    }
}

async fn run_map_reduce<'a>(
    ctx: &'a ExecutionContext,
    ensemble: &'a Ensemble,
    block: &'a MapReduceBlock,
    node_id: &'a str,
    scope: &'a CancelScope,
    locals: &'a [(String, Value)],
) -> Result<ElementOutcome> {
    let interpolator = Interpolator::new();
    let block_scope = ctx.block_scope(locals).await;
    let items = match interpolator.resolve(&block.items, &block_scope)? {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => {
            return Err(EngineError::Validation(format!(
                "map-reduce items resolved to {other} instead of an array"
            )))
        }
    };

    let mapped = run_items(
        ctx,
        ensemble,
        &block.map,
        node_id,
        &items,
        block.max_concurrency,
        None,
        scope,
        locals,
    )
    .await?;

    let collected = match mapped {
        ItemsOutcome::Suspended { step_id, signal } => {
            return Ok(ElementOutcome::Suspended { step_id, signal })
        }
        ItemsOutcome::Completed(values) => Value::Array(values),
    };

    let mut reduce_locals = locals.to_vec();
    reduce_locals.push(("items".to_string(), collected));

    let reduce_id = format!("{node_id}.reduce");
    match execute_element(
        ctx,
        ensemble,
        &block.reduce,
        &reduce_id,
        scope,
        &reduce_locals,
    )
    .await?
    {
        ElementOutcome::Suspended { step_id, signal } => {
            Ok(ElementOutcome::Suspended { step_id, signal })
        }
        ElementOutcome::Completed(value) => {
            let result = value.unwrap_or(Value::Null);
            ctx.record_output(node_id, result.clone());
            Ok(ElementOutcome::Completed(Some(result)))
        }
        ElementOutcome::Skipped => Ok(ElementOutcome::Completed(None)),
    }
}
