//! Ensemble and flow definitions - the parsed AST the engine executes
//!
//! An [`Ensemble`] is a named workflow: shared state declarations, a flow
//! of steps and control blocks, an output projection, plus webhook and
//! schedule bindings. The engine consumes this in-memory AST; the YAML
//! parsing boundary lives in [`crate::yaml`].
//!
//! A flow entry is either a [`Step`] (an object with a `member` key) or a
//! typed control block:
//!
//! | element | semantics |
//! |---------|-----------|
//! | `parallel` | children run concurrently, `waitFor: all \| any` |
//! | `branch` | condition picks `then` or `else` |
//! | `foreach` | one child instantiation per item, bounded concurrency |
//! | `while` | loop with a mandatory iteration cap |
//! | `try` | `steps` / `catch` / `finally` |
//! | `switch` | string-compared case dispatch |
//! | `map-reduce` | bounded map phase, then a single reduce |
//!
//! A flow with only plain steps and no `dependsOn` edges is *linear* and
//! runs on the sequential executor; anything else goes through the graph
//! scheduler.

use crate::error::{EngineError, Result};
use crate::executor::retry::StepRetryPolicy;
use crate::registry::MemberRef;
use crate::scoring::ScoringPolicy;
use crate::state::StateSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Per-step cache controls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSpec {
    /// Caching on/off for this step
    pub enabled: bool,

    /// Force recomputation (refreshing the stored value on success)
    pub bypass: bool,

    /// Entry TTL in seconds
    pub ttl: Option<u64>,

    /// Tags for bulk invalidation
    pub tags: Vec<String>,
}

impl Default for CacheSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            bypass: false,
            ttl: None,
            tags: Vec::new(),
        }
    }
}

/// One step: a member invocation with its wiring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Member reference: `name` or `name@version`
    pub member: String,

    /// Explicit step id; defaults to the member name, disambiguated by
    /// occurrence (`draft`, `draft#2`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Input template, resolved against the layered context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    /// State keys this step may read
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state_use: Vec<String>,

    /// State keys this step may write
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state_set: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring: Option<ScoringPolicy>,

    /// Skip the step unless this template resolves truthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Value>,

    /// Per-invocation deadline in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<StepRetryPolicy>,

    /// Graph mode: ids of steps that must complete first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl Step {
    pub fn new(member: impl Into<String>) -> Self {
        Self {
            member: member.into(),
            id: None,
            input: None,
            state_use: Vec::new(),
            state_set: Vec::new(),
            cache: None,
            scoring: None,
            when: None,
            timeout: None,
            retry: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The member name without any version suffix.
    pub fn member_name(&self) -> &str {
        self.member.split('@').next().unwrap_or(&self.member)
    }
}

/// `parallel` completion modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitFor {
    /// All children must succeed; first failure cancels the rest
    #[default]
    All,
    /// First success wins; the rest are cancelled
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub wait_for: WaitFor,
    pub children: Vec<FlowElement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Template whose resolved value is boolean-cast
    pub condition: Value,
    pub then: Vec<FlowElement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#else: Option<Vec<FlowElement>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeachBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Template resolving to the array of items
    pub items: Value,
    /// Instantiated once per item with `${item}` / `${index}` bound
    pub step: Box<FlowElement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Stop issuing new items once this resolves truthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_when: Option<Value>,
}

fn default_max_iterations() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhileBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub condition: Value,
    pub steps: Vec<FlowElement>,
    /// Mandatory safety cap; exceeding it is a terminal error
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TryBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub steps: Vec<FlowElement>,
    /// Runs on failure with `${error}` bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch: Option<Vec<FlowElement>>,
    /// Always runs on exit - success, failure, or cancellation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finally: Option<Vec<FlowElement>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub value: Value,
    /// Case keys compare as strings against the resolved value
    pub cases: BTreeMap<String, Vec<FlowElement>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Vec<FlowElement>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapReduceBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub items: Value,
    /// Per-item phase with `${item}` / `${index}` bound
    pub map: Box<FlowElement>,
    /// Runs once with `${items}` bound to the collected map results
    pub reduce: Box<FlowElement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

/// One entry in a flow: a step or a typed control block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlowElement {
    Step(Step),
    Parallel {
        parallel: ParallelBlock,
    },
    Branch {
        branch: BranchBlock,
    },
    Foreach {
        foreach: ForeachBlock,
    },
    While {
        r#while: WhileBlock,
    },
    Try {
        r#try: TryBlock,
    },
    Switch {
        switch: SwitchBlock,
    },
    MapReduce {
        #[serde(rename = "map-reduce")]
        map_reduce: MapReduceBlock,
    },
}

impl FlowElement {
    /// Whether this element forces graph scheduling.
    pub fn is_graph_construct(&self) -> bool {
        match self {
            FlowElement::Step(step) => !step.depends_on.is_empty(),
            _ => true,
        }
    }
}

/// State declaration: schema plus initial values
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDecl {
    #[serde(default)]
    pub schema: StateSchema,
    #[serde(default)]
    pub initial: Map<String, Value>,
}

/// Webhook authentication modes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum WebhookAuth {
    /// `Authorization: Bearer <token>`
    Bearer { token: String },
    /// Hex SHA-256 digest of `secret || body` in the signature header
    Signature { secret: String },
    /// `Authorization: Basic base64(user:pass)`
    Basic { username: String, password: String },
}

/// What an inbound webhook does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookMode {
    /// Request body becomes ensemble input
    #[default]
    Trigger,
    /// URL carries a resumption token; body becomes approval data
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WebhookMethod {
    #[default]
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "GET")]
    Get,
}

/// An inbound HTTP binding for an ensemble
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookBinding {
    pub path: String,
    #[serde(default)]
    pub method: WebhookMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<WebhookAuth>,
    #[serde(default)]
    pub mode: WebhookMode,
    /// Fire-and-forget: respond before the execution finishes
    #[serde(default)]
    pub r#async: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

/// A cron-triggered dispatch of this ensemble
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDef {
    /// Standard 5-field cron expression
    pub cron: String,
    /// Input map handed to each firing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// A named workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ensemble {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateDecl>,

    /// Ensemble-level scoring policy, applied to every step that does not
    /// declare its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring: Option<ScoringPolicy>,

    pub flow: Vec<FlowElement>,

    /// Output projection template; defaults to the last step's output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhooks: Vec<WebhookBinding>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schedules: Vec<ScheduleDef>,

    /// Default per-step deadline in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout: Option<f64>,

    /// Notification routing, opaque to the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<Value>,

    /// API exposure settings, opaque to the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose: Option<Value>,
}

impl Ensemble {
    pub fn new(name: impl Into<String>, flow: Vec<FlowElement>) -> Self {
        Self {
            name: name.into(),
            description: None,
            version: None,
            state: None,
            scoring: None,
            flow,
            output: None,
            webhooks: Vec::new(),
            schedules: Vec::new(),
            default_timeout: None,
            notifications: None,
            expose: None,
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_state(mut self, state: StateDecl) -> Self {
        self.state = Some(state);
        self
    }

    /// Whether any element requires the graph scheduler.
    pub fn has_graph_constructs(&self) -> bool {
        self.flow.iter().any(FlowElement::is_graph_construct)
    }

    /// Every member reference in the flow, recursively.
    pub fn member_refs(&self) -> Vec<String> {
        let mut refs = Vec::new();
        collect_member_refs(&self.flow, &mut refs);
        refs
    }

    /// Structural validation: reference syntax, scoring policies, block
    /// shapes, duplicate ids, state keys against the schema. Runs before
    /// any step executes.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EngineError::Validation("ensemble has no name".to_string()));
        }

        for reference in self.member_refs() {
            MemberRef::parse(&reference)?;
        }

        let mut seen_ids = HashSet::new();
        validate_elements(&self.flow, self, &mut seen_ids)?;
        Ok(())
    }

    /// Declared schema, or an empty (untyped) one.
    pub fn state_schema(&self) -> StateSchema {
        self.state
            .as_ref()
            .map(|s| s.schema.clone())
            .unwrap_or_default()
    }

    pub fn initial_state(&self) -> Map<String, Value> {
        self.state
            .as_ref()
            .map(|s| s.initial.clone())
            .unwrap_or_default()
    }
}

fn collect_member_refs(elements: &[FlowElement], refs: &mut Vec<String>) {
    for element in elements {
        match element {
            FlowElement::Step(step) => refs.push(step.member.clone()),
            FlowElement::Parallel { parallel } => collect_member_refs(&parallel.children, refs),
            FlowElement::Branch { branch } => {
                collect_member_refs(&branch.then, refs);
                if let Some(other) = &branch.r#else {
                    collect_member_refs(other, refs);
                }
            }
            FlowElement::Foreach { foreach } => {
                collect_member_refs(std::slice::from_ref(&foreach.step), refs)
            }
            FlowElement::While { r#while } => collect_member_refs(&r#while.steps, refs),
            FlowElement::Try { r#try } => {
                collect_member_refs(&r#try.steps, refs);
                if let Some(catch) = &r#try.catch {
                    collect_member_refs(catch, refs);
                }
                if let Some(finally) = &r#try.finally {
                    collect_member_refs(finally, refs);
                }
            }
            FlowElement::Switch { switch } => {
                for case in switch.cases.values() {
                    collect_member_refs(case, refs);
                }
                if let Some(default) = &switch.default {
                    collect_member_refs(default, refs);
                }
            }
            FlowElement::MapReduce { map_reduce } => {
                collect_member_refs(std::slice::from_ref(&map_reduce.map), refs);
                collect_member_refs(std::slice::from_ref(&map_reduce.reduce), refs);
            }
        }
    }
}

fn validate_elements(
    elements: &[FlowElement],
    ensemble: &Ensemble,
    seen_ids: &mut HashSet<String>,
) -> Result<()> {
    let schema = ensemble.state_schema();
    let schema_declared = schema.keys().next().is_some();

    for element in elements {
        match element {
            FlowElement::Step(step) => {
                if let Some(id) = &step.id {
                    if !seen_ids.insert(id.clone()) {
                        return Err(EngineError::Validation(format!(
                            "duplicate step id '{id}'"
                        )));
                    }
                }
                if let Some(scoring) = &step.scoring {
                    scoring.validate()?;
                }
                if schema_declared {
                    for key in &step.state_set {
                        if schema.field(key).is_none() {
                            return Err(EngineError::Validation(format!(
                                "step '{}' writes undeclared state key '{key}'",
                                step.id.as_deref().unwrap_or(step.member_name())
                            )));
                        }
                    }
                }
            }
            FlowElement::Parallel { parallel } => {
                validate_elements(&parallel.children, ensemble, seen_ids)?
            }
            FlowElement::Branch { branch } => {
                validate_elements(&branch.then, ensemble, seen_ids)?;
                if let Some(other) = &branch.r#else {
                    validate_elements(other, ensemble, seen_ids)?;
                }
            }
            FlowElement::Foreach { foreach } => {
                validate_elements(std::slice::from_ref(&foreach.step), ensemble, seen_ids)?
            }
            FlowElement::While { r#while } => {
                if r#while.max_iterations == 0 {
                    return Err(EngineError::Validation(
                        "while block requires maxIterations >= 1".to_string(),
                    ));
                }
                validate_elements(&r#while.steps, ensemble, seen_ids)?
            }
            FlowElement::Try { r#try } => {
                validate_elements(&r#try.steps, ensemble, seen_ids)?;
                if let Some(catch) = &r#try.catch {
                    validate_elements(catch, ensemble, seen_ids)?;
                }
                if let Some(finally) = &r#try.finally {
                    validate_elements(finally, ensemble, seen_ids)?;
                }
            }
            FlowElement::Switch { switch } => {
                for case in switch.cases.values() {
                    validate_elements(case, ensemble, seen_ids)?;
                }
                if let Some(default) = &switch.default {
                    validate_elements(default, ensemble, seen_ids)?;
                }
            }
            FlowElement::MapReduce { map_reduce } => {
                validate_elements(std::slice::from_ref(&map_reduce.map), ensemble, seen_ids)?;
                validate_elements(std::slice::from_ref(&map_reduce.reduce), ensemble, seen_ids)?;
            }
        }
    }
    Ok(())
}

/// Assign effective step ids across a linear flow: the explicit id when
/// present, otherwise the member name disambiguated by occurrence
/// (`draft`, `draft#2`, ...).
pub fn assign_step_ids(steps: &[&Step]) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    steps
        .iter()
        .map(|step| match &step.id {
            Some(id) => id.clone(),
            None => {
                let name = step.member_name().to_string();
                let count = counts.entry(name.clone()).or_insert(0);
                *count += 1;
                if *count == 1 {
                    name
                } else {
                    format!("{name}#{count}")
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_parses_from_yaml() {
        let yaml = r#"
member: summarize@v1.2.0
input:
  text: "${input.document}"
stateUse: [style]
stateSet: [summary]
timeout: 30
dependsOn: [fetch]
"#;
        let step: Step = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.member, "summarize@v1.2.0");
        assert_eq!(step.member_name(), "summarize");
        assert_eq!(step.state_use, vec!["style"]);
        assert_eq!(step.depends_on, vec!["fetch"]);
    }

    #[test]
    fn test_flow_element_untagged_dispatch() {
        let yaml = r#"
- member: fetch
- parallel:
    waitFor: any
    children:
      - member: mirror-a
      - member: mirror-b
- while:
    condition: "${state.pending}"
    steps:
      - member: poll
"#;
        let flow: Vec<FlowElement> = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(flow[0], FlowElement::Step(_)));
        assert!(matches!(
            &flow[1],
            FlowElement::Parallel { parallel } if parallel.wait_for == WaitFor::Any
        ));
        assert!(matches!(
            &flow[2],
            FlowElement::While { r#while } if r#while.max_iterations == 1000
        ));
    }

    #[test]
    fn test_map_reduce_key_name() {
        let yaml = r#"
map-reduce:
  items: "${input.urls}"
  map:
    member: fetch
    input: { url: "${item}" }
  reduce:
    member: combine
    input: { pages: "${items}" }
  maxConcurrency: 4
"#;
        let element: FlowElement = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            &element,
            FlowElement::MapReduce { map_reduce } if map_reduce.max_concurrency == Some(4)
        ));
    }

    #[test]
    fn test_linear_detection() {
        let linear = Ensemble::new("lin", vec![FlowElement::Step(Step::new("a"))]);
        assert!(!linear.has_graph_constructs());

        let mut dependent = Step::new("b");
        dependent.depends_on = vec!["a".to_string()];
        let graph = Ensemble::new(
            "graph",
            vec![
                FlowElement::Step(Step::new("a").with_id("a")),
                FlowElement::Step(dependent),
            ],
        );
        assert!(graph.has_graph_constructs());
    }

    #[test]
    fn test_member_refs_recurse_into_blocks() {
        let ensemble = Ensemble::new(
            "refs",
            vec![
                FlowElement::Step(Step::new("a")),
                FlowElement::Try {
                    r#try: TryBlock {
                        id: None,
                        steps: vec![FlowElement::Step(Step::new("b"))],
                        catch: Some(vec![FlowElement::Step(Step::new("c"))]),
                        finally: Some(vec![FlowElement::Step(Step::new("d"))]),
                    },
                },
            ],
        );
        assert_eq!(ensemble.member_refs(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_validation_rejects_duplicate_ids() {
        let ensemble = Ensemble::new(
            "dup",
            vec![
                FlowElement::Step(Step::new("a").with_id("same")),
                FlowElement::Step(Step::new("b").with_id("same")),
            ],
        );
        assert!(matches!(
            ensemble.validate(),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_rejects_undeclared_state_writes() {
        use crate::state::StateType;
        let mut step = Step::new("writer");
        step.state_set = vec!["unknown".to_string()];
        let ensemble = Ensemble::new("typed", vec![FlowElement::Step(step)]).with_state(
            StateDecl {
                schema: StateSchema::new().with_field("known", StateType::String),
                initial: Map::new(),
            },
        );
        assert!(matches!(
            ensemble.validate(),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_step_id_assignment_disambiguates_repeats() {
        let a = Step::new("draft");
        let b = Step::new("review").with_id("gate");
        let c = Step::new("draft");
        let ids = assign_step_ids(&[&a, &b, &c]);
        assert_eq!(ids, vec!["draft", "gate", "draft#2"]);
    }

    #[test]
    fn test_ensemble_yaml_round_trip() {
        let ensemble = Ensemble::new(
            "greet",
            vec![FlowElement::Step(
                Step::new("upper").with_input(json!({"text": "${input.name}"})),
            )],
        )
        .with_output(json!({"msg": "${upper.output}"}));

        let encoded = serde_yaml::to_string(&ensemble).unwrap();
        let decoded: Ensemble = serde_yaml::from_str(&encoded).unwrap();
        assert_eq!(decoded.name, "greet");
        assert_eq!(decoded.flow.len(), 1);
        assert_eq!(decoded.output, ensemble.output);
    }
}
