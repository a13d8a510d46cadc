//! Template interpolation - `${path}` references over a layered context
//!
//! Step inputs and output projections are plain JSON values that may embed
//! `${path.to.value}` references. Resolution walks the value recursively:
//!
//! - A string that is **exactly one reference** (`"${input.user}"`) resolves
//!   to the raw referenced value, preserving its type (number, object,
//!   array, null). An unresolved whole-string reference resolves to `null`.
//! - A string with **embedded references** (`"Hello, ${input.user}!"`) has
//!   each occurrence replaced by the stringified referenced value.
//!   Unresolved references are left literal so failures stay visible.
//! - Arrays map element-wise, object values recurse (keys are literal),
//!   primitives pass through.
//!
//! References are parsed once into a small AST ([`TemplateString`] /
//! [`RefPath`]) and resolved by walking - there is no regex scanning on the
//! hot path, and malformed syntax fails with `InvalidTemplate` at parse
//! time rather than resolving to garbage.
//!
//! # Resolver chain
//!
//! [`Interpolator`] owns an ordered chain of [`ValueResolver`]s (string,
//! array, object, passthrough). Each resolver inspects the value and either
//! handles it or defers to the next. New resolvers (secrets, computed
//! values) slot into the chain without touching call sites.
//!
//! # Context layering
//!
//! A [`Scope`] resolves the first path segment in order:
//!
//! 1. local bindings (`item`, `index`, `error`, `items` inside blocks),
//! 2. `input` - the caller's frozen arguments,
//! 3. `state` - the keys this step declared in `stateUse` (and only those),
//! 4. `env` - frozen deployment bindings,
//! 5. a step id - prior outputs, addressed as `${stepId.output...}`.

use crate::error::{EngineError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// A validated, dot-separated reference path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefPath {
    segments: Vec<String>,
    raw: String,
}

impl RefPath {
    /// Parse and validate `a.b.c`. Empty paths and empty segments are
    /// invalid syntax.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(EngineError::InvalidTemplate(
                "empty reference path".to_string(),
            ));
        }
        let mut segments = Vec::new();
        for segment in raw.split('.') {
            if segment.is_empty() {
                return Err(EngineError::InvalidTemplate(format!(
                    "empty segment in reference path '{raw}'"
                )));
            }
            if segment
                .chars()
                .any(|c| c.is_whitespace() || c == '{' || c == '}' || c == '$')
            {
                return Err(EngineError::InvalidTemplate(format!(
                    "invalid character in reference path '{raw}'"
                )));
            }
            segments.push(segment.to_string());
        }
        Ok(Self {
            segments,
            raw: raw.to_string(),
        })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The original `a.b.c` text
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// One piece of a parsed template string
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Literal(String),
    Reference(RefPath),
}

/// A template string parsed into literal and reference parts
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateString {
    parts: Vec<TemplatePart>,
}

impl TemplateString {
    /// Parse a string, extracting `${...}` references.
    ///
    /// An unterminated `${` is invalid syntax. A `$` not followed by `{`
    /// is literal text.
    pub fn parse(input: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let bytes = input.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
                let close = input[i + 2..].find('}').ok_or_else(|| {
                    EngineError::InvalidTemplate(format!("unterminated reference in '{input}'"))
                })?;
                let path = &input[i + 2..i + 2 + close];
                if !literal.is_empty() {
                    parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                }
                parts.push(TemplatePart::Reference(RefPath::parse(path)?));
                i += 2 + close + 1;
            } else {
                // Safe: iterating byte-wise but pushing full chars
                let ch = input[i..].chars().next().unwrap_or('\u{fffd}');
                literal.push(ch);
                i += ch.len_utf8();
            }
        }
        if !literal.is_empty() {
            parts.push(TemplatePart::Literal(literal));
        }
        Ok(Self { parts })
    }

    /// Whether the whole string is a single `${...}` reference
    pub fn as_single_reference(&self) -> Option<&RefPath> {
        match self.parts.as_slice() {
            [TemplatePart::Reference(path)] => Some(path),
            _ => None,
        }
    }

    /// Whether the string contains any reference at all
    pub fn has_references(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, TemplatePart::Reference(_)))
    }

    pub fn parts(&self) -> &[TemplatePart] {
        &self.parts
    }
}

/// Layered resolution context for one step
#[derive(Debug, Clone, Default)]
pub struct Scope {
    /// Block-scoped bindings (`item`, `index`, `error`, `items`); innermost
    /// binding wins.
    locals: Vec<(String, Value)>,

    /// The caller's frozen arguments
    input: Value,

    /// The state keys visible to this step (already permission-filtered)
    state: Map<String, Value>,

    /// Prior step outputs by step id
    outputs: HashMap<String, Value>,

    /// Frozen deployment bindings
    env: Value,
}

impl Scope {
    pub fn new(input: Value, env: Value) -> Self {
        Self {
            locals: Vec::new(),
            input,
            state: Map::new(),
            outputs: HashMap::new(),
            env,
        }
    }

    /// Replace the visible state slice (call per step with its `stateUse`
    /// projection).
    pub fn with_state(mut self, state: Map<String, Value>) -> Self {
        self.state = state;
        self
    }

    pub fn with_outputs(mut self, outputs: HashMap<String, Value>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Push a local binding; later bindings shadow earlier ones.
    pub fn bind(mut self, name: impl Into<String>, value: Value) -> Self {
        self.locals.push((name.into(), value));
        self
    }

    /// Resolve a full reference path against the layers. `None` means
    /// unresolved (not an error - the caller decides visibility).
    pub fn lookup(&self, path: &RefPath) -> Option<Value> {
        let (head, rest) = path.segments().split_first()?;

        // Innermost local binding wins
        if let Some((_, value)) = self.locals.iter().rev().find(|(name, _)| name == head) {
            return navigate(value, rest);
        }

        match head.as_str() {
            "input" => navigate(&self.input, rest),
            "env" => navigate(&self.env, rest),
            "state" => {
                let (key, deeper) = rest.split_first()?;
                self.state.get(key).and_then(|v| navigate(v, deeper))
            }
            step_id => {
                // Step outputs are addressed as `${stepId.output}` (and
                // deeper into the produced value).
                let value = self.outputs.get(step_id)?;
                match rest.split_first() {
                    Some((field, deeper)) if field == "output" => navigate(value, deeper),
                    _ => None,
                }
            }
        }
    }
}

fn navigate(value: &Value, segments: &[String]) -> Option<Value> {
    let mut current = value;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Stringification used for embedded references: strings insert raw, other
/// values use their compact JSON form.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One link in the resolver chain. Returns `None` to defer to the next
/// resolver.
pub trait ValueResolver: Send + Sync {
    fn try_resolve(&self, value: &Value, scope: &Scope, chain: &Interpolator)
        -> Option<Result<Value>>;
}

struct StringResolver;

impl ValueResolver for StringResolver {
    fn try_resolve(
        &self,
        value: &Value,
        scope: &Scope,
        _chain: &Interpolator,
    ) -> Option<Result<Value>> {
        let Value::String(text) = value else {
            return None;
        };
        let template = match TemplateString::parse(text) {
            Ok(t) => t,
            Err(e) => return Some(Err(e)),
        };

        // Whole-string reference: preserve the referenced value's type.
        if let Some(path) = template.as_single_reference() {
            return Some(Ok(scope.lookup(path).unwrap_or(Value::Null)));
        }

        if !template.has_references() {
            return Some(Ok(value.clone()));
        }

        let mut out = String::new();
        for part in template.parts() {
            match part {
                TemplatePart::Literal(text) => out.push_str(text),
                TemplatePart::Reference(path) => match scope.lookup(path) {
                    Some(resolved) => out.push_str(&stringify(&resolved)),
                    // Unresolved embedded references stay literal
                    None => {
                        out.push_str("${");
                        out.push_str(path.raw());
                        out.push('}');
                    }
                },
            }
        }
        Some(Ok(Value::String(out)))
    }
}

struct ArrayResolver;

impl ValueResolver for ArrayResolver {
    fn try_resolve(
        &self,
        value: &Value,
        scope: &Scope,
        chain: &Interpolator,
    ) -> Option<Result<Value>> {
        let Value::Array(items) = value else {
            return None;
        };
        let resolved: Result<Vec<Value>> =
            items.iter().map(|item| chain.resolve(item, scope)).collect();
        Some(resolved.map(Value::Array))
    }
}

struct ObjectResolver;

impl ValueResolver for ObjectResolver {
    fn try_resolve(
        &self,
        value: &Value,
        scope: &Scope,
        chain: &Interpolator,
    ) -> Option<Result<Value>> {
        let Value::Object(map) = value else {
            return None;
        };
        let mut out = Map::with_capacity(map.len());
        for (key, item) in map {
            match chain.resolve(item, scope) {
                Ok(resolved) => {
                    out.insert(key.clone(), resolved);
                }
                Err(e) => return Some(Err(e)),
            }
        }
        Some(Ok(Value::Object(out)))
    }
}

struct PassthroughResolver;

impl ValueResolver for PassthroughResolver {
    fn try_resolve(
        &self,
        value: &Value,
        _scope: &Scope,
        _chain: &Interpolator,
    ) -> Option<Result<Value>> {
        Some(Ok(value.clone()))
    }
}

/// The interpolator: an ordered resolver chain over JSON values
pub struct Interpolator {
    resolvers: Vec<Box<dyn ValueResolver>>,
}

impl Interpolator {
    /// Standard chain: string, array, object, passthrough.
    pub fn new() -> Self {
        Self {
            resolvers: vec![
                Box::new(StringResolver),
                Box::new(ArrayResolver),
                Box::new(ObjectResolver),
                Box::new(PassthroughResolver),
            ],
        }
    }

    /// Prepend a custom resolver ahead of the standard chain.
    pub fn with_resolver(mut self, resolver: Box<dyn ValueResolver>) -> Self {
        self.resolvers.insert(0, resolver);
        self
    }

    /// Resolve a template value against a scope.
    pub fn resolve(&self, template: &Value, scope: &Scope) -> Result<Value> {
        for resolver in &self.resolvers {
            if let Some(result) = resolver.try_resolve(template, scope, self) {
                return result;
            }
        }
        // Unreachable with the passthrough resolver installed
        Err(EngineError::Internal(
            "no resolver handled template value".to_string(),
        ))
    }

    /// Cast a resolved value to a branch/while condition boolean.
    ///
    /// `false`, `null`, `0`, `""`, empty arrays/objects are false;
    /// everything else is true.
    pub fn truthy(value: &Value) -> bool {
        match value {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
        }
    }
}

impl Default for Interpolator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Scope {
        Scope::new(
            json!({"name": "ada", "n": 3, "nested": {"deep": [10, 20]}}),
            json!({"region": "eu-west-1"}),
        )
        .with_state(
            json!({"count": 7})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        )
        .with_outputs(HashMap::from([(
            "upper".to_string(),
            json!("ADA"),
        )]))
    }

    #[test]
    fn test_whole_string_reference_preserves_type() {
        let interp = Interpolator::new();
        let out = interp.resolve(&json!("${input.n}"), &scope()).unwrap();
        assert_eq!(out, json!(3));

        let out = interp
            .resolve(&json!("${input.nested}"), &scope())
            .unwrap();
        assert_eq!(out, json!({"deep": [10, 20]}));
    }

    #[test]
    fn test_embedded_reference_stringifies() {
        let interp = Interpolator::new();
        let out = interp
            .resolve(&json!("Hello, ${input.name}! n=${input.n}"), &scope())
            .unwrap();
        assert_eq!(out, json!("Hello, ada! n=3"));
    }

    #[test]
    fn test_unresolved_whole_string_is_null() {
        let interp = Interpolator::new();
        let out = interp.resolve(&json!("${input.missing}"), &scope()).unwrap();
        assert_eq!(out, Value::Null);
    }

    #[test]
    fn test_unresolved_embedded_stays_literal() {
        let interp = Interpolator::new();
        let out = interp
            .resolve(&json!("value: ${nothing.here}"), &scope())
            .unwrap();
        assert_eq!(out, json!("value: ${nothing.here}"));
    }

    #[test]
    fn test_step_output_reference() {
        let interp = Interpolator::new();
        let out = interp.resolve(&json!("${upper.output}"), &scope()).unwrap();
        assert_eq!(out, json!("ADA"));
    }

    #[test]
    fn test_state_and_env_layers() {
        let interp = Interpolator::new();
        assert_eq!(
            interp.resolve(&json!("${state.count}"), &scope()).unwrap(),
            json!(7)
        );
        assert_eq!(
            interp.resolve(&json!("${env.region}"), &scope()).unwrap(),
            json!("eu-west-1")
        );
    }

    #[test]
    fn test_locals_shadow_outputs() {
        let interp = Interpolator::new();
        let scoped = scope().bind("item", json!(42)).bind("index", json!(1));
        assert_eq!(interp.resolve(&json!("${item}"), &scoped).unwrap(), json!(42));
        assert_eq!(
            interp.resolve(&json!("${index}"), &scoped).unwrap(),
            json!(1)
        );
    }

    #[test]
    fn test_array_index_navigation() {
        let interp = Interpolator::new();
        assert_eq!(
            interp
                .resolve(&json!("${input.nested.deep.1}"), &scope())
                .unwrap(),
            json!(20)
        );
    }

    #[test]
    fn test_recursion_into_arrays_and_objects() {
        let interp = Interpolator::new();
        let template = json!({
            "greeting": "Hi ${input.name}",
            "values": ["${input.n}", {"inner": "${state.count}"}],
            "untouched": 99
        });
        let out = interp.resolve(&template, &scope()).unwrap();
        assert_eq!(
            out,
            json!({
                "greeting": "Hi ada",
                "values": [3, {"inner": 7}],
                "untouched": 99
            })
        );
    }

    #[test]
    fn test_no_references_is_identity() {
        let interp = Interpolator::new();
        let template = json!({"a": [1, 2.5, "plain"], "b": null, "c": true});
        assert_eq!(interp.resolve(&template, &scope()).unwrap(), template);
    }

    #[test]
    fn test_invalid_syntax_errors() {
        let interp = Interpolator::new();
        assert!(matches!(
            interp.resolve(&json!("${}"), &scope()),
            Err(EngineError::InvalidTemplate(_))
        ));
        assert!(matches!(
            interp.resolve(&json!("${a..b}"), &scope()),
            Err(EngineError::InvalidTemplate(_))
        ));
        assert!(matches!(
            interp.resolve(&json!("broken ${open"), &scope()),
            Err(EngineError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn test_dollar_without_brace_is_literal() {
        let interp = Interpolator::new();
        assert_eq!(
            interp.resolve(&json!("cost: $5"), &scope()).unwrap(),
            json!("cost: $5")
        );
    }

    #[test]
    fn test_truthiness() {
        assert!(Interpolator::truthy(&json!(true)));
        assert!(Interpolator::truthy(&json!(1)));
        assert!(Interpolator::truthy(&json!("x")));
        assert!(!Interpolator::truthy(&json!(false)));
        assert!(!Interpolator::truthy(&json!(0)));
        assert!(!Interpolator::truthy(&json!("")));
        assert!(!Interpolator::truthy(&Value::Null));
        assert!(!Interpolator::truthy(&json!([])));
    }
}
