//! Scoring evaluators - pluggable quality measurement
//!
//! Four standard evaluator kinds score step output against criteria:
//!
//! - **Rule** - boolean expressions over cheap text metrics
//!   (`length >= 40`, `includes("summary")`); the score is the weighted
//!   average of boolean outcomes.
//! - **NLP** - reference-based text metrics: BLEU unigram precision,
//!   ROUGE-L (LCS F1), and length ratio, averaged.
//! - **Embedding** - cosine similarity between embeddings of content and
//!   reference, normalized to [0,1]. The embedding function itself is an
//!   injected capability; the engine does not ship one.
//! - **Judge** - delegates to an LLM member and parses one score per
//!   criterion out of its JSON response.
//!
//! All evaluators return a [`ScoreReport`] with per-criterion breakdown;
//! aggregation and thresholds are applied by the controller in
//! [`super`].

use crate::error::{EngineError, Result};
use crate::member::{Member, MemberContext, MemberOutcome};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One scored criterion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    pub name: String,

    /// Relative weight in weighted-average aggregation
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Rule evaluator: boolean expression text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,

    /// NLP / Embedding evaluators: reference text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,

    /// Judge evaluator: instruction for this criterion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

fn default_weight() -> f64 {
    1.0
}

impl Criterion {
    pub fn rule(name: impl Into<String>, rule: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: 1.0,
            rule: Some(rule.into()),
            reference: None,
            prompt: None,
        }
    }

    pub fn reference(name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: 1.0,
            rule: None,
            reference: Some(reference.into()),
            prompt: None,
        }
    }
}

/// Result of evaluating content against criteria
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreReport {
    /// Aggregated score in [0,1]
    pub average: f64,

    /// Per-criterion scores in [0,1]
    pub breakdown: BTreeMap<String, f64>,

    /// The minimum threshold this report was gated against
    pub threshold: f64,

    /// Whether `average >= threshold` at gate time
    pub passed: bool,

    /// Evaluator-specific diagnostics
    pub detail: Value,
}

/// Content under evaluation, as text. Strings evaluate raw; other values
/// evaluate as their compact JSON form.
pub fn content_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The evaluator capability
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Score content per criterion. Aggregation happens in the controller.
    async fn evaluate(
        &self,
        content: &Value,
        criteria: &[Criterion],
    ) -> Result<BTreeMap<String, f64>>;
}

// ---------------------------------------------------------------------------
// Rule evaluator
// ---------------------------------------------------------------------------

/// Boolean expressions over `{length, wordCount, lineCount, includes(s)}`
pub struct RuleEvaluator {
    comparison: Regex,
    includes: Regex,
}

impl RuleEvaluator {
    pub fn new() -> Self {
        Self {
            comparison: Regex::new(
                r"^\s*(length|wordCount|lineCount)\s*(>=|<=|==|!=|>|<)\s*(\d+)\s*$",
            )
            .expect("static pattern"),
            includes: Regex::new(r#"^\s*(!)?includes\(\s*["'](.*)["']\s*\)\s*$"#)
                .expect("static pattern"),
        }
    }

    fn metric(text: &str, name: &str) -> usize {
        match name {
            "length" => text.chars().count(),
            "wordCount" => text.split_whitespace().count(),
            "lineCount" => text.lines().count(),
            _ => 0,
        }
    }

    fn check(&self, text: &str, rule: &str) -> Result<bool> {
        if let Some(caps) = self.comparison.captures(rule) {
            let actual = Self::metric(text, &caps[1]);
            let expected: usize = caps[3].parse().map_err(|_| {
                EngineError::Validation(format!("rule operand out of range: '{rule}'"))
            })?;
            return Ok(match &caps[2] {
                ">=" => actual >= expected,
                "<=" => actual <= expected,
                ">" => actual > expected,
                "<" => actual < expected,
                "==" => actual == expected,
                "!=" => actual != expected,
                _ => false,
            });
        }
        if let Some(caps) = self.includes.captures(rule) {
            let negated = caps.get(1).is_some();
            let found = text.contains(&caps[2]);
            return Ok(negated != found);
        }
        Err(EngineError::Validation(format!(
            "unparseable scoring rule: '{rule}'"
        )))
    }
}

impl Default for RuleEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Evaluator for RuleEvaluator {
    async fn evaluate(
        &self,
        content: &Value,
        criteria: &[Criterion],
    ) -> Result<BTreeMap<String, f64>> {
        let text = content_text(content);
        let mut breakdown = BTreeMap::new();
        for criterion in criteria {
            let rule = criterion.rule.as_deref().ok_or_else(|| {
                EngineError::Validation(format!(
                    "criterion '{}' has no rule expression",
                    criterion.name
                ))
            })?;
            let passed = self.check(&text, rule)?;
            breakdown.insert(criterion.name.clone(), if passed { 1.0 } else { 0.0 });
        }
        Ok(breakdown)
    }
}

// ---------------------------------------------------------------------------
// NLP evaluator
// ---------------------------------------------------------------------------

/// Reference-based text metrics: BLEU-1, ROUGE-L, length ratio, averaged
/// per criterion.
#[derive(Debug, Default)]
pub struct NlpEvaluator;

impl NlpEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Unigram precision with clipped counts.
    fn bleu_unigram(candidate: &[&str], reference: &[&str]) -> f64 {
        if candidate.is_empty() {
            return 0.0;
        }
        let mut ref_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for token in reference {
            *ref_counts.entry(token).or_default() += 1;
        }
        let mut matched = 0usize;
        let mut cand_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for token in candidate {
            let seen = cand_counts.entry(token).or_default();
            *seen += 1;
            if *seen <= ref_counts.get(token).copied().unwrap_or(0) {
                matched += 1;
            }
        }
        matched as f64 / candidate.len() as f64
    }

    /// Longest common subsequence length over tokens.
    fn lcs(a: &[&str], b: &[&str]) -> usize {
        let mut previous = vec![0usize; b.len() + 1];
        let mut current = vec![0usize; b.len() + 1];
        for token_a in a {
            for (j, token_b) in b.iter().enumerate() {
                current[j + 1] = if token_a == token_b {
                    previous[j] + 1
                } else {
                    current[j].max(previous[j + 1])
                };
            }
            std::mem::swap(&mut previous, &mut current);
        }
        previous[b.len()]
    }

    /// LCS-based F1.
    fn rouge_l(candidate: &[&str], reference: &[&str]) -> f64 {
        if candidate.is_empty() || reference.is_empty() {
            return 0.0;
        }
        let lcs = Self::lcs(candidate, reference) as f64;
        if lcs == 0.0 {
            return 0.0;
        }
        let precision = lcs / candidate.len() as f64;
        let recall = lcs / reference.len() as f64;
        2.0 * precision * recall / (precision + recall)
    }

    fn length_ratio(candidate: &str, reference: &str) -> f64 {
        let (c, r) = (candidate.chars().count(), reference.chars().count());
        if c == 0 && r == 0 {
            return 1.0;
        }
        let (lo, hi) = (c.min(r), c.max(r));
        if hi == 0 {
            0.0
        } else {
            lo as f64 / hi as f64
        }
    }

    fn score_against(candidate: &str, reference: &str) -> f64 {
        let cand_tokens: Vec<&str> = candidate.split_whitespace().collect();
        let ref_tokens: Vec<&str> = reference.split_whitespace().collect();
        let bleu = Self::bleu_unigram(&cand_tokens, &ref_tokens);
        let rouge = Self::rouge_l(&cand_tokens, &ref_tokens);
        let ratio = Self::length_ratio(candidate, reference);
        (bleu + rouge + ratio) / 3.0
    }
}

#[async_trait]
impl Evaluator for NlpEvaluator {
    async fn evaluate(
        &self,
        content: &Value,
        criteria: &[Criterion],
    ) -> Result<BTreeMap<String, f64>> {
        let text = content_text(content);
        let mut breakdown = BTreeMap::new();
        for criterion in criteria {
            let reference = criterion.reference.as_deref().ok_or_else(|| {
                EngineError::Validation(format!(
                    "criterion '{}' has no reference text",
                    criterion.name
                ))
            })?;
            breakdown.insert(
                criterion.name.clone(),
                Self::score_against(&text, reference),
            );
        }
        Ok(breakdown)
    }
}

// ---------------------------------------------------------------------------
// Embedding evaluator
// ---------------------------------------------------------------------------

/// Text-to-vector capability injected by the embedder of the process.
/// Implementations typically wrap an embedding-model client.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Cosine similarity between content and reference embeddings, normalized
/// from [-1,1] to [0,1].
pub struct EmbeddingEvaluator {
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingEvaluator {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    fn cosine(a: &[f32], b: &[f32]) -> f64 {
        if a.is_empty() || a.len() != b.len() {
            return 0.0;
        }
        let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
        let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
        let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl Evaluator for EmbeddingEvaluator {
    async fn evaluate(
        &self,
        content: &Value,
        criteria: &[Criterion],
    ) -> Result<BTreeMap<String, f64>> {
        let text = content_text(content);
        let content_vec = self.embedder.embed(&text);
        let mut breakdown = BTreeMap::new();
        for criterion in criteria {
            let reference = criterion.reference.as_deref().ok_or_else(|| {
                EngineError::Validation(format!(
                    "criterion '{}' has no reference text",
                    criterion.name
                ))
            })?;
            let reference_vec = self.embedder.embed(reference);
            let cosine = Self::cosine(&content_vec, &reference_vec);
            breakdown.insert(criterion.name.clone(), ((cosine + 1.0) / 2.0).clamp(0.0, 1.0));
        }
        Ok(breakdown)
    }
}

// ---------------------------------------------------------------------------
// Judge evaluator
// ---------------------------------------------------------------------------

/// Delegates scoring to an LLM member. The member receives the content and
/// criteria in its input and is expected to answer with one score per
/// criterion, either at the top level or under a `scores` key:
///
/// ```json
/// {"scores": {"clarity": 0.8, "accuracy": 0.95}}
/// ```
///
/// Scores are clamped to [0,1]; a criterion the judge omits scores 0.
pub struct JudgeEvaluator {
    judge: Arc<dyn Member>,
    env: Value,
}

impl JudgeEvaluator {
    pub fn new(judge: Arc<dyn Member>, env: Value) -> Self {
        Self { judge, env }
    }

    fn parse_score(data: &Value, criterion: &str) -> f64 {
        let holder = data.get("scores").unwrap_or(data);
        holder
            .get(criterion)
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0)
    }
}

#[async_trait]
impl Evaluator for JudgeEvaluator {
    async fn evaluate(
        &self,
        content: &Value,
        criteria: &[Criterion],
    ) -> Result<BTreeMap<String, f64>> {
        let input = json!({
            "content": content,
            "criteria": criteria
                .iter()
                .map(|c| json!({"name": c.name, "prompt": c.prompt}))
                .collect::<Vec<_>>(),
        });
        let ctx = MemberContext::new(
            input,
            self.env.clone(),
            crate::executor::scope::CancelScope::new(),
            "scoring-judge",
            None,
        );
        let response = self.judge.execute(ctx).await;
        let data = match response.outcome {
            MemberOutcome::Success(data) => data,
            MemberOutcome::Failure(error) => {
                return Err(EngineError::member_failure(
                    "scoring-judge",
                    "judge",
                    error.message,
                ))
            }
            MemberOutcome::Suspend(_) => {
                return Err(EngineError::Internal(
                    "judge member attempted to suspend".to_string(),
                ))
            }
        };

        let mut breakdown = BTreeMap::new();
        for criterion in criteria {
            breakdown.insert(
                criterion.name.clone(),
                Self::parse_score(&data, &criterion.name),
            );
        }
        Ok(breakdown)
    }
}
