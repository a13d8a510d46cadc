//! YAML loading for ensemble and member definitions
//!
//! On-disk definitions deserialize straight into the AST types in
//! [`crate::flow`] - this module adds the file/string entry points,
//! immediate structural validation, and the member-definition format:
//!
//! ```yaml
//! # ensemble
//! name: article-pipeline
//! state:
//!   schema:
//!     topic: string
//!   initial:
//!     topic: "distributed tracing"
//! flow:
//!   - member: research
//!     input: { topic: "${state.topic}" }
//!   - member: draft
//!     input: { notes: "${research.output}" }
//! output:
//!   article: "${draft.output}"
//! ```
//!
//! ```yaml
//! # member
//! name: draft
//! type: think
//! version: 1.2.0
//! config:
//!   model: large
//! schema:
//!   input: { type: object }
//! ```

use crate::error::Result;
use crate::flow::Ensemble;
use crate::member::{MemberKind, MemberMetadata};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Parse and validate an ensemble definition from YAML text.
pub fn ensemble_from_str(yaml: &str) -> Result<Ensemble> {
    let ensemble: Ensemble = serde_yaml::from_str(yaml)?;
    ensemble.validate()?;
    Ok(ensemble)
}

/// Parse and validate an ensemble definition from a file.
pub fn ensemble_from_file(path: impl AsRef<Path>) -> Result<Ensemble> {
    let content = std::fs::read_to_string(path)?;
    ensemble_from_str(&content)
}

/// Serialize an ensemble back to YAML.
pub fn ensemble_to_yaml(ensemble: &Ensemble) -> Result<String> {
    Ok(serde_yaml::to_string(ensemble)?)
}

/// On-disk member definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlMemberDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MemberKind,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<YamlMemberSchema>,
}

/// Input/output schema attachments of a member definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct YamlMemberSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl YamlMemberDef {
    pub fn from_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Convert into registry metadata.
    pub fn into_metadata(self) -> MemberMetadata {
        let (input_schema, output_schema) = self
            .schema
            .map(|s| (s.input, s.output))
            .unwrap_or((None, None));
        MemberMetadata {
            name: self.name,
            kind: self.kind,
            version: self.version,
            description: self.description,
            config: self.config,
            input_schema,
            output_schema,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowElement;
    use serde_json::json;

    #[test]
    fn test_parse_linear_ensemble() {
        let yaml = r#"
name: greet
flow:
  - member: upper
    input:
      text: "${input.name}"
  - member: join
    input:
      a: "Hello, "
      b: "${upper.output}"
output:
  msg: "${join.output}"
"#;
        let ensemble = ensemble_from_str(yaml).unwrap();
        assert_eq!(ensemble.name, "greet");
        assert_eq!(ensemble.flow.len(), 2);
        assert!(!ensemble.has_graph_constructs());
        assert_eq!(ensemble.output, Some(json!({"msg": "${join.output}"})));
    }

    #[test]
    fn test_parse_ensemble_with_blocks_and_bindings() {
        let yaml = r#"
name: crawl
flow:
  - member: seed
  - foreach:
      items: "${seed.output}"
      maxConcurrency: 3
      step:
        member: fetch
        input: { url: "${item}" }
  - while:
      condition: "${state.pending}"
      maxIterations: 10
      steps:
        - member: poll
state:
  schema:
    pending: boolean
"#;
        let ensemble = ensemble_from_str(yaml).unwrap();
        assert!(ensemble.has_graph_constructs());
        assert!(matches!(ensemble.flow[1], FlowElement::Foreach { .. }));
    }

    #[test]
    fn test_parse_rejects_invalid_structure() {
        let yaml = r#"
name: bad
flow:
  - member: a
    id: dup
  - member: b
    id: dup
"#;
        assert!(ensemble_from_str(yaml).is_err());
    }

    #[test]
    fn test_schedules_and_webhooks_parse() {
        let yaml = r#"
name: nightly
flow:
  - member: report
schedules:
  - cron: "0 3 * * *"
    input:
      window: daily
webhooks:
  - path: /hooks/report
    method: POST
    mode: trigger
    auth:
      kind: bearer
      token: shh
"#;
        let ensemble = ensemble_from_str(yaml).unwrap();
        assert_eq!(ensemble.schedules.len(), 1);
        assert_eq!(ensemble.webhooks.len(), 1);
        assert!(ensemble.schedules[0].enabled);
    }

    #[test]
    fn test_member_definition_round_trip() {
        let yaml = r#"
name: draft
type: think
version: 1.2.0
description: writes prose
config:
  model: large
schema:
  input:
    type: object
"#;
        let def = YamlMemberDef::from_str(yaml).unwrap();
        let metadata = def.into_metadata();
        assert_eq!(metadata.name, "draft");
        assert_eq!(metadata.version, "1.2.0");
        assert_eq!(metadata.config, json!({"model": "large"}));
        assert!(metadata.input_schema.is_some());
        assert!(metadata.output_schema.is_none());
    }
}
