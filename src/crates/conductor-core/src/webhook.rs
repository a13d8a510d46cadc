//! Webhook dispatcher - inbound requests to ensemble invocations
//!
//! The dispatcher owns the mapping layer only; HTTP transport is the
//! embedder's concern. A deserialized [`WebhookRequest`] is matched
//! against the bindings registered from ensemble definitions, the
//! binding's auth policy is enforced, and the result is a
//! [`WebhookAction`]:
//!
//! - `trigger` bindings turn the request body into ensemble input,
//! - `resume` bindings extract the resumption token from the URL (the
//!   trailing path segment, or a `token` query parameter) and turn the
//!   body into approval data.
//!
//! Auth failures are deliberately uniform - the error never reveals
//! whether the route, method, or credential was at fault.

use crate::error::{EngineError, Result};
use crate::flow::{Ensemble, WebhookAuth, WebhookBinding, WebhookMethod, WebhookMode};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// A transport-agnostic inbound request
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub path: String,
    pub method: WebhookMethod,
    /// Lower-cased header names
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    /// Raw body text; parsed as JSON where a body is meaningful
    pub body: String,
}

impl WebhookRequest {
    pub fn post(path: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: WebhookMethod::Post,
            headers: HashMap::new(),
            query: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    fn body_json(&self) -> Value {
        if self.body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&self.body).unwrap_or(Value::Null)
        }
    }
}

/// What the matched request should do
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookAction {
    Trigger {
        ensemble: String,
        input: Value,
        r#async: bool,
        timeout: Option<f64>,
    },
    Resume {
        ensemble: String,
        token: String,
        approval_data: Option<Value>,
    },
}

/// Registered bindings across all ensembles
#[derive(Default)]
pub struct WebhookDispatcher {
    routes: Vec<(String, WebhookBinding)>,
}

fn auth_error() -> EngineError {
    // Uniform on purpose
    EngineError::Validation("webhook request rejected".to_string())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

impl WebhookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register all webhook bindings of an ensemble.
    pub fn add_ensemble(&mut self, ensemble: &Ensemble) -> usize {
        for binding in &ensemble.webhooks {
            self.routes.push((ensemble.name.clone(), binding.clone()));
        }
        ensemble.webhooks.len()
    }

    pub fn routes(&self) -> &[(String, WebhookBinding)] {
        &self.routes
    }

    /// Match a request to a binding and produce its action.
    pub fn dispatch(&self, request: &WebhookRequest) -> Result<WebhookAction> {
        let (ensemble, binding, token) = self
            .routes
            .iter()
            .find_map(|(ensemble, binding)| {
                match_path(&binding.path, &request.path, binding.mode, &request.query)
                    .filter(|_| binding.method == request.method)
                    .map(|token| (ensemble, binding, token))
            })
            .ok_or_else(auth_error)?;

        check_auth(binding, request)?;

        match binding.mode {
            WebhookMode::Trigger => Ok(WebhookAction::Trigger {
                ensemble: ensemble.clone(),
                input: request.body_json(),
                r#async: binding.r#async,
                timeout: binding.timeout,
            }),
            WebhookMode::Resume => {
                let token = token.ok_or_else(auth_error)?;
                let approval_data = match request.body_json() {
                    Value::Null => None,
                    data => Some(data),
                };
                Ok(WebhookAction::Resume {
                    ensemble: ensemble.clone(),
                    token,
                    approval_data,
                })
            }
        }
    }
}

/// Match a binding path against a request path. In resume mode the token
/// rides as the trailing path segment or a `token` query parameter;
/// returns `Some(Some(token))` on resume matches, `Some(None)` on trigger
/// matches.
fn match_path(
    binding_path: &str,
    request_path: &str,
    mode: WebhookMode,
    query: &HashMap<String, String>,
) -> Option<Option<String>> {
    let binding_path = binding_path.trim_end_matches('/');
    let request_path = request_path.trim_end_matches('/');

    match mode {
        WebhookMode::Trigger => (binding_path == request_path).then_some(None),
        WebhookMode::Resume => {
            if binding_path == request_path {
                return query.get("token").cloned().map(Some);
            }
            let suffix = request_path.strip_prefix(binding_path)?;
            let token = suffix.strip_prefix('/')?;
            (!token.is_empty() && !token.contains('/')).then(|| Some(token.to_string()))
        }
    }
}

fn check_auth(binding: &WebhookBinding, request: &WebhookRequest) -> Result<()> {
    let Some(auth) = &binding.auth else {
        return Ok(());
    };
    match auth {
        WebhookAuth::Bearer { token } => {
            let header = request.headers.get("authorization").ok_or_else(auth_error)?;
            let presented = header.strip_prefix("Bearer ").ok_or_else(auth_error)?;
            if constant_time_eq(presented.as_bytes(), token.as_bytes()) {
                Ok(())
            } else {
                Err(auth_error())
            }
        }
        WebhookAuth::Signature { secret } => {
            let presented = request.headers.get("x-signature").ok_or_else(auth_error)?;
            let mut hasher = Sha256::new();
            hasher.update(secret.as_bytes());
            hasher.update(request.body.as_bytes());
            let expected = hasher
                .finalize()
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>();
            if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
                Ok(())
            } else {
                Err(auth_error())
            }
        }
        WebhookAuth::Basic { username, password } => {
            let header = request.headers.get("authorization").ok_or_else(auth_error)?;
            let presented = header.strip_prefix("Basic ").ok_or_else(auth_error)?;
            let expected = BASE64.encode(format!("{username}:{password}"));
            if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
                Ok(())
            } else {
                Err(auth_error())
            }
        }
    }
}
