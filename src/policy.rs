//! Scope policy for MCP traffic.
//!
//! Required scopes are configured per JSON-RPC method, per namespace (the part
//! of the method before the first `/`), and optionally per target nested under
//! a method (the tool name of a `tools/call`, the URI of a `resources/read`).
//!
//! Configuration accepts three shapes and normalizes all of them into
//! [`MethodScopes`] while deserializing:
//!
//! ```yaml
//! required_scopes:
//!   tools/list: "tools.read, tools.list"   # delimited string
//!   resources: [resources.read]            # list, namespace fallback
//!   tools/call:                            # nested targets
//!     scopes: tools.write
//!     tools:
//!       delete_repo: admin
//!   "*": mcp.basic                         # wildcard
//! ```
//!
//! A token is allowed when it holds ANY of the resolved scopes. No resolved
//! scopes means no restriction.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Config key that applies when neither method nor namespace matched
pub const WILDCARD: &str = "*";

/// Normalized required scopes for one method or namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawScopeSpec")]
pub struct MethodScopes {
    /// Scopes required for the method itself
    pub scopes: BTreeSet<String>,
    /// Scopes required when the call targets a named sub-resource
    pub targets: HashMap<String, BTreeSet<String>>,
}

/// Shapes accepted in configuration
#[derive(Deserialize)]
#[serde(untagged)]
enum RawScopeSpec {
    Delimited(String),
    List(Vec<String>),
    Nested {
        #[serde(default)]
        scopes: Option<RawScopeList>,
        #[serde(default, alias = "tools", alias = "resources", alias = "prompts")]
        targets: HashMap<String, RawScopeList>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawScopeList {
    Delimited(String),
    List(Vec<String>),
}

impl From<RawScopeList> for BTreeSet<String> {
    fn from(raw: RawScopeList) -> Self {
        match raw {
            RawScopeList::Delimited(s) => split_scopes(&s),
            RawScopeList::List(items) => items.iter().flat_map(|s| split_scopes(s)).collect(),
        }
    }
}

impl From<RawScopeSpec> for MethodScopes {
    fn from(raw: RawScopeSpec) -> Self {
        match raw {
            RawScopeSpec::Delimited(s) => Self {
                scopes: split_scopes(&s),
                targets: HashMap::new(),
            },
            RawScopeSpec::List(items) => Self {
                scopes: RawScopeList::List(items).into(),
                targets: HashMap::new(),
            },
            RawScopeSpec::Nested { scopes, targets } => Self {
                scopes: scopes.map(Into::into).unwrap_or_default(),
                targets: targets.into_iter().map(|(k, v)| (k, v.into())).collect(),
            },
        }
    }
}

/// Split a space- or comma-delimited scope string
pub fn split_scopes(value: &str) -> BTreeSet<String> {
    value
        .split([' ', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Outcome of a policy evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Human-readable explanation
    pub reason: String,
}

impl PolicyDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }
}

/// ANY-of scope check
pub fn evaluate(required: &BTreeSet<String>, token_scopes: &BTreeSet<String>) -> PolicyDecision {
    if required.is_empty() {
        return PolicyDecision::allow("no scopes required");
    }
    if let Some(granted) = required.intersection(token_scopes).next() {
        return PolicyDecision::allow(format!("granted by scope {granted}"));
    }
    let required: Vec<&str> = required.iter().map(String::as_str).collect();
    PolicyDecision {
        allowed: false,
        reason: format!(
            "insufficient scope: requires any of [{}]",
            required.join(", ")
        ),
    }
}

/// Required-scope table built from configuration
#[derive(Debug, Clone, Default)]
pub struct ScopePolicy {
    by_method: HashMap<String, MethodScopes>,
    wildcard: BTreeSet<String>,
}

impl ScopePolicy {
    /// Build from the `required_scopes` config section
    pub fn from_config(required: &HashMap<String, MethodScopes>) -> Self {
        let mut by_method = required.clone();
        let wildcard = by_method
            .remove(WILDCARD)
            .map(|entry| entry.scopes)
            .unwrap_or_default();
        Self {
            by_method,
            wildcard,
        }
    }

    /// Whether any scope requirement is configured at all
    pub fn is_empty(&self) -> bool {
        self.by_method.is_empty() && self.wildcard.is_empty()
    }

    /// Resolve the scopes required for `method`, optionally targeting `target`
    pub fn required_for(&self, method: &str, target: Option<&str>) -> &BTreeSet<String> {
        let entry = self.by_method.get(method).or_else(|| {
            method
                .split_once('/')
                .and_then(|(namespace, _)| self.by_method.get(namespace))
        });

        match entry {
            Some(entry) => target
                .and_then(|t| entry.targets.get(t))
                .unwrap_or(&entry.scopes),
            None => &self.wildcard,
        }
    }

    /// Evaluate every call in a JSON-RPC body; all must be allowed
    pub fn authorize(&self, calls: &[RpcEnvelope], token_scopes: &BTreeSet<String>) -> PolicyDecision {
        for call in calls {
            let required = self.required_for(&call.method, call.target());
            let decision = evaluate(required, token_scopes);
            if !decision.allowed {
                return PolicyDecision {
                    allowed: false,
                    reason: format!("{}: {}", call.method, decision.reason),
                };
            }
        }
        PolicyDecision::allow("all calls permitted")
    }

    /// Rows of `(key, target, scopes)` for display
    pub fn table(&self) -> Vec<(String, Option<String>, Vec<String>)> {
        let mut rows = Vec::new();
        for (method, entry) in &self.by_method {
            rows.push((method.clone(), None, entry.scopes.iter().cloned().collect()));
            for (target, scopes) in &entry.targets {
                rows.push((
                    method.clone(),
                    Some(target.clone()),
                    scopes.iter().cloned().collect(),
                ));
            }
        }
        if !self.wildcard.is_empty() {
            rows.push((
                WILDCARD.to_string(),
                None,
                self.wildcard.iter().cloned().collect(),
            ));
        }
        rows.sort();
        rows
    }
}

/// Malformed JSON-RPC body
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Not JSON
    #[error("invalid JSON-RPC body: {0}")]
    Json(#[from] serde_json::Error),
    /// JSON but not a request object or batch of them
    #[error("invalid JSON-RPC body: {0}")]
    Shape(&'static str),
}

/// The parts of a JSON-RPC request the policy looks at
#[derive(Debug, Clone, Deserialize)]
pub struct RpcEnvelope {
    /// Method name
    pub method: String,
    /// Parameters, opaque except for target lookup
    #[serde(default)]
    pub params: Option<Value>,
    /// Request id (absent for notifications)
    #[serde(default)]
    pub id: Option<Value>,
}

impl RpcEnvelope {
    /// Named sub-resource of the call (`params.name`, else `params.uri`)
    pub fn target(&self) -> Option<&str> {
        let params = self.params.as_ref()?;
        params
            .get("name")
            .or_else(|| params.get("uri"))
            .and_then(Value::as_str)
    }
}

/// Parse a request body into the calls it carries.
///
/// An empty body yields no calls. Responses sent by the client (objects
/// without `method`) are skipped.
pub fn parse_envelopes(body: &[u8]) -> Result<Vec<RpcEnvelope>, EnvelopeError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let value: Value = serde_json::from_slice(body)?;
    let items = match value {
        Value::Array(items) if items.is_empty() => return Err(EnvelopeError::Shape("empty batch")),
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        _ => return Err(EnvelopeError::Shape("expected an object or array")),
    };

    let mut calls = Vec::with_capacity(items.len());
    for item in items {
        let Value::Object(map) = &item else {
            return Err(EnvelopeError::Shape("batch entries must be objects"));
        };
        if !map.contains_key("method") {
            continue;
        }
        calls.push(serde_json::from_value(item)?);
    }
    Ok(calls)
}
