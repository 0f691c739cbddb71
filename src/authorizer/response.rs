//! Authorization request and response types.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use serde::{Deserialize, Serialize};

/// IAM policy language version stamped on every document.
pub const POLICY_VERSION: &str = "2012-10-17";

/// Action granted or refused by the policy statement.
pub const INVOKE_ACTION: &str = "execute-api:Invoke";

/// An inbound authorization check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationRequest {
    /// The presented credential.
    pub api_key: String,
    /// Network origin of the request.
    pub origin_address: String,
    /// Resource the policy statement applies to.
    pub resource: String,
    /// Declared request body size in bytes.
    pub content_length: Option<u64>,
}

/// Policy effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Allow => f.write_str("Allow"),
            Effect::Deny => f.write_str("Deny"),
        }
    }
}

/// A single policy statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    pub action: Vec<String>,
    pub effect: Effect,
    pub resource: Vec<String>,
}

/// IAM-style policy document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: String,
    pub statement: Vec<Statement>,
}

impl PolicyDocument {
    /// A document with one invoke statement for `resource`.
    pub fn for_resource(effect: Effect, resource: &str) -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            statement: vec![Statement {
                action: vec![INVOKE_ACTION.to_string()],
                effect,
                resource: vec![resource.to_string()],
            }],
        }
    }
}

/// The outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthorizationResponse {
    /// Client identity, empty when the key never resolved.
    pub principal_id: String,
    pub effect: Effect,
    /// Machine-readable reason code.
    pub reason: String,
    /// Human-readable explanation for denials.
    pub message: Option<String>,
    /// Values forwarded to the downstream service. The `reason` key (and
    /// `error` on denials) is always set by the authorizer and takes
    /// precedence over platform data with the same name.
    pub context: HashMap<String, serde_json::Value>,
    /// Headers the caller should attach to its response.
    pub response_headers: HashMap<String, String>,
    /// Absent when no resource was supplied.
    pub policy_document: Option<PolicyDocument>,
}

impl AuthorizationResponse {
    /// Allow the request, forwarding `context` downstream. A `reason` entry
    /// in `context` is replaced by the decision's reason code.
    pub fn allow(
        principal_id: &str,
        resource: &str,
        reason: &str,
        context: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self::build(Effect::Allow, principal_id, resource, reason, None, context)
    }

    /// Deny the request with an explanation.
    pub fn deny(principal_id: &str, resource: &str, reason: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut context = HashMap::new();
        context.insert("error".to_string(), serde_json::Value::String(message.clone()));
        Self::build(
            Effect::Deny,
            principal_id,
            resource,
            reason,
            Some(message),
            context,
        )
    }

    /// Attach response headers.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.response_headers.extend(headers);
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.effect == Effect::Allow
    }

    fn build(
        effect: Effect,
        principal_id: &str,
        resource: &str,
        reason: &str,
        message: Option<String>,
        mut context: HashMap<String, serde_json::Value>,
    ) -> Self {
        let reason_value = serde_json::Value::String(reason.to_string());
        if let Some(shadowed) = context.insert("reason".to_string(), reason_value) {
            debug!(principal_id = %principal_id, shadowed = %shadowed, "Context key 'reason' overridden by reason code");
        }
        let policy_document =
            (!resource.is_empty()).then(|| PolicyDocument::for_resource(effect, resource));

        Self {
            principal_id: principal_id.to_string(),
            effect,
            reason: reason.to_string(),
            message,
            context,
            response_headers: HashMap::new(),
            policy_document,
        }
    }
}
