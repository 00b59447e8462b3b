use anyhow::{anyhow, Context, Result};
use serde_json::Value as JsonValue;
use std::env;
use std::time::Duration;

use crate::capability::CapabilityKind;
use crate::manifest::InferenceSpec;

/// One fully-resolved capability invocation handed to a provider.
///
/// The dispatch layer builds this per call: actions and prompt templates are
/// addressed by capability name, data sources by their expanded URI.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityCall {
    pub kind: CapabilityKind,
    pub capability: String,
    pub uri: Option<String>,
    pub arguments: Vec<(String, JsonValue)>,
}

/// The remote side of a capability invocation.
///
/// The wire protocol and transport are deliberately unspecified here; a call
/// is an opaque remote operation that returns a value or fails. The dispatch
/// wrapper tags any failure with the capability name and source line before
/// re-raising it into the run.
pub trait CapabilityProvider: Send + Sync {
    fn invoke(&self, call: &CapabilityCall) -> Result<JsonValue>;
}

/// Capability provider that acknowledges every call without any transport.
///
/// The remote side of a capability call is out of scope here; this stand-in
/// lets a workflow run locally, echoing what would have been sent.
pub struct NullCapabilityProvider;

impl CapabilityProvider for NullCapabilityProvider {
    fn invoke(&self, call: &CapabilityCall) -> Result<JsonValue> {
        let arguments: serde_json::Map<String, JsonValue> =
            call.arguments.iter().cloned().collect();
        Ok(serde_json::json!({
            "capability": call.capability,
            "kind": call.kind.to_string(),
            "uri": call.uri,
            "arguments": arguments,
            "status": "acknowledged",
        }))
    }
}

/// What an inference provider returns for one question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceReply {
    pub answer: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A minimal blocking inference interface.
pub trait InferenceProvider: Send + Sync {
    fn respond(&self, system_prompt: &str, question: &str) -> Result<InferenceReply>;
}

/// Factory: build an inference provider from its manifest spec.
pub fn build_inference_provider(spec: &InferenceSpec) -> Result<Box<dyn InferenceProvider>> {
    Ok(Box::new(HttpInferenceProvider::from_spec(spec)?))
}

/// Placeholder used when the manifest names no inference endpoint: any
/// `Sample` call fails, everything else runs normally.
pub struct UnconfiguredInference;

impl InferenceProvider for UnconfiguredInference {
    fn respond(&self, _system_prompt: &str, _question: &str) -> Result<InferenceReply> {
        Err(anyhow!(
            "manifest does not define an inference endpoint; Sample is unavailable"
        ))
    }
}

/// HTTP-backed inference provider (blocking).
///
/// POSTs `{system, question}` as JSON and expects `{answer}` back, with
/// optional `prompt_tokens`/`completion_tokens` usage fields.
#[derive(Debug, Clone)]
pub struct HttpInferenceProvider {
    endpoint: String,
    auth_env: Option<String>,
    headers: Vec<(String, String)>,
    timeout_secs: Option<u64>,
}

impl HttpInferenceProvider {
    pub fn from_spec(spec: &InferenceSpec) -> Result<Self> {
        let endpoint = spec.endpoint.trim();
        if endpoint.is_empty() {
            return Err(anyhow!("inference spec requires a non-empty endpoint"));
        }

        Ok(Self {
            endpoint: endpoint.to_string(),
            auth_env: spec.auth_env.clone(),
            headers: spec
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            timeout_secs: spec.timeout_secs,
        })
    }
}

impl InferenceProvider for HttpInferenceProvider {
    fn respond(&self, system_prompt: &str, question: &str) -> Result<InferenceReply> {
        let mut client_builder = reqwest::blocking::Client::builder();
        if let Some(secs) = self.timeout_secs {
            client_builder = client_builder.timeout(Duration::from_secs(secs));
        }
        let client = client_builder
            .build()
            .context("failed to build http client")?;

        let mut req = client
            .post(&self.endpoint)
            .header("Content-Type", "application/json");

        for (k, v) in self.headers.iter() {
            req = req.header(k, v);
        }

        if let Some(auth_env) = &self.auth_env {
            let token = env::var(auth_env)
                .map_err(|_| anyhow!("missing required auth env var '{}'", auth_env))?;
            req = req.bearer_auth(token);
        }

        let body = serde_json::json!({ "system": system_prompt, "question": question });
        let resp = req
            .json(&body)
            .send()
            .context("inference provider request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().unwrap_or_default();
            let trimmed = text.trim();
            let trimmed = if trimmed.len() > 200 {
                &trimmed[..200]
            } else {
                trimmed
            };
            return Err(anyhow!(
                "inference provider returned non-200 status {status}: {trimmed}"
            ));
        }

        let json: JsonValue = resp
            .json()
            .context("inference provider response was not valid JSON")?;
        let answer = json
            .get("answer")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("inference provider response missing 'answer' field"))?;

        Ok(InferenceReply {
            answer: answer.to_string(),
            prompt_tokens: usage_field(&json, "prompt_tokens"),
            completion_tokens: usage_field(&json, "completion_tokens"),
        })
    }
}

fn usage_field(json: &JsonValue, key: &str) -> u64 {
    json.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
}
