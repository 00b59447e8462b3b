use anyhow::{anyhow, Context, Result};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::capability::{expand_template, Capability, CapabilityKind};
use crate::events::EventSink;
use crate::manifest::CapabilityManifest;
use crate::prompt;
use crate::provider::{CapabilityCall, CapabilityProvider};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("duplicate capability name '{capability}' in provider namespace '{provider}'")]
    DuplicateCapability {
        provider: String,
        capability: String,
    },

    #[error("unknown provider namespace '{0}'")]
    UnknownProvider(String),

    #[error("unknown capability '{provider}.{capability}'")]
    UnknownCapability {
        provider: String,
        capability: String,
    },
}

/// A capability invocation failure, tagged with where it happened.
#[derive(Debug, Error)]
#[error("capability {provider}.{capability}() failed at line {line}: {source}")]
pub struct InvokeError {
    pub provider: String,
    pub capability: String,
    pub line: u32,
    #[source]
    pub source: anyhow::Error,
}

/// Wraps one bound capability: performs the remote call and emits the
/// begin/end event pair that brackets it.
pub struct InvocationWrapper {
    provider: String,
    capability: Capability,
    remote: Arc<dyn CapabilityProvider>,
    sink: EventSink,
}

impl std::fmt::Debug for InvocationWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationWrapper")
            .field("provider", &self.provider)
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

impl InvocationWrapper {
    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    /// Perform the call declared at `line` with already-resolved arguments.
    ///
    /// Two stream writes bracket the remote call; elapsed time is wall-clock
    /// across the whole delegation. A provider failure is reported through the
    /// end event and then re-raised tagged with capability name and line.
    pub fn execute(
        &self,
        line: u32,
        arguments: Vec<(String, JsonValue)>,
    ) -> Result<JsonValue, InvokeError> {
        let started = Instant::now();
        self.sink.update(
            Some(line),
            format!("Beginning {}.{}()", self.provider, self.capability.name),
            Some(self.capability.description.clone()),
        );

        let call = self.build_call(arguments);
        tracing::debug!(
            provider = %self.provider,
            capability = %self.capability.name,
            line,
            "delegating capability call"
        );
        let result = self.remote.invoke(&call);
        let secs = started.elapsed().as_secs_f64();

        match result {
            Ok(value) => {
                self.sink.update(
                    Some(line),
                    format!("Returned from {}.{}()", self.provider, self.capability.name),
                    Some(format!(
                        "{}\nTime: {secs:.2} seconds.",
                        summarize_value(&value)
                    )),
                );
                Ok(value)
            }
            Err(source) => {
                self.sink.update(
                    Some(line),
                    format!("Returned from {}.{}()", self.provider, self.capability.name),
                    Some(format!("Call failed: {source}\nTime: {secs:.2} seconds.")),
                );
                Err(InvokeError {
                    provider: self.provider.clone(),
                    capability: self.capability.name.clone(),
                    line,
                    source,
                })
            }
        }
    }

    fn build_call(&self, arguments: Vec<(String, JsonValue)>) -> CapabilityCall {
        let uri = match (self.capability.kind, self.capability.uri_template.as_deref()) {
            (CapabilityKind::DataSource, Some(template)) => {
                Some(expand_template(template, &arguments))
            }
            _ => None,
        };
        CapabilityCall {
            kind: self.capability.kind,
            capability: self.capability.name.clone(),
            uri,
            arguments,
        }
    }
}

/// Per-provider namespace of callable bindings, built once at setup time and
/// read-only afterwards.
pub struct DispatchTable {
    sink: EventSink,
    providers: BTreeMap<String, BTreeMap<String, Arc<InvocationWrapper>>>,
}

impl DispatchTable {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            providers: BTreeMap::new(),
        }
    }

    /// Register `(provider, descriptor.name)`. A name already bound in that
    /// namespace is a setup error, never a silent overwrite.
    pub fn bind(
        &mut self,
        provider: &str,
        capability: Capability,
        remote: Arc<dyn CapabilityProvider>,
    ) -> Result<(), DispatchError> {
        let namespace = self.providers.entry(provider.to_string()).or_default();
        if namespace.contains_key(&capability.name) {
            return Err(DispatchError::DuplicateCapability {
                provider: provider.to_string(),
                capability: capability.name,
            });
        }

        let name = capability.name.clone();
        let wrapper = Arc::new(InvocationWrapper {
            provider: provider.to_string(),
            capability,
            remote,
            sink: self.sink.clone(),
        });
        namespace.insert(name, wrapper);
        Ok(())
    }

    pub fn resolve(
        &self,
        provider: &str,
        capability: &str,
    ) -> Result<Arc<InvocationWrapper>, DispatchError> {
        let namespace = self
            .providers
            .get(provider)
            .ok_or_else(|| DispatchError::UnknownProvider(provider.to_string()))?;
        namespace
            .get(capability)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownCapability {
                provider: provider.to_string(),
                capability: capability.to_string(),
            })
    }

    /// Render the capability listing for every bound namespace plus the
    /// builtins. Deterministic: namespaces and names in sorted order.
    pub fn docs(&self) -> String {
        let mut out = String::new();
        for (provider, namespace) in &self.providers {
            for wrapper in namespace.values() {
                out.push_str(&wrapper.capability.summary(&format!("MCP.{provider}")));
            }
        }
        out.push_str(&prompt::builtins_docs("MCP"));
        out
    }
}

/// Build the dispatch table for one run from a manifest.
///
/// `remotes` maps provider names to their transport implementations; a
/// manifest provider without one is a setup error, as is any schema or
/// duplicate-name failure.
pub fn build_dispatch_table(
    manifest: &CapabilityManifest,
    remotes: &BTreeMap<String, Arc<dyn CapabilityProvider>>,
    sink: &EventSink,
) -> Result<DispatchTable> {
    let mut table = DispatchTable::new(sink.clone());
    for (provider_name, capabilities) in manifest.descriptors()? {
        let remote = remotes
            .get(&provider_name)
            .cloned()
            .ok_or_else(|| anyhow!("no provider implementation registered for '{provider_name}'"))?;
        for capability in capabilities {
            let name = capability.name.clone();
            table
                .bind(&provider_name, capability, Arc::clone(&remote))
                .with_context(|| {
                    format!("failed to bind capability '{provider_name}.{name}'")
                })?;
        }
    }
    Ok(table)
}

/// One-line result summary for the end-of-call hover text.
fn summarize_value(value: &JsonValue) -> String {
    let text = match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    };
    const MAX: usize = 120;
    if text.chars().count() > MAX {
        let truncated: String = text.chars().take(MAX).collect();
        format!("{truncated}…")
    } else {
        text
    }
}
