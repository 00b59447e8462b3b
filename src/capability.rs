use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::schema::{flatten_schema, FlatProperty, SchemaError, TypeLabel};

/// How a capability is ultimately delegated to its provider.
///
/// The three kinds share one descriptor shape; they differ only in how their
/// parameters are discovered and how an invocation is handed to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Action,
    DataSource,
    PromptTemplate,
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityKind::Action => write!(f, "action"),
            CapabilityKind::DataSource => write!(f, "data_source"),
            CapabilityKind::PromptTemplate => write!(f, "prompt_template"),
        }
    }
}

/// A capability as a provider advertises it, before any schema flattening.
///
/// This is the inbound interface shape: `input_schema`/`output_schema` are
/// carried opaquely until descriptor construction runs the parser over them.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CapabilityRecord {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub kind: CapabilityKind,

    #[serde(default)]
    pub input_schema: Option<JsonValue>,

    #[serde(default)]
    pub output_schema: Option<JsonValue>,

    /// Data sources advertise a URI template instead of an input schema.
    #[serde(default)]
    pub uri_template: Option<String>,
}

/// One parameter or response field of a capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub datatype: TypeLabel,
    pub required: bool,
}

impl From<FlatProperty> for Parameter {
    fn from(p: FlatProperty) -> Self {
        Parameter {
            name: p.name,
            datatype: p.datatype,
            required: p.required,
        }
    }
}

/// The normalized, provider-agnostic description of one capability.
///
/// Built once per provider capability and immutable afterwards; the dispatch
/// table owns it and indexes it by `(provider, name)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Capability {
    pub name: String,
    pub description: String,
    pub kind: CapabilityKind,
    pub parameters: Vec<Parameter>,
    pub responses: Vec<Parameter>,
    pub uri_template: Option<String>,
}

impl Capability {
    /// Build a descriptor from a provider capability record.
    ///
    /// Actions and prompt templates discover parameters by flattening the
    /// record's input schema; data sources scan their URI template for
    /// `{placeholder}` segments and get one untyped parameter per placeholder.
    /// A record with no schema at all still yields a descriptor with an empty
    /// parameter list.
    pub fn from_record(record: &CapabilityRecord) -> Result<Self, SchemaError> {
        let parameters = match record.kind {
            CapabilityKind::DataSource => record
                .uri_template
                .as_deref()
                .map(template_parameters)
                .unwrap_or_default(),
            CapabilityKind::Action | CapabilityKind::PromptTemplate => match &record.input_schema {
                Some(schema) => flatten_schema(schema)?
                    .into_iter()
                    .map(Parameter::from)
                    .collect(),
                None => Vec::new(),
            },
        };

        let responses = match &record.output_schema {
            Some(schema) => flatten_schema(schema)?
                .into_iter()
                .map(Parameter::from)
                .collect(),
            None => Vec::new(),
        };

        Ok(Capability {
            name: record.name.trim().to_string(),
            description: record.description.trim().to_string(),
            kind: record.kind,
            parameters,
            responses,
            uri_template: record.uri_template.clone(),
        })
    }

    /// Render the `Function:` block handed to the generating model.
    pub fn summary(&self, prefix: &str) -> String {
        format!(
            "Function: {prefix}.{name}\n\tDescription: {description}\n\tParameters: {params}\n\tReturns: {returns}\n",
            name = self.name,
            description = self.description,
            params = render_fields(&self.parameters),
            returns = render_fields(&self.responses),
        )
    }
}

fn render_fields(fields: &[Parameter]) -> String {
    if fields.is_empty() {
        return "None".to_string();
    }
    fields
        .iter()
        .map(|p| {
            if p.required {
                format!("{}: {}", p.name, p.datatype)
            } else {
                format!("{}: {} (optional)", p.name, p.datatype)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Scan a URI template for `{placeholder}` segments, in template order.
///
/// A placeholder may not span a path separator; each one becomes a required
/// untyped parameter.
pub fn template_parameters(template: &str) -> Vec<Parameter> {
    let mut params = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let tail = &rest[open + 1..];
        let Some(close) = tail.find('}') else {
            break;
        };
        let name = &tail[..close];
        if !name.is_empty() && !name.contains('/') {
            params.push(Parameter {
                name: name.to_string(),
                datatype: TypeLabel::Scalar("any".to_string()),
                required: true,
            });
        }
        rest = &tail[close + 1..];
    }
    params
}

/// Substitute `{placeholder}` segments with argument values.
///
/// Missing arguments leave the placeholder in place; the provider will reject
/// the malformed URI, which keeps this a pure string operation.
pub fn expand_template(template: &str, arguments: &[(String, JsonValue)]) -> String {
    let mut expanded = template.to_string();
    for (name, value) in arguments {
        let needle = format!("{{{name}}}");
        if expanded.contains(&needle) {
            expanded = expanded.replace(&needle, &argument_text(value));
        }
    }
    expanded
}

fn argument_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render the full capability listing for a set of providers.
///
/// Deterministic: providers and capabilities appear in the order given.
pub fn render_docs(providers: &[(String, Vec<Capability>)]) -> String {
    let mut out = String::new();
    for (provider, capabilities) in providers {
        for cap in capabilities {
            out.push_str(&cap.summary(&format!("MCP.{provider}")));
        }
    }
    out.push_str(&crate::prompt::builtins_docs("MCP"));
    out
}
