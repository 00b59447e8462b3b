use anyhow::{anyhow, Context, Result};
use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::capability::{Capability, CapabilityRecord};

/// Top-level capability manifest.
///
/// Lists the providers a run may dispatch to, each with the capability
/// records it advertises, plus an optional inference endpoint. The manifest
/// stands in for live discovery: the transport that would fetch these records
/// from a running provider is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CapabilityManifest {
    pub version: String,

    #[serde(default)]
    pub providers: Vec<ProviderManifest>,

    #[serde(default)]
    pub inference: Option<InferenceSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ProviderManifest {
    pub name: String,

    #[serde(default)]
    pub capabilities: Vec<CapabilityRecord>,
}

/// Connection details for the inference provider.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct InferenceSpec {
    pub endpoint: String,

    /// Name of the env var holding a bearer token, if the endpoint needs one.
    #[serde(default)]
    pub auth_env: Option<String>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Schema generated directly from the Rust manifest structs.
///
/// This is the authoritative validator because it cannot drift from the
/// types it validates.
static MANIFEST_SCHEMA_GENERATED: Lazy<JsonValue> = Lazy::new(|| {
    let schema = schema_for!(CapabilityManifest);
    serde_json::to_value(&schema).expect("schemars schema must serialize to JSON")
});

/// Strict-ish validator: requires the core top-level fields and rejects
/// unknown top-level keys, which catches common typos early. Nested objects
/// stay permissive.
static MANIFEST_SCHEMA_STRICT_TOPLEVEL: Lazy<JSONSchema> = Lazy::new(|| {
    let mut schema_json = MANIFEST_SCHEMA_GENERATED.clone();

    if let Some(obj) = schema_json.as_object_mut() {
        obj.insert("additionalProperties".to_string(), JsonValue::Bool(false));
        obj.insert(
            "required".to_string(),
            JsonValue::Array(vec![JsonValue::String("version".to_string())]),
        );
    }

    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema_json)
        .expect("failed to compile strict top-level manifest schema")
});

/// Validate a manifest YAML document before deserializing it.
pub fn validate_manifest_yaml(yaml_text: &str) -> Result<()> {
    let yaml_value: serde_yaml::Value =
        serde_yaml::from_str(yaml_text).context("parse yaml into Value")?;
    let json_value: JsonValue =
        serde_json::to_value(&yaml_value).context("convert yaml value to json value")?;

    let compiled = &*MANIFEST_SCHEMA_STRICT_TOPLEVEL;

    // `validate()` returns an iterator that borrows `json_value`; consume it
    // before the value is dropped.
    let result: Result<()> = match compiled.validate(&json_value) {
        Ok(()) => Ok(()),
        Err(err_iter) => {
            let mut msgs: Vec<String> = Vec::new();
            for (i, e) in err_iter.enumerate() {
                if i >= 10 {
                    msgs.push("... (more schema errors omitted)".to_string());
                    break;
                }
                let instance_path = e.instance_path.to_string();
                let path = if instance_path.is_empty() {
                    "/".to_string()
                } else {
                    instance_path
                };
                msgs.push(format!("at {path}: {e}"));
            }

            Err(anyhow!(
                "manifest schema validation failed:\n{}",
                msgs.join("\n")
            ))
        }
    };

    result
}

fn check_version(version: &str) -> Result<()> {
    let v = version.trim();
    match v {
        "0.1" => Ok(()),
        "" => Err(anyhow!("manifest is missing required field: version")),
        _ => Err(anyhow!("unsupported manifest version '{v}' (supported: 0.1)")),
    }
}

impl CapabilityManifest {
    /// Load and validate a manifest from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        validate_manifest_yaml(text)?;
        let manifest: CapabilityManifest =
            serde_yaml::from_str(text).context("parse manifest yaml")?;
        check_version(&manifest.version)?;

        let mut seen = std::collections::BTreeSet::new();
        for provider in &manifest.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(anyhow!(
                    "duplicate provider name '{}' in manifest",
                    provider.name
                ));
            }
        }

        if manifest.providers.is_empty() {
            tracing::warn!("manifest defines no providers");
        }
        tracing::info!(version = %manifest.version, "loaded capability manifest");
        Ok(manifest)
    }

    /// Load a manifest from a file path.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest '{}'", path.display()))?;
        Self::from_yaml(&text)
            .with_context(|| format!("while parsing manifest '{}'", path.display()))
    }

    /// Build descriptors for every provider, in manifest order.
    ///
    /// Any schema failure aborts the whole build: setup must not proceed with
    /// a partial capability set.
    pub fn descriptors(&self) -> Result<Vec<(String, Vec<Capability>)>> {
        let mut out = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            let mut caps = Vec::with_capacity(provider.capabilities.len());
            for record in &provider.capabilities {
                let cap = Capability::from_record(record).with_context(|| {
                    format!(
                        "failed to build descriptor for capability '{}' of provider '{}'",
                        record.name, provider.name
                    )
                })?;
                caps.push(cap);
            }
            out.push((provider.name.clone(), caps));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
version: "0.1"
providers:
  - name: Weather
    capabilities:
      - name: forecast
        description: Five day forecast for a city.
        kind: action
        input_schema:
          properties:
            city: {type: string}
"#;

    #[test]
    fn minimal_manifest_parses() {
        let manifest = CapabilityManifest::from_yaml(MINIMAL).expect("manifest");
        assert_eq!(manifest.providers.len(), 1);
        assert_eq!(manifest.providers[0].name, "Weather");
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let text = format!("{MINIMAL}\nworkflos: []\n");
        let err = CapabilityManifest::from_yaml(&text).unwrap_err();
        assert!(
            err.to_string().contains("manifest schema validation failed"),
            "{err:#}"
        );
    }

    #[test]
    fn missing_version_is_rejected() {
        let err = CapabilityManifest::from_yaml("providers: []\n").unwrap_err();
        assert!(err.to_string().contains("validation failed"), "{err:#}");
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let err = CapabilityManifest::from_yaml("version: \"9.9\"\n").unwrap_err();
        assert!(
            err.to_string().contains("unsupported manifest version"),
            "{err:#}"
        );
    }

    #[test]
    fn duplicate_provider_names_are_rejected() {
        let text = r#"
version: "0.1"
providers:
  - name: Weather
  - name: Weather
"#;
        let err = CapabilityManifest::from_yaml(text).unwrap_err();
        assert!(err.to_string().contains("duplicate provider name"), "{err:#}");
    }

    #[test]
    fn descriptors_are_built_in_manifest_order() {
        let text = r#"
version: "0.1"
providers:
  - name: Weather
    capabilities:
      - name: forecast
        kind: action
  - name: Library
    capabilities:
      - name: city_report
        kind: data_source
        uri_template: "report://{city}"
"#;
        let manifest = CapabilityManifest::from_yaml(text).expect("manifest");
        let providers = manifest.descriptors().expect("descriptors");
        assert_eq!(providers[0].0, "Weather");
        assert_eq!(providers[1].0, "Library");
        assert_eq!(providers[1].1[0].parameters[0].name, "city");
    }

    #[test]
    fn descriptor_schema_failure_aborts_the_build() {
        let text = r#"
version: "0.1"
providers:
  - name: Weather
    capabilities:
      - name: broken
        kind: action
        input_schema:
          properties:
            x: {format: binary}
"#;
        let manifest = CapabilityManifest::from_yaml(text).expect("manifest");
        let err = manifest.descriptors().unwrap_err();
        assert!(err.to_string().contains("'broken'"), "{err:#}");
    }
}
