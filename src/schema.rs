use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while flattening a capability schema.
///
/// All of these are fatal to descriptor construction: a schema that cannot be
/// flattened produces no descriptor at all, and setup must stop before any
/// execution is attempted.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown schema property shape for '{property}'")]
    UnknownPropertyShape { property: String },

    #[error("property '{property}' references unknown definition '{definition}'")]
    UnresolvedReference {
        property: String,
        definition: String,
    },

    #[error("definition '{definition}' has no properties block (sub definitions are not supported)")]
    DefinitionWithoutProperties { definition: String },

    #[error("definition '{definition}' property '{property}' uses a nested reference (only one level of $ref is supported)")]
    NestedReference {
        definition: String,
        property: String,
    },

    #[error("anyOf alternative for property '{property}' is missing a type")]
    MalformedUnion { property: String },
}

/// The flattened type of one schema property.
///
/// A property is either a plain type label (including `|`-joined unions) or a
/// reference resolved one level deep into the schema's `$defs` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeLabel {
    Scalar(String),
    /// Resolved `$ref`: the referenced definition's properties, in source order.
    Object(Vec<(String, String)>),
}

impl std::fmt::Display for TypeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeLabel::Scalar(label) => write!(f, "{label}"),
            TypeLabel::Object(fields) => {
                write!(f, "{{")?;
                for (idx, (name, label)) in fields.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {label}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// One flattened property of a parameter or response schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatProperty {
    pub name: String,
    pub datatype: TypeLabel,
    pub required: bool,
}

/// Flatten a raw capability schema into an ordered property list.
///
/// The supported per-property shapes are `type`, `anyOf` (joined with `|`),
/// and `$ref` into a one-level `$defs` table. Anything else fails with a
/// [`SchemaError`] naming the offending property; no partial list is produced.
///
/// The `required` flag comes from the schema's own `required` list. A schema
/// without one marks every property required.
pub fn flatten_schema(schema: &JsonValue) -> Result<Vec<FlatProperty>, SchemaError> {
    let defs = flatten_definitions(schema)?;

    let Some(properties) = schema.get("properties").and_then(JsonValue::as_object) else {
        return Ok(Vec::new());
    };

    let required = schema.get("required").and_then(JsonValue::as_array);
    let is_required = |name: &str| -> bool {
        match required {
            // No required list: treat every property as required.
            None => true,
            Some(names) => names.iter().any(|v| v.as_str() == Some(name)),
        }
    };

    let mut out = Vec::with_capacity(properties.len());
    for (name, shape) in properties {
        let datatype = if let Some(label) = scalar_label(name, shape)? {
            TypeLabel::Scalar(label)
        } else if let Some(reference) = shape.get("$ref").and_then(JsonValue::as_str) {
            let def_name = definition_name(reference);
            let fields = defs
                .as_ref()
                .and_then(|d| d.get(def_name))
                .ok_or_else(|| SchemaError::UnresolvedReference {
                    property: name.clone(),
                    definition: def_name.to_string(),
                })?;
            TypeLabel::Object(fields.clone())
        } else {
            return Err(SchemaError::UnknownPropertyShape {
                property: name.clone(),
            });
        };

        out.push(FlatProperty {
            name: name.clone(),
            datatype,
            required: is_required(name),
        });
    }

    Ok(out)
}

/// Flatten the schema's `$defs` table, one level deep.
///
/// Each definition must carry its own `properties` block, and those properties
/// may only use `type` or `anyOf`; a `$ref` inside a definition is a hard
/// failure rather than a silently unresolved label.
fn flatten_definitions(
    schema: &JsonValue,
) -> Result<Option<BTreeMap<String, Vec<(String, String)>>>, SchemaError> {
    let Some(defs) = schema.get("$defs").and_then(JsonValue::as_object) else {
        return Ok(None);
    };

    let mut flattened = BTreeMap::new();
    for (def_name, definition) in defs {
        let Some(properties) = definition.get("properties").and_then(JsonValue::as_object) else {
            return Err(SchemaError::DefinitionWithoutProperties {
                definition: def_name.clone(),
            });
        };

        let mut fields = Vec::with_capacity(properties.len());
        for (prop_name, shape) in properties {
            if shape.get("$ref").is_some() {
                return Err(SchemaError::NestedReference {
                    definition: def_name.clone(),
                    property: prop_name.clone(),
                });
            }
            let label = scalar_label(prop_name, shape)?.ok_or_else(|| {
                SchemaError::UnknownPropertyShape {
                    property: prop_name.clone(),
                }
            })?;
            fields.push((prop_name.clone(), label));
        }
        flattened.insert(def_name.clone(), fields);
    }

    Ok(Some(flattened))
}

/// Resolve the `type`/`anyOf` shapes shared by top-level properties and
/// definition properties. Returns `Ok(None)` when neither is present so the
/// caller can try `$ref` (or fail).
fn scalar_label(property: &str, shape: &JsonValue) -> Result<Option<String>, SchemaError> {
    if let Some(label) = shape.get("type").and_then(JsonValue::as_str) {
        return Ok(Some(label.to_string()));
    }

    if let Some(alternatives) = shape.get("anyOf").and_then(JsonValue::as_array) {
        let mut labels = Vec::with_capacity(alternatives.len());
        for alt in alternatives {
            let label = alt.get("type").and_then(JsonValue::as_str).ok_or_else(|| {
                SchemaError::MalformedUnion {
                    property: property.to_string(),
                }
            })?;
            labels.push(label);
        }
        return Ok(Some(labels.join("|")));
    }

    Ok(None)
}

fn definition_name(reference: &str) -> &str {
    reference.rsplit('/').next().unwrap_or(reference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_plain_types_and_unions_in_source_order() {
        let schema = json!({
            "properties": {
                "city": {"type": "string"},
                "days": {"anyOf": [{"type": "integer"}, {"type": "null"}]}
            }
        });

        let props = flatten_schema(&schema).expect("flatten");
        assert_eq!(props.len(), 2);
        assert_eq!(props[0].name, "city");
        assert_eq!(props[0].datatype, TypeLabel::Scalar("string".to_string()));
        assert!(props[0].required);
        assert_eq!(props[1].name, "days");
        assert_eq!(
            props[1].datatype,
            TypeLabel::Scalar("integer|null".to_string())
        );
        assert!(props[1].required);
    }

    #[test]
    fn required_list_controls_the_required_flag() {
        let schema = json!({
            "properties": {
                "city": {"type": "string"},
                "days": {"type": "integer"}
            },
            "required": ["city"]
        });

        let props = flatten_schema(&schema).expect("flatten");
        assert!(props[0].required);
        assert!(!props[1].required);
    }

    #[test]
    fn resolves_single_level_references() {
        let schema = json!({
            "properties": {
                "location": {"$ref": "#/$defs/Location"}
            },
            "$defs": {
                "Location": {
                    "properties": {
                        "lat": {"type": "number"},
                        "lon": {"type": "number"}
                    }
                }
            }
        });

        let props = flatten_schema(&schema).expect("flatten");
        assert_eq!(
            props[0].datatype,
            TypeLabel::Object(vec![
                ("lat".to_string(), "number".to_string()),
                ("lon".to_string(), "number".to_string()),
            ])
        );
        assert_eq!(props[0].datatype.to_string(), "{lat: number, lon: number}");
    }

    #[test]
    fn nested_reference_inside_definition_fails() {
        let schema = json!({
            "properties": {
                "location": {"$ref": "#/$defs/Location"}
            },
            "$defs": {
                "Location": {
                    "properties": {
                        "inner": {"$ref": "#/$defs/Other"}
                    }
                }
            }
        });

        let err = flatten_schema(&schema).unwrap_err();
        assert!(matches!(err, SchemaError::NestedReference { .. }), "{err}");
    }

    #[test]
    fn definition_without_properties_fails() {
        let schema = json!({
            "properties": {
                "location": {"$ref": "#/$defs/Location"}
            },
            "$defs": {
                "Location": {"type": "object"}
            }
        });

        let err = flatten_schema(&schema).unwrap_err();
        assert!(
            matches!(err, SchemaError::DefinitionWithoutProperties { .. }),
            "{err}"
        );
    }

    #[test]
    fn unknown_property_shape_names_the_property() {
        let schema = json!({
            "properties": {
                "blob": {"format": "binary"}
            }
        });

        let err = flatten_schema(&schema).unwrap_err();
        assert!(err.to_string().contains("'blob'"), "{err}");
    }

    #[test]
    fn reference_without_definitions_table_fails() {
        let schema = json!({
            "properties": {
                "location": {"$ref": "#/$defs/Location"}
            }
        });

        let err = flatten_schema(&schema).unwrap_err();
        assert!(
            matches!(err, SchemaError::UnresolvedReference { .. }),
            "{err}"
        );
    }

    #[test]
    fn schema_without_properties_yields_empty_list() {
        let props = flatten_schema(&json!({})).expect("flatten");
        assert!(props.is_empty());
    }
}
