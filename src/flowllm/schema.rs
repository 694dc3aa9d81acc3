//! Input-schema subset validation.
//!
//! Tools and workflows describe their accepted input with a small JSON
//! Schema dialect: an object schema with a `properties` map, property
//! types restricted to `string | number | integer | boolean`, optional
//! `enum`, `title`, `description`, `default`, and a `required` name list.
//! This module checks both the schemas themselves (at create/update
//! time) and input instances against them (at dispatch time).

use crate::flowllm::error::EngineError;
use serde_json::Value as JsonValue;

const SCALAR_TYPES: [&str; 4] = ["string", "number", "integer", "boolean"];

/// Validate that `schema` is a well-formed object schema in the accepted
/// subset.
pub fn validate_schema(schema: &JsonValue) -> Result<(), EngineError> {
    let obj = schema
        .as_object()
        .ok_or_else(|| EngineError::Validation("input schema must be a JSON object".into()))?;

    match obj.get("type").and_then(|t| t.as_str()) {
        Some("object") => {}
        _ => {
            return Err(EngineError::Validation(
                "input schema must declare type \"object\"".into(),
            ))
        }
    }

    let properties = obj
        .get("properties")
        .and_then(|p| p.as_object())
        .ok_or_else(|| EngineError::Validation("input schema must carry a properties map".into()))?;

    for (name, prop) in properties {
        let prop_obj = prop.as_object().ok_or_else(|| {
            EngineError::Validation(format!("property '{}' must be an object", name))
        })?;
        let ty = prop_obj.get("type").and_then(|t| t.as_str()).ok_or_else(|| {
            EngineError::Validation(format!("property '{}' is missing a type", name))
        })?;
        if !SCALAR_TYPES.contains(&ty) {
            return Err(EngineError::Validation(format!(
                "property '{}' has unsupported type '{}'",
                name, ty
            )));
        }
        if let Some(enum_values) = prop_obj.get("enum") {
            let values = enum_values.as_array().ok_or_else(|| {
                EngineError::Validation(format!("property '{}': enum must be an array", name))
            })?;
            if values.is_empty() {
                return Err(EngineError::Validation(format!(
                    "property '{}': enum must not be empty",
                    name
                )));
            }
        }
    }

    if let Some(required) = obj.get("required") {
        let names = required.as_array().ok_or_else(|| {
            EngineError::Validation("required must be an array of property names".into())
        })?;
        for name in names {
            let name = name.as_str().ok_or_else(|| {
                EngineError::Validation("required entries must be strings".into())
            })?;
            if !properties.contains_key(name) {
                return Err(EngineError::Validation(format!(
                    "required property '{}' is not declared",
                    name
                )));
            }
        }
    }

    Ok(())
}

/// Validate an input instance against an (already well-formed) schema.
pub fn validate_input(schema: &JsonValue, input: &JsonValue) -> Result<(), EngineError> {
    let obj = match schema.as_object() {
        Some(o) => o,
        // A tool without a declared schema accepts anything.
        None => return Ok(()),
    };
    let properties = match obj.get("properties").and_then(|p| p.as_object()) {
        Some(p) => p,
        None => return Ok(()),
    };

    let instance = input
        .as_object()
        .ok_or_else(|| EngineError::Validation("input must be a JSON object".into()))?;

    if let Some(required) = obj.get("required").and_then(|r| r.as_array()) {
        for name in required.iter().filter_map(|n| n.as_str()) {
            if !instance.contains_key(name) {
                return Err(EngineError::Validation(format!(
                    "missing required field '{}'",
                    name
                )));
            }
        }
    }

    for (name, value) in instance {
        let prop = match properties.get(name).and_then(|p| p.as_object()) {
            Some(p) => p,
            // Undeclared fields pass through untouched.
            None => continue,
        };
        let ty = prop.get("type").and_then(|t| t.as_str()).unwrap_or("string");
        let matches = match ty {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            _ => true,
        };
        if !matches {
            return Err(EngineError::Validation(format!(
                "field '{}' is not a {}",
                name, ty
            )));
        }
        if let Some(allowed) = prop.get("enum").and_then(|e| e.as_array()) {
            if !allowed.contains(value) {
                return Err(EngineError::Validation(format!(
                    "field '{}' is not one of the allowed values",
                    name
                )));
            }
        }
    }

    Ok(())
}
