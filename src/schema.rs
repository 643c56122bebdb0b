//! JSON Schema (Draft-7) validation of invocation arguments.

use crate::errors::{ToolgateError, ToolgateResult};
use jsonschema::Draft;
use serde_json::Value;

/// Maximum number of path-qualified problems reported per validation failure.
const MAX_REPORTED_ERRORS: usize = 5;

/// Validates tool arguments against a Draft-7 input schema.
///
/// Validation is globally toggleable; a per-call override always wins.
#[derive(Debug, Clone)]
pub struct SchemaValidator {
    enabled: bool,
}

impl SchemaValidator {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Validate `arguments` against `schema`.
    ///
    /// Returns `Ok(())` when validation is disabled (and not overridden on),
    /// when the schema has no constraints, or when the arguments conform.
    pub fn validate(
        &self,
        schema: &Value,
        arguments: &Value,
        override_enabled: Option<bool>,
    ) -> ToolgateResult<()> {
        if !override_enabled.unwrap_or(self.enabled) {
            return Ok(());
        }
        // An absent or trivially-empty schema constrains nothing.
        if schema.as_object().is_none_or(|o| o.is_empty()) {
            return Ok(());
        }

        let validator = jsonschema::options()
            .with_draft(Draft::Draft7)
            .build(schema)
            .map_err(|e| {
                ToolgateError::internal(format!("tool input schema is itself invalid: {}", e))
            })?;

        let messages: Vec<String> = validator
            .iter_errors(arguments)
            .take(MAX_REPORTED_ERRORS)
            .map(format_error)
            .collect();

        if messages.is_empty() {
            Ok(())
        } else {
            Err(ToolgateError::validation(
                "argument validation failed",
                messages,
            ))
        }
    }
}

fn format_error(error: jsonschema::ValidationError<'_>) -> String {
    use jsonschema::error::ValidationErrorKind;

    if let ValidationErrorKind::Required { property } = error.kind() {
        let name = property.as_str().map(str::to_string).unwrap_or_else(|| property.to_string());
        return format!("{}: is a required property", name);
    }

    let path = error.instance_path().to_string();
    if path.is_empty() || path == "/" {
        error.to_string()
    } else {
        format!("{}: {}", path.trim_start_matches('/').replace('/', "."), error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "email": {"type": "string"},
                "age": {"type": "integer", "minimum": 0}
            },
            "required": ["email"]
        })
    }

    #[test]
    fn conforming_arguments_pass() {
        let validator = SchemaValidator::new(true);
        assert!(validator
            .validate(&user_schema(), &json!({"email": "a@b.c", "age": 3}), None)
            .is_ok());
    }

    #[test]
    fn missing_required_property_is_path_qualified() {
        let validator = SchemaValidator::new(true);
        let err = validator
            .validate(&user_schema(), &json!({}), None)
            .unwrap_err();
        assert_eq!(err.error_code(), "validation_error");
        let messages = err.details["validation_errors"].as_array().unwrap();
        assert_eq!(messages[0], "email: is a required property");
    }

    #[test]
    fn nested_errors_carry_paths() {
        let validator = SchemaValidator::new(true);
        let err = validator
            .validate(&user_schema(), &json!({"email": "a@b.c", "age": -1}), None)
            .unwrap_err();
        let messages = err.details["validation_errors"].as_array().unwrap();
        assert!(messages[0].as_str().unwrap().starts_with("age:"));
    }

    #[test]
    fn error_list_is_capped_at_five() {
        let schema = json!({
            "type": "object",
            "properties": {},
            "required": ["a", "b", "c", "d", "e", "f", "g"]
        });
        let validator = SchemaValidator::new(true);
        let err = validator.validate(&schema, &json!({}), None).unwrap_err();
        let messages = err.details["validation_errors"].as_array().unwrap();
        assert_eq!(messages.len(), 5);
    }

    #[test]
    fn global_toggle_and_override() {
        let disabled = SchemaValidator::new(false);
        assert!(disabled.validate(&user_schema(), &json!({}), None).is_ok());
        // Per-call override wins in both directions.
        assert!(disabled
            .validate(&user_schema(), &json!({}), Some(true))
            .is_err());
        let enabled = SchemaValidator::new(true);
        assert!(enabled
            .validate(&user_schema(), &json!({}), Some(false))
            .is_ok());
    }

    #[test]
    fn empty_schema_constrains_nothing() {
        let validator = SchemaValidator::new(true);
        assert!(validator.validate(&json!({}), &json!({"x": 1}), None).is_ok());
    }
}
