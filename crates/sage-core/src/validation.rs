//! Request validation
//!
//! Rejections here are terminal: an invalid request is never retried,
//! never creates an in-flight marker and never pollutes the cache.

use serde_json::Value;

use crate::prediction::PredictionRequest;
use crate::{CoreError, Result};

/// Upper bound on features per request
pub const MAX_FEATURES: usize = 256;

/// Upper bound on identifier length
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Validation for prediction requests
pub struct Validator;

impl Validator {
    /// Validate a request before any pipeline work happens
    pub fn validate_request(request: &PredictionRequest) -> Result<()> {
        Self::validate_identifier("subject_id", &request.subject_id)?;
        Self::validate_identifier("content_id", &request.content_id)?;
        Self::validate_model_name(&request.model_name)?;

        if let Some(version) = &request.model_version {
            if version.is_empty() {
                return Err(CoreError::invalid_parameter(
                    "model_version must not be empty when set",
                    "model_version",
                ));
            }
        }

        if request.input_features.is_empty() {
            return Err(CoreError::invalid_parameter(
                "at least one input feature is required",
                "input_features",
            ));
        }
        if request.input_features.len() > MAX_FEATURES {
            return Err(CoreError::invalid_parameter(
                format!(
                    "too many input features: {} (maximum {})",
                    request.input_features.len(),
                    MAX_FEATURES
                ),
                "input_features",
            ));
        }
        for (name, value) in &request.input_features {
            Self::validate_feature(name, value)?;
        }
        Ok(())
    }

    /// Validate a model name: non-empty, bounded, restricted charset
    pub fn validate_model_name(model_name: &str) -> Result<()> {
        if model_name.is_empty() {
            return Err(CoreError::invalid_parameter(
                "model_name must not be empty",
                "model_name",
            ));
        }
        if model_name.len() > MAX_IDENTIFIER_LEN {
            return Err(CoreError::invalid_parameter(
                format!("model_name exceeds {} characters", MAX_IDENTIFIER_LEN),
                "model_name",
            ));
        }
        if !model_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(CoreError::invalid_parameter(
                format!("model_name '{}' contains unsupported characters", model_name),
                "model_name",
            ));
        }
        Ok(())
    }

    fn validate_identifier(parameter: &str, value: &str) -> Result<()> {
        if value.is_empty() {
            return Err(CoreError::invalid_parameter(
                format!("{} must not be empty", parameter),
                parameter,
            ));
        }
        if value.len() > MAX_IDENTIFIER_LEN {
            return Err(CoreError::invalid_parameter(
                format!("{} exceeds {} characters", parameter, MAX_IDENTIFIER_LEN),
                parameter,
            ));
        }
        Ok(())
    }

    /// Features are scalars or arrays of scalars; null and nested objects
    /// are rejected rather than silently hashed into the fingerprint.
    fn validate_feature(name: &str, value: &Value) -> Result<()> {
        if name.is_empty() {
            return Err(CoreError::invalid_parameter(
                "feature names must not be empty",
                "input_features",
            ));
        }
        match value {
            Value::Number(_) | Value::String(_) | Value::Bool(_) => Ok(()),
            Value::Array(items) => {
                if items
                    .iter()
                    .all(|item| matches!(item, Value::Number(_) | Value::String(_) | Value::Bool(_)))
                {
                    Ok(())
                } else {
                    Err(CoreError::invalid_parameter(
                        format!("feature '{}' array may only contain scalars", name),
                        name,
                    ))
                }
            }
            Value::Null => Err(CoreError::invalid_parameter(
                format!("feature '{}' must not be null", name),
                name,
            )),
            Value::Object(_) => Err(CoreError::invalid_parameter(
                format!("feature '{}' must be a scalar or array of scalars", name),
                name,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_request() -> PredictionRequest {
        PredictionRequest::new("student-1", "course-9", "dropout_risk")
            .with_feature("attendance", json!(0.4))
            .with_feature("gpa", json!(2.1))
    }

    #[test]
    fn accepts_well_formed_requests() {
        assert!(Validator::validate_request(&valid_request()).is_ok());
    }

    #[test]
    fn rejects_empty_identifiers() {
        let mut request = valid_request();
        request.subject_id = String::new();
        assert!(matches!(
            Validator::validate_request(&request),
            Err(CoreError::InvalidInput { .. })
        ));
    }

    #[test]
    fn rejects_bad_model_names() {
        assert!(Validator::validate_model_name("dropout risk").is_err());
        assert!(Validator::validate_model_name("").is_err());
        assert!(Validator::validate_model_name("dropout_risk-v2.1").is_ok());
    }

    #[test]
    fn rejects_empty_feature_map() {
        let mut request = valid_request();
        request.input_features.clear();
        assert!(Validator::validate_request(&request).is_err());
    }

    #[test]
    fn rejects_null_and_nested_features() {
        let request = valid_request().with_feature("missing", json!(null));
        assert!(Validator::validate_request(&request).is_err());

        let request = valid_request().with_feature("nested", json!({"a": 1}));
        assert!(Validator::validate_request(&request).is_err());

        let request = valid_request().with_feature("history", json!([0.1, 0.2, 0.3]));
        assert!(Validator::validate_request(&request).is_ok());
    }

    #[test]
    fn rejects_oversized_feature_maps() {
        let mut request = valid_request();
        for i in 0..=MAX_FEATURES {
            request
                .input_features
                .insert(format!("feature_{}", i), json!(i));
        }
        assert!(Validator::validate_request(&request).is_err());
    }
}
