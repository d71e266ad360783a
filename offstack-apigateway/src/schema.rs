//! Request body validation against declared JSON schemas

use jsonschema::Validator;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::endpoint::ConfigurationError;

/// Compiled schemas keyed by lower-case content type
#[derive(Clone, Default)]
pub struct RequestSchemas {
    validators: HashMap<String, Arc<Validator>>,
}

impl fmt::Debug for RequestSchemas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSchemas")
            .field("content_types", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RequestSchemas {
    pub fn compile(schemas: &HashMap<String, Value>) -> Result<Self, ConfigurationError> {
        let mut validators = HashMap::new();
        for (content_type, schema) in schemas {
            let validator = Validator::new(schema).map_err(|e| ConfigurationError::InvalidSchema {
                content_type: content_type.clone(),
                message: e.to_string(),
            })?;
            validators.insert(content_type.to_lowercase(), Arc::new(validator));
        }
        Ok(Self { validators })
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Validate `body` if a schema is declared for `content_type`.
    /// The error is the first validation message.
    pub fn validate(&self, content_type: &str, body: &Value) -> Result<(), String> {
        match self.validators.get(&content_type.to_lowercase()) {
            Some(validator) => validator.validate(body).map_err(|e| e.to_string()),
            None => Ok(()),
        }
    }
}
