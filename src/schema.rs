use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use jsonschema::Validator;
use serde_json::Value;

use crate::error::BrokerError;

/// Compile a JSON schema, mapping compilation failures to a validation error.
pub fn compile(schema: &Value) -> Result<Validator, BrokerError> {
    jsonschema::validator_for(schema)
        .map_err(|e| BrokerError::Validation(format!("schema does not compile: {e}")))
}

/// Cache of compiled payload validators, keyed by the owning
/// `(tenant, name, version)`. Schemas are compiled once at registration and
/// reused for every payload check.
#[derive(Default)]
pub struct SchemaCache {
    compiled: RwLock<HashMap<String, Arc<Validator>>>,
}

fn cache_key(tenant: &str, name: &str, version: &str) -> String {
    format!("{tenant}/{name}@{version}")
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant: &str, name: &str, version: &str, validator: Validator) {
        self.compiled
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cache_key(tenant, name, version), Arc::new(validator));
    }

    pub fn remove(&self, tenant: &str, name: &str, version: &str) {
        self.compiled
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&cache_key(tenant, name, version));
    }

    pub fn get(&self, tenant: &str, name: &str, version: &str) -> Option<Arc<Validator>> {
        self.compiled
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&cache_key(tenant, name, version))
            .cloned()
    }

    /// Fetch the cached validator, compiling and caching `schema` on a miss.
    pub fn get_or_compile(
        &self,
        tenant: &str,
        name: &str,
        version: &str,
        schema: &Value,
    ) -> Result<Arc<Validator>, BrokerError> {
        if let Some(v) = self.get(tenant, name, version) {
            return Ok(v);
        }
        let validator = compile(schema)?;
        self.insert(tenant, name, version, validator);
        self.get(tenant, name, version)
            .ok_or_else(|| BrokerError::Internal("schema cache lost freshly compiled entry".into()))
    }
}

/// Validate a payload, reporting the JSON pointer of the first offending
/// element and the violated constraint.
pub fn validate_payload(validator: &Validator, payload: &Value) -> Result<(), BrokerError> {
    if let Err(err) = validator.validate(payload) {
        let path = err.instance_path.to_string();
        let at = if path.is_empty() { "/".to_string() } else { path };
        return Err(BrokerError::Validation(format!(
            "payload does not match protocol schema at {at}: {err}"
        )));
    }
    Ok(())
}
