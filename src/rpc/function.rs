//! Function ids and schema validation at the decode boundary.
//!
//! The RPC vocabulary is pluggable: the registry only knows the functions it
//! was told about, and envelopes for unknown function ids pass through as
//! opaque payloads. Known functions are checked for their required keys.

use std::collections::HashMap;

use super::envelope::{MessageKind, RpcEnvelope};
use crate::error::{ProxyError, Result};

/// Function ids the connection core itself relies on.
pub mod function_id {
    pub const REGISTER_APP_INTERFACE: u32 = 1;
    pub const UNREGISTER_APP_INTERFACE: u32 = 2;
    pub const DIAL_NUMBER: u32 = 40;
    pub const ON_HMI_STATUS: u32 = 32768;
    pub const ON_APP_INTERFACE_UNREGISTERED: u32 = 32769;
}

/// Required parameter keys of one function, per message kind.
#[derive(Debug, Clone, Default)]
pub struct FunctionSchema {
    name: String,
    request: Vec<String>,
    response: Vec<String>,
    notification: Vec<String>,
}

impl FunctionSchema {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request(&mut self, keys: &[&str]) -> &mut Self {
        self.request = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn response(&mut self, keys: &[&str]) -> &mut Self {
        self.response = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn notification(&mut self, keys: &[&str]) -> &mut Self {
        self.notification = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    fn required(&self, kind: MessageKind) -> &[String] {
        match kind {
            MessageKind::Request => &self.request,
            MessageKind::Response => &self.response,
            MessageKind::Notification => &self.notification,
        }
    }
}

/// Registry mapping function ids to their schemas.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<u32, FunctionSchema>,
}

impl FunctionRegistry {
    /// Create an empty registry that treats every function as opaque.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the functions used by the connection lifecycle.
    pub fn with_core_functions() -> Self {
        use function_id::*;

        let mut registry = Self::new();
        registry
            .define(REGISTER_APP_INTERFACE, "RegisterAppInterface")
            .request(&[
                "syncMsgVersion",
                "appName",
                "isMediaApplication",
                "languageDesired",
                "hmiDisplayLanguageDesired",
                "appID",
            ])
            .response(&["success", "resultCode"]);
        registry
            .define(UNREGISTER_APP_INTERFACE, "UnregisterAppInterface")
            .response(&["success", "resultCode"]);
        registry
            .define(DIAL_NUMBER, "DialNumber")
            .request(&["number"])
            .response(&["success", "resultCode"]);
        registry
            .define(ON_HMI_STATUS, "OnHMIStatus")
            .notification(&["hmiLevel", "audioStreamingState", "systemContext"]);
        registry
            .define(ON_APP_INTERFACE_UNREGISTERED, "OnAppInterfaceUnregistered")
            .notification(&["reason"]);
        registry
    }

    /// Define (or redefine) a function and return its schema for editing.
    pub fn define(&mut self, id: u32, name: &str) -> &mut FunctionSchema {
        let slot = self.functions.entry(id).or_default();
        *slot = FunctionSchema::new(name);
        slot
    }

    pub fn name(&self, id: u32) -> Option<&str> {
        self.functions.get(&id).map(FunctionSchema::name)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.functions.contains_key(&id)
    }

    /// Check an envelope against its function's schema.
    pub fn validate(&self, envelope: &RpcEnvelope) -> Result<()> {
        let Some(schema) = self.functions.get(&envelope.function_id) else {
            return Ok(());
        };

        let missing: Vec<&str> = schema
            .required(envelope.kind)
            .iter()
            .filter(|key| !envelope.params.contains_key(key.as_str()))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ProxyError::InvalidPayload(format!(
                "{} {:?} missing required parameters: {}",
                schema.name,
                envelope.kind,
                missing.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_function_is_opaque() {
        let registry = FunctionRegistry::with_core_functions();
        let envelope = RpcEnvelope::request(9999).with_param("anything", 1);
        assert!(registry.validate(&envelope).is_ok());
        assert!(!registry.contains(9999));
    }

    #[test]
    fn test_missing_required_key() {
        let registry = FunctionRegistry::with_core_functions();
        let envelope = RpcEnvelope::notification(function_id::ON_HMI_STATUS)
            .with_param("hmiLevel", "FULL");

        let err = registry.validate(&envelope).unwrap_err().to_string();
        assert!(err.contains("OnHMIStatus"));
        assert!(err.contains("audioStreamingState"));
        assert!(err.contains("systemContext"));
    }

    #[test]
    fn test_valid_response() {
        let registry = FunctionRegistry::with_core_functions();
        let envelope = RpcEnvelope::response(function_id::DIAL_NUMBER, 3)
            .with_param("success", true)
            .with_param("resultCode", "SUCCESS");
        assert!(registry.validate(&envelope).is_ok());
    }

    #[test]
    fn test_define_custom_function() {
        let mut registry = FunctionRegistry::new();
        registry.define(77, "Show").request(&["mainField1"]);

        assert_eq!(registry.name(77), Some("Show"));
        assert!(registry.validate(&RpcEnvelope::request(77)).is_err());
        assert!(registry
            .validate(&RpcEnvelope::request(77).with_param("mainField1", "hi"))
            .is_ok());
        // Kinds without requirements are unconstrained.
        assert!(registry.validate(&RpcEnvelope::response(77, 1)).is_ok());
    }
}
