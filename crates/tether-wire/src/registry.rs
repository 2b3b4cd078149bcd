//! Per-connection type registry.
//!
//! Maps named types to marshal/unmarshal pairs. Registration is one-shot per
//! name and happens at startup; afterwards the registry is read-only and may
//! be shared across tasks without locking.
//!
//! Interface types need side-specific knowledge (a caller turns a local proxy
//! into its `objectId`; a callee checks the id against the live-object
//! registry), so their handling is delegated to a [`HandleBinder`] supplied
//! by the owning dispatcher at marshal time.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

/// Marshal or unmarshal function for a custom type. Must be deterministic
/// for a given value.
pub type CodecFn = Arc<dyn Fn(&Value) -> Result<Value, RegistryError> + Send + Sync>;

/// Side-specific handling of interface-typed values.
pub trait HandleBinder: Send + Sync {
    /// Turn a local handle value into its wire identifier.
    fn marshal_handle(&self, interface: &str, value: &Value) -> Result<Value, RegistryError>;

    /// Reconstruct a handle from a wire identifier.
    fn unmarshal_handle(&self, interface: &str, value: &Value) -> Result<Value, RegistryError>;
}

/// Binder for contexts with no live handles (tests, plain data pipelines).
/// Passes identifiers through unchanged.
pub struct NoHandles;

impl HandleBinder for NoHandles {
    fn marshal_handle(&self, _interface: &str, value: &Value) -> Result<Value, RegistryError> {
        Ok(value.clone())
    }

    fn unmarshal_handle(&self, _interface: &str, value: &Value) -> Result<Value, RegistryError> {
        Ok(value.clone())
    }
}

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("type {0:?} is already registered")]
    DuplicateTypeRegistration(String),
    #[error("alias cycle while resolving {0:?}")]
    AliasCycle(String),
    #[error("cannot marshal {ty:?}: {reason}")]
    Marshal { ty: String, reason: String },
    #[error("cannot unmarshal {ty:?}: {reason}")]
    Unmarshal { ty: String, reason: String },
}

enum Registration {
    /// Forwards marshaling to the target definition.
    Alias { target: String },
    /// Interface handle; delegated to the binder.
    Interface,
    /// Caller-supplied marshal/unmarshal pair.
    Custom { marshal: CodecFn, unmarshal: CodecFn },
}

/// Name → marshal/unmarshal registry.
///
/// Unregistered names (primitive schema types such as `number` or `string`)
/// pass through unchanged.
#[derive(Default)]
pub struct TypeRegistry {
    entries: HashMap<String, Registration>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, name: String, registration: Registration) -> Result<(), RegistryError> {
        if self.entries.contains_key(&name) {
            return Err(RegistryError::DuplicateTypeRegistration(name));
        }
        self.entries.insert(name, registration);
        Ok(())
    }

    pub fn register_alias(
        &mut self,
        name: impl Into<String>,
        target: impl Into<String>,
    ) -> Result<(), RegistryError> {
        self.insert(
            name.into(),
            Registration::Alias {
                target: target.into(),
            },
        )
    }

    pub fn register_interface(&mut self, name: impl Into<String>) -> Result<(), RegistryError> {
        self.insert(name.into(), Registration::Interface)
    }

    pub fn register_custom(
        &mut self,
        name: impl Into<String>,
        marshal: CodecFn,
        unmarshal: CodecFn,
    ) -> Result<(), RegistryError> {
        self.insert(name.into(), Registration::Custom { marshal, unmarshal })
    }

    /// Register every alias and interface a schema declares.
    pub fn register_schema_types(
        &mut self,
        schema: &crate::schema::ServiceSchema,
    ) -> Result<(), RegistryError> {
        for (name, target) in schema.alias_entries() {
            self.register_alias(name, target)?;
        }
        for name in schema.interface_names() {
            self.register_interface(name)?;
        }
        Ok(())
    }

    /// Marshal a value declared as `ty` for transmission.
    pub fn marshal(
        &self,
        ty: &str,
        value: &Value,
        binder: &dyn HandleBinder,
    ) -> Result<Value, RegistryError> {
        match self.lookup(ty)? {
            None => Ok(value.clone()),
            Some((name, Registration::Interface)) => binder.marshal_handle(name, value),
            Some((_, Registration::Custom { marshal, .. })) => marshal(value),
            Some((_, Registration::Alias { .. })) => unreachable!("aliases resolved in lookup"),
        }
    }

    /// Unmarshal a received value declared as `ty`.
    pub fn unmarshal(
        &self,
        ty: &str,
        value: &Value,
        binder: &dyn HandleBinder,
    ) -> Result<Value, RegistryError> {
        match self.lookup(ty)? {
            None => Ok(value.clone()),
            Some((name, Registration::Interface)) => binder.unmarshal_handle(name, value),
            Some((_, Registration::Custom { unmarshal, .. })) => unmarshal(value),
            Some((_, Registration::Alias { .. })) => unreachable!("aliases resolved in lookup"),
        }
    }

    /// Resolve aliases to the terminal registration, if any.
    fn lookup<'a>(
        &'a self,
        ty: &'a str,
    ) -> Result<Option<(&'a str, &'a Registration)>, RegistryError> {
        let mut current = ty;
        for _ in 0..=self.entries.len() {
            match self.entries.get(current) {
                None => return Ok(None),
                Some(Registration::Alias { target }) => current = target,
                Some(registration) => return Ok(Some((current, registration))),
            }
        }
        Err(RegistryError::AliasCycle(ty.to_string()))
    }
}
