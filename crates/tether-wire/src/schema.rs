//! Consumed form of the service schema.
//!
//! The schema source (an external collaborator) produces declarations for
//! aliases, interfaces, and free functions; the transport only reads them to
//! learn call shapes, parameter types, and return types. The JSON layout is:
//!
//! ```json
//! {"declarations": [
//!   {"kind": "alias", "name": "Path", "target": "string"},
//!   {"kind": "function", "name": "add",
//!    "params": ["number", "number"],
//!    "returns": {"shape": "promise", "type": "number"}},
//!   {"kind": "interface", "name": "Session",
//!    "ctor": {"params": []},
//!    "methods": {"rename": {"params": ["string"], "returns": {"shape": "void"}}}}
//! ]}
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a call's results come back over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum ReturnShape {
    /// Fire-and-forget: no reply frame at all.
    #[default]
    Void,
    /// Exactly one terminal reply.
    Promise {
        #[serde(rename = "type")]
        ty: String,
    },
    /// Zero or more `next` frames followed by at most one terminal frame.
    Observable {
        #[serde(rename = "type")]
        ty: String,
    },
}

impl ReturnShape {
    /// Short name used in shape-mismatch diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ReturnShape::Void => "void",
            ReturnShape::Promise { .. } => "promise",
            ReturnShape::Observable { .. } => "observable",
        }
    }

    /// Declared element/result type, when the shape carries one.
    pub fn value_type(&self) -> Option<&str> {
        match self {
            ReturnShape::Void => None,
            ReturnShape::Promise { ty } | ReturnShape::Observable { ty } => Some(ty),
        }
    }
}

/// Declared signature of a function, method, or constructor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Signature {
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub returns: ReturnShape,
}

/// Declared interface: constructor signature plus named method signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceDecl {
    #[serde(default)]
    pub ctor: Signature,
    #[serde(default)]
    pub methods: HashMap<String, Signature>,
}

/// One declaration from the schema source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Declaration {
    Alias {
        name: String,
        target: String,
    },
    Function {
        name: String,
        #[serde(flatten)]
        sig: Signature,
    },
    Interface {
        name: String,
        #[serde(flatten)]
        decl: InterfaceDecl,
    },
}

impl Declaration {
    pub fn name(&self) -> &str {
        match self {
            Declaration::Alias { name, .. }
            | Declaration::Function { name, .. }
            | Declaration::Interface { name, .. } => name,
        }
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate declaration {0:?}")]
    DuplicateDeclaration(String),
}

#[derive(Debug, Clone, Deserialize)]
struct SchemaDocument {
    declarations: Vec<Declaration>,
}

/// Aggregated, lookup-ready schema.
#[derive(Debug, Clone, Default)]
pub struct ServiceSchema {
    aliases: HashMap<String, String>,
    functions: HashMap<String, Signature>,
    interfaces: HashMap<String, InterfaceDecl>,
}

impl ServiceSchema {
    /// Build from a list of declarations; duplicate names are rejected.
    pub fn from_declarations(declarations: Vec<Declaration>) -> Result<Self, SchemaError> {
        let mut schema = Self::default();
        for declaration in declarations {
            let name = declaration.name().to_string();
            if schema.aliases.contains_key(&name)
                || schema.functions.contains_key(&name)
                || schema.interfaces.contains_key(&name)
            {
                return Err(SchemaError::DuplicateDeclaration(name));
            }
            match declaration {
                Declaration::Alias { name, target } => {
                    schema.aliases.insert(name, target);
                }
                Declaration::Function { name, sig } => {
                    schema.functions.insert(name, sig);
                }
                Declaration::Interface { name, decl } => {
                    schema.interfaces.insert(name, decl);
                }
            }
        }
        Ok(schema)
    }

    /// Parse the JSON document the schema source emits.
    pub fn from_json(text: &str) -> Result<Self, SchemaError> {
        let document: SchemaDocument = serde_json::from_str(text)?;
        Self::from_declarations(document.declarations)
    }

    pub fn function(&self, name: &str) -> Option<&Signature> {
        self.functions.get(name)
    }

    pub fn interface(&self, name: &str) -> Option<&InterfaceDecl> {
        self.interfaces.get(name)
    }

    pub fn method(&self, interface: &str, method: &str) -> Option<&Signature> {
        self.interfaces.get(interface)?.methods.get(method)
    }

    pub fn alias_target(&self, name: &str) -> Option<&str> {
        self.aliases.get(name).map(String::as_str)
    }

    /// All declared alias pairs, for seeding a type registry.
    pub fn alias_entries(&self) -> Vec<(String, String)> {
        self.aliases
            .iter()
            .map(|(name, target)| (name.clone(), target.clone()))
            .collect()
    }

    /// All declared interface names, for seeding a type registry.
    pub fn interface_names(&self) -> Vec<String> {
        self.interfaces.keys().cloned().collect()
    }

    /// Chase alias declarations to the underlying type name.
    ///
    /// Stops after the map size in hops so a cyclic schema cannot loop.
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        let mut current = name;
        for _ in 0..=self.aliases.len() {
            match self.aliases.get(current) {
                Some(target) => current = target,
                None => return current,
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA_JSON: &str = r#"{
        "declarations": [
            {"kind": "alias", "name": "Path", "target": "string"},
            {"kind": "function", "name": "add",
             "params": ["number", "number"],
             "returns": {"shape": "promise", "type": "number"}},
            {"kind": "function", "name": "tail",
             "params": ["Path"],
             "returns": {"shape": "observable", "type": "string"}},
            {"kind": "function", "name": "log",
             "params": ["string"],
             "returns": {"shape": "void"}},
            {"kind": "interface", "name": "Session",
             "ctor": {"params": []},
             "methods": {
                 "rename": {"params": ["string"], "returns": {"shape": "void"}},
                 "title": {"returns": {"shape": "promise", "type": "string"}}
             }}
        ]
    }"#;

    #[test]
    fn test_parse_and_lookup() {
        let schema = ServiceSchema::from_json(SCHEMA_JSON).unwrap();

        let add = schema.function("add").unwrap();
        assert_eq!(add.params, vec!["number", "number"]);
        assert_eq!(
            add.returns,
            ReturnShape::Promise {
                ty: "number".to_string()
            }
        );

        let tail = schema.function("tail").unwrap();
        assert_eq!(tail.returns.name(), "observable");

        assert_eq!(schema.function("log").unwrap().returns, ReturnShape::Void);

        let rename = schema.method("Session", "rename").unwrap();
        assert_eq!(rename.returns, ReturnShape::Void);
        assert!(schema.method("Session", "missing").is_none());
        assert!(schema.function("missing").is_none());
    }

    #[test]
    fn test_alias_resolution() {
        let schema = ServiceSchema::from_json(SCHEMA_JSON).unwrap();
        assert_eq!(schema.resolve("Path"), "string");
        assert_eq!(schema.resolve("number"), "number");
    }

    #[test]
    fn test_alias_cycle_terminates() {
        let schema = ServiceSchema::from_declarations(vec![
            Declaration::Alias {
                name: "A".to_string(),
                target: "B".to_string(),
            },
            Declaration::Alias {
                name: "B".to_string(),
                target: "A".to_string(),
            },
        ])
        .unwrap();
        // Must not hang; whichever name it lands on is acceptable.
        let resolved = schema.resolve("A");
        assert!(resolved == "A" || resolved == "B");
    }

    #[test]
    fn test_duplicate_declaration_rejected() {
        let result = ServiceSchema::from_declarations(vec![
            Declaration::Function {
                name: "add".to_string(),
                sig: Signature::default(),
            },
            Declaration::Function {
                name: "add".to_string(),
                sig: Signature::default(),
            },
        ]);
        assert!(matches!(result, Err(SchemaError::DuplicateDeclaration(_))));
    }

    #[test]
    fn test_ctor_defaults_to_void() {
        let schema = ServiceSchema::from_json(SCHEMA_JSON).unwrap();
        let session = schema.interface("Session").unwrap();
        assert_eq!(session.ctor.returns, ReturnShape::Void);
    }
}
