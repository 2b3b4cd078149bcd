use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error payload carried on the wire.
///
/// A service exception is encoded as `{message, code?, stack?}`; `code` is
/// transmitted only when present on the thrown value, and `stack` is
/// advisory. Non-object errors travel as primitives and surface as-is in
/// `message` form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl WireError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            stack: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Encode for transmission in a response frame's `error` field.
    pub fn to_wire(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::String(self.message.clone()))
    }

    /// Reconstruct from a received `error` field.
    ///
    /// Objects yield their `message`/`code`/`stack` fields; primitives are
    /// surfaced as the message itself.
    pub fn from_wire(value: &Value) -> Self {
        match value {
            Value::Object(map) => {
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                let code = map
                    .get("code")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let stack = map
                    .get("stack")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Self {
                    message,
                    code,
                    stack,
                }
            }
            Value::String(s) => Self::new(s.clone()),
            other => Self::new(other.to_string()),
        }
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for WireError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_roundtrip() {
        let error = WireError::new("boom").with_code("EBOOM");
        let wire = error.to_wire();
        assert_eq!(wire, json!({"message": "boom", "code": "EBOOM"}));

        let back = WireError::from_wire(&wire);
        assert_eq!(back, error);
    }

    #[test]
    fn test_code_omitted_when_absent() {
        let wire = WireError::new("plain").to_wire();
        assert_eq!(wire, json!({"message": "plain"}));
    }

    #[test]
    fn test_primitive_error_surfaces_as_message() {
        let back = WireError::from_wire(&json!("just a string"));
        assert_eq!(back.message, "just a string");
        assert_eq!(back.code, None);

        let numeric = WireError::from_wire(&json!(42));
        assert_eq!(numeric.message, "42");
    }

    #[test]
    fn test_stack_is_preserved_verbatim() {
        let wire = json!({"message": "boom", "stack": "at foo()\nat bar()"});
        let back = WireError::from_wire(&wire);
        assert_eq!(back.stack.as_deref(), Some("at foo()\nat bar()"));
    }
}
