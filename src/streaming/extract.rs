use serde_json::Value;

use crate::error::Result;

/// Terminal payload used by OpenAI-style event streams
pub const DONE_MARKER: &str = "[DONE]";

/// Top-level fields tried, in order, when no pointer is configured
pub const DEFAULT_FIELDS: [&str; 3] = ["content", "token", "data"];

/// Where to find the text inside a JSON payload line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TextField {
    /// First present string among `content`, `token`, `data`
    #[default]
    Default,
    /// A named top-level field
    Named(String),
    /// A JSON pointer such as `/choices/0/delta/content`
    Pointer(String),
}

impl TextField {
    /// `/`-prefixed strings are pointers, anything else a field name
    pub fn parse(spec: &str) -> Self {
        match spec {
            "" => TextField::Default,
            s if s.starts_with('/') => TextField::Pointer(s.to_string()),
            s => TextField::Named(s.to_string()),
        }
    }

    /// Pull the text out of one payload line.
    ///
    /// `Ok(None)` for the done marker or when the field is absent or not a
    /// string; an error only when the payload is not JSON.
    pub fn extract(&self, payload: &str) -> Result<Option<String>> {
        let payload = payload.trim();
        if payload == DONE_MARKER {
            return Ok(None);
        }

        let value: Value = serde_json::from_str(payload)?;
        let found = match self {
            TextField::Default => DEFAULT_FIELDS
                .iter()
                .find_map(|field| value.get(field).and_then(Value::as_str)),
            TextField::Named(name) => value.get(name).and_then(Value::as_str),
            TextField::Pointer(pointer) => value.pointer(pointer).and_then(Value::as_str),
        };
        Ok(found.map(str::to_string))
    }
}

pub fn is_done(payload: &str) -> bool {
    payload.trim() == DONE_MARKER
}
