//! Schema validation of raw inbound messages
//!
//! Each message type declares its fields; anything outside the declared
//! fields and the routing allow-list is rejected. Size, string length, array
//! length and nesting depth are bounded globally by [`ValidationLimits`].

use std::collections::BTreeMap;

use hashbrown::HashMap;
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::ValidationLimits;
use crate::errors::ValidationError;

/// Routing fields accepted on every message type
pub const ROUTING_FIELDS: [&str; 3] = ["type", "_s", "_ctrl"];

// ----------------------------------------------------------------------------
// Field Rules
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
        }
    }
}

/// Built-in string patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// 64 hexadecimal characters (SHA-256 digest)
    HexDigest,
    /// ASCII letters, digits, `-` and `_`
    Identifier,
}

impl Pattern {
    pub fn matches(&self, raw: &str) -> bool {
        match self {
            Pattern::HexDigest => raw.len() == 64 && raw.bytes().all(|b| b.is_ascii_hexdigit()),
            Pattern::Identifier => {
                !raw.is_empty()
                    && raw
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
            }
        }
    }
}

/// Constraints on a single top-level field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRule {
    pub kind: FieldKind,
    pub max_length: Option<usize>,
    pub pattern: Option<Pattern>,
    pub min: Option<i64>,
    pub nullable: bool,
    pub max_depth: Option<usize>,
}

impl FieldRule {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            max_length: None,
            pattern: None,
            min: None,
            nullable: false,
            max_depth: None,
        }
    }

    pub fn string() -> Self {
        Self::new(FieldKind::String)
    }

    pub fn number() -> Self {
        Self::new(FieldKind::Number)
    }

    pub fn object() -> Self {
        Self::new(FieldKind::Object)
    }

    pub fn array() -> Self {
        Self::new(FieldKind::Array)
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn pattern(mut self, pattern: Pattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn min(mut self, min: i64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }
}

// ----------------------------------------------------------------------------
// Message Schema
// ----------------------------------------------------------------------------

/// Declared shape of one message type
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageSchema {
    pub required: Vec<String>,
    pub fields: BTreeMap<String, FieldRule>,
}

impl MessageSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field that must be present
    pub fn require(mut self, name: &str, rule: FieldRule) -> Self {
        self.required.push(name.to_string());
        self.fields.insert(name.to_string(), rule);
        self
    }

    /// Declare an optional field
    pub fn field(mut self, name: &str, rule: FieldRule) -> Self {
        self.fields.insert(name.to_string(), rule);
        self
    }
}

fn builtin_schemas() -> HashMap<String, MessageSchema> {
    let timestamp = || FieldRule::number().min(0);
    let state = || FieldRule::object().max_depth(5);

    [
        (
            "auth",
            MessageSchema::new()
                .require("hash", FieldRule::string().max_length(64).pattern(Pattern::HexDigest))
                .require("name", FieldRule::string().max_length(10).pattern(Pattern::Identifier))
                .field("timestamp", timestamp()),
        ),
        ("ping", MessageSchema::new().require("timestamp", timestamp())),
        ("pong", MessageSchema::new().require("timestamp", timestamp())),
        ("fullState", MessageSchema::new().require("state", state())),
        ("localState", MessageSchema::new().require("state", state())),
        (
            "action",
            MessageSchema::new().require("action", FieldRule::object().nullable().max_depth(3)),
        ),
        ("message", MessageSchema::new().require("payload", state())),
        (
            "_ctrl",
            MessageSchema::new()
                .require("_ctrl", FieldRule::string().max_length(50))
                .require("id", FieldRule::string().max_length(50))
                .field("mode", FieldRule::string().max_length(20))
                .field("fps", FieldRule::number().min(0)),
        ),
    ]
    .into_iter()
    .map(|(name, schema)| (name.to_string(), schema))
    .collect()
}

// ----------------------------------------------------------------------------
// Validator
// ----------------------------------------------------------------------------

/// Validates raw inbound messages against per-type schemas
#[derive(Debug, Clone)]
pub struct MessageValidator {
    schemas: HashMap<String, MessageSchema>,
    limits: ValidationLimits,
}

impl Default for MessageValidator {
    fn default() -> Self {
        Self::new(ValidationLimits::default())
    }
}

impl MessageValidator {
    /// Validator preloaded with the session-layer message types
    pub fn new(limits: ValidationLimits) -> Self {
        Self {
            schemas: builtin_schemas(),
            limits,
        }
    }

    /// Add or replace the schema of an application message type
    pub fn register_schema(&mut self, message_type: &str, schema: MessageSchema) {
        debug!(message_type, "schema registered");
        self.schemas.insert(message_type.to_string(), schema);
    }

    pub fn schema(&self, message_type: &str) -> Option<&MessageSchema> {
        self.schemas.get(message_type)
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    /// Parse and validate a message from raw bytes
    pub fn validate_bytes(&self, raw: &[u8]) -> Result<Value, ValidationError> {
        if raw.len() > self.limits.max_message_size {
            return Err(ValidationError::TooLarge {
                size: raw.len(),
                max: self.limits.max_message_size,
            });
        }
        let value: Value = serde_json::from_slice(raw).map_err(|e| ValidationError::Malformed {
            reason: e.to_string(),
        })?;
        self.validate(&value)?;
        Ok(value)
    }

    /// Validate a decoded message, returning its type on success
    pub fn validate<'a>(&self, message: &'a Value) -> Result<&'a str, ValidationError> {
        let object = message.as_object().ok_or(ValidationError::NotAnObject)?;

        let size = serde_json::to_vec(message)
            .map(|bytes| bytes.len())
            .map_err(|e| ValidationError::Malformed {
                reason: e.to_string(),
            })?;
        if size > self.limits.max_message_size {
            return Err(ValidationError::TooLarge {
                size,
                max: self.limits.max_message_size,
            });
        }

        let message_type = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ValidationError::MissingType)?;
        let schema = self
            .schemas
            .get(message_type)
            .ok_or_else(|| ValidationError::UnknownType {
                message_type: message_type.to_string(),
            })?;

        for field in &schema.required {
            if !object.contains_key(field) {
                return Err(ValidationError::MissingField {
                    field: field.clone(),
                });
            }
        }

        for (name, value) in object {
            match schema.fields.get(name) {
                Some(rule) => self.check_field(name, rule, value)?,
                None if ROUTING_FIELDS.contains(&name.as_str()) => {
                    self.check_nested(name, value, 1)?;
                }
                None => {
                    return Err(ValidationError::UnexpectedField {
                        field: name.clone(),
                    })
                }
            }
        }

        trace!(message_type, size, "message accepted");
        Ok(message_type)
    }

    fn check_field(&self, name: &str, rule: &FieldRule, value: &Value) -> Result<(), ValidationError> {
        if value.is_null() && rule.nullable {
            return Ok(());
        }
        if !rule.kind.matches(value) {
            return Err(ValidationError::WrongType {
                field: name.to_string(),
                expected: rule.kind.as_str(),
            });
        }

        match value {
            Value::String(raw) => {
                let max = rule.max_length.unwrap_or(self.limits.max_string_length);
                if raw.chars().count() > max {
                    return Err(ValidationError::TooLong {
                        field: name.to_string(),
                        max,
                    });
                }
                if let Some(pattern) = rule.pattern {
                    if !pattern.matches(raw) {
                        return Err(ValidationError::PatternMismatch {
                            field: name.to_string(),
                        });
                    }
                }
            }
            Value::Number(number) => {
                if let Some(min) = rule.min {
                    let below = number.as_f64().is_some_and(|n| n < min as f64);
                    if below {
                        return Err(ValidationError::BelowMinimum {
                            field: name.to_string(),
                            min,
                        });
                    }
                }
            }
            Value::Object(_) | Value::Array(_) => {
                if let Some(max) = rule.max_depth {
                    if depth(value) > max {
                        return Err(ValidationError::TooDeep {
                            field: name.to_string(),
                            max,
                        });
                    }
                }
                if let (Value::Array(items), Some(max)) = (value, rule.max_length) {
                    if items.len() > max {
                        return Err(ValidationError::TooLong {
                            field: name.to_string(),
                            max,
                        });
                    }
                }
                self.check_nested(name, value, 1)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Global ceilings applied to everything below a top-level field
    fn check_nested(&self, field: &str, value: &Value, level: usize) -> Result<(), ValidationError> {
        match value {
            Value::String(raw) if raw.chars().count() > self.limits.max_string_length => {
                Err(ValidationError::TooLong {
                    field: field.to_string(),
                    max: self.limits.max_string_length,
                })
            }
            Value::Array(items) => {
                if items.len() > self.limits.max_array_length {
                    return Err(ValidationError::TooLong {
                        field: field.to_string(),
                        max: self.limits.max_array_length,
                    });
                }
                self.check_level(field, level)?;
                items
                    .iter()
                    .try_for_each(|item| self.check_nested(field, item, level + 1))
            }
            Value::Object(map) => {
                self.check_level(field, level)?;
                map.values()
                    .try_for_each(|item| self.check_nested(field, item, level + 1))
            }
            _ => Ok(()),
        }
    }

    fn check_level(&self, field: &str, level: usize) -> Result<(), ValidationError> {
        if level > self.limits.max_object_depth {
            return Err(ValidationError::TooDeep {
                field: field.to_string(),
                max: self.limits.max_object_depth,
            });
        }
        Ok(())
    }
}

/// Nesting depth of objects and arrays; scalars are depth 0
pub fn depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(depth).max().unwrap_or(0),
        _ => 0,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
