//! Job payload schemas
//!
//! A queued payload may be executed by a newer build than the one that
//! enqueued it, so payload schemas only ever grow: fields are never removed or
//! retyped, and fields added after the first version must be optional.
//! [`check_additive`] enforces this over a payload's whole version history, and
//! [`crate::job::check_history`] replays a sample of every shipped version
//! through the current payload type.

use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    /// Any JSON value.
    Any,
}

impl FieldKind {
    fn matches(self, value: &JsonValue) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSchema {
    pub version: u32,
    pub fields: Vec<FieldSpec>,
}

impl PayloadSchema {
    pub fn new(version: u32, fields: Vec<FieldSpec>) -> Self {
        Self { version, fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check a raw payload against this schema. Unknown fields are allowed.
    pub fn validate(&self, raw: &JsonValue) -> Result<(), String> {
        let obj = raw
            .as_object()
            .ok_or_else(|| "payload must be a JSON object".to_string())?;

        for field in &self.fields {
            match obj.get(field.name) {
                None | Some(JsonValue::Null) if field.required => {
                    return Err(format!("missing required field '{}'", field.name));
                }
                None | Some(JsonValue::Null) => {}
                Some(value) if !field.kind.matches(value) => {
                    return Err(format!(
                        "field '{}' should be {:?}, got {}",
                        field.name, field.kind, value
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchemaEvolutionError {
    #[error("{payload}: schema history is empty")]
    Empty { payload: String },

    #[error("{payload}: version {version} does not follow version {previous}")]
    VersionOrder {
        payload: String,
        previous: u32,
        version: u32,
    },

    #[error("{payload} v{version}: field '{field}' was removed")]
    FieldRemoved {
        payload: String,
        version: u32,
        field: String,
    },

    #[error("{payload} v{version}: field '{field}' changed type")]
    FieldRetyped {
        payload: String,
        version: u32,
        field: String,
    },

    #[error("{payload} v{version}: field '{field}' became required")]
    FieldNowRequired {
        payload: String,
        version: u32,
        field: String,
    },

    #[error("{payload} v{version}: new field '{field}' must be optional")]
    NewRequiredField {
        payload: String,
        version: u32,
        field: String,
    },

    #[error("{payload} v{version}: no sample payload")]
    MissingSample { payload: String, version: u32 },

    #[error("{payload} v{version}: sample payload is not accepted: {reason}")]
    RejectedSample {
        payload: String,
        version: u32,
        reason: String,
    },
}

/// Verify that every schema in `history` is an additive evolution of the one before it.
pub fn check_additive(payload: &str, history: &[PayloadSchema]) -> Result<(), SchemaEvolutionError> {
    if history.is_empty() {
        return Err(SchemaEvolutionError::Empty {
            payload: payload.to_string(),
        });
    }

    for pair in history.windows(2) {
        let (previous, next) = (&pair[0], &pair[1]);
        if next.version <= previous.version {
            return Err(SchemaEvolutionError::VersionOrder {
                payload: payload.to_string(),
                previous: previous.version,
                version: next.version,
            });
        }

        for old in &previous.fields {
            let Some(new) = next.field(old.name) else {
                return Err(SchemaEvolutionError::FieldRemoved {
                    payload: payload.to_string(),
                    version: next.version,
                    field: old.name.to_string(),
                });
            };
            if new.kind != old.kind {
                return Err(SchemaEvolutionError::FieldRetyped {
                    payload: payload.to_string(),
                    version: next.version,
                    field: old.name.to_string(),
                });
            }
            if new.required && !old.required {
                return Err(SchemaEvolutionError::FieldNowRequired {
                    payload: payload.to_string(),
                    version: next.version,
                    field: old.name.to_string(),
                });
            }
        }

        for added in next.fields.iter().filter(|f| previous.field(f.name).is_none()) {
            if added.required {
                return Err(SchemaEvolutionError::NewRequiredField {
                    payload: payload.to_string(),
                    version: next.version,
                    field: added.name.to_string(),
                });
            }
        }
    }

    Ok(())
}
