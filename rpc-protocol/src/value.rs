//! Structured message content.
//!
//! A `Value` is the document carried in a payload. Capabilities appear as
//! [`Value::Capability`] leaves holding an index into the payload's
//! capability table, so a document can be copied around without touching
//! reference counts.

use serde::Deserialize;
use serde::Serialize;

use crate::message::PipelineOp;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    #[serde(rename = "uint")]
    UInt(u64),
    Float(f64),
    Text(String),
    Data(Vec<u8>),
    List(Vec<Value>),
    Struct(Vec<Field>),
    Capability(u32),
}

/// A named struct member. Field position is significant: pipeline paths
/// select fields by index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("pipeline step {step} reads a field of a non-struct value")]
    NotAStruct { step: usize },
}

impl Value {
    /// Build a struct from `(name, value)` pairs, keeping their order.
    pub fn structure<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        Value::Struct(
            fields
                .into_iter()
                .map(|(name, value)| Field {
                    name: name.into(),
                    value,
                })
                .collect(),
        )
    }

    pub fn text(text: impl Into<String>) -> Self {
        Value::Text(text.into())
    }

    /// Look up a struct field by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct(fields) => fields
                .iter()
                .find(|field| field.name == name)
                .map(|field| &field.value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::UInt(value) => i64::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::UInt(value) => Some(*value),
            Value::Int(value) => u64::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_capability(&self) -> Option<u32> {
        match self {
            Value::Capability(index) => Some(*index),
            _ => None,
        }
    }

    /// Follow a pipeline transform path.
    ///
    /// `GetPointerField(n)` selects the n-th field of a struct. Reading past
    /// the last field or through a null yields null, the same as reading an
    /// unset pointer.
    pub fn follow(&self, ops: &[PipelineOp]) -> Result<&Value, PathError> {
        let mut current = self;
        for (step, op) in ops.iter().enumerate() {
            match op {
                PipelineOp::Noop => {}
                PipelineOp::GetPointerField(index) => match current {
                    Value::Null => return Ok(&Value::Null),
                    Value::Struct(fields) => match fields.get(usize::from(*index)) {
                        Some(field) => current = &field.value,
                        None => return Ok(&Value::Null),
                    },
                    _ => return Err(PathError::NotAStruct { step }),
                },
            }
        }
        Ok(current)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::UInt(value)
    }
}
