//! # Formula Values
//!
//! A formula value is a decimal, a boolean, a string, or an object.
//! Objects are JSON-like trees (`Node`) behind an `Arc`: handing one to
//! another variable is a pointer copy, and the first mutation through a
//! shared handle clones the tree (`Arc::make_mut`).
//!
//! Values also have a stored form, a `(kind, text)` pair that state
//! variables are persisted as.

use super::decimal::{Decimal, DecimalError};
use serde::{Deserialize, Serialize};
use shared_types::canonical_json;
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// TREE NODES
// =============================================================================

/// One node of an object tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Decimal leaf.
    Number(Decimal),
    /// Boolean leaf.
    Bool(bool),
    /// String leaf.
    Str(String),
    /// Ordered list.
    Array(Vec<Node>),
    /// Map with sorted keys.
    Map(BTreeMap<String, Node>),
}

impl Node {
    /// Converts parsed JSON. `null` becomes `false`.
    ///
    /// # Errors
    ///
    /// Fails if a number is out of decimal range.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, DecimalError> {
        Ok(match json {
            serde_json::Value::Null => Node::Bool(false),
            serde_json::Value::Bool(b) => Node::Bool(*b),
            serde_json::Value::Number(n) => Node::Number(n.to_string().parse()?),
            serde_json::Value::String(s) => Node::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Node::Array(items.iter().map(Node::from_json).collect::<Result<_, _>>()?)
            }
            serde_json::Value::Object(map) => Node::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Node::from_json(v)?)))
                    .collect::<Result<_, DecimalError>>()?,
            ),
        })
    }

    /// Converts to JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Node::Number(d) => d.to_json(),
            Node::Bool(b) => serde_json::Value::Bool(*b),
            Node::Str(s) => serde_json::Value::String(s.clone()),
            Node::Array(items) => serde_json::Value::Array(items.iter().map(Node::to_json).collect()),
            Node::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Whether this is an array or a map.
    #[must_use]
    pub fn is_object(&self) -> bool {
        matches!(self, Node::Array(_) | Node::Map(_))
    }
}

// =============================================================================
// OBJECT HANDLES
// =============================================================================

/// Shared handle to an object tree.
#[derive(Debug, Clone)]
pub struct ObjectRef {
    root: Arc<Node>,
    frozen: bool,
}

impl ObjectRef {
    /// Wraps a tree.
    #[must_use]
    pub fn new(node: Node) -> Self {
        Self { root: Arc::new(node), frozen: false }
    }

    /// The tree.
    #[must_use]
    pub fn node(&self) -> &Node {
        &self.root
    }

    /// Whether further mutation is refused.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Refuses all further mutation through this handle.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Mutable access, cloning the tree if it is shared. `None` if frozen.
    pub fn make_mut(&mut self) -> Option<&mut Node> {
        if self.frozen {
            None
        } else {
            Some(Arc::make_mut(&mut self.root))
        }
    }

    /// Takes the tree out, cloning only if it is still shared.
    #[must_use]
    pub fn into_node(self) -> Node {
        Arc::try_unwrap(self.root).unwrap_or_else(|shared| (*shared).clone())
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
    }
}

// =============================================================================
// VALUES
// =============================================================================

/// A formula value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Decimal number.
    Number(Decimal),
    /// Boolean.
    Bool(bool),
    /// String.
    Str(String),
    /// Array or map.
    Object(ObjectRef),
}

impl Value {
    /// Lifts a tree node; arrays and maps become objects.
    #[must_use]
    pub fn from_node(node: Node) -> Self {
        match node {
            Node::Number(d) => Value::Number(d),
            Node::Bool(b) => Value::Bool(b),
            Node::Str(s) => Value::Str(s),
            object => Value::Object(ObjectRef::new(object)),
        }
    }

    /// Lowers to a tree node.
    #[must_use]
    pub fn into_node(self) -> Node {
        match self {
            Value::Number(d) => Node::Number(d),
            Value::Bool(b) => Node::Bool(b),
            Value::Str(s) => Node::Str(s),
            Value::Object(o) => o.into_node(),
        }
    }

    /// A copy of this value as a tree node.
    #[must_use]
    pub fn to_node(&self) -> Node {
        self.clone().into_node()
    }

    /// Converts parsed JSON.
    ///
    /// # Errors
    ///
    /// Fails if a number is out of decimal range.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, DecimalError> {
        Node::from_json(json).map(Value::from_node)
    }

    /// Converts to JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Object(o) => o.node().to_json(),
            Value::Number(d) => d.to_json(),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Str(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Canonical JSON text.
    #[must_use]
    pub fn canonical_json(&self) -> String {
        canonical_json(&self.to_json())
    }

    /// Name returned by `typeof`.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Bool(_) => "boolean",
            Value::Str(_) => "string",
            Value::Object(_) => "object",
        }
    }

    /// `false`, `0` and `""` are falsy; everything else, objects included, is truthy.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Number(d) => !d.is_zero(),
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
            Value::Object(_) => true,
        }
    }

    /// Text used by string concatenation and string functions.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Value::Number(d) => d.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Str(s) => s.clone(),
            Value::Object(_) => self.canonical_json(),
        }
    }

    /// Whether this is an object.
    #[must_use]
    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }
}

impl From<Decimal> for Value {
    fn from(d: Decimal) -> Self {
        Value::Number(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

// =============================================================================
// STORED FORM
// =============================================================================

/// Type tag of a persisted state variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoredKind {
    /// Decimal text.
    Number,
    /// Raw string.
    String,
    /// Canonical JSON.
    Object,
}

/// A state variable as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    /// Type tag.
    pub kind: StoredKind,
    /// Text form.
    pub text: String,
}

impl Value {
    /// Stored form; `None` means the variable is deleted. `true` is stored as `1`.
    #[must_use]
    pub fn to_stored(&self) -> Option<StoredValue> {
        match self {
            Value::Bool(false) => None,
            Value::Bool(true) => Some(StoredValue { kind: StoredKind::Number, text: "1".into() }),
            Value::Number(d) => Some(StoredValue { kind: StoredKind::Number, text: d.to_string() }),
            Value::Str(s) => Some(StoredValue { kind: StoredKind::String, text: s.clone() }),
            Value::Object(_) => Some(StoredValue { kind: StoredKind::Object, text: self.canonical_json() }),
        }
    }

    /// Decodes a stored form.
    ///
    /// # Errors
    ///
    /// Returns a description of the malformed text.
    pub fn from_stored(stored: &StoredValue) -> Result<Self, String> {
        match stored.kind {
            StoredKind::Number => stored.text.parse().map(Value::Number).map_err(|e| e.to_string()),
            StoredKind::String => Ok(Value::Str(stored.text.clone())),
            StoredKind::Object => {
                let json: serde_json::Value =
                    serde_json::from_str(&stored.text).map_err(|e| e.to_string())?;
                let value = Value::from_json(&json).map_err(|e| e.to_string())?;
                if value.is_object() {
                    Ok(value)
                } else {
                    Err(format!("stored object is a scalar: {}", stored.text))
                }
            }
        }
    }
}

/// Bytes a state variable occupies: name length plus stored text length,
/// zero when deleted.
#[must_use]
pub fn storage_size(name: &str, value: &Value) -> i64 {
    value
        .to_stored()
        .map_or(0, |s| (name.len() + s.text.len()) as i64)
}

// =============================================================================
// TESTS
// =============================================================================
