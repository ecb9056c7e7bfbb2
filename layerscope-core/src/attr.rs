//! Attribute nodes: single decoded values within a layer.
//!
//! An [`Attr`] carries a dotted identifier, a typed [`Value`], the byte range
//! it was decoded from and an ordered list of child attributes. Child
//! identifiers use the `parent.child` convention, but the parent → children
//! edge is explicit: a flag-set attribute owns its named boolean flags and
//! renderers never have to discover them by scanning identifiers.

use std::fmt;
use std::ops::Range;

use bytes::Bytes;
use compact_str::{format_compact, CompactString};

use crate::token::TokenRegistry;

/// Possible attribute value types.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Signed integer (all integral header fields widen to this)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// Text value
    Str(CompactString),
    /// Boolean value
    Bool(bool),
    /// Raw bytes
    Bytes(Bytes),
    /// Bit set whose named flags are the attribute's children
    Flags(u64),
}

impl Value {
    /// Create a string value.
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(CompactString::new(s.as_ref()))
    }

    /// Create a bytes value by copying a slice.
    pub fn bytes(data: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(data))
    }

    /// Try to get as i64. Flag sets read as their bit value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Flags(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Try to get as f64. Integers widen.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Flags(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Try to get as str reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Try to get as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get as bytes reference.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Short type name, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bool(_) => "boolean",
            Value::Bytes(_) => "bytes",
            Value::Flags(_) => "flags",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Bytes(b) => {
                for (i, byte) in b.iter().enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::Flags(v) => write!(f, "{v:#x}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Int(v.into())
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Int(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::str(v)
    }
}

/// A single decoded value with optional sub-attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Attr {
    id: CompactString,
    value: Value,
    range: Range<usize>,
    children: Vec<Attr>,
    error: Option<CompactString>,
}

impl Attr {
    /// Create an attribute covering `range` of its input.
    pub fn new(id: impl AsRef<str>, value: impl Into<Value>, range: Range<usize>) -> Self {
        Self {
            id: CompactString::new(id.as_ref()),
            value: value.into(),
            range,
            children: Vec::new(),
            error: None,
        }
    }

    /// Create a flag-set attribute.
    ///
    /// Each `(name, mask)` pair becomes a boolean child `<id>.<name>` that is
    /// true when `bits & mask != 0`, in the order given.
    pub fn flags(id: impl AsRef<str>, bits: u64, range: Range<usize>, flags: &[(&str, u64)]) -> Self {
        let id = id.as_ref();
        let children = flags
            .iter()
            .map(|(name, mask)| Attr::new(format_compact!("{id}.{name}"), bits & mask != 0, range.clone()))
            .collect();
        Self {
            id: CompactString::new(id),
            value: Value::Flags(bits),
            range,
            children,
            error: None,
        }
    }

    /// Add a child attribute.
    pub fn with_child(mut self, child: Attr) -> Self {
        self.children.push(child);
        self
    }

    /// Attach a decoding error to this attribute.
    pub fn with_error(mut self, error: impl AsRef<str>) -> Self {
        self.error = Some(CompactString::new(error.as_ref()));
        self
    }

    /// Add a child attribute in place.
    pub fn push_child(&mut self, child: Attr) {
        self.children.push(child);
    }

    /// The dotted identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The decoded value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Byte range within the owning packet (or stream, for stream layers).
    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    /// Ordered sub-attributes.
    pub fn children(&self) -> &[Attr] {
        &self.children
    }

    /// Decoding error recorded by the dissector, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Direct child by identifier.
    pub fn child(&self, id: &str) -> Option<&Attr> {
        self.children.iter().find(|c| c.id == id)
    }

    /// This attribute and all descendants, depth-first in order.
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: vec![self] }
    }

    /// Depth-first search for an identifier in this subtree.
    pub fn find(&self, id: &str) -> Option<&Attr> {
        self.walk().find(|a| a.id == id)
    }

    /// Whether this is a flag-set attribute.
    pub fn is_flag_set(&self) -> bool {
        matches!(self.value, Value::Flags(_))
    }

    /// Flag children that are set.
    pub fn active_flags(&self) -> impl Iterator<Item = &Attr> {
        self.children
            .iter()
            .filter(|c| matches!(c.value, Value::Bool(true)))
    }

    /// Display name resolved through the token registry.
    pub fn name(&self, tokens: &TokenRegistry) -> CompactString {
        tokens.resolve(&self.id)
    }

    /// One-line rendering of the value.
    ///
    /// Flag sets render their active flag names followed by the raw value,
    /// e.g. `SYN, ACK (0x12)`.
    pub fn summary(&self, tokens: &TokenRegistry) -> String {
        match &self.value {
            Value::Flags(bits) => {
                let names: Vec<CompactString> =
                    self.active_flags().map(|f| f.name(tokens)).collect();
                format!("{} ({bits:#x})", names.join(", "))
            }
            value => value.to_string(),
        }
    }

    /// Shift this subtree's ranges by `offset` bytes.
    pub(crate) fn rebase(&mut self, offset: usize) {
        self.range = (self.range.start + offset)..(self.range.end + offset);
        for child in &mut self.children {
            child.rebase(offset);
        }
    }
}

/// Depth-first iterator over an attribute subtree.
pub struct Walk<'a> {
    stack: Vec<&'a Attr>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a Attr;

    fn next(&mut self) -> Option<Self::Item> {
        let attr = self.stack.pop()?;
        self.stack.extend(attr.children.iter().rev());
        Some(attr)
    }
}
