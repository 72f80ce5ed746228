//! Flat-path <-> tree codec for the CMI runtime data model.
//!
//! Records are stored as `(dotted.path, string)` pairs. [`flatten`] turns a
//! nested JSON payload into that form; [`unflatten`] folds a stream of pairs
//! back into a [`CmiNode`] tree.
//!
//! Segments are joined with `.`. A segment made only of ASCII digits is an
//! array index, everywhere except the first segment, which always addresses a
//! key of the root object. This is the single array-vs-object decision point
//! (see [`Segment::parse`]). Objects that use numeric-looking keys below the
//! root therefore come back as arrays; that is a known limitation.

use std::collections::BTreeMap;

use serde_json::Value;

/// Largest array index accepted in a path. Guards against a single record
/// such as `interactions.99999999.id` allocating a huge array on rebuild.
pub const MAX_ARRAY_INDEX: usize = 9_999;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CmiError {
    #[error("invalid path {path:?}: {reason}")]
    Validation { path: String, reason: &'static str },
}

impl CmiError {
    fn invalid(path: &str, reason: &'static str) -> Self {
        Self::Validation {
            path: path.to_string(),
            reason,
        }
    }
}

/// Rebuilt CMI tree. Leaves are always strings: the record store is
/// value-type-erasing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CmiNode {
    Object(BTreeMap<String, CmiNode>),
    Array(Vec<CmiNode>),
    Scalar(String),
}

impl Default for CmiNode {
    fn default() -> Self {
        Self::empty_object()
    }
}

impl CmiNode {
    pub fn empty_object() -> Self {
        Self::Object(BTreeMap::new())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Object(map) => map.is_empty(),
            Self::Array(items) => items.is_empty(),
            Self::Scalar(_) => false,
        }
    }

    /// Convert a JSON value, stringifying scalar leaves.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Object(map) => Self::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
            Value::Array(items) => Self::Array(items.iter().map(Self::from_json).collect()),
            scalar => Self::Scalar(scalar_to_string(scalar)),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Self::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Scalar(s) => Value::String(s.clone()),
        }
    }

    /// Look up a node by dotted path.
    pub fn get(&self, path: &str) -> Option<&CmiNode> {
        let mut node = self;
        for raw in split_path(path).ok()? {
            node = match node {
                Self::Object(map) => map.get(raw)?,
                Self::Array(items) => items.get(raw.parse::<usize>().ok()?)?,
                Self::Scalar(_) => return None,
            };
        }
        Some(node)
    }

    /// Write `value` at `path`, creating parents on demand. A node whose kind
    /// contradicts the path (a scalar where an object is needed, an object
    /// where an index is needed) is replaced.
    pub fn insert(&mut self, path: &str, value: impl Into<String>) -> Result<(), CmiError> {
        let mut node = self;
        for segment in parse_path(path)? {
            node = node.child_mut(segment);
        }
        *node = Self::Scalar(value.into());
        Ok(())
    }

    fn child_mut(&mut self, segment: Segment<'_>) -> &mut CmiNode {
        match segment {
            Segment::Key(key) => self
                .coerce_object()
                .entry(key.to_string())
                .or_insert_with(Self::empty_object),
            Segment::Index(index) => {
                let items = self.coerce_array();
                if items.len() <= index {
                    // Holes left by out-of-order writes become empty objects.
                    items.resize_with(index + 1, Self::empty_object);
                }
                &mut items[index]
            }
        }
    }

    fn coerce_object(&mut self) -> &mut BTreeMap<String, CmiNode> {
        if !matches!(self, Self::Object(_)) {
            *self = Self::empty_object();
        }
        match self {
            Self::Object(map) => map,
            _ => unreachable!("node coerced to object"),
        }
    }

    fn coerce_array(&mut self) -> &mut Vec<CmiNode> {
        if !matches!(self, Self::Array(_)) {
            *self = Self::Array(Vec::new());
        }
        match self {
            Self::Array(items) => items,
            _ => unreachable!("node coerced to array"),
        }
    }
}

/// One parsed path segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

impl<'a> Segment<'a> {
    /// A non-negative integer literal is an array index; anything else is an
    /// object key. Leading zeros still count as an index (`"01"` is `1`).
    pub fn parse(raw: &'a str) -> Result<Self, &'static str> {
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Self::Key(raw));
        }
        match raw.parse::<usize>() {
            Ok(index) if index <= MAX_ARRAY_INDEX => Ok(Self::Index(index)),
            _ => Err("array index out of range"),
        }
    }
}

/// Split a dotted path, rejecting empty paths and empty segments.
pub fn split_path(path: &str) -> Result<Vec<&str>, CmiError> {
    if path.is_empty() {
        return Err(CmiError::invalid(path, "empty path"));
    }
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(CmiError::invalid(path, "empty segment"));
    }
    Ok(segments)
}

/// Split and classify every segment of `path`. The first segment always
/// names a root key, even when it is numeric.
pub fn parse_path(path: &str) -> Result<Vec<Segment<'_>>, CmiError> {
    let segments = split_path(path)?;
    let mut parsed = Vec::with_capacity(segments.len());
    for (depth, raw) in segments.into_iter().enumerate() {
        if depth == 0 {
            parsed.push(Segment::Key(raw));
        } else {
            parsed.push(Segment::parse(raw).map_err(|reason| CmiError::invalid(path, reason))?);
        }
    }
    Ok(parsed)
}

/// Canonical string form of a JSON scalar.
pub fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Flatten a JSON tree into `(path, value)` pairs under `prefix`.
///
/// Empty objects and arrays produce no pairs. Every produced path is checked
/// with [`parse_path`], so the result can be stored as is: an empty segment
/// or an index above [`MAX_ARRAY_INDEX`] fails the whole flatten.
pub fn flatten(tree: &Value, prefix: &str) -> Result<Vec<(String, String)>, CmiError> {
    let mut segments: Vec<String> = if prefix.is_empty() {
        Vec::new()
    } else {
        split_path(prefix)?.into_iter().map(str::to_string).collect()
    };
    let mut out = Vec::new();
    flatten_into(tree, &mut segments, &mut out)?;
    Ok(out)
}

fn flatten_into(
    value: &Value,
    segments: &mut Vec<String>,
    out: &mut Vec<(String, String)>,
) -> Result<(), CmiError> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                segments.push(key.clone());
                flatten_into(child, segments, out)?;
                segments.pop();
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                segments.push(index.to_string());
                flatten_into(child, segments, out)?;
                segments.pop();
            }
        }
        scalar => {
            let path = segments.join(".");
            parse_path(&path)?;
            out.push((path, scalar_to_string(scalar)));
        }
    }
    Ok(())
}

/// Fold `(path, value)` pairs, in application order, into a tree.
/// The root is always an object; later pairs win.
pub fn unflatten<I, P, V>(entries: I) -> Result<CmiNode, CmiError>
where
    I: IntoIterator<Item = (P, V)>,
    P: AsRef<str>,
    V: Into<String>,
{
    let mut root = CmiNode::empty_object();
    for (path, value) in entries {
        root.insert(path.as_ref(), value)?;
    }
    Ok(root)
}
