// Runtime values and render contexts

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;

/// Host object exposed to templates.
///
/// Both methods are optional: an object without a string conversion renders
/// as `"Object"`, an object without field access resolves every key to nothing.
pub trait TemplateObject: Send + Sync {
    fn to_text(&self) -> Option<String> {
        None
    }

    fn get(&self, _key: &str) -> Option<Value> {
        None
    }
}

/// A value addressable from template syntax.
///
/// Sequences and mappings are shared, so cloning a value never copies a
/// collection.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Arc<Vec<Value>>),
    Map(Arc<BTreeMap<String, Value>>),
    Object(Arc<dyn TemplateObject>),
}

impl Value {
    pub fn object(obj: impl TemplateObject + 'static) -> Self {
        Value::Object(Arc::new(obj))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// `!empty(...)` semantics: null, false, 0, "" and empty collections are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
            Value::Object(_) => true,
        }
    }

    /// Text form used for output.
    ///
    /// Null and false become empty, true becomes `"1"`, sequences and mappings
    /// become `"Array"` and objects without a string conversion `"Object"`.
    pub fn to_output(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(true) => "1".to_string(),
            Value::Bool(false) => String::new(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::String(s) => s.clone(),
            Value::Array(_) | Value::Map(_) => "Array".to_string(),
            Value::Object(obj) => obj.to_text().unwrap_or_else(|| "Object".to_string()),
        }
    }

    /// Numeric view used by comparisons and arithmetic in conditions.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Null => Some(0.0),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Look up a map key or object field.
    pub fn get_key(&self, key: &str) -> Option<Value> {
        self.key_ref(key).map(Cow::into_owned)
    }

    /// Look up a sequence position; maps are tried with the decimal key.
    pub fn get_index(&self, index: usize) -> Option<Value> {
        self.index_ref(index).map(Cow::into_owned)
    }

    /// Like `get_key`, borrowing from collections. Object fields are owned.
    pub fn key_ref(&self, key: &str) -> Option<Cow<'_, Value>> {
        match self {
            Value::Map(map) => map.get(key).map(Cow::Borrowed),
            Value::Object(obj) => obj.get(key).map(Cow::Owned),
            Value::Array(items) => key
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i))
                .map(Cow::Borrowed),
            _ => None,
        }
    }

    pub fn index_ref(&self, index: usize) -> Option<Cow<'_, Value>> {
        match self {
            Value::Array(items) => items.get(index).map(Cow::Borrowed),
            Value::Map(map) => map.get(&index.to_string()).map(Cow::Borrowed),
            Value::Object(obj) => obj.get(&index.to_string()).map(Cow::Owned),
            _ => None,
        }
    }

    /// `(key, value)` pairs for iteration. Non-iterables yield nothing.
    ///
    /// The iterator shares the collection instead of copying it.
    pub fn iter_entries(&self) -> Entries {
        match self {
            Value::Array(items) => Entries::Items {
                items: Arc::clone(items),
                next: 0,
            },
            Value::Map(map) => Entries::Pairs {
                next: map.keys().next().cloned(),
                map: Arc::clone(map),
            },
            _ => Entries::Empty,
        }
    }
}

/// Iterator returned by [`Value::iter_entries`].
pub enum Entries {
    Items { items: Arc<Vec<Value>>, next: usize },
    Pairs {
        map: Arc<BTreeMap<String, Value>>,
        next: Option<String>,
    },
    Empty,
}

impl Iterator for Entries {
    type Item = (Value, Value);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Entries::Items { items, next } => {
                let item = items.get(*next)?.clone();
                let key = Value::Int(*next as i64);
                *next += 1;
                Some((key, item))
            }
            Entries::Pairs { map, next } => {
                let key = next.take()?;
                let value = map.get(&key)?.clone();
                *next = map
                    .range::<String, _>((Bound::Excluded(&key), Bound::Unbounded))
                    .next()
                    .map(|(k, _)| k.clone());
                Some((Value::String(key), value))
            }
            Entries::Empty => None,
        }
    }
}

fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Array(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Map(map) => f.debug_map().entries(map.iter()).finish(),
            Value::Object(obj) => write!(f, "Object({:?})", obj.to_text()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(Arc::new(items.into_iter().map(Value::from).collect()))
            }
            serde_json::Value::Object(map) => Value::Map(Arc::new(
                map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            )),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(Arc::new(items.into_iter().map(Into::into).collect()))
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(Arc::new(map))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Top-level variables for one render call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    vars: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from any serializable value whose top level is a map.
    pub fn from_serialize<T: Serialize>(data: T) -> Result<Self> {
        match Value::from(serde_json::to_value(data)?) {
            Value::Map(vars) => Ok(Self {
                vars: Arc::unwrap_or_clone(vars),
            }),
            Value::Null => Ok(Self::new()),
            other => Err(crate::error::TemplateError::Config(format!(
                "context must serialize to a map, got {:?}",
                other
            ))),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl From<BTreeMap<String, Value>> for Context {
    fn from(vars: BTreeMap<String, Value>) -> Self {
        Self { vars }
    }
}
