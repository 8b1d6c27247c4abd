use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map as JsonMap, Number as JsonNumber, Value as JsonValue};
use thiserror::Error;

const MAX_CLONE_DEPTH: usize = 100;

/// Reference to a callable living on one side of the bridge. Functions never
/// survive a structured clone; the name only exists for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRef {
    pub name: String,
}

/// Native object that cannot cross a realm boundary.
#[derive(Clone)]
pub struct HostObject {
    pub description: String,
    pub inner: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostObject")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl PartialEq for HostObject {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Values carried by port messages, modelled after the structured clone
/// algorithm's value space.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RpcValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<RpcValue>),
    Object(BTreeMap<String, RpcValue>),
    Bytes(Vec<u8>),
    /// Milliseconds since the Unix epoch.
    Date(f64),
    Error {
        name: String,
        message: String,
        stack: Option<String>,
    },
    Map(Vec<(RpcValue, RpcValue)>),
    Set(Vec<RpcValue>),
    Function(FunctionRef),
    Symbol(String),
    Host(HostObject),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("DataCloneError: {kind} at {path} could not be cloned")]
pub struct DataCloneError {
    pub kind: &'static str,
    pub path: String,
}

impl RpcValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            name: "Error".to_string(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn object<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, RpcValue)>,
        K: Into<String>,
    {
        Self::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&RpcValue> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Copy the value the way `postMessage` does, failing on anything that
    /// has no representation on the other side.
    pub fn structured_clone(&self) -> Result<RpcValue, DataCloneError> {
        self.ensure_cloneable("$")?;
        Ok(self.clone())
    }

    fn ensure_cloneable(&self, path: &str) -> Result<(), DataCloneError> {
        let fail = |kind: &'static str| {
            Err(DataCloneError {
                kind,
                path: path.to_string(),
            })
        };
        match self {
            Self::Function(_) => fail("function"),
            Self::Symbol(_) => fail("symbol"),
            Self::Host(_) => fail("host object"),
            Self::Array(items) | Self::Set(items) => {
                for (index, item) in items.iter().enumerate() {
                    item.ensure_cloneable(&format!("{path}[{index}]"))?;
                }
                Ok(())
            }
            Self::Object(map) => {
                for (key, item) in map {
                    item.ensure_cloneable(&format!("{path}.{key}"))?;
                }
                Ok(())
            }
            Self::Map(entries) => {
                for (index, (key, item)) in entries.iter().enumerate() {
                    key.ensure_cloneable(&format!("{path}<key {index}>"))?;
                    item.ensure_cloneable(&format!("{path}<value {index}>"))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::from)
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.to_json())
    }

    /// Lossy JSON projection. `undefined` and unclonable values inside objects
    /// are omitted, matching `JSON.stringify`.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Undefined | Self::Null | Self::Function(_) | Self::Symbol(_) => JsonValue::Null,
            Self::Bool(value) => JsonValue::Bool(*value),
            Self::Number(value) => number_to_json(*value),
            Self::String(value) => JsonValue::String(value.clone()),
            Self::Array(items) | Self::Set(items) => {
                JsonValue::Array(items.iter().map(RpcValue::to_json).collect())
            }
            Self::Object(map) => {
                let mut out = JsonMap::new();
                for (key, item) in map {
                    if matches!(item, Self::Undefined | Self::Function(_) | Self::Symbol(_)) {
                        continue;
                    }
                    out.insert(key.clone(), item.to_json());
                }
                JsonValue::Object(out)
            }
            Self::Bytes(bytes) => {
                JsonValue::Array(bytes.iter().map(|b| JsonValue::from(*b)).collect())
            }
            Self::Date(millis) => number_to_json(*millis),
            Self::Error {
                name,
                message,
                stack,
            } => {
                let mut out = JsonMap::new();
                out.insert("name".into(), JsonValue::String(name.clone()));
                out.insert("message".into(), JsonValue::String(message.clone()));
                if let Some(stack) = stack {
                    out.insert("stack".into(), JsonValue::String(stack.clone()));
                }
                JsonValue::Object(out)
            }
            Self::Map(entries) => JsonValue::Array(
                entries
                    .iter()
                    .map(|(k, v)| JsonValue::Array(vec![k.to_json(), v.to_json()]))
                    .collect(),
            ),
            Self::Host(host) => JsonValue::String(host.description.clone()),
        }
    }

    /// Short human readable rendering, used for console forwarding.
    pub fn display_string(&self) -> String {
        match self {
            Self::Undefined => "undefined".to_string(),
            Self::Null => "null".to_string(),
            Self::String(value) => value.clone(),
            Self::Error { name, message, .. } => format!("{name}: {message}"),
            Self::Function(func) => format!("[Function {}]", func.name),
            Self::Symbol(desc) => format!("Symbol({desc})"),
            Self::Host(host) => host.description.clone(),
            other => other.to_json().to_string(),
        }
    }
}

fn number_to_json(value: f64) -> JsonValue {
    if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        JsonValue::from(value as i64)
    } else {
        JsonNumber::from_f64(value)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

impl From<JsonValue> for RpcValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(value) => Self::Bool(value),
            JsonValue::Number(number) => Self::Number(number.as_f64().unwrap_or(f64::NAN)),
            JsonValue::String(value) => Self::String(value),
            JsonValue::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            JsonValue::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<&str> for RpcValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RpcValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for RpcValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for RpcValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl<T: Into<RpcValue>> From<Option<T>> for RpcValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Undefined)
    }
}

/// Best-effort deep copy used when a reply fails the structured clone.
pub fn fallback_clone(value: &RpcValue) -> RpcValue {
    match value {
        RpcValue::Function(func) => RpcValue::String(format!("[Function {}]", func.name)),
        RpcValue::Symbol(desc) => RpcValue::String(format!("Symbol({desc})")),
        RpcValue::Host(host) => RpcValue::String(host.description.clone()),
        other => clone_nested(other, 0),
    }
}

fn clone_nested(value: &RpcValue, depth: usize) -> RpcValue {
    if depth > MAX_CLONE_DEPTH {
        return RpcValue::String("[Max depth exceeded]".to_string());
    }
    match value {
        RpcValue::Function(_) | RpcValue::Symbol(_) => RpcValue::Undefined,
        RpcValue::Host(host) => RpcValue::String(host.description.clone()),
        RpcValue::Array(items) => RpcValue::Array(
            items
                .iter()
                .map(|item| match clone_nested(item, depth + 1) {
                    RpcValue::Undefined if !item.is_undefined() => RpcValue::Null,
                    cloned => cloned,
                })
                .collect(),
        ),
        RpcValue::Set(items) => RpcValue::Set(
            items
                .iter()
                .map(|item| clone_nested(item, depth + 1))
                .filter(|item| !item.is_undefined())
                .collect(),
        ),
        RpcValue::Object(map) => RpcValue::Object(
            map.iter()
                .filter(|(_, item)| !matches!(item, RpcValue::Function(_) | RpcValue::Symbol(_)))
                .map(|(key, item)| (key.clone(), clone_nested(item, depth + 1)))
                .collect(),
        ),
        RpcValue::Map(entries) => RpcValue::Map(
            entries
                .iter()
                .filter(|(k, v)| {
                    !matches!(k, RpcValue::Function(_) | RpcValue::Symbol(_))
                        && !matches!(v, RpcValue::Function(_) | RpcValue::Symbol(_))
                })
                .map(|(k, v)| (clone_nested(k, depth + 1), clone_nested(v, depth + 1)))
                .collect(),
        ),
        other => other.clone(),
    }
}
