//! Call and result envelopes.
//!
//! A remote call carries positional and keyword arguments. A failed call
//! carries an error kind and a message, which survive the trip to the client.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::engine::EngineError;

/// Positional and keyword arguments of one remote call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    /// Append a positional argument. A value that cannot be represented as
    /// JSON (a map with non-string keys, a failing `Serialize` impl) is sent
    /// as `null`; use [`CallArgs::try_with`] when that can happen.
    pub fn with(self, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.push(value)
    }

    /// Append a positional argument, failing if it does not serialize.
    pub fn try_with(self, value: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(self.push(serde_json::to_value(value)?))
    }

    /// Set a keyword argument. Same `null` fallback as [`CallArgs::with`].
    pub fn kwarg(self, name: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.insert(name, value)
    }

    /// Set a keyword argument, failing if it does not serialize.
    pub fn try_kwarg(self, name: &str, value: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(self.insert(name, serde_json::to_value(value)?))
    }

    fn push(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    fn insert(mut self, name: &str, value: Value) -> Self {
        self.kwargs.insert(name.to_string(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }

    /// Decode JSON-RPC `params`: an `{args, kwargs}` object, a bare array of
    /// positional arguments, or nothing at all.
    pub fn from_params(params: Option<Value>) -> Result<Self, RemoteError> {
        match params {
            None | Some(Value::Null) => Ok(Self::new()),
            Some(Value::Array(args)) => Ok(Self::positional(args)),
            Some(value @ Value::Object(_)) => serde_json::from_value(value)
                .map_err(|e| RemoteError::type_error(format!("malformed call arguments: {e}"))),
            Some(other) => Err(RemoteError::type_error(format!(
                "call arguments must be an object or an array, got {other}"
            ))),
        }
    }

    fn lookup(&self, index: usize, name: &str) -> Option<&Value> {
        self.kwargs.get(name).or_else(|| self.args.get(index))
    }

    /// Required argument, by keyword first and then by position.
    pub fn arg<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, RemoteError> {
        let value = self.lookup(index, name).ok_or_else(|| {
            RemoteError::type_error(format!("missing required argument '{name}'"))
        })?;
        decode(value, name)
    }

    /// Optional argument with a default.
    pub fn arg_or<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
        default: T,
    ) -> Result<T, RemoteError> {
        match self.lookup(index, name) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => decode(value, name),
        }
    }

    /// The single value of a setter call: exactly one argument, positional or
    /// keyword.
    pub fn single(&self) -> Result<Value, RemoteError> {
        match (self.args.as_slice(), self.kwargs.len()) {
            ([value], 0) => Ok(value.clone()),
            ([], 1) => Ok(self.kwargs.values().next().cloned().unwrap_or(Value::Null)),
            _ => Err(RemoteError::type_error(format!(
                "expected exactly one argument, got {}",
                self.args.len() + self.kwargs.len()
            ))),
        }
    }
}

fn decode<T: DeserializeOwned>(value: &Value, name: &str) -> Result<T, RemoteError> {
    T::deserialize(value)
        .map_err(|e| RemoteError::type_error(format!("invalid value for argument '{name}': {e}")))
}

/// An error raised by endpoint code, as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// Classify an error returned by endpoint code.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        let err = match err.downcast::<RemoteError>() {
            Ok(remote) => return remote,
            Err(err) => err,
        };
        let kind = if err.downcast_ref::<EngineError>().is_some() {
            "EngineError"
        } else if err.downcast_ref::<std::io::Error>().is_some() {
            "IoError"
        } else {
            "Error"
        };
        Self::new(kind, format!("{err:#}"))
    }
}
