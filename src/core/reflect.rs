//! Endpoint reflection.
//!
//! Implementation types declare their remotable surface through [`Remote`].
//! Reflection turns that declaration into endpoint descriptors whose targets
//! resolve the instance by slot on the engine thread.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::engine::{Engine, EngineHost};
use super::envelope::{CallArgs, RemoteError};
use crate::error::ConfigError;

/// Wire prefix of property getters.
pub const PROPGET_PREFIX: &str = "propget_";
/// Wire prefix of property setters.
pub const PROPSET_PREFIX: &str = "propset_";

/// The invocation target of an endpoint. Always runs on the engine thread.
pub type Target<E> =
    Arc<dyn Fn(&mut EngineHost<E>, &CallArgs) -> Result<Value, RemoteError> + Send + Sync>;

/// A type whose instances expose remote endpoints.
///
/// The server builds one instance per registered type, on the engine thread,
/// and keeps it for the server's lifetime. Only what `endpoints` declares is
/// reachable by clients.
pub trait Remote<E: Engine>: Sized + 'static {
    fn construct(engine: &mut E) -> anyhow::Result<Self>;

    fn endpoints(reflector: &mut Reflector<Self, E>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Method,
    PropertyGet,
    PropertySet,
    Builtin,
}

/// One reflected remote attribute.
pub enum Reflected<E> {
    Method {
        name: String,
        target: Target<E>,
    },
    Property {
        name: String,
        getter: Option<Target<E>>,
        setter: Option<Target<E>>,
    },
}

impl<E> Reflected<E> {
    pub fn name(&self) -> &str {
        match self {
            Reflected::Method { name, .. } | Reflected::Property { name, .. } => name,
        }
    }
}

impl<E> std::fmt::Debug for Reflected<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reflected::Method { name, .. } => f.debug_struct("Method").field("name", name).finish(),
            Reflected::Property {
                name,
                getter,
                setter,
            } => f
                .debug_struct("Property")
                .field("name", name)
                .field("getter", &getter.is_some())
                .field("setter", &setter.is_some())
                .finish(),
        }
    }
}

/// Collects the remote declarations of `T`.
pub struct Reflector<T, E> {
    slot: usize,
    entries: Vec<Reflected<E>>,
    _owner: PhantomData<fn() -> T>,
}

impl<T: 'static, E: Engine> Reflector<T, E> {
    fn new(slot: usize) -> Self {
        Self {
            slot,
            entries: Vec::new(),
            _owner: PhantomData,
        }
    }

    /// Declare a remote method.
    pub fn method<F, R>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&mut T, &mut E, &CallArgs) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Serialize,
    {
        let slot = self.slot;
        let target: Target<E> = Arc::new(move |host: &mut EngineHost<E>, args: &CallArgs| {
            let (instance, engine) = resolve::<T, E>(host, slot)?;
            let value = f(instance, engine, args).map_err(RemoteError::from_anyhow)?;
            to_wire(value)
        });
        self.entries.push(Reflected::Method {
            name: name.to_string(),
            target,
        });
        self
    }

    /// Declare a remote property; attach a getter and/or a setter to it.
    pub fn property(&mut self, name: &str) -> PropertyBuilder<'_, T, E> {
        self.entries.push(Reflected::Property {
            name: name.to_string(),
            getter: None,
            setter: None,
        });
        let index = self.entries.len() - 1;
        PropertyBuilder {
            reflector: self,
            index,
        }
    }

    fn finish(self) -> Result<Vec<Reflected<E>>, ConfigError> {
        let owner = std::any::type_name::<T>();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::with_capacity(self.entries.len());

        for entry in self.entries {
            let name = entry.name();
            if name.starts_with("__") {
                debug!(owner, name, "Skipping dunder attribute");
                continue;
            }
            validate_name(owner, name)?;
            if !seen.insert(name.to_string()) {
                return Err(ConfigError::DuplicateEndpoint(format!("{owner}.{name}")));
            }
            if let Reflected::Property {
                getter: None,
                setter: None,
                ..
            } = &entry
            {
                return Err(ConfigError::EmptyProperty {
                    owner: owner.to_string(),
                    name: name.to_string(),
                });
            }
            out.push(entry);
        }

        Ok(out)
    }
}

pub struct PropertyBuilder<'a, T, E> {
    reflector: &'a mut Reflector<T, E>,
    index: usize,
}

impl<T: 'static, E: Engine> PropertyBuilder<'_, T, E> {
    pub fn getter<F, R>(self, f: F) -> Self
    where
        F: Fn(&mut T, &mut E) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Serialize,
    {
        let slot = self.reflector.slot;
        let target: Target<E> = Arc::new(move |host: &mut EngineHost<E>, _args: &CallArgs| {
            let (instance, engine) = resolve::<T, E>(host, slot)?;
            let value = f(instance, engine).map_err(RemoteError::from_anyhow)?;
            to_wire(value)
        });
        if let Some(Reflected::Property { getter, .. }) = self.reflector.entries.get_mut(self.index)
        {
            *getter = Some(target);
        }
        self
    }

    pub fn setter<F, V>(self, f: F) -> Self
    where
        F: Fn(&mut T, &mut E, V) -> anyhow::Result<()> + Send + Sync + 'static,
        V: DeserializeOwned,
    {
        let slot = self.reflector.slot;
        let target: Target<E> = Arc::new(move |host: &mut EngineHost<E>, args: &CallArgs| {
            let value = args.single()?;
            let value = V::deserialize(&value)
                .map_err(|e| RemoteError::type_error(format!("invalid property value: {e}")))?;
            let (instance, engine) = resolve::<T, E>(host, slot)?;
            f(instance, engine, value).map_err(RemoteError::from_anyhow)?;
            Ok(Value::Null)
        });
        if let Some(Reflected::Property { setter, .. }) = self.reflector.entries.get_mut(self.index)
        {
            *setter = Some(target);
        }
        self
    }
}

/// Reflect the remote surface of `T`, whose instance lives at `slot`.
pub fn reflect<T: Remote<E>, E: Engine>(slot: usize) -> Result<Vec<Reflected<E>>, ConfigError> {
    let mut reflector = Reflector::<T, E>::new(slot);
    T::endpoints(&mut reflector);
    reflector.finish()
}

/// Wrap a stateless function as a target; the engine is injected as its
/// first argument.
pub fn function_target<E, F, R>(f: F) -> Target<E>
where
    E: Engine,
    F: Fn(&mut E, &CallArgs) -> anyhow::Result<R> + Send + Sync + 'static,
    R: Serialize,
{
    Arc::new(move |host: &mut EngineHost<E>, args: &CallArgs| {
        let value = f(host.engine_mut(), args).map_err(RemoteError::from_anyhow)?;
        to_wire(value)
    })
}

/// Endpoint names must be plain identifiers and must not collide with the
/// property wire prefixes.
pub(crate) fn validate_name(owner: &str, name: &str) -> Result<(), ConfigError> {
    let invalid = |reason| ConfigError::InvalidName {
        owner: owner.to_string(),
        name: name.to_string(),
        reason,
    };

    let mut chars = name.chars();
    match chars.next() {
        None => return Err(invalid("name is empty")),
        Some(c) if !(c.is_ascii_alphabetic() || c == '_') => {
            return Err(invalid("must start with a letter or underscore"));
        }
        _ => {}
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid("may contain only letters, digits and underscores"));
    }
    if name.starts_with(PROPGET_PREFIX) || name.starts_with(PROPSET_PREFIX) {
        return Err(invalid("collides with the property accessor prefixes"));
    }
    Ok(())
}

fn resolve<T: 'static, E: Engine>(
    host: &mut EngineHost<E>,
    slot: usize,
) -> Result<(&mut T, &mut E), RemoteError> {
    host.split::<T>(slot).ok_or_else(|| {
        RemoteError::new(
            "InternalError",
            format!(
                "no {} instance at slot {slot}",
                std::any::type_name::<T>()
            ),
        )
    })
}

fn to_wire(value: impl Serialize) -> Result<Value, RemoteError> {
    serde_json::to_value(value).map_err(|e| RemoteError::new("SerializationError", e.to_string()))
}
