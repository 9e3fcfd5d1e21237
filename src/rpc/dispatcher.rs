//! Endpoint dispatch.
//!
//! Dispatches JSON-RPC calls either to a built-in service endpoint or, through
//! the poster adapter, to a reflected endpoint on the engine thread.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::Shutdown;
use super::files::{self, Payload};
use super::protocol::{Request, Response};
use crate::core::reflect::{PROPGET_PREFIX, PROPSET_PREFIX, validate_name};
use crate::core::{
    CallArgs, Engine, EndpointKind, Lifecycle, PostError, PosterAdapter, Reflected, RemoteError,
    Target,
};
use crate::error::ConfigError;

/// Names handled by the dispatcher itself.
pub const BUILTINS: [&str; 5] = [
    "service_upload",
    "service_download",
    "service_exit",
    "service_ping",
    "service_endpoints",
];

/// Prefix reserved for built-in endpoints.
pub const RESERVED_PREFIX: &str = "service_";

/// One entry of the `service_endpoints` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub name: String,
    pub kind: EndpointKind,
}

struct Endpoint<E> {
    kind: EndpointKind,
    target: Target<E>,
}

/// The endpoint table. Built once before serving; read-only afterwards.
pub struct EndpointTable<E> {
    entries: BTreeMap<String, Endpoint<E>>,
}

impl<E: Engine> Default for EndpointTable<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Engine> EndpointTable<E> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    fn insert(
        &mut self,
        name: String,
        kind: EndpointKind,
        target: Target<E>,
    ) -> Result<(), ConfigError> {
        if name.starts_with(RESERVED_PREFIX) {
            return Err(ConfigError::ReservedName(name));
        }
        if self.entries.contains_key(&name) {
            return Err(ConfigError::DuplicateEndpoint(name));
        }
        debug!(endpoint = %name, ?kind, "Endpoint installed");
        self.entries.insert(name, Endpoint { kind, target });
        Ok(())
    }

    /// Install reflected attributes. Properties become `propget_<name>` and
    /// `propset_<name>`.
    pub fn install(&mut self, reflected: Vec<Reflected<E>>) -> Result<(), ConfigError> {
        for entry in reflected {
            match entry {
                Reflected::Method { name, target } => {
                    self.insert(name, EndpointKind::Method, target)?;
                }
                Reflected::Property {
                    name,
                    getter,
                    setter,
                } => {
                    if let Some(getter) = getter {
                        let wire = format!("{PROPGET_PREFIX}{name}");
                        self.insert(wire, EndpointKind::PropertyGet, getter)?;
                    }
                    if let Some(setter) = setter {
                        let wire = format!("{PROPSET_PREFIX}{name}");
                        self.insert(wire, EndpointKind::PropertySet, setter)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Install a stateless function endpoint.
    pub fn install_function(&mut self, name: &str, target: Target<E>) -> Result<(), ConfigError> {
        validate_name("function", name)?;
        self.insert(name.to_string(), EndpointKind::Method, target)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All reachable endpoints, built-ins included.
    pub fn describe(&self) -> Vec<EndpointInfo> {
        let builtins = BUILTINS.iter().map(|name| EndpointInfo {
            name: name.to_string(),
            kind: EndpointKind::Builtin,
        });
        let installed = self.entries.iter().map(|(name, endpoint)| EndpointInfo {
            name: name.clone(),
            kind: endpoint.kind,
        });
        builtins.chain(installed).collect()
    }
}

pub struct Dispatcher<E: Engine> {
    table: EndpointTable<E>,
    adapter: Arc<PosterAdapter<E>>,
    lifecycle: Lifecycle,
    shutdown: Shutdown<E>,
}

impl<E: Engine> Dispatcher<E> {
    pub(crate) fn new(
        table: EndpointTable<E>,
        adapter: Arc<PosterAdapter<E>>,
        lifecycle: Lifecycle,
        shutdown: Shutdown<E>,
    ) -> Self {
        Self {
            table,
            adapter,
            lifecycle,
            shutdown,
        }
    }

    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        self.table.describe()
    }

    /// Handle an RPC request and return a response.
    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let args = match CallArgs::from_params(request.params) {
            Ok(args) => args,
            Err(e) => return Response::invalid_params(id, e.message),
        };

        match request.method.as_str() {
            "service_ping" => Response::success(id, "pong"),
            "service_endpoints" => Response::success(id, self.table.describe()),
            _ if !self.lifecycle.is_accepting_calls() => Response::shutting_down(id),
            "service_upload" => self.service_upload(id, &args).await,
            "service_download" => self.service_download(id, &args).await,
            "service_exit" => self.service_exit(id),
            name => self.invoke(id, name, args).await,
        }
    }

    async fn invoke(&self, id: Value, name: &str, args: CallArgs) -> Response {
        let Some(endpoint) = self.table.entries.get(name) else {
            debug!(endpoint = name, "Unknown endpoint");
            return Response::method_not_found(id, name);
        };

        let target = endpoint.target.clone();
        let outcome = self.adapter.submit(move |host| target(host, &args)).await;

        match outcome {
            Ok(Ok(value)) => Response::success(id, value),
            Ok(Err(err)) => {
                debug!(endpoint = name, kind = %err.kind, error = %err.message, "Endpoint raised");
                Response::remote_exception(id, &err)
            }
            Err(PostError::Panicked(message)) => {
                warn!(endpoint = name, panic = %message, "Endpoint panicked on the engine thread");
                Response::remote_exception(id, &RemoteError::new("EnginePanic", message))
            }
            Err(e @ PostError::Reentrant) => Response::internal_error(id, e.to_string()),
            Err(e) => {
                warn!(endpoint = name, error = %e, "Engine unavailable");
                Response::engine_unavailable(id, e.to_string())
            }
        }
    }

    async fn service_upload(&self, id: Value, args: &CallArgs) -> Response {
        let parsed = args
            .arg::<String>(0, "path")
            .and_then(|path| Ok((path, args.arg::<Payload>(1, "data")?)));
        let (path, data) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => return Response::remote_exception(id, &err),
        };

        let target = PathBuf::from(&path);
        let written = tokio::task::spawn_blocking(move || files::upload(&target, &data.0)).await;
        match written {
            Ok(Ok(bytes)) => {
                info!(path = %path, bytes, "File uploaded");
                Response::success(id, bytes)
            }
            Ok(Err(e)) => Response::io_error(id, e.kind(), e.to_string()),
            Err(e) => Response::internal_error(id, format!("upload task failed: {e}")),
        }
    }

    async fn service_download(&self, id: Value, args: &CallArgs) -> Response {
        let path: String = match args.arg(0, "path") {
            Ok(path) => path,
            Err(err) => return Response::remote_exception(id, &err),
        };

        let target = PathBuf::from(&path);
        let reply = tokio::task::spawn_blocking(move || files::download(&target)).await;
        match reply {
            Ok(Ok(reply)) => {
                debug!(path = %path, "Download served");
                Response::success(id, reply)
            }
            Ok(Err(e)) => Response::io_error(id, e.kind(), e.to_string()),
            Err(e) => Response::internal_error(id, format!("download task failed: {e}")),
        }
    }

    fn service_exit(&self, id: Value) -> Response {
        info!("Exit requested by client");
        match self.shutdown.request() {
            Ok(()) => Response::success(id, Value::Null),
            Err(_) => Response::shutting_down(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reflect::function_target;
    use crate::core::{EngineError, EngineHost};
    use std::path::PathBuf;

    struct Null;

    impl Engine for Null {
        fn version(&self) -> u32 {
            251
        }
        fn project_directory(&self) -> Result<PathBuf, EngineError> {
            Ok(PathBuf::from("/tmp/null"))
        }
        fn project_file_path(&self) -> Result<Option<PathBuf>, EngineError> {
            Ok(None)
        }
        fn execute_script(&mut self, _source: &str) -> Result<String, EngineError> {
            Ok(String::new())
        }
        fn new_project(&mut self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn noop() -> Target<Null> {
        Arc::new(|_host: &mut EngineHost<Null>, _args: &CallArgs| Ok(Value::Null))
    }

    #[test]
    fn test_install_properties_as_accessor_pair() {
        let mut table = EndpointTable::<Null>::new();
        table
            .install(vec![
                Reflected::Method {
                    name: "get_project_name".into(),
                    target: noop(),
                },
                Reflected::Property {
                    name: "name".into(),
                    getter: Some(noop()),
                    setter: Some(noop()),
                },
                Reflected::Property {
                    name: "project_directory".into(),
                    getter: Some(noop()),
                    setter: None,
                },
            ])
            .unwrap();

        assert_eq!(table.len(), 4);
        let described = table.describe();
        assert_eq!(described.len(), BUILTINS.len() + 4);
        assert!(described.contains(&EndpointInfo {
            name: "propset_name".into(),
            kind: EndpointKind::PropertySet
        }));
        assert!(described.contains(&EndpointInfo {
            name: "propget_project_directory".into(),
            kind: EndpointKind::PropertyGet
        }));
        assert!(!described.iter().any(|e| e.name == "propset_project_directory"));
    }

    #[test]
    fn test_reserved_and_duplicate_names() {
        let mut table = EndpointTable::<Null>::new();
        let err = table.install_function("service_exit", noop()).unwrap_err();
        assert!(matches!(err, ConfigError::ReservedName(_)));

        let version = function_target(|e: &mut Null, _a: &CallArgs| Ok(e.version()));
        table.install_function("engine_version", version).unwrap();
        let err = table.install_function("engine_version", noop()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateEndpoint(_)));

        let err = table.install_function("not valid", noop()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidName { .. }));
    }
}
