//! RPC server and client.
//!
//! Provides a JSON-RPC 2.0 interface over TCP through which clients call the
//! endpoints of an embedded engine.
//!
//! ## Architecture
//!
//! - `protocol`: JSON-RPC 2.0 request/response types
//! - `transport`: TCP listener with newline-delimited JSON framing
//! - `dispatcher`: endpoint table, built-in service endpoints
//! - `files`: upload/download payloads
//! - `defaults`: the default endpoint bundle
//! - `client`: client proxy for connecting to a server

pub mod client;
pub mod defaults;
pub mod dispatcher;
pub mod files;
pub mod protocol;
mod transport;

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::adapters::{BackgroundPoster, ForegroundPoster};
use crate::config::ServerConfig;
use crate::core::engine::InstanceCtor;
use crate::core::reflect::{self, function_target};
use crate::core::{
    CallArgs, Engine, EngineHost, EngineLoop, Lifecycle, LifecycleError, PosterAdapter, Reflected,
    Remote, ServerState, Target, validate_version,
};
use crate::error::ConfigError;
use crate::logging::LogThrottle;
use transport::Transport;

pub use client::{Attribute, Client, ClientError};
pub use defaults::DefaultServiceMethods;
pub use dispatcher::{Dispatcher, EndpointInfo, EndpointTable};
pub use protocol::{Request, Response, RpcError};

type ReflectFn<E> = fn(usize) -> Result<Vec<Reflected<E>>, ConfigError>;

struct Registration<E> {
    owner: &'static str,
    ctor: InstanceCtor<E>,
    reflect: ReflectFn<E>,
}

/// Endpoint table, instance constructors and listen address.
type Parts<E> = (EndpointTable<E>, Vec<(&'static str, InstanceCtor<E>)>, SocketAddr);

/// Assembles a server: engine version, implementation types, free functions.
pub struct ServerBuilder<E: Engine> {
    bind_addr: SocketAddr,
    version: u32,
    registrations: Vec<Registration<E>>,
    functions: Vec<(String, Target<E>)>,
}

impl<E: Engine> ServerBuilder<E> {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            bind_addr: config.bind_addr(),
            version: config.version,
            registrations: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Expose the endpoints of `T`. One instance is constructed at start.
    pub fn implementation<T: Remote<E>>(mut self) -> Self {
        self.registrations.push(Registration {
            owner: std::any::type_name::<T>(),
            ctor: Box::new(|engine: &mut E| Ok(Box::new(T::construct(engine)?) as Box<dyn Any>)),
            reflect: reflect::reflect::<T, E>,
        });
        self
    }

    /// Expose a free function; the engine is passed as its first argument.
    pub fn function<F, R>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut E, &CallArgs) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Serialize,
    {
        self.functions.push((name.to_string(), function_target(f)));
        self
    }

    /// Reflect every registration into an endpoint table. Nothing is
    /// constructed yet, so a malformed declaration fails before the engine
    /// starts.
    fn into_parts(self) -> Result<Parts<E>, ConfigError> {
        let mut table = EndpointTable::new();
        let mut ctors = Vec::with_capacity(self.registrations.len());

        for (slot, registration) in self.registrations.into_iter().enumerate() {
            table.install((registration.reflect)(slot)?)?;
            ctors.push((registration.owner, registration.ctor));
        }
        for (name, target) in self.functions {
            table.install_function(&name, target)?;
        }

        Ok((table, ctors, self.bind_addr))
    }

    /// Start with the engine on a dedicated worker thread. `factory` receives
    /// the configured version and runs on that thread.
    pub async fn start_background<F>(self, factory: F) -> Result<ServerHandle<E>>
    where
        F: FnOnce(u32) -> Result<E> + Send + 'static,
    {
        let version = validate_version(self.version)?;
        let (table, ctors, addr) = self.into_parts()?;

        let poster = BackgroundPoster::spawn(
            move || factory(version),
            move |host| install_instances(host, ctors),
        )
        .await?;
        let adapter = Arc::new(PosterAdapter::new(Arc::new(poster)));

        let listener = match bind(addr) {
            Ok(listener) => listener,
            Err(e) => {
                if let Err(stop_err) = adapter.stop().await {
                    warn!(error = %stop_err, "Failed to stop engine after bind failure");
                }
                return Err(e);
            }
        };

        serve(listener, table, adapter, Handle::current())
    }

    /// Start with the engine on the calling thread.
    ///
    /// The returned [`EngineLoop`] must be run on this same thread; it returns
    /// once the server has been asked to stop. Network IO runs on `runtime`,
    /// which must not be driven by this thread.
    pub fn start_foreground(
        self,
        runtime: &Handle,
        engine: E,
    ) -> Result<(ServerHandle<E>, EngineLoop<E>)> {
        validate_version(engine.version())?;
        let (table, ctors, addr) = self.into_parts()?;

        let mut host = EngineHost::new(engine);
        install_instances(&mut host, ctors)?;
        let (poster, engine_loop) = ForegroundPoster::attach(host);
        let adapter = Arc::new(PosterAdapter::new(Arc::new(poster)));

        let listener = bind(addr)?;
        let handle = {
            let _guard = runtime.enter();
            serve(listener, table, adapter, runtime.clone())?
        };
        Ok((handle, engine_loop))
    }
}

fn install_instances<E: Engine>(
    host: &mut EngineHost<E>,
    ctors: Vec<(&'static str, InstanceCtor<E>)>,
) -> Result<()> {
    for (owner, ctor) in ctors {
        let slot = host.install(ctor).map_err(|e| ConfigError::Construct {
            owner: owner.to_string(),
            reason: format!("{e:#}"),
        })?;
        debug!(owner, slot, "Implementation constructed");
    }
    Ok(())
}

fn bind(addr: SocketAddr) -> Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(addr)
        .with_context(|| format!("Failed to bind RPC listener on {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("Failed to configure RPC listener")?;
    Ok(listener)
}

/// Must be called within `runtime`'s context.
fn serve<E: Engine>(
    listener: std::net::TcpListener,
    table: EndpointTable<E>,
    adapter: Arc<PosterAdapter<E>>,
    runtime: Handle,
) -> Result<ServerHandle<E>> {
    let listener =
        tokio::net::TcpListener::from_std(listener).context("Failed to register RPC listener")?;
    let local_addr = listener.local_addr().context("Failed to read listener address")?;

    let lifecycle = Lifecycle::new();
    let tracker = TaskTracker::new();
    let shutdown = Shutdown {
        lifecycle: lifecycle.clone(),
        tracker: tracker.clone(),
        adapter: adapter.clone(),
        runtime: runtime.clone(),
    };

    let endpoints = table.len();
    let dispatcher = Arc::new(Dispatcher::new(
        table,
        adapter.clone(),
        lifecycle.clone(),
        shutdown.clone(),
    ));
    let transport = Transport::new(listener, dispatcher, lifecycle.clone(), tracker.clone());
    tracker.spawn_on(transport.listen(), &runtime);

    lifecycle.advance(ServerState::Serving)?;
    info!(addr = %local_addr, mode = ?adapter.mode(), endpoints, "Server ready");

    Ok(ServerHandle {
        local_addr,
        lifecycle,
        shutdown,
        adapter,
    })
}

/// Drives the `Stopping -> Stopped` half of the lifecycle.
pub(crate) struct Shutdown<E: Engine> {
    lifecycle: Lifecycle,
    tracker: TaskTracker,
    adapter: Arc<PosterAdapter<E>>,
    runtime: Handle,
}

impl<E: Engine> Clone for Shutdown<E> {
    fn clone(&self) -> Self {
        Self {
            lifecycle: self.lifecycle.clone(),
            tracker: self.tracker.clone(),
            adapter: self.adapter.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

impl<E: Engine> Shutdown<E> {
    /// Stop taking new calls and start draining. Returns immediately.
    pub(crate) fn request(&self) -> Result<(), LifecycleError> {
        self.lifecycle.advance(ServerState::Stopping)?;
        info!("Shutdown requested, draining connections");
        self.tracker.close();

        let this = self.clone();
        self.runtime.spawn(async move { this.drain().await });
        Ok(())
    }

    async fn drain(self) {
        let throttle = LogThrottle::new(Duration::from_secs(2));
        loop {
            tokio::select! {
                _ = self.tracker.wait() => break,
                _ = tokio::time::sleep(Duration::from_millis(250)) => {
                    if throttle.should_log() {
                        info!(open = self.tracker.len(), "Waiting for connections to close");
                    }
                }
            }
        }

        if let Err(e) = self.adapter.stop().await {
            warn!(error = %e, "Engine did not stop cleanly");
        }
        // Only this task moves the state past Stopping.
        let _ = self.lifecycle.advance(ServerState::Stopped);
        info!("Server stopped");
    }
}

/// Handle to a running server.
pub struct ServerHandle<E: Engine> {
    local_addr: SocketAddr,
    lifecycle: Lifecycle,
    shutdown: Shutdown<E>,
    adapter: Arc<PosterAdapter<E>>,
}

impl<E: Engine> Clone for ServerHandle<E> {
    fn clone(&self) -> Self {
        Self {
            local_addr: self.local_addr,
            lifecycle: self.lifecycle.clone(),
            shutdown: self.shutdown.clone(),
            adapter: self.adapter.clone(),
        }
    }
}

impl<E: Engine> ServerHandle<E> {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle.state()
    }

    /// Begin shutdown: in-flight calls finish, then the engine stops. Returns
    /// immediately; use [`wait_stopped`](Self::wait_stopped) to join.
    pub fn stop(&self) -> Result<(), LifecycleError> {
        self.shutdown.request()
    }

    pub async fn wait_stopped(&self) {
        self.lifecycle.wait_for(ServerState::Stopped).await;
    }

    /// Run work on the engine thread from host code.
    pub fn poster(&self) -> &Arc<PosterAdapter<E>> {
        &self.adapter
    }
}
