#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use mechbridge::adapters::{SimulatedEngine, simulated_factory};
use mechbridge::config::{ClientConfig, ServerConfig};
use mechbridge::core::{CallArgs, Engine, Reflector, Remote, RemoteError};
use mechbridge::rpc::{Client, DefaultServiceMethods, ServerBuilder, ServerHandle};
use tempfile::TempDir;

/// Test implementation exposing a mix of methods and properties.
pub struct ProjectMethods {
    recorded: Vec<u64>,
    counter: u64,
}

impl Remote<SimulatedEngine> for ProjectMethods {
    fn construct(_engine: &mut SimulatedEngine) -> anyhow::Result<Self> {
        Ok(Self {
            recorded: Vec::new(),
            counter: 0,
        })
    }

    fn endpoints(r: &mut Reflector<Self, SimulatedEngine>) {
        r.method("get_project_name", |_this, engine, _args| {
            Ok(engine.name().to_string())
        });

        r.property("name")
            .getter(|_this, engine| Ok(engine.name().to_string()))
            .setter(|_this, engine, value: String| {
                engine.set_name(value);
                Ok(())
            });

        r.method("fail", |_this, _engine, args| {
            let message: String = args.arg_or(0, "message", "boom".to_string())?;
            Err::<(), _>(anyhow::Error::new(RemoteError::value_error(message)))
        });

        r.method("panic", |_this, _engine, _args| -> anyhow::Result<()> {
            panic!("engine exploded")
        });

        r.method("engine_thread", |_this, engine, _args| {
            // Goes through the engine's own thread check.
            engine.project_directory()?;
            let current = std::thread::current();
            Ok(current.name().unwrap_or("unnamed").to_string())
        });

        r.method("record", |this, _engine, args| {
            let value: u64 = args.arg(0, "value")?;
            this.recorded.push(value);
            Ok(this.recorded.len())
        });

        r.method("recorded", |this, _engine, _args| Ok(this.recorded.clone()));

        // Read-modify-write with a pause in between; only atomic if calls
        // never interleave.
        r.method("bump", |this, _engine, _args| {
            let before = this.counter;
            std::thread::sleep(Duration::from_millis(1));
            this.counter = before + 1;
            Ok(this.counter)
        });

        r.property("counter").getter(|this, _engine| Ok(this.counter));
    }
}

pub struct TestServer {
    pub handle: ServerHandle<SimulatedEngine>,
    pub project: PathBuf,
    pub dir: TempDir,
}

impl TestServer {
    pub async fn client(&self) -> Client {
        Client::connect(client_config(&self.handle))
            .await
            .expect("client should connect")
    }
}

pub fn client_config(handle: &ServerHandle<SimulatedEngine>) -> ClientConfig {
    ClientConfig {
        timeout_ms: 5_000,
        call_timeout_ms: Some(30_000),
        ..ClientConfig::for_addr(handle.local_addr())
    }
}

pub fn server_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        ..Default::default()
    }
}

pub fn builder() -> ServerBuilder<SimulatedEngine> {
    ServerBuilder::new(&server_config())
        .implementation::<DefaultServiceMethods>()
        .implementation::<ProjectMethods>()
        .function("engine_version", |engine: &mut SimulatedEngine, _args: &CallArgs| {
            Ok(engine.version())
        })
}

/// Start a background-mode server on a free port with a fresh project
/// directory.
pub async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("proj_files");
    let handle = builder()
        .start_background(simulated_factory(Some(project.clone())))
        .await
        .expect("server should start");
    TestServer {
        handle,
        project,
        dir,
    }
}
