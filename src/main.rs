use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use mechbridge::adapters::{SimulatedEngine, simulated_factory};
use mechbridge::config::{self, ClientConfig, ServerConfig, Settings};
use mechbridge::core::{CallArgs, Engine, HostingMode};
use mechbridge::logging::{self, LogConfig};
use mechbridge::rpc::{Client, DefaultServiceMethods, ServerBuilder, ServerHandle};
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Runtime;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "mechbridge")]
#[command(about = "RPC bridge for an embedded simulation engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: $MECHBRIDGE_CONFIG, then ./mechbridge.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Host an engine and serve its endpoints
    Serve(ServeArgs),
    /// Call an endpoint; positional arguments are JSON (bare words are strings)
    Call {
        #[command(flatten)]
        conn: ConnectArgs,
        endpoint: String,
        args: Vec<String>,
        /// Keyword argument as name=json, repeatable
        #[arg(short = 'k', long = "kwarg")]
        kwargs: Vec<String>,
    },
    /// Read a remote attribute
    Get {
        #[command(flatten)]
        conn: ConnectArgs,
        name: String,
    },
    /// Check liveness and list endpoints
    Status(ConnectArgs),
    /// Upload a local file into a remote directory
    Upload {
        #[command(flatten)]
        conn: ConnectArgs,
        file: PathBuf,
        remote_dir: String,
    },
    /// Download a remote file or directory
    Download {
        #[command(flatten)]
        conn: ConnectArgs,
        remote: String,
        target: PathBuf,
        #[arg(long)]
        no_overwrite: bool,
    },
    /// Download every file of the engine project
    DownloadProject {
        #[command(flatten)]
        conn: ConnectArgs,
        target: PathBuf,
        /// Only files with these extensions
        #[arg(long = "ext")]
        extensions: Vec<String>,
        #[arg(long)]
        no_overwrite: bool,
    },
    /// Ask the server to shut down
    Stop(ConnectArgs),
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write a config file holding the defaults
    Init { path: Option<PathBuf> },
}

#[derive(Args, Serialize)]
struct ServeArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    host: Option<IpAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    port: Option<u16>,

    /// Three-digit engine release, e.g. 251
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    version: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, value_enum)]
    mode: Option<HostingMode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    project_root: Option<PathBuf>,
}

#[derive(Args, Serialize)]
struct ConnectArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    host: Option<IpAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    call_timeout_ms: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(Settings::path);

    // Built by hand: in foreground mode the main thread belongs to the engine.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("mechbridge-rt")
        .build()
        .context("Failed to start async runtime")?;

    match cli.command {
        Commands::Serve(args) => {
            let config = ServerConfig::load_from(&path, Some(&args))?;
            logging::init(LogConfig {
                json: config.json_logs || cli.json_logs,
                verbose: config.verbose || cli.verbose,
            });
            run_server(&runtime, config).context("Server failed")
        }
        Commands::Config(ConfigCommand::Init { path: target }) => {
            let target = target.unwrap_or(path);
            config::write_default(&target)?;
            println!("Wrote {}", target.display());
            Ok(())
        }
        command => {
            logging::init(LogConfig {
                json: cli.json_logs,
                verbose: cli.verbose,
            });
            runtime.block_on(run_client_command(&path, command))
        }
    }
}

fn build_server(config: &ServerConfig) -> ServerBuilder<SimulatedEngine> {
    ServerBuilder::new(config)
        .implementation::<DefaultServiceMethods>()
        .function("engine_version", |engine: &mut SimulatedEngine, _args: &CallArgs| {
            Ok(engine.version())
        })
}

fn run_server(runtime: &Runtime, config: ServerConfig) -> Result<()> {
    match config.mode {
        HostingMode::Background => runtime.block_on(async {
            let handle = build_server(&config)
                .start_background(simulated_factory(config.project_root.clone()))
                .await?;
            println!("Serving on {}", handle.local_addr());

            tokio::select! {
                _ = tokio::signal::ctrl_c() => request_stop(&handle),
                _ = handle.wait_stopped() => {}
            }
            handle.wait_stopped().await;
            Ok(())
        }),
        HostingMode::Foreground => {
            let engine = simulated_factory(config.project_root.clone())(config.version)?;
            let (handle, engine_loop) =
                build_server(&config).start_foreground(runtime.handle(), engine)?;
            println!("Serving on {}", handle.local_addr());

            let stopper = handle.clone();
            runtime.spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    request_stop(&stopper);
                }
            });

            engine_loop.run();
            runtime.block_on(handle.wait_stopped());
            Ok(())
        }
    }
}

fn request_stop(handle: &ServerHandle<SimulatedEngine>) {
    info!("Interrupted, stopping server");
    if let Err(e) = handle.stop() {
        debug!(error = %e, "Stop ignored");
    }
}

async fn run_client_command(path: &Path, command: Commands) -> Result<()> {
    match command {
        Commands::Call {
            conn,
            endpoint,
            args,
            kwargs,
        } => {
            let client = connect(path, &conn).await?;
            let call_args = parse_call_args(&args, &kwargs)?;
            let value = client
                .call_raw(&endpoint, call_args)
                .await
                .with_context(|| format!("Call to {endpoint} failed"))?;
            print_json(&value)
        }
        Commands::Get { conn, name } => {
            let client = connect(path, &conn).await?;
            let value = client
                .attr(&name)
                .await
                .with_context(|| format!("Failed to read {name}"))?;
            match value {
                mechbridge::rpc::Attribute::Value(value) => print_json(&value),
                mechbridge::rpc::Attribute::Method(name) => {
                    println!("<method {name}>");
                    Ok(())
                }
            }
        }
        Commands::Status(conn) => {
            let client = connect(path, &conn).await?;
            println!("alive: {}", client.is_alive().await);
            for endpoint in client.endpoints().await.context("Failed to list endpoints")? {
                println!("{:<40} {:?}", endpoint.name, endpoint.kind);
            }
            Ok(())
        }
        Commands::Upload {
            conn,
            file,
            remote_dir,
        } => {
            let client = connect(path, &conn).await?;
            let remote = client
                .upload(&file, &remote_dir)
                .await
                .with_context(|| format!("Failed to upload {}", file.display()))?;
            println!("{remote}");
            Ok(())
        }
        Commands::Download {
            conn,
            remote,
            target,
            no_overwrite,
        } => {
            let client = connect(path, &conn).await?;
            let written = client
                .download(&remote, &target, !no_overwrite)
                .await
                .with_context(|| format!("Failed to download {remote}"))?;
            print_paths(&written);
            Ok(())
        }
        Commands::DownloadProject {
            conn,
            target,
            extensions,
            no_overwrite,
        } => {
            let client = connect(path, &conn).await?;
            let written = client
                .download_project(&target, &extensions, !no_overwrite)
                .await
                .context("Failed to download project")?;
            print_paths(&written);
            Ok(())
        }
        Commands::Stop(conn) => {
            let client = connect(path, &conn).await?;
            client
                .shutdown_server()
                .await
                .context("Failed to stop server")?;
            println!("Server stopping");
            Ok(())
        }
        Commands::Serve(_) | Commands::Config(_) => bail!("not a client command"),
    }
}

async fn connect(path: &Path, conn: &ConnectArgs) -> Result<Client> {
    let config = ClientConfig::load_from(path, Some(conn))?;
    let addr = config.addr();
    Client::connect(config)
        .await
        .with_context(|| format!("Failed to connect to server at {addr}"))
}

/// JSON values pass through; anything that does not parse is a string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_call_args(args: &[String], kwargs: &[String]) -> Result<CallArgs> {
    let mut call = CallArgs::positional(args.iter().map(|a| parse_value(a)).collect());
    for kwarg in kwargs {
        let Some((name, raw)) = kwarg.split_once('=') else {
            bail!("Keyword argument '{kwarg}' must look like name=value");
        };
        call = call.kwarg(name.trim(), parse_value(raw));
    }
    Ok(call)
}

fn print_json(value: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to format result")?
    );
    Ok(())
}

fn print_paths(paths: &[PathBuf]) {
    for path in paths {
        println!("{}", path.display());
    }
}
