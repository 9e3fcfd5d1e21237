//! TCP transport layer for the RPC server.
//!
//! Handles TCP connections with newline-delimited JSON framing.
//! Each connection is handled in its own task, tracked so that shutdown can
//! wait for every connection to finish.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::dispatcher::Dispatcher;
use super::protocol::{Request, Response};
use crate::core::{Engine, Lifecycle, ServerState};

/// Manages the TCP transport layer.
pub struct Transport<E: Engine> {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher<E>>,
    lifecycle: Lifecycle,
    tracker: TaskTracker,
}

impl<E: Engine> Transport<E> {
    pub fn new(
        listener: TcpListener,
        dispatcher: Arc<Dispatcher<E>>,
        lifecycle: Lifecycle,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            listener,
            dispatcher,
            lifecycle,
            tracker,
        }
    }

    /// Accept connections until the server starts stopping. The listening
    /// socket closes when this returns.
    pub async fn listen(self) {
        let addr = self.listener.local_addr().ok();
        info!(addr = ?addr, "RPC server listening");

        let stopping = self.lifecycle.wait_for(ServerState::Stopping);
        tokio::pin!(stopping);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let session = Uuid::now_v7();
                            let span = info_span!("session", id = %session, peer = %peer_addr);
                            debug!(parent: &span, "Client connected");
                            let dispatcher = self.dispatcher.clone();
                            let lifecycle = self.lifecycle.clone();
                            self.tracker.spawn(
                                async move {
                                    let outcome =
                                        handle_connection(stream, peer_addr, dispatcher, lifecycle)
                                            .await;
                                    if let Err(e) = outcome {
                                        debug!(error = %e, "Connection error");
                                    }
                                    debug!("Client disconnected");
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = &mut stopping => {
                    info!("RPC server no longer accepting connections");
                    break;
                }
            }
        }
    }
}

/// Handle a single client connection.
///
/// Requests on one connection are processed strictly one after another. An
/// idle connection is closed once the server is stopping; a request already
/// being processed always gets its response.
async fn handle_connection<E: Engine>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    dispatcher: Arc<Dispatcher<E>>,
    lifecycle: Lifecycle,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    let stopping = lifecycle.wait_for(ServerState::Stopping);
    tokio::pin!(stopping);

    loop {
        line.clear();
        let bytes_read = tokio::select! {
            read = reader.read_until(b'\n', &mut line) => read?,
            _ = &mut stopping => {
                debug!(peer = %peer_addr, "Closing idle connection for shutdown");
                break;
            }
        };

        if bytes_read == 0 {
            // EOF - client disconnected
            break;
        }

        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }

        // Covers invalid UTF-8 as well as malformed JSON.
        let response = match serde_json::from_slice::<Request>(trimmed) {
            Ok(request) => {
                // Validate JSON-RPC 2.0 format
                if let Err(msg) = request.validate() {
                    warn!(peer = %peer_addr, error = msg, "Invalid request");
                    let id = request.id.clone().unwrap_or(serde_json::Value::Null);
                    Response::invalid_request(id)
                } else if request.is_notification() {
                    // Notifications don't get responses
                    debug!(peer = %peer_addr, method = %request.method, "Notification received");
                    dispatcher.handle(request).await;
                    continue;
                } else {
                    debug!(method = %request.method, "Request received");
                    dispatcher.handle(request).await
                }
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "Parse error");
                Response::parse_error()
            }
        };

        let mut response_json = serde_json::to_string(&response)?;
        response_json.push('\n');
        writer.write_all(response_json.as_bytes()).await?;
    }

    writer.shutdown().await.ok();
    Ok(())
}
