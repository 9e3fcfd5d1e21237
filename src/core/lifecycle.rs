//! Server lifecycle state.
//!
//! `Starting -> Serving -> Stopping -> Stopped`, never backwards. The state
//! lives in a watch channel so the accept loop, the connections and the
//! drainer can all wait on it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Starting,
    Serving,
    Stopping,
    Stopped,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerState::Starting => "starting",
            ServerState::Serving => "serving",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("server is already stopped")]
    AlreadyStopped,

    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidTransition { from: ServerState, to: ServerState },
}

#[derive(Debug, Clone)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<ServerState>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ServerState::Starting);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ServerState {
        *self.tx.borrow()
    }

    /// Move forward to `to`. Returns the previous state.
    pub fn advance(&self, to: ServerState) -> Result<ServerState, LifecycleError> {
        let mut outcome = Err(LifecycleError::AlreadyStopped);
        self.tx.send_if_modified(|state| {
            let from = *state;
            if to > from {
                *state = to;
                outcome = Ok(from);
                true
            } else {
                outcome = Err(if from >= ServerState::Stopping && to >= ServerState::Stopping {
                    LifecycleError::AlreadyStopped
                } else {
                    LifecycleError::InvalidTransition { from, to }
                });
                false
            }
        });
        outcome
    }

    /// New endpoint invocations may start only while serving.
    pub fn is_accepting_calls(&self) -> bool {
        self.state() == ServerState::Serving
    }

    /// Wait until the state is at least `target`.
    pub async fn wait_for(&self, target: ServerState) -> ServerState {
        let mut rx = self.tx.subscribe();
        let reached = rx.wait_for(|state| *state >= target).await.map(|state| *state);
        // The sender lives as long as `self`, so the channel cannot close here.
        reached.unwrap_or_else(|_| self.state())
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.tx.subscribe()
    }
}
