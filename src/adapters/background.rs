//! Background hosting: the engine lives on a dedicated worker thread.

use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::core::poster::{Message, panic_message};
use crate::core::{Engine, EngineHost, EngineLoop, HostingMode, Job, PostError, Poster};

/// Name of the worker thread that owns the engine.
pub const ENGINE_THREAD_NAME: &str = "mechbridge-engine";

pub struct BackgroundPoster<E> {
    tx: mpsc::UnboundedSender<Message<E>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Engine> BackgroundPoster<E> {
    /// Start the engine thread.
    ///
    /// `factory` builds the engine and `init` installs the implementation
    /// instances; both run on the new thread, so the engine never crosses
    /// threads. Returns once the engine is ready, or with the error that
    /// kept it from starting.
    pub async fn spawn<F, I>(factory: F, init: I) -> Result<Self>
    where
        F: FnOnce() -> Result<E> + Send + 'static,
        I: FnOnce(&mut EngineHost<E>) -> Result<()> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        let thread = std::thread::Builder::new()
            .name(ENGINE_THREAD_NAME.to_string())
            .spawn(move || {
                let host = factory().and_then(|engine| {
                    let mut host = EngineHost::new(engine);
                    init(&mut host)?;
                    Ok(host)
                });
                match host {
                    Ok(host) => {
                        let _ = ready_tx.send(Ok(()));
                        EngineLoop::new(host, rx).run();
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .context("Failed to spawn engine thread")?;

        match ready_rx.await {
            Ok(Ok(())) => {
                debug!(thread = ENGINE_THREAD_NAME, "Engine thread ready");
                Ok(Self {
                    tx,
                    thread: Mutex::new(Some(thread)),
                })
            }
            Ok(Err(e)) => Err(e.context("Engine failed to start")),
            Err(_) => {
                let reason = tokio::task::spawn_blocking(move || thread.join())
                    .await
                    .ok()
                    .and_then(|joined| joined.err())
                    .map(panic_message)
                    .unwrap_or_else(|| "exited without reporting".to_string());
                Err(anyhow!("Engine thread died during startup: {reason}"))
            }
        }
    }
}

#[async_trait]
impl<E: Engine> Poster<E> for BackgroundPoster<E> {
    fn try_post(&self, job: Job<E>) -> Result<(), PostError> {
        self.tx
            .send(Message::Run(job))
            .map_err(|_| PostError::Stopped)
    }

    async fn stop(&self) -> Result<(), PostError> {
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(PostError::Stopped)?;

        if self.tx.send(Message::Stop).is_err() {
            warn!("Engine loop already gone before stop");
        }

        tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| PostError::Thread(e.to_string()))?
            .map_err(|payload| PostError::Thread(panic_message(payload)))?;

        info!("Engine thread stopped");
        Ok(())
    }

    fn mode(&self) -> HostingMode {
        HostingMode::Background
    }
}

impl<E> Drop for BackgroundPoster<E> {
    fn drop(&mut self) {
        // Never stopped explicitly: let the loop wind down on its own.
        let running = self
            .thread
            .get_mut()
            .map(|thread| thread.is_some())
            .unwrap_or(false);
        if running {
            let _ = self.tx.send(Message::Stop);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::simulated::SimulatedEngine;
    use crate::core::{PosterAdapter, on_engine_thread};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_factory_and_jobs_run_on_engine_thread() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("proj_files");

        let poster = BackgroundPoster::spawn(
            move || {
                assert_eq!(
                    std::thread::current().name(),
                    Some(ENGINE_THREAD_NAME)
                );
                Ok(SimulatedEngine::new(251, project)?)
            },
            |_host| Ok(()),
        )
        .await
        .unwrap();
        let adapter = PosterAdapter::new(Arc::new(poster));
        assert_eq!(adapter.mode(), Some(HostingMode::Background));

        let (name, on_engine, result) = adapter
            .submit(|host| {
                let thread = std::thread::current();
                (
                    thread.name().map(str::to_string),
                    on_engine_thread(),
                    host.engine_mut().execute_script("x = 2\nx"),
                )
            })
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some(ENGINE_THREAD_NAME));
        assert!(on_engine);
        assert_eq!(result.unwrap(), "2");

        adapter.stop().await.unwrap();
        assert!(!adapter.is_attached());
    }

    #[tokio::test]
    async fn test_startup_failure_is_reported() {
        let err = BackgroundPoster::<SimulatedEngine>::spawn(
            || Err(anyhow!("license server unreachable")),
            |_host| Ok(()),
        )
        .await
        .err()
        .unwrap();
        assert!(format!("{err:#}").contains("license server unreachable"));

        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("p");
        let err = BackgroundPoster::spawn(
            move || Ok(SimulatedEngine::new(251, project)?),
            |_host| Err(anyhow!("bad implementation")),
        )
        .await
        .err()
        .unwrap();
        assert!(format!("{err:#}").contains("bad implementation"));
    }

    #[tokio::test]
    async fn test_stop_runs_queued_jobs_then_joins() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("p");
        let poster = BackgroundPoster::spawn(
            move || Ok(SimulatedEngine::new(251, project)?),
            |_host| Ok(()),
        )
        .await
        .unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        poster
            .try_post(Box::new(move |_host| {
                std::thread::sleep(std::time::Duration::from_millis(50));
                flag.store(true, Ordering::SeqCst);
            }))
            .unwrap();

        poster.stop().await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert!(matches!(poster.stop().await, Err(PostError::Stopped)));
        assert!(matches!(
            poster.try_post(Box::new(|_host| {})),
            Err(PostError::Stopped)
        ));
    }
}
