//! The poster adapter.
//!
//! Every engine-bound unit of work is a boxed closure posted to the engine
//! thread. A [`Poster`] delivers jobs to that thread; which thread it is
//! (a dedicated worker, or the process main thread) is the poster's business,
//! and the rest of the server only sees the [`PosterAdapter`].

use std::any::Any;
use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::engine::{Engine, EngineHost};

/// A unit of work for the engine thread.
pub type Job<E> = Box<dyn FnOnce(&mut EngineHost<E>) + Send>;

pub(crate) enum Message<E> {
    Run(Job<E>),
    Stop,
}

/// Which thread hosts the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HostingMode {
    /// The engine owns the process main thread.
    Foreground,
    /// The engine runs on a dedicated worker thread.
    #[default]
    Background,
}

#[derive(Debug, Error)]
pub enum PostError {
    #[error("cannot submit from the engine thread: the job would wait on itself")]
    Reentrant,

    #[error("engine is not running")]
    Stopped,

    #[error("engine job panicked: {0}")]
    Panicked(String),

    #[error("engine thread failed: {0}")]
    Thread(String),
}

/// Delivers jobs to the engine thread.
#[async_trait]
pub trait Poster<E: Engine>: Send + Sync {
    /// Queue a job. Returns once the job is queued, not once it has run.
    fn try_post(&self, job: Job<E>) -> Result<(), PostError>;

    /// Stop accepting jobs and terminate the engine loop after the jobs
    /// already queued.
    async fn stop(&self) -> Result<(), PostError>;

    fn mode(&self) -> HostingMode;
}

thread_local! {
    static ON_ENGINE_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// True while running inside an [`EngineLoop`].
pub fn on_engine_thread() -> bool {
    ON_ENGINE_THREAD.with(Cell::get)
}

/// Uniform `submit` over whichever poster hosts the engine.
pub struct PosterAdapter<E: Engine> {
    poster: RwLock<Option<Arc<dyn Poster<E>>>>,
}

impl<E: Engine> PosterAdapter<E> {
    pub fn new(poster: Arc<dyn Poster<E>>) -> Self {
        Self {
            poster: RwLock::new(Some(poster)),
        }
    }

    fn current(&self) -> Result<Arc<dyn Poster<E>>, PostError> {
        self.poster
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PostError::Stopped)
    }

    pub fn is_attached(&self) -> bool {
        self.current().is_ok()
    }

    pub fn mode(&self) -> Option<HostingMode> {
        self.current().ok().map(|poster| poster.mode())
    }

    fn post<F, R>(&self, f: F) -> Result<oneshot::Receiver<Result<R, String>>, PostError>
    where
        F: FnOnce(&mut EngineHost<E>) -> R + Send + 'static,
        R: Send + 'static,
    {
        if on_engine_thread() {
            return Err(PostError::Reentrant);
        }

        let (tx, rx) = oneshot::channel();
        let job: Job<E> = Box::new(move |host: &mut EngineHost<E>| {
            let outcome = catch_unwind(AssertUnwindSafe(move || f(host))).map_err(panic_message);
            // The caller may have given up waiting.
            let _ = tx.send(outcome);
        });
        self.current()?.try_post(job)?;
        Ok(rx)
    }

    /// Run `f` on the engine thread and wait for its result.
    pub async fn submit<F, R>(&self, f: F) -> Result<R, PostError>
    where
        F: FnOnce(&mut EngineHost<E>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let rx = self.post(f)?;
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(PostError::Panicked(message)),
            Err(_) => Err(PostError::Stopped),
        }
    }

    /// Blocking variant of [`submit`](Self::submit) for non-async callers.
    /// Must not be called from within a tokio runtime.
    pub fn submit_blocking<F, R>(&self, f: F) -> Result<R, PostError>
    where
        F: FnOnce(&mut EngineHost<E>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let rx = self.post(f)?;
        match rx.blocking_recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(PostError::Panicked(message)),
            Err(_) => Err(PostError::Stopped),
        }
    }

    /// Detach the poster and stop it. Later submits fail with
    /// [`PostError::Stopped`].
    pub async fn stop(&self) -> Result<(), PostError> {
        let poster = self
            .poster
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(PostError::Stopped)?;
        poster.stop().await
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The job pump that runs on the engine thread.
///
/// In background mode the server runs it on its own worker thread. In
/// foreground mode the caller runs it on the thread that owns the engine,
/// usually `main`.
pub struct EngineLoop<E: Engine> {
    host: EngineHost<E>,
    rx: mpsc::UnboundedReceiver<Message<E>>,
}

impl<E: Engine> EngineLoop<E> {
    pub(crate) fn new(host: EngineHost<E>, rx: mpsc::UnboundedReceiver<Message<E>>) -> Self {
        Self { host, rx }
    }

    /// Process jobs in arrival order until the poster is stopped, then shut
    /// the engine down. Blocks the current thread.
    pub fn run(mut self) {
        ON_ENGINE_THREAD.with(|flag| flag.set(true));
        let thread = std::thread::current();
        debug!(thread = ?thread.name(), "Engine loop started");

        let mut jobs: u64 = 0;
        while let Some(message) = self.rx.blocking_recv() {
            match message {
                Message::Run(job) => {
                    jobs += 1;
                    let host = &mut self.host;
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || job(host))) {
                        error!(panic = %panic_message(payload), "Engine job panicked");
                    }
                }
                Message::Stop => break,
            }
        }

        // Jobs still queued are dropped, which fails their submitters.
        self.rx.close();
        ON_ENGINE_THREAD.with(|flag| flag.set(false));
        info!(jobs, "Engine loop stopped");
        self.host.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::EngineError;
    use std::path::PathBuf;

    struct Tally(u32);

    impl Engine for Tally {
        fn version(&self) -> u32 {
            251
        }
        fn project_directory(&self) -> Result<PathBuf, EngineError> {
            Ok(PathBuf::from("/tmp/tally"))
        }
        fn project_file_path(&self) -> Result<Option<PathBuf>, EngineError> {
            Ok(None)
        }
        fn execute_script(&mut self, _source: &str) -> Result<String, EngineError> {
            self.0 += 1;
            Ok(self.0.to_string())
        }
        fn new_project(&mut self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    /// Minimal poster over a raw channel, for exercising the adapter alone.
    struct ChannelPoster(mpsc::UnboundedSender<Message<Tally>>);

    #[async_trait]
    impl Poster<Tally> for ChannelPoster {
        fn try_post(&self, job: Job<Tally>) -> Result<(), PostError> {
            self.0
                .send(Message::Run(job))
                .map_err(|_| PostError::Stopped)
        }

        async fn stop(&self) -> Result<(), PostError> {
            self.0.send(Message::Stop).map_err(|_| PostError::Stopped)
        }

        fn mode(&self) -> HostingMode {
            HostingMode::Background
        }
    }

    fn spawn_loop() -> (Arc<PosterAdapter<Tally>>, std::thread::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        // The host is not Send; build it on the thread that runs it.
        let handle =
            std::thread::spawn(move || EngineLoop::new(EngineHost::new(Tally(0)), rx).run());
        (Arc::new(PosterAdapter::new(Arc::new(ChannelPoster(tx)))), handle)
    }

    #[tokio::test]
    async fn test_submit_runs_on_engine_thread() {
        let (adapter, handle) = spawn_loop();
        assert!(!on_engine_thread());

        let (flag, result) = adapter
            .submit(|host| {
                (
                    on_engine_thread(),
                    host.engine_mut().execute_script("x").unwrap(),
                )
            })
            .await
            .unwrap();
        assert!(flag);
        assert_eq!(result, "1");

        adapter.stop().await.unwrap();
        handle.join().unwrap();
        assert!(matches!(adapter.submit(|_| ()).await, Err(PostError::Stopped)));
        assert!(matches!(adapter.stop().await, Err(PostError::Stopped)));
    }

    #[tokio::test]
    async fn test_reentrant_submit_fails_fast() {
        let (adapter, handle) = spawn_loop();
        let inner = adapter.clone();

        let nested = adapter
            .submit(move |_host| inner.submit_blocking(|_host| 1))
            .await
            .unwrap();
        assert!(matches!(nested, Err(PostError::Reentrant)));

        adapter.stop().await.unwrap();
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_panic_is_reported_and_loop_survives() {
        let (adapter, handle) = spawn_loop();

        let err = adapter
            .submit(|_host| -> u32 { panic!("engine exploded") })
            .await
            .unwrap_err();
        match err {
            PostError::Panicked(message) => assert!(message.contains("engine exploded")),
            other => panic!("unexpected error: {other}"),
        }

        let value = adapter.submit(|_host| 7).await.unwrap();
        assert_eq!(value, 7);

        adapter.stop().await.unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_submit_blocking_outside_runtime() {
        let (adapter, handle) = spawn_loop();
        assert_eq!(adapter.submit_blocking(|_host| "ok").unwrap(), "ok");
        adapter.poster.write().unwrap().take();
        assert!(matches!(
            adapter.submit_blocking(|_host| ()),
            Err(PostError::Stopped)
        ));
        // Dropping the only sender ends the loop.
        drop(adapter);
        handle.join().unwrap();
    }
}
