//! Foreground hosting: the engine owns the caller's thread.
//!
//! The caller keeps the [`EngineLoop`] and runs it on the thread that created
//! the engine (normally `main`). Stopping the poster makes that loop return.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::poster::Message;
use crate::core::{Engine, EngineHost, EngineLoop, HostingMode, Job, PostError, Poster};

pub struct ForegroundPoster<E> {
    tx: mpsc::UnboundedSender<Message<E>>,
    stopped: AtomicBool,
}

impl<E: Engine> ForegroundPoster<E> {
    /// Wrap an engine that already lives on the current thread.
    pub fn attach(host: EngineHost<E>) -> (Self, EngineLoop<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let poster = Self {
            tx,
            stopped: AtomicBool::new(false),
        };
        (poster, EngineLoop::new(host, rx))
    }
}

#[async_trait]
impl<E: Engine> Poster<E> for ForegroundPoster<E> {
    fn try_post(&self, job: Job<E>) -> Result<(), PostError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(PostError::Stopped);
        }
        self.tx
            .send(Message::Run(job))
            .map_err(|_| PostError::Stopped)
    }

    /// Flags the loop to return after the jobs already queued. Does not wait:
    /// the thread running the loop is the caller's to join.
    async fn stop(&self) -> Result<(), PostError> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Err(PostError::Stopped);
        }
        let _ = self.tx.send(Message::Stop);
        debug!("Foreground engine loop signalled to stop");
        Ok(())
    }

    fn mode(&self) -> HostingMode {
        HostingMode::Foreground
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::simulated::SimulatedEngine;
    use crate::core::PosterAdapter;
    use std::sync::Arc;

    #[test]
    fn test_loop_runs_on_calling_thread() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SimulatedEngine::new(242, dir.path().join("p")).unwrap();
        let (poster, engine_loop) = ForegroundPoster::attach(EngineHost::new(engine));
        let adapter = Arc::new(PosterAdapter::new(Arc::new(poster)));
        assert_eq!(adapter.mode(), Some(HostingMode::Foreground));

        let main_thread = std::thread::current().id();
        let worker = {
            let adapter = adapter.clone();
            std::thread::spawn(move || {
                let ran_on = adapter
                    .submit_blocking(|host| {
                        host.engine_mut().set_name("foreground");
                        std::thread::current().id()
                    })
                    .unwrap();
                let rt = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .unwrap();
                rt.block_on(adapter.stop()).unwrap();
                ran_on
            })
        };

        engine_loop.run();
        assert_eq!(worker.join().unwrap(), main_thread);
        assert!(matches!(
            adapter.submit_blocking(|_host| ()),
            Err(PostError::Stopped)
        ));
    }
}
