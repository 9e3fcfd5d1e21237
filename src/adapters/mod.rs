//! Engine hosting.
//!
//! Two posters (`background`, `foreground`) decide which thread owns the
//! engine. `simulated` provides the engine used by the binary and the tests.

pub mod background;
pub mod foreground;
pub mod simulated;

use std::path::PathBuf;

pub use background::BackgroundPoster;
pub use foreground::ForegroundPoster;
pub use simulated::SimulatedEngine;

/// Factory for a [`SimulatedEngine`] rooted at `project_root`, or at a scratch
/// directory when none is configured.
pub fn simulated_factory(
    project_root: Option<PathBuf>,
) -> impl FnOnce(u32) -> anyhow::Result<SimulatedEngine> + Send + 'static {
    move |version| {
        let engine = match project_root {
            Some(root) => SimulatedEngine::new(version, root)?,
            None => SimulatedEngine::scratch(version)?,
        };
        Ok(engine)
    }
}
