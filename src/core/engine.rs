//! The engine collaborator contract.
//!
//! The bridge treats the simulation engine as opaque. It needs only the entry
//! points below, and it guarantees that each of them is invoked from the one
//! thread that created the engine. Implementations are therefore not required
//! to be `Send`.

use std::any::Any;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unsupported engine version {0}: expected a three-digit release such as 242 or 251")]
    UnsupportedVersion(u32),

    #[error("{0}")]
    Script(String),

    #[error("engine called from thread {actual}, but it is owned by {owner}")]
    WrongThread { owner: String, actual: String },

    #[error("failed to read script file {path}: {source}")]
    ScriptFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("project IO failed at {path}: {source}")]
    Project {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Entry points the bridge needs from an embedded engine.
pub trait Engine: 'static {
    /// Three-digit release number the engine was constructed with.
    fn version(&self) -> u32;

    /// Absolute path of the active project's working directory.
    fn project_directory(&self) -> Result<PathBuf, EngineError>;

    /// Project manifest, one level above the project directory, if saved.
    fn project_file_path(&self) -> Result<Option<PathBuf>, EngineError>;

    fn execute_script(&mut self, source: &str) -> Result<String, EngineError>;

    fn execute_script_from_file(&mut self, path: &Path) -> Result<String, EngineError> {
        let source = std::fs::read_to_string(path).map_err(|source| EngineError::ScriptFile {
            path: path.to_path_buf(),
            source,
        })?;
        self.execute_script(&source)
    }

    /// Reset the active project.
    fn new_project(&mut self) -> Result<(), EngineError>;

    /// Called once on the engine thread after the last job has run.
    fn shutdown(&mut self) {}
}

/// Accept only three-digit release numbers (e.g. 242, 251, 261).
pub fn validate_version(version: u32) -> Result<u32, EngineError> {
    if (100..=999).contains(&version) {
        Ok(version)
    } else {
        Err(EngineError::UnsupportedVersion(version))
    }
}

/// Builds one implementation instance from the engine handle.
pub type InstanceCtor<E> = Box<dyn FnOnce(&mut E) -> anyhow::Result<Box<dyn Any>> + Send>;

/// Everything that lives on the engine thread: the engine itself plus the
/// implementation instances whose endpoints the server exposes.
///
/// Instances are stored at fixed slots for the lifetime of the host.
pub struct EngineHost<E> {
    engine: E,
    instances: Vec<Box<dyn Any>>,
}

impl<E: Engine> EngineHost<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            instances: Vec::new(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Number of installed implementation instances.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Construct an instance against the engine and store it at the next slot.
    pub fn install(&mut self, ctor: InstanceCtor<E>) -> anyhow::Result<usize> {
        let instance = ctor(&mut self.engine)?;
        self.instances.push(instance);
        Ok(self.instances.len() - 1)
    }

    /// Borrow the instance at `slot` together with the engine.
    pub fn split<T: 'static>(&mut self, slot: usize) -> Option<(&mut T, &mut E)> {
        let instance = self.instances.get_mut(slot)?.downcast_mut::<T>()?;
        Some((instance, &mut self.engine))
    }

    pub(crate) fn shutdown(mut self) {
        self.instances.clear();
        self.engine.shutdown();
    }
}
