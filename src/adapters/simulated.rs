//! A stand-in engine for local runs and tests.
//!
//! It keeps a real project directory on disk and understands a very small
//! line-oriented script language:
//!
//! ```text
//! # comment
//! x = "text"                                  # variable
//! ExtAPI.DataModel.Project.Name = "Bracket"   # project attribute
//! sleep(250)                                  # milliseconds
//! save()                                      # write the project manifest
//! raise something went wrong                  # fail with a message
//! ExtAPI.DataModel.Project.Name               # expression, becomes the result
//! ```
//!
//! A script's result is the value of its last statement.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread::ThreadId;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info};

use crate::core::engine::{Engine, EngineError, validate_version};

pub const DEFAULT_PROJECT_NAME: &str = "UnsavedProject";
pub const MANIFEST_EXTENSION: &str = "mechdb";

const PROJECT_PATH: &str = "ExtAPI.DataModel.Project.";

struct Grammar {
    assign: Regex,
    sleep: Regex,
    raise: Regex,
    string: Regex,
    number: Regex,
    path: Regex,
}

impl Grammar {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            assign: Regex::new(r"^([A-Za-z_][A-Za-z0-9_.]*)\s*=\s*([^=].*)$")?,
            sleep: Regex::new(r"^sleep\(\s*(\d+)\s*\)$")?,
            raise: Regex::new(r"^raise\s+(.+)$")?,
            string: Regex::new(r#"^(?:"([^"]*)"|'([^']*)')$"#)?,
            number: Regex::new(r"^-?\d+(?:\.\d+)?$")?,
            path: Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*$")?,
        })
    }
}

pub struct SimulatedEngine {
    version: u32,
    owner: ThreadId,
    owner_name: String,
    project_dir: PathBuf,
    name: String,
    manifest: Option<PathBuf>,
    globals: HashMap<String, String>,
    grammar: Grammar,
    scripts_run: u64,
}

impl SimulatedEngine {
    /// Create an engine bound to the current thread, with its project
    /// directory at `project_dir` (created if missing).
    pub fn new(version: u32, project_dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let version = validate_version(version)?;
        let project_dir = project_dir.into();
        let project_dir =
            std::path::absolute(&project_dir).map_err(|source| EngineError::Project {
                path: project_dir.clone(),
                source,
            })?;
        fs::create_dir_all(&project_dir).map_err(|source| EngineError::Project {
            path: project_dir.clone(),
            source,
        })?;
        let grammar = Grammar::new().map_err(|e| EngineError::Script(e.to_string()))?;

        let owner = std::thread::current();
        info!(version, project = %project_dir.display(), "Simulated engine started");

        Ok(Self {
            version,
            owner: owner.id(),
            owner_name: owner.name().unwrap_or("unnamed").to_string(),
            project_dir,
            name: DEFAULT_PROJECT_NAME.to_string(),
            manifest: None,
            globals: HashMap::new(),
            grammar,
            scripts_run: 0,
        })
    }

    /// Engine with a fresh project under the system temp directory.
    pub fn scratch(version: u32) -> Result<Self, EngineError> {
        let root = std::env::temp_dir().join(format!("mechbridge-{}", uuid::Uuid::now_v7()));
        Self::new(version, root.join(format!("{DEFAULT_PROJECT_NAME}_files")))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    fn check_thread(&self) -> Result<(), EngineError> {
        let current = std::thread::current();
        if current.id() == self.owner {
            Ok(())
        } else {
            Err(EngineError::WrongThread {
                owner: self.owner_name.clone(),
                actual: current.name().unwrap_or("unnamed").to_string(),
            })
        }
    }

    fn manifest_path(&self) -> Result<PathBuf, EngineError> {
        let parent = self.project_dir.parent();
        let stem = self.project_dir.file_name();
        match (parent, stem) {
            (Some(parent), Some(stem)) => Ok(parent.join(format!(
                "{}.{MANIFEST_EXTENSION}",
                stem.to_string_lossy()
            ))),
            _ => Err(EngineError::Script(format!(
                "project directory {} has no parent to save into",
                self.project_dir.display()
            ))),
        }
    }

    fn save(&mut self) -> Result<String, EngineError> {
        let path = self.manifest_path()?;
        let contents = format!("name={}\nversion={}\n", self.name, self.version);
        fs::write(&path, contents).map_err(|source| EngineError::Project {
            path: path.clone(),
            source,
        })?;
        debug!(manifest = %path.display(), "Project saved");
        let saved = path.display().to_string();
        self.manifest = Some(path);
        Ok(saved)
    }

    fn statement(&mut self, line: &str) -> Result<String, EngineError> {
        if let Some(caps) = self.grammar.sleep.captures(line) {
            let ms: u64 = caps[1]
                .parse()
                .map_err(|_| EngineError::Script(format!("invalid sleep duration: {line}")))?;
            std::thread::sleep(Duration::from_millis(ms));
            return Ok(String::new());
        }
        if let Some(caps) = self.grammar.raise.captures(line) {
            let message = caps[1].trim();
            let message = self.literal(message).unwrap_or_else(|| message.to_string());
            return Err(EngineError::Script(message));
        }
        if line == "save()" {
            return self.save();
        }
        if let Some(caps) = self.grammar.assign.captures(line) {
            let target = caps[1].to_string();
            let value = self.eval(caps[2].trim())?;
            self.assign(&target, value)?;
            return Ok(String::new());
        }
        self.eval(line)
    }

    fn literal(&self, expr: &str) -> Option<String> {
        if let Some(caps) = self.grammar.string.captures(expr) {
            let text = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            return Some(text.to_string());
        }
        if self.grammar.number.is_match(expr) {
            return Some(expr.to_string());
        }
        None
    }

    fn eval(&self, expr: &str) -> Result<String, EngineError> {
        if let Some(value) = self.literal(expr) {
            return Ok(value);
        }
        if !self.grammar.path.is_match(expr) {
            return Err(EngineError::Script(format!("invalid syntax: {expr}")));
        }
        if let Some(attr) = expr.strip_prefix(PROJECT_PATH) {
            return self.get_attribute(attr);
        }
        self.globals
            .get(expr)
            .cloned()
            .ok_or_else(|| EngineError::Script(format!("name '{expr}' is not defined")))
    }

    fn get_attribute(&self, attr: &str) -> Result<String, EngineError> {
        match attr {
            "Name" => Ok(self.name.clone()),
            "ProjectDirectory" => Ok(self.project_dir.display().to_string()),
            "FilePath" => Ok(self
                .manifest
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()),
            _ => Err(EngineError::Script(format!(
                "'Project' object has no attribute '{attr}'"
            ))),
        }
    }

    fn assign(&mut self, target: &str, value: String) -> Result<(), EngineError> {
        match target.strip_prefix(PROJECT_PATH) {
            Some("Name") => {
                self.name = value;
                Ok(())
            }
            Some(attr @ ("ProjectDirectory" | "FilePath")) => Err(EngineError::Script(format!(
                "attribute '{attr}' is read-only"
            ))),
            Some(attr) => Err(EngineError::Script(format!(
                "'Project' object has no attribute '{attr}'"
            ))),
            None if !target.contains('.') => {
                self.globals.insert(target.to_string(), value);
                Ok(())
            }
            None => Err(EngineError::Script(format!("cannot assign to {target}"))),
        }
    }
}

impl Engine for SimulatedEngine {
    fn version(&self) -> u32 {
        self.version
    }

    fn project_directory(&self) -> Result<PathBuf, EngineError> {
        self.check_thread()?;
        Ok(self.project_dir.clone())
    }

    fn project_file_path(&self) -> Result<Option<PathBuf>, EngineError> {
        self.check_thread()?;
        Ok(self.manifest.clone().filter(|path| path.is_file()))
    }

    fn execute_script(&mut self, source: &str) -> Result<String, EngineError> {
        self.check_thread()?;
        self.scripts_run += 1;

        let mut last = String::new();
        for line in source.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            last = self.statement(line)?;
        }
        Ok(last)
    }

    fn new_project(&mut self) -> Result<(), EngineError> {
        self.check_thread()?;

        let dir = self.project_dir.clone();
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| EngineError::Project { path, source }
        };
        match fs::remove_dir_all(&dir) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(io_err(&dir)(e)),
            _ => {}
        }
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        if let Some(manifest) = self.manifest.take() {
            match fs::remove_file(&manifest) {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(io_err(&manifest)(e)),
                _ => {}
            }
        }

        self.name = DEFAULT_PROJECT_NAME.to_string();
        self.globals.clear();
        info!(project = %dir.display(), "Project cleared");
        Ok(())
    }

    fn shutdown(&mut self) {
        info!(scripts_run = self.scripts_run, "Simulated engine shut down");
    }
}
