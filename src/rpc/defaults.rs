//! The default endpoint bundle: script execution, project reset and project
//! file listing.

use std::path::{Path, PathBuf};
use std::time::Instant;

use regex::Regex;
use serde_json::Value;
use tracing::{Level, debug, error, info, trace, warn};

use super::files::walk_files;
use crate::core::{CallArgs, Engine, Reflector, Remote, RemoteError};

/// Service methods every bridge server can expose.
pub struct DefaultServiceMethods;

/// Options shared by the two script runners.
struct ScriptOptions {
    enable_logging: bool,
    level: Level,
    progress_interval: u64,
}

impl ScriptOptions {
    fn from_args(args: &CallArgs) -> Result<Self, RemoteError> {
        let log_level: String = args.arg_or(2, "log_level", "WARNING".to_string())?;
        Ok(Self {
            enable_logging: args.arg_or(1, "enable_logging", false)?,
            level: parse_level(&log_level)?,
            progress_interval: args.arg_or(3, "progress_interval", 2000)?,
        })
    }

    fn report(&self, what: &str, started: Instant, outcome: &Result<String, RemoteError>) {
        if !self.enable_logging {
            return;
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let interval = self.progress_interval;
        let status = match outcome {
            Ok(_) => "completed",
            Err(_) => "failed",
        };
        match self.level {
            Level::ERROR => error!(what, status, elapsed_ms, interval, "Script run"),
            Level::WARN => warn!(what, status, elapsed_ms, interval, "Script run"),
            Level::INFO => info!(what, status, elapsed_ms, interval, "Script run"),
            Level::DEBUG => debug!(what, status, elapsed_ms, interval, "Script run"),
            _ => trace!(what, status, elapsed_ms, interval, "Script run"),
        }
    }
}

/// Accepts the level names scripts are used to (`WARNING`, `CRITICAL`, ...).
fn parse_level(name: &str) -> Result<Level, RemoteError> {
    match name.to_ascii_uppercase().as_str() {
        "CRITICAL" | "FATAL" | "ERROR" => Ok(Level::ERROR),
        "WARNING" | "WARN" => Ok(Level::WARN),
        "INFO" => Ok(Level::INFO),
        "DEBUG" => Ok(Level::DEBUG),
        "TRACE" => Ok(Level::TRACE),
        _ => Err(RemoteError::value_error(format!(
            "unknown log level '{name}'"
        ))),
    }
}

impl<E: Engine> Remote<E> for DefaultServiceMethods {
    fn construct(_engine: &mut E) -> anyhow::Result<Self> {
        Ok(Self)
    }

    fn endpoints(r: &mut Reflector<Self, E>) {
        r.method("run_python_script", |_this, engine, args| {
            let script: String = args.arg(0, "script")?;
            let options = ScriptOptions::from_args(args)?;
            let started = Instant::now();
            let outcome = engine
                .execute_script(&script)
                .map_err(|e| RemoteError::from_anyhow(e.into()));
            options.report("inline", started, &outcome);
            Ok(outcome?)
        });

        r.method("run_python_script_from_file", |_this, engine, args| {
            let file_path: PathBuf = args.arg(0, "file_path")?;
            let options = ScriptOptions::from_args(args)?;
            let started = Instant::now();
            let outcome = engine
                .execute_script_from_file(&file_path)
                .map_err(|e| RemoteError::from_anyhow(e.into()));
            options.report("file", started, &outcome);
            Ok(outcome?)
        });

        r.method("clear", |_this, engine, _args| {
            engine.new_project()?;
            Ok(())
        });

        r.property("project_directory").getter(|_this, engine| {
            Ok(engine.project_directory()?.display().to_string())
        });

        r.method("list_files", |_this, engine, _args| list_files(engine));

        r.method("get_files", |_this, engine, args| {
            let files: Value = args.arg(0, "files")?;
            get_files(engine, files)
        });
    }
}

/// The project manifest (when saved) followed by every file under the
/// project directory, as absolute paths.
fn list_files<E: Engine>(engine: &E) -> anyhow::Result<Vec<String>> {
    let mut files = Vec::new();
    if let Some(manifest) = engine.project_file_path()? {
        files.push(manifest.display().to_string());
    }

    let root = engine.project_directory()?;
    files.extend(
        walk_files(&root)?
            .into_iter()
            .map(|path| path.display().to_string()),
    );

    if files.is_empty() {
        debug!(project = %root.display(), "No files listed");
    }
    Ok(files)
}

/// Resolve `files` against the project listing: an exact path, a `*`/`?`
/// pattern, or an explicit list of paths.
fn get_files<E: Engine>(engine: &E, files: Value) -> anyhow::Result<Vec<String>> {
    match files {
        Value::String(pattern) => {
            let listed = list_files(engine)?;
            if listed.contains(&pattern) {
                return Ok(vec![pattern]);
            }
            if !pattern.contains(['*', '?']) {
                return Err(RemoteError::value_error(format!(
                    "'{pattern}' does not match any file or pattern"
                ))
                .into());
            }

            let root = engine.project_directory()?;
            let matcher = glob_regex(&pattern)?;
            let matched: Vec<String> = listed
                .into_iter()
                .filter(|path| {
                    matcher.is_match(path)
                        || relative_to(Path::new(path), &root)
                            .is_some_and(|rel| matcher.is_match(&rel))
                })
                .collect();
            if matched.is_empty() {
                return Err(RemoteError::value_error(format!(
                    "'{pattern}' did not match any file in the project"
                ))
                .into());
            }
            Ok(matched)
        }
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(path) => Ok(path),
                other => Err(RemoteError::value_error(format!(
                    "file lists may only contain strings, got {other}"
                ))
                .into()),
            })
            .collect(),
        other => Err(RemoteError::value_error(format!(
            "files must be a string or a list of strings, got {other}"
        ))
        .into()),
    }
}

fn relative_to(path: &Path, root: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .map(super::files::to_wire_path)
}

/// Anchored regex for a shell-style pattern. `*` and `?` also match `/`.
fn glob_regex(pattern: &str) -> Result<Regex, RemoteError> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for c in pattern.chars() {
        match c {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            c => source.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    source.push('$');
    Regex::new(&source)
        .map_err(|e| RemoteError::value_error(format!("invalid pattern '{pattern}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedEngine;
    use std::fs;

    fn engine() -> (tempfile::TempDir, SimulatedEngine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = SimulatedEngine::new(251, dir.path().join("proj_files")).unwrap();
        (dir, engine)
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("WARNING").unwrap(), Level::WARN);
        assert_eq!(parse_level("critical").unwrap(), Level::ERROR);
        assert_eq!(parse_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_level("LOUD").unwrap_err().kind, "ValueError");
    }

    #[test]
    fn test_glob_regex() {
        let re = glob_regex("*.txt").unwrap();
        assert!(re.is_match("a.txt"));
        assert!(re.is_match("sub/b.txt"));
        assert!(!re.is_match("a.txt.bak"));

        let re = glob_regex("file?.(1)").unwrap();
        assert!(re.is_match("file1.(1)"));
        assert!(!re.is_match("file12.(1)"));
    }

    #[test]
    fn test_list_files_includes_manifest_first() {
        let (dir, mut engine) = engine();
        let project = engine.project_directory().unwrap();
        fs::create_dir_all(project.join("sub")).unwrap();
        fs::write(project.join("a.txt"), b"a").unwrap();
        fs::write(project.join("sub/b.txt"), b"b").unwrap();

        let files = list_files(&engine).unwrap();
        assert_eq!(files.len(), 2);

        engine.execute_script("save()").unwrap();
        let files = list_files(&engine).unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(
            PathBuf::from(&files[0]),
            dir.path().join("proj_files.mechdb")
        );
        assert!(files[1].ends_with("a.txt"));
    }

    #[test]
    fn test_get_files() {
        let (_dir, engine) = engine();
        let project = engine.project_directory().unwrap();
        fs::create_dir_all(project.join("sub")).unwrap();
        fs::write(project.join("a.txt"), b"a").unwrap();
        fs::write(project.join("sub/b.txt"), b"b").unwrap();
        fs::write(project.join("c.bin"), b"c").unwrap();

        let exact = project.join("c.bin").display().to_string();
        assert_eq!(get_files(&engine, Value::String(exact.clone())).unwrap(), vec![exact]);

        let txt = get_files(&engine, Value::String("*.txt".into())).unwrap();
        assert_eq!(txt.len(), 2);

        let nested = get_files(&engine, Value::String("sub/*".into())).unwrap();
        assert_eq!(nested.len(), 1);
        assert!(nested[0].ends_with("b.txt"));

        let err = get_files(&engine, Value::String("*.stl".into())).unwrap_err();
        assert_eq!(RemoteError::from_anyhow(err).kind, "ValueError");

        let err = get_files(&engine, Value::String("missing.txt".into())).unwrap_err();
        assert!(err.to_string().contains("does not match"));

        let listed = get_files(&engine, serde_json::json!(["x", "y"])).unwrap();
        assert_eq!(listed, vec!["x", "y"]);
        assert!(get_files(&engine, serde_json::json!([1])).is_err());
        assert!(get_files(&engine, serde_json::json!(3)).is_err());
    }
}
