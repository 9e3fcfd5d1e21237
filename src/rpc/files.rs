//! Server half of the file transport, plus the payload types both halves
//! share.
//!
//! A single-file download carries the bytes (base64 in the JSON frame) and a
//! BLAKE3 digest. A directory download carries only the relative paths of
//! the regular files below it; the client fetches each one in turn.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FileError {
    #[error("remote path must not be empty")]
    EmptyPath,

    #[error("no such file or directory: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to {op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

impl FileError {
    fn io(op: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| FileError::Io { op, path, source }
    }

    /// Error kind reported to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            FileError::EmptyPath => "ValueError",
            FileError::NotFound(_) => "FileNotFoundError",
            FileError::Io { .. } => "IoError",
            FileError::DigestMismatch { .. } => "IntegrityError",
        }
    }
}

/// Raw bytes, base64-encoded on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload(pub Vec<u8>);

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Payload)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryListing {
    pub is_directory: bool,
    /// Paths relative to the requested directory, `/`-separated, sorted.
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePayload {
    pub data: Payload,
    pub size: u64,
    pub blake3: String,
}

impl FilePayload {
    pub fn new(bytes: Vec<u8>) -> Self {
        let digest = blake3::hash(&bytes).to_hex().to_string();
        Self {
            size: bytes.len() as u64,
            data: Payload(bytes),
            blake3: digest,
        }
    }

    /// Check the digest and hand back the bytes.
    pub fn verify(self, path: &str) -> Result<Vec<u8>, FileError> {
        let actual = blake3::hash(&self.data.0).to_hex().to_string();
        if actual != self.blake3 || self.data.0.len() as u64 != self.size {
            return Err(FileError::DigestMismatch {
                path: path.to_string(),
                expected: self.blake3,
                actual,
            });
        }
        Ok(self.data.0)
    }
}

/// Reply of `service_download`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DownloadReply {
    Directory(DirectoryListing),
    File(FilePayload),
}

/// Write `data` to `path`, creating parent directories. The file appears
/// atomically: readers see either the old contents or the new ones.
pub fn upload(path: &Path, data: &[u8]) -> Result<u64, FileError> {
    if path.as_os_str().is_empty() {
        return Err(FileError::EmptyPath);
    }

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(FileError::io("create directory", &parent))?;

    let mut tmp =
        NamedTempFile::new_in(&parent).map_err(FileError::io("create temp file in", &parent))?;
    tmp.write_all(data).map_err(FileError::io("write", path))?;
    tmp.as_file().sync_all().map_err(FileError::io("sync", path))?;
    tmp.persist(path)
        .map_err(|e| FileError::io("replace", path)(e.error))?;

    debug!(path = %path.display(), bytes = data.len(), "Upload written");
    Ok(data.len() as u64)
}

/// Read a single file, or list a directory tree.
pub fn download(path: &Path) -> Result<DownloadReply, FileError> {
    if path.as_os_str().is_empty() {
        return Err(FileError::EmptyPath);
    }

    let metadata = match path.metadata() {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(FileError::NotFound(path.to_path_buf()));
        }
        Err(e) => return Err(FileError::io("stat", path)(e)),
    };

    if metadata.is_dir() {
        let files = list_tree(path)?;
        debug!(path = %path.display(), files = files.len(), "Directory listed for download");
        return Ok(DownloadReply::Directory(DirectoryListing {
            is_directory: true,
            files,
        }));
    }

    let bytes = fs::read(path).map_err(FileError::io("read", path))?;
    debug!(path = %path.display(), bytes = bytes.len(), "File read for download");
    Ok(DownloadReply::File(FilePayload::new(bytes)))
}

/// Relative paths of every regular file under `root`, sorted.
pub fn list_tree(root: &Path) -> Result<Vec<String>, FileError> {
    let mut files = Vec::new();
    list_tree_recursive(root, root, &mut files)?;
    files.sort();
    Ok(files)
}

fn list_tree_recursive(
    base: &Path,
    current: &Path,
    files: &mut Vec<String>,
) -> Result<(), FileError> {
    let entries = fs::read_dir(current).map_err(FileError::io("read directory", current))?;

    for entry in entries {
        let entry = entry.map_err(FileError::io("read directory entry in", current))?;
        let path = entry.path();

        // Use symlink_metadata to avoid following symlinks
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            list_tree_recursive(base, &path, files)?;
        } else if metadata.is_file() {
            if let Ok(relative) = path.strip_prefix(base) {
                files.push(to_wire_path(relative));
            }
        }
        // Skip symlinks and other special files
    }

    Ok(())
}

/// `/`-joined form of a relative path.
pub fn to_wire_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Absolute paths of every regular file under `root`, sorted.
pub fn walk_files(root: &Path) -> Result<Vec<PathBuf>, FileError> {
    Ok(list_tree(root)?
        .into_iter()
        .map(|relative| root.join(relative))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_upload_creates_parents_and_overwrites() {
        let temp = tempdir().unwrap();
        let target = temp.path().join("deep/er/hello.x_t");

        assert_eq!(upload(&target, b"first").unwrap(), 5);
        assert_eq!(fs::read(&target).unwrap(), b"first");

        upload(&target, b"second!").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second!");

        // No temp files left behind.
        assert_eq!(fs::read_dir(target.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_empty_path_is_rejected() {
        assert!(matches!(upload(Path::new(""), b"x"), Err(FileError::EmptyPath)));
        assert!(matches!(download(Path::new("")), Err(FileError::EmptyPath)));
    }

    #[test]
    fn test_download_missing_names_path() {
        let temp = tempdir().unwrap();
        let missing = temp.path().join("nope.txt");
        let err = download(&missing).unwrap_err();
        assert_eq!(err.kind(), "FileNotFoundError");
        assert!(err.to_string().contains("nope.txt"));
    }

    #[test]
    fn test_download_file_and_directory() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("a.txt"), b"a").unwrap();
        fs::create_dir_all(temp.path().join("sub/c")).unwrap();
        fs::write(temp.path().join("sub/b.txt"), b"bb").unwrap();
        fs::write(temp.path().join("sub/c/d.bin"), [0u8, 1, 2, 255]).unwrap();

        let DownloadReply::Directory(listing) = download(temp.path()).unwrap() else {
            panic!("expected a directory listing");
        };
        assert!(listing.is_directory);
        assert_eq!(listing.files, vec!["a.txt", "sub/b.txt", "sub/c/d.bin"]);

        let reply = download(&temp.path().join("sub/c/d.bin")).unwrap();
        let DownloadReply::File(payload) = reply else {
            panic!("expected file bytes");
        };
        assert_eq!(payload.size, 4);
        assert_eq!(payload.verify("d.bin").unwrap(), vec![0u8, 1, 2, 255]);
    }

    #[test]
    fn test_reply_wire_shapes() {
        let file = DownloadReply::File(FilePayload::new(b"hi".to_vec()));
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["data"], "aGk=");
        assert_eq!(json["size"], 2);
        let back: DownloadReply = serde_json::from_value(json).unwrap();
        assert_eq!(back, file);

        let dir: DownloadReply =
            serde_json::from_str(r#"{"is_directory":true,"files":["x/y.txt"]}"#).unwrap();
        assert!(matches!(dir, DownloadReply::Directory(_)));
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let mut payload = FilePayload::new(b"original".to_vec());
        payload.data = Payload(b"tampered".to_vec());
        let err = payload.verify("f.bin").unwrap_err();
        assert!(matches!(err, FileError::DigestMismatch { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_list_tree_skips_symlinks() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("real.txt"), b"r").unwrap();
        std::os::unix::fs::symlink(temp.path().join("real.txt"), temp.path().join("link.txt"))
            .unwrap();
        assert_eq!(list_tree(temp.path()).unwrap(), vec!["real.txt"]);
    }
}
