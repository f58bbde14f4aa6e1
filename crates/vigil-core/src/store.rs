//! Durable identity store: one directory of reference images per identity.
//!
//! ```text
//! known_faces/
//!   alice/            enrolled by an operator
//!     01.jpg
//!   Unknown_3/        registered at runtime
//!     20250101_120000.jpg
//! ```

use crate::frame::Frame;
use chrono::Local;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name prefix reserved for identities registered at runtime.
pub const UNKNOWN_PREFIX: &str = "Unknown_";

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("image encode failed for {path}: {message}")]
    Encode { path: PathBuf, message: String },
    #[error("invalid identity name: {0:?}")]
    InvalidName(String),
    #[error("face crop is empty")]
    EmptyCrop,
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One identity directory found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredIdentity {
    pub name: String,
    /// Reference images, sorted by file name.
    pub images: Vec<PathBuf>,
}

impl StoredIdentity {
    pub fn is_generated(&self) -> bool {
        generated_sequence(&self.name).is_some()
    }
}

/// Sequence number of a generated name (`Unknown_12` → 12).
pub fn generated_sequence(name: &str) -> Option<u32> {
    name.strip_prefix(UNKNOWN_PREFIX)?.parse().ok()
}

/// Identity names double as directory names.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);
    if bad {
        Err(StoreError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct IdentityStore {
    root: PathBuf,
}

impl IdentityStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List identity directories, sorted by name. A missing root is an empty store.
    pub fn scan(&self) -> Result<Vec<StoredIdentity>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(root = %self.root.display(), "identity store not found");
                return Ok(Vec::new());
            }
            Err(e) => return Err(io_err(&self.root)(e)),
        };

        let mut identities = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.root))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                tracing::warn!(path = %path.display(), "skipping non-UTF-8 identity directory");
                continue;
            };
            identities.push(StoredIdentity {
                name: name.to_string(),
                images: list_images(&path)?,
            });
        }
        identities.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(identities)
    }

    /// Highest generated sequence number on disk, 0 when there is none.
    pub fn max_generated_sequence(&self) -> Result<u32, StoreError> {
        Ok(self
            .scan()?
            .iter()
            .filter_map(|i| generated_sequence(&i.name))
            .max()
            .unwrap_or(0))
    }

    /// Write a face crop under `name` as a timestamped JPEG.
    ///
    /// If the directory had to be created and the write fails, the directory
    /// is removed again so no half-registered identity is left behind.
    pub fn save_face(&self, name: &str, face: &Frame) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        let image = face
            .to_gray_image()
            .filter(|_| !face.is_empty())
            .ok_or(StoreError::EmptyCrop)?;

        let dir = self.root.join(name);
        let created = !dir.exists();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let path = dir.join(format!("{}.jpg", Local::now().format("%Y%m%d_%H%M%S")));
        if let Err(e) = image.save(&path) {
            if created {
                let _ = fs::remove_dir_all(&dir);
            }
            return Err(StoreError::Encode {
                path,
                message: e.to_string(),
            });
        }
        Ok(path)
    }

    /// Copy reference images into the directory for `name`, keeping file names.
    pub fn add_images(&self, name: &str, images: &[PathBuf]) -> Result<Vec<PathBuf>, StoreError> {
        validate_name(name)?;
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let mut written = Vec::with_capacity(images.len());
        for src in images {
            let file_name = src
                .file_name()
                .ok_or_else(|| StoreError::InvalidName(src.display().to_string()))?;
            let dst = dir.join(file_name);
            fs::copy(src, &dst).map_err(io_err(src))?;
            written.push(dst);
        }
        Ok(written)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut images: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(io_err(dir))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_image(p))
        .collect();
    images.sort();
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_generated_sequence() {
        assert_eq!(generated_sequence("Unknown_12"), Some(12));
        assert_eq!(generated_sequence("Unknown_x"), None);
        assert_eq!(generated_sequence("alice"), None);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("alice").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
    }

    #[test]
    fn test_scan_missing_root_is_empty() {
        let store = IdentityStore::new("/nonexistent/vigil/store");
        assert!(store.scan().unwrap().is_empty());
        assert_eq!(store.max_generated_sequence().unwrap(), 0);
    }

    #[test]
    fn test_scan_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("bob/b.png"));
        touch(&dir.path().join("bob/a.JPG"));
        touch(&dir.path().join("bob/notes.txt"));
        touch(&dir.path().join("alice/1.jpeg"));
        touch(&dir.path().join("stray.jpg"));

        let ids = IdentityStore::new(dir.path()).scan().unwrap();
        let names: Vec<_> = ids.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        let bob: Vec<_> = ids[1].images.iter().map(|p| p.file_name().unwrap().to_owned()).collect();
        assert_eq!(bob, vec!["a.JPG", "b.png"]);
    }

    #[test]
    fn test_max_generated_sequence() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["Unknown_2", "Unknown_10", "Unknown_bad", "carol"] {
            fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        assert_eq!(IdentityStore::new(dir.path()).max_generated_sequence().unwrap(), 10);
    }

    #[test]
    fn test_save_face_writes_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        let face = Frame::new(vec![128u8; 16 * 16], 16, 16, 0).unwrap();
        let path = store.save_face("Unknown_1", &face).unwrap();
        assert!(path.starts_with(dir.path().join("Unknown_1")));
        assert!(Frame::from_path(&path).is_ok());
    }

    #[test]
    fn test_save_empty_face_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        let face = Frame::new(Vec::new(), 0, 0, 0).unwrap();
        assert!(matches!(store.save_face("Unknown_1", &face), Err(StoreError::EmptyCrop)));
        assert!(!dir.path().join("Unknown_1").exists());
    }
}
