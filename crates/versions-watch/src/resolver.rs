//! Reads the bytes of a changed file, given its name relative to the root.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("`{0}` does not exist")]
    NotFound(PathBuf),

    #[error("`{0}` is a directory")]
    IsDirectory(PathBuf),

    #[error("`{0}` is not UTF-8 text")]
    NotDecodable(PathBuf),

    #[error("`{0}` is not inside the watched root")]
    OutsideRoot(String),

    #[error("failed to read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Source of file content for the snapshot builder.
pub trait ContentResolver {
    /// Exact bytes of `name`. Only UTF-8 text is accepted.
    fn resolve(&self, name: &str) -> Result<Vec<u8>, ResolveError>;
}

impl<F> ContentResolver for F
where
    F: Fn(&str) -> Result<Vec<u8>, ResolveError>,
{
    fn resolve(&self, name: &str) -> Result<Vec<u8>, ResolveError> {
        self(name)
    }
}

/// Resolves names against a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsResolver {
    root: PathBuf,
}

impl FsResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn locate(&self, name: &str) -> Result<PathBuf, ResolveError> {
        let relative = Path::new(name);
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !contained {
            return Err(ResolveError::OutsideRoot(name.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl ContentResolver for FsResolver {
    fn resolve(&self, name: &str) -> Result<Vec<u8>, ResolveError> {
        let path = self.locate(name)?;

        let io_error = |path: &Path, e: std::io::Error| match e.kind() {
            ErrorKind::NotFound => ResolveError::NotFound(path.to_path_buf()),
            _ => ResolveError::Io {
                path: path.to_path_buf(),
                source: e,
            },
        };

        // Symlinks may point anywhere; only targets under the root count.
        let real = path.canonicalize().map_err(|e| io_error(path.as_path(), e))?;
        let root = self
            .root
            .canonicalize()
            .map_err(|e| io_error(self.root.as_path(), e))?;
        if !real.starts_with(&root) {
            return Err(ResolveError::OutsideRoot(name.to_string()));
        }

        let meta = fs::metadata(&real).map_err(|e| io_error(path.as_path(), e))?;
        if meta.is_dir() {
            return Err(ResolveError::IsDirectory(path));
        }

        // NotFound here means it was removed between the stat and the read.
        let bytes = fs::read(&real).map_err(|e| io_error(path.as_path(), e))?;

        if std::str::from_utf8(&bytes).is_err() {
            return Err(ResolveError::NotDecodable(path));
        }
        Ok(bytes)
    }
}
