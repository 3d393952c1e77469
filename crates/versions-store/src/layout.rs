//! On-disk state layout: one WAL per watch session plus a shared blob dir.
//!
//! ```text
//! <state_dir>/<session-uuid>.wal     (default ~/.watcher)
//! <snapshot_dir>/<sha256>            (default ~/.snapshots)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::content::ContentStore;
use crate::error::{Result, StoreError};
use crate::graph::{AccessMode, GraphStore};

pub const DEFAULT_STATE_DIR: &str = ".watcher";
pub const DEFAULT_SNAPSHOT_DIR: &str = ".snapshots";
pub const WAL_EXTENSION: &str = "wal";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateLayout {
    pub state_dir: PathBuf,
    pub snapshot_dir: PathBuf,
}

/// An open writer session.
pub struct Session {
    pub id: Uuid,
    pub graph: GraphStore,
    pub content: ContentStore,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub wal_path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

impl StateLayout {
    pub fn new(state_dir: impl Into<PathBuf>, snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            snapshot_dir: snapshot_dir.into(),
        }
    }

    /// `~/.watcher` and `~/.snapshots` for the current user.
    pub fn per_user() -> Result<Self> {
        let dirs = directories::BaseDirs::new().ok_or(StoreError::NoHomeDir)?;
        let home = dirs.home_dir();
        Ok(Self::new(
            home.join(DEFAULT_STATE_DIR),
            home.join(DEFAULT_SNAPSHOT_DIR),
        ))
    }

    /// Fill in whichever directory the caller did not override.
    pub fn with_overrides(state_dir: Option<PathBuf>, snapshot_dir: Option<PathBuf>) -> Result<Self> {
        match (state_dir, snapshot_dir) {
            (Some(state), Some(snapshots)) => Ok(Self::new(state, snapshots)),
            (state, snapshots) => {
                let defaults = Self::per_user()?;
                Ok(Self::new(
                    state.unwrap_or(defaults.state_dir),
                    snapshots.unwrap_or(defaults.snapshot_dir),
                ))
            }
        }
    }

    pub fn wal_path(&self, session: &Uuid) -> PathBuf {
        self.state_dir
            .join(format!("{}.{WAL_EXTENSION}", session.hyphenated()))
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.state_dir, &self.snapshot_dir] {
            fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }
        Ok(())
    }

    pub fn content_store(&self) -> Result<ContentStore> {
        ContentStore::open(&self.snapshot_dir)
    }

    /// Create a fresh session log and open it for writing.
    pub fn start_session(&self) -> Result<Session> {
        self.ensure()?;
        let id = Uuid::new_v4();
        let path = self.wal_path(&id);
        let graph = GraphStore::open(&path, AccessMode::Shared)?;
        let content = self.content_store()?;
        info!(session = %id, wal = %path.display(), blobs = %self.snapshot_dir.display(), "started session");
        Ok(Session { id, graph, content })
    }

    /// Session logs, newest first. A missing state dir means no sessions.
    pub fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let entries = match fs::read_dir(&self.state_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.state_dir, e)),
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.state_dir, e))?;
            let path = entry.path();
            let Some(id) = session_id_of(&path) else {
                continue;
            };
            let meta = entry.metadata().map_err(|e| StoreError::io(&path, e))?;
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_default();
            sessions.push(SessionInfo {
                id,
                wal_path: path,
                size_bytes: meta.len(),
                modified,
            });
        }
        sessions.sort_by(|a, b| b.modified.cmp(&a.modified).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }

    /// Resolve `latest`, a full session id, or an unambiguous id prefix.
    pub fn resolve_session(&self, selector: &str) -> Result<SessionInfo> {
        let selector = selector.trim();
        let sessions = self.list_sessions()?;

        if selector.eq_ignore_ascii_case("latest") {
            return sessions
                .into_iter()
                .next()
                .ok_or_else(|| StoreError::SessionNotFound(selector.to_string()));
        }

        let mut matches = sessions
            .into_iter()
            .filter(|s| s.id.hyphenated().to_string().starts_with(selector));
        match (matches.next(), matches.next()) {
            (Some(found), None) => Ok(found),
            (Some(_), Some(_)) => Err(StoreError::AmbiguousSession(selector.to_string())),
            (None, _) => Err(StoreError::SessionNotFound(selector.to_string())),
        }
    }
}

fn session_id_of(path: &Path) -> Option<Uuid> {
    if path.extension().and_then(|e| e.to_str()) != Some(WAL_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    Uuid::parse_str(stem).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn layout(dir: &Path) -> StateLayout {
        StateLayout::new(dir.join("state"), dir.join("blobs"))
    }

    #[test]
    fn test_start_session_creates_layout() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        let session = layout.start_session().unwrap();

        assert!(layout.wal_path(&session.id).is_file());
        assert!(layout.snapshot_dir.is_dir());
        assert_eq!(session.graph.session_id(), Some(session.id));
        assert_eq!(session.content.root(), layout.snapshot_dir.as_path());
    }

    #[test]
    fn test_list_sessions_ignores_other_files() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        assert!(layout.list_sessions().unwrap().is_empty());

        let a = layout.start_session().unwrap().id;
        let b = layout.start_session().unwrap().id;
        fs::write(layout.state_dir.join("notes.txt"), b"x").unwrap();
        fs::write(layout.state_dir.join("bogus.wal"), b"x").unwrap();

        let listed: Vec<Uuid> = layout.list_sessions().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&a));
        assert!(listed.contains(&b));
    }

    #[test]
    fn test_resolve_session() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        assert!(matches!(
            layout.resolve_session("latest"),
            Err(StoreError::SessionNotFound(_))
        ));

        let id = layout.start_session().unwrap().id;
        assert_eq!(layout.resolve_session("latest").unwrap().id, id);
        let full = id.to_string();
        assert_eq!(layout.resolve_session(&full).unwrap().id, id);
        assert_eq!(layout.resolve_session(&full[..8]).unwrap().id, id);
        assert!(matches!(
            layout.resolve_session("zzzz"),
            Err(StoreError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_ambiguous_prefix() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        layout.start_session().unwrap();
        layout.start_session().unwrap();
        assert!(matches!(
            layout.resolve_session(""),
            Err(StoreError::AmbiguousSession(_))
        ));
    }

    #[test]
    fn test_explicit_overrides_skip_home_lookup() {
        let layout =
            StateLayout::with_overrides(Some("/s".into()), Some("/b".into())).unwrap();
        assert_eq!(layout, StateLayout::new("/s", "/b"));
    }
}
