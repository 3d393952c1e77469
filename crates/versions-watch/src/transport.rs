//! Watch transports: where change batches come from.
//!
//! [`NotifyTransport`] watches a directory tree with `notify` and emits
//! watchman-shaped batches. [`JsonLinesSource`] replays recorded batches, one
//! JSON object per line.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::BufRead;
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, trace, warn};
use versions_store::ContentHash;
use walkdir::WalkDir;

use crate::batch::{EventBatch, FILES_KEY};

/// Entry field carrying the transport's own digest of a regular file.
pub const CONTENT_DIGEST_KEY: &str = "content.sha256hex";

/// Directory names never reported, at any depth.
pub const IGNORED_DIRS: &[&str] = &[".git", ".hg", ".svn"];

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to create watcher: {0}")]
    Watcher(#[from] notify::Error),

    #[error("failed to watch {path}: {source}")]
    WatchPath {
        path: PathBuf,
        source: notify::Error,
    },

    #[error("watch root {path} is unusable: {source}")]
    Root {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed batch on line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("failed to read batch stream: {0}")]
    Read(#[from] std::io::Error),

    #[error("watch transport disconnected")]
    Disconnected,

    /// A finite source has delivered everything it had.
    #[error("end of batch stream")]
    EndOfStream,
}

/// A source of change batches, polled one batch at a time.
pub trait BatchSource {
    /// Wait up to `timeout` for the next batch. `Ok(None)` means nothing
    /// arrived in time.
    fn next_batch(&mut self, timeout: Duration) -> Result<Option<EventBatch>, TransportError>;
}

// ============================================================================
// notify-backed transport
// ============================================================================

pub struct NotifyTransport {
    root: PathBuf,
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
    debounce: Duration,
    pid: u32,
    ticks: u64,
    started: bool,
    seen: HashSet<PathBuf>,
}

impl NotifyTransport {
    pub fn new(root: &Path, debounce: Duration) -> Result<Self, TransportError> {
        let root = root.canonicalize().map_err(|e| TransportError::Root {
            path: root.to_path_buf(),
            source: e,
        })?;

        let (tx, rx) = channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            Config::default(),
        )?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| TransportError::WatchPath {
                path: root.clone(),
                source: e,
            })?;
        debug!(root = %root.display(), debounce_ms = debounce.as_millis() as u64, "watching");

        Ok(Self {
            root,
            _watcher: watcher,
            events: rx,
            debounce,
            pid: std::process::id(),
            ticks: 0,
            started: false,
            seen: HashSet::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn next_clock(&mut self) -> String {
        self.ticks += 1;
        format!("c:{}:{}", self.pid, self.ticks)
    }

    /// Every file under the root, as a new subscription reports it.
    fn fresh_instance(&mut self) -> EventBatch {
        let mut paths = BTreeSet::new();
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !is_ignored_name(e.file_name().to_string_lossy().as_ref()));
        for entry in walker {
            match entry {
                Ok(entry) if !entry.file_type().is_dir() => {
                    paths.insert(entry.into_path());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "skipping unreadable path during initial scan"),
            }
        }
        debug!(files = paths.len(), "initial scan complete");
        self.batch_for(paths, true)
    }

    fn absorb(&self, event: notify::Result<Event>, changed: &mut BTreeSet<PathBuf>) {
        match event {
            Ok(event) => {
                trace!(kind = ?event.kind, paths = event.paths.len(), "raw event");
                for path in event.paths {
                    if path != self.root && !self.is_ignored(&path) {
                        changed.insert(path);
                    }
                }
            }
            Err(e) => warn!(error = %e, "watch error"),
        }
    }

    fn is_ignored(&self, path: &Path) -> bool {
        match path.strip_prefix(&self.root) {
            Ok(rel) => rel.components().any(|c| match c {
                Component::Normal(name) => is_ignored_name(name.to_string_lossy().as_ref()),
                _ => false,
            }),
            Err(_) => true,
        }
    }

    fn batch_for(&mut self, paths: BTreeSet<PathBuf>, fresh: bool) -> EventBatch {
        let files: Vec<Value> = paths
            .into_iter()
            .filter_map(|path| {
                let name = relative_name(&self.root, &path)?;
                let entry = file_entry(&path, name, !self.seen.contains(&path));
                if entry.get("exists") == Some(&Value::Bool(true)) {
                    self.seen.insert(path);
                } else {
                    self.seen.remove(&path);
                }
                Some(entry)
            })
            .collect();

        let mut batch = EventBatch::new();
        batch
            .insert("clock", self.next_clock())
            .insert("root", self.root.to_string_lossy().into_owned())
            .insert("is_fresh_instance", fresh)
            .insert(FILES_KEY, Value::Array(files));
        batch
    }
}

impl BatchSource for NotifyTransport {
    fn next_batch(&mut self, timeout: Duration) -> Result<Option<EventBatch>, TransportError> {
        if !self.started {
            self.started = true;
            return Ok(Some(self.fresh_instance()));
        }

        let first = match self.events.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Disconnected),
        };

        let mut changed = BTreeSet::new();
        self.absorb(first, &mut changed);

        // Coalesce whatever else arrives within the debounce window.
        let deadline = Instant::now() + self.debounce;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.events.recv_timeout(deadline - now) {
                Ok(event) => self.absorb(event, &mut changed),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Disconnected),
            }
        }

        if changed.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.batch_for(changed, false)))
    }
}

fn is_ignored_name(name: &str) -> bool {
    IGNORED_DIRS.contains(&name)
}

/// `/`-separated path of `path` under `root`.
fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// One watchman-style file entry. Metadata fields are present only when the
/// path still exists.
fn file_entry(path: &Path, name: String, is_new: bool) -> Value {
    let mut entry = Map::new();
    entry.insert("name".into(), json!(name));

    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => {
            entry.insert("exists".into(), json!(false));
            entry.insert("new".into(), json!(false));
            return Value::Object(entry);
        }
    };

    let file_type = meta.file_type();
    let kind = if file_type.is_dir() {
        "d"
    } else if file_type.is_symlink() {
        "l"
    } else {
        "f"
    };
    entry.insert("exists".into(), json!(true));
    entry.insert("new".into(), json!(is_new));
    entry.insert("type".into(), json!(kind));
    entry.insert("size".into(), json!(meta.len()));
    if file_type.is_file() {
        match fs::read(path) {
            Ok(bytes) => {
                entry.insert(
                    CONTENT_DIGEST_KEY.into(),
                    json!(ContentHash::of(&bytes).as_str()),
                );
            }
            Err(e) => trace!(path = %path.display(), error = %e, "no digest"),
        }
    }

    if let Ok(modified) = meta.modified() {
        if let Ok(since) = modified.duration_since(UNIX_EPOCH) {
            insert_times(&mut entry, "mtime", since);
        }
    }
    unix_fields(&mut entry, &meta);

    Value::Object(entry)
}

fn insert_times(entry: &mut Map<String, Value>, prefix: &str, since: Duration) {
    entry.insert(prefix.to_string(), json!(since.as_secs()));
    entry.insert(format!("{prefix}_ms"), json!(since.as_millis() as u64));
    entry.insert(format!("{prefix}_f"), json!(since.as_secs_f64()));
}

#[cfg(unix)]
fn unix_fields(entry: &mut Map<String, Value>, meta: &fs::Metadata) {
    use std::os::unix::fs::MetadataExt;

    entry.insert("mode".into(), json!(meta.mode()));
    entry.insert("ino".into(), json!(meta.ino()));
    entry.insert("nlink".into(), json!(meta.nlink()));
    if let Ok(secs) = u64::try_from(meta.ctime()) {
        let nanos = u32::try_from(meta.ctime_nsec()).unwrap_or(0);
        insert_times(entry, "ctime", Duration::new(secs, nanos));
    }
}

#[cfg(not(unix))]
fn unix_fields(_entry: &mut Map<String, Value>, _meta: &fs::Metadata) {}

// ============================================================================
// Recorded batches
// ============================================================================

/// Replays batches from JSON lines. Blank lines are skipped; the source ends
/// with [`TransportError::EndOfStream`].
pub struct JsonLinesSource<R> {
    reader: R,
    line: usize,
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, line: 0 }
    }
}

impl<R: BufRead> BatchSource for JsonLinesSource<R> {
    fn next_batch(&mut self, _timeout: Duration) -> Result<Option<EventBatch>, TransportError> {
        let mut buf = String::new();
        loop {
            buf.clear();
            if self.reader.read_line(&mut buf)? == 0 {
                return Err(TransportError::EndOfStream);
            }
            self.line += 1;
            let text = buf.trim();
            if text.is_empty() {
                continue;
            }

            let value: Value = serde_json::from_str(text).map_err(|e| TransportError::Malformed {
                line: self.line,
                message: e.to_string(),
            })?;
            return EventBatch::from_value(value)
                .map(Some)
                .ok_or(TransportError::Malformed {
                    line: self.line,
                    message: "batch must be a JSON object".to_string(),
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[test]
    fn test_json_lines_source() {
        let input = "{\"files\": []}\n\n{\"version\": \"1.0\"}\n";
        let mut source = JsonLinesSource::new(Cursor::new(input));
        let timeout = Duration::from_millis(1);

        assert!(source.next_batch(timeout).unwrap().unwrap().files().is_some());
        assert!(source.next_batch(timeout).unwrap().unwrap().files().is_none());
        assert!(matches!(
            source.next_batch(timeout),
            Err(TransportError::EndOfStream)
        ));
    }

    #[test]
    fn test_json_lines_rejects_non_objects() {
        let mut source = JsonLinesSource::new(Cursor::new("[1]\n"));
        assert!(matches!(
            source.next_batch(Duration::ZERO),
            Err(TransportError::Malformed { line: 1, .. })
        ));
        let mut source = JsonLinesSource::new(Cursor::new("{oops\n"));
        assert!(matches!(
            source.next_batch(Duration::ZERO),
            Err(TransportError::Malformed { line: 1, .. })
        ));
    }

    #[test]
    fn test_relative_name() {
        let root = Path::new("/w");
        assert_eq!(
            relative_name(root, Path::new("/w/src/lib.rs")),
            Some("src/lib.rs".to_string())
        );
        assert_eq!(relative_name(root, Path::new("/w")), None);
        assert_eq!(relative_name(root, Path::new("/elsewhere/x")), None);
    }

    #[test]
    fn test_file_entry_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "hello").unwrap();

        let entry = file_entry(&path, "a.txt".to_string(), true);
        assert_eq!(entry["name"], json!("a.txt"));
        assert_eq!(entry["exists"], json!(true));
        assert_eq!(entry["new"], json!(true));
        assert_eq!(entry["type"], json!("f"));
        assert_eq!(entry["size"], json!(5));
        assert!(entry["mtime"].is_u64());
        assert!(entry["mtime_f"].is_f64());
        assert_eq!(
            entry[CONTENT_DIGEST_KEY],
            json!(ContentHash::of(b"hello").as_str())
        );

        let gone = file_entry(&dir.path().join("gone"), "gone".to_string(), false);
        assert_eq!(gone["exists"], json!(false));
        assert!(gone.get("size").is_none());
        assert!(gone.get(CONTENT_DIGEST_KEY).is_none());
    }

    #[test]
    fn test_deleted_path_is_new_again_when_recreated() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "one").unwrap();
        let mut transport =
            NotifyTransport::new(dir.path(), Duration::from_millis(10)).unwrap();
        transport.next_batch(Duration::from_millis(10)).unwrap();
        let path = transport.root().join("a.txt");
        assert!(transport.seen.contains(&path));

        fs::remove_file(&path).unwrap();
        let gone = transport.batch_for(BTreeSet::from([path.clone()]), false);
        assert_eq!(gone.files().unwrap()[0]["exists"], json!(false));
        assert!(!transport.seen.contains(&path));

        fs::write(&path, "two").unwrap();
        let back = transport.batch_for(BTreeSet::from([path.clone()]), false);
        assert_eq!(back.files().unwrap()[0]["new"], json!(true));
        let again = transport.batch_for(BTreeSet::from([path]), false);
        assert_eq!(again.files().unwrap()[0]["new"], json!(false));
    }

    #[test]
    fn test_fresh_instance_lists_tree_without_vcs_dirs() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("README"), "hi").unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();

        let mut transport =
            NotifyTransport::new(dir.path(), Duration::from_millis(10)).unwrap();
        let batch = transport
            .next_batch(Duration::from_millis(10))
            .unwrap()
            .unwrap();

        assert_eq!(batch.get("is_fresh_instance"), Some(&json!(true)));
        assert!(batch.clock().unwrap().starts_with("c:"));
        let names: Vec<&str> = batch
            .files()
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["README", "src/main.rs"]);
    }

    #[test]
    fn test_change_produces_batch() {
        let dir = tempdir().unwrap();
        let mut transport =
            NotifyTransport::new(dir.path(), Duration::from_millis(50)).unwrap();
        transport.next_batch(Duration::from_millis(10)).unwrap();

        fs::write(dir.path().join("new.txt"), "content").unwrap();

        let mut found = None;
        for _ in 0..50 {
            if let Some(batch) = transport.next_batch(Duration::from_millis(100)).unwrap() {
                found = Some(batch);
                break;
            }
        }
        let batch = found.expect("no batch after writing a file");
        assert_eq!(batch.get("is_fresh_instance"), Some(&json!(false)));
        let names: Vec<&str> = batch
            .files()
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"new.txt"));
    }
}
