//! Integration tests for the complete Versions pipeline
//!
//! These tests verify end-to-end functionality across crates:
//! - recorded batches → WatchRunner → session log + blob store
//! - writer process → read-only reader (commit visibility)
//! - crash leftovers in the log (torn frames, open transactions)
//!
//! Run with: cargo test --test integration_tests

use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

use versions_store::query::{recent_snapshots, snapshot_detail};
use versions_store::wal::{WalRecord, WriteAheadLog};
use versions_store::{
    AccessMode, ContentHash, ContentStore, EntityId, EntityKind, EntityQuery, GraphStore,
    ScalarValue, StateLayout,
};
use versions_watch::{
    BatchOutcome, EventBatch, FsResolver, JsonLinesSource, SnapshotBuilder, WatchRunner,
};

fn batch(value: serde_json::Value) -> EventBatch {
    EventBatch::from_value(value).unwrap()
}

fn files_batch(names: &[&str]) -> EventBatch {
    let files: Vec<_> = names.iter().map(|n| json!({ "name": n })).collect();
    batch(json!({ "files": files }))
}

fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (name, text) in files {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, text).unwrap();
    }
}

// ============================================================================
// Recorded batches → session layout
// ============================================================================

#[test]
fn test_replay_into_session_then_query() {
    let dir = tempdir().unwrap();
    let tree = dir.path().join("tree");
    write_tree(&tree, &[("test.txt", "hello"), ("valid.txt", "valid"), ("src/lib.rs", "fn x() {}")]);

    let layout = StateLayout::new(dir.path().join("state"), dir.path().join("blobs"));
    let session = layout.start_session().unwrap();
    let session_id = session.id;

    let lines = [
        r#"{"files": [{"name": "test.txt"}]}"#,
        r#"{"version": "1.0"}"#,
        r#"{"files": ["not_a_dict", {"name": "valid.txt"}]}"#,
        "",
        r#"{"clock": "c:1:4", "files": [{"name": "src/lib.rs", "size": 9}, {"name": "gone.txt"}]}"#,
    ]
    .join("\n");

    let builder = SnapshotBuilder::new(session.graph, session.content, FsResolver::new(&tree));
    let mut runner = WatchRunner::new(JsonLinesSource::new(Cursor::new(lines)), builder);
    let summary = runner.run().unwrap();
    assert_eq!(summary.batches, 4);
    assert_eq!(summary.snapshots, 3);
    assert_eq!(summary.no_ops, 1);
    assert_eq!(summary.files, 3);
    assert_eq!(summary.storage_failures, 0);
    drop(runner);

    // A separate reader finds the session through the layout.
    let sessions = layout.list_sessions().unwrap();
    assert_eq!(sessions.len(), 1);
    let info = layout.resolve_session("latest").unwrap();
    assert_eq!(info.id, session_id);
    let prefix = &session_id.to_string()[..8];
    assert_eq!(layout.resolve_session(prefix).unwrap().id, session_id);

    let reader = GraphStore::open_read_only(&info.wal_path).unwrap();
    assert_eq!(reader.session_id(), Some(session_id));
    assert_eq!(reader.stats().snapshots, 3);
    assert_eq!(reader.stats().files, 3);

    let newest = recent_snapshots(&reader, 1);
    assert_eq!(newest[0].attributes.get("clock"), Some(&json!("c:1:4")));
    assert_eq!(newest[0].file_count, Some(1));

    let hits = EntityQuery::of_kind(EntityKind::File)
        .filter("filename", "test.txt")
        .run(&reader)
        .unwrap();
    assert_eq!(hits.len(), 1);
    let hash = ContentHash::of(b"hello");
    assert_eq!(hits[0].attributes.get("sha256"), Some(&json!(hash.as_str())));

    let content = layout.content_store().unwrap();
    assert_eq!(content.get(&hash).unwrap().unwrap(), b"hello");
    assert_eq!(content.blob_count().unwrap(), 3);
}

#[test]
fn test_replay_continues_past_malformed_line() {
    let dir = tempdir().unwrap();
    let tree = dir.path().join("tree");
    write_tree(&tree, &[("a.txt", "alpha")]);
    let layout = StateLayout::new(dir.path().join("state"), dir.path().join("blobs"));
    let session = layout.start_session().unwrap();

    let lines = "{\"files\":[{\"name\":\"a.txt\"}]}\n{oops\n{\"files\":[{\"name\":\"a.txt\"}]}";
    let builder = SnapshotBuilder::new(session.graph, session.content, FsResolver::new(&tree));
    let mut runner = WatchRunner::new(JsonLinesSource::new(Cursor::new(lines)), builder);
    let summary = runner.run().unwrap();
    assert_eq!(summary.snapshots, 2);
    assert_eq!(summary.malformed, 1);
    drop(runner);

    let reader = GraphStore::open_read_only(&layout.wal_path(&session.id)).unwrap();
    assert_eq!(reader.stats().snapshots, 2);
    assert_eq!(layout.content_store().unwrap().blob_count().unwrap(), 1);
}

// ============================================================================
// Writer / reader visibility
// ============================================================================

#[test]
fn test_reader_never_sees_partial_batch() {
    const BATCHES: usize = 40;
    const FILES_PER_BATCH: usize = 3;

    let dir = tempdir().unwrap();
    let tree = dir.path().join("tree");
    write_tree(&tree, &[("a.txt", "a"), ("b.txt", "b"), ("c.txt", "c")]);
    let wal = dir.path().join("s.wal");
    let blobs = dir.path().join("blobs");

    let graph = GraphStore::open(&wal, AccessMode::Shared).unwrap();
    let content = ContentStore::open(&blobs).unwrap();
    let mut builder = SnapshotBuilder::new(graph, content, FsResolver::new(&tree));
    let mut reader = GraphStore::open_read_only(&wal).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let writer = {
        let done = done.clone();
        thread::spawn(move || {
            for _ in 0..BATCHES {
                builder
                    .process(&files_batch(&["a.txt", "b.txt", "c.txt"]))
                    .unwrap();
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let mut polls = 0usize;
    loop {
        let finished = done.load(Ordering::SeqCst);
        reader.refresh().unwrap();
        polls += 1;
        for snap in reader.entities_of_kind(EntityKind::Snapshot) {
            assert_eq!(reader.members(&snap.id).len(), FILES_PER_BATCH);
        }
        assert_eq!(
            reader.entity_count(),
            reader.stats().snapshots * (FILES_PER_BATCH + 1)
        );
        if finished {
            break;
        }
    }
    writer.join().unwrap();

    reader.refresh().unwrap();
    assert!(polls > 0);
    assert_eq!(reader.stats().snapshots, BATCHES);
    assert_eq!(reader.committed_transactions(), BATCHES as u64);
}

// ============================================================================
// Crash leftovers
// ============================================================================

#[test]
fn test_torn_tail_ignored_then_truncated_by_writer() {
    let dir = tempdir().unwrap();
    let tree = dir.path().join("tree");
    write_tree(&tree, &[("a.txt", "alpha")]);
    let wal = dir.path().join("s.wal");
    let blobs = dir.path().join("blobs");

    {
        let graph = GraphStore::open(&wal, AccessMode::Shared).unwrap();
        let content = ContentStore::open(&blobs).unwrap();
        let mut builder = SnapshotBuilder::new(graph, content, FsResolver::new(&tree));
        builder.process(&files_batch(&["a.txt"])).unwrap();
    }
    let committed_len = fs::metadata(&wal).unwrap().len();

    // A frame header promising more bytes than were written.
    let mut f = OpenOptions::new().append(true).open(&wal).unwrap();
    f.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
    drop(f);

    let reader = GraphStore::open_read_only(&wal).unwrap();
    assert_eq!(reader.stats().snapshots, 1);
    assert_eq!(fs::metadata(&wal).unwrap().len(), committed_len + 7);

    let graph = GraphStore::open(&wal, AccessMode::Shared).unwrap();
    assert_eq!(fs::metadata(&wal).unwrap().len(), committed_len);
    let content = ContentStore::open(&blobs).unwrap();
    let mut builder = SnapshotBuilder::new(graph, content, FsResolver::new(&tree));
    builder.process(&files_batch(&["a.txt"])).unwrap();
    assert_eq!(builder.graph().stats().snapshots, 2);

    let reader = GraphStore::open_read_only(&wal).unwrap();
    assert_eq!(reader.stats().snapshots, 2);
}

#[test]
fn test_uncommitted_transaction_never_visible() {
    let dir = tempdir().unwrap();
    let tree = dir.path().join("tree");
    write_tree(&tree, &[("a.txt", "alpha")]);
    let wal = dir.path().join("s.wal");
    let blobs = dir.path().join("blobs");

    let graph = GraphStore::open(&wal, AccessMode::Shared).unwrap();
    let content = ContentStore::open(&blobs).unwrap();
    let mut builder = SnapshotBuilder::new(graph, content, FsResolver::new(&tree));
    builder.process(&files_batch(&["a.txt"])).unwrap();
    drop(builder);

    // A writer that died between BeginTx and CommitTx.
    let raw = WriteAheadLog::open(&wal).unwrap();
    let orphan = EntityId::generate();
    raw.append_all(&[
        WalRecord::BeginTx {
            tx_id: 99,
            timestamp: 0,
        },
        WalRecord::CreateEntity {
            tx_id: 99,
            id: orphan,
            kind: EntityKind::Snapshot,
        },
        WalRecord::SetAttribute {
            tx_id: 99,
            id: orphan,
            name: "clock".to_string(),
            value: ScalarValue::from("c:dead"),
        },
    ])
    .unwrap();
    drop(raw);

    let mut reader = GraphStore::open_read_only(&wal).unwrap();
    assert!(reader.get(&orphan).is_none());
    assert_eq!(reader.stats().snapshots, 1);

    // Reopening as writer discards the open transaction; new work lands after it.
    let graph = GraphStore::open(&wal, AccessMode::Shared).unwrap();
    let content = ContentStore::open(&blobs).unwrap();
    let mut builder = SnapshotBuilder::new(graph, content, FsResolver::new(&tree));
    let outcome = builder
        .process(&batch(json!({ "clock": "c:alive", "files": [{"name": "a.txt"}] })))
        .unwrap();
    let BatchOutcome::Committed(report) = outcome else {
        panic!("expected a committed snapshot");
    };

    reader.refresh().unwrap();
    assert!(reader.get(&orphan).is_none());
    assert_eq!(reader.stats().snapshots, 2);
    let detail = snapshot_detail(&reader, &report.snapshot_id).unwrap();
    assert_eq!(detail.snapshot.attributes.get("clock"), Some(&json!("c:alive")));
    assert_eq!(detail.files.len(), 1);
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn test_session_survives_restart() {
    let dir = tempdir().unwrap();
    let tree = dir.path().join("tree");
    write_tree(&tree, &[("a.txt", "alpha"), ("b.txt", "beta")]);
    let layout = StateLayout::new(dir.path().join("state"), dir.path().join("blobs"));

    let session = layout.start_session().unwrap();
    let wal = layout.wal_path(&session.id);
    let first = {
        let mut builder =
            SnapshotBuilder::new(session.graph, session.content, FsResolver::new(&tree));
        let outcome = builder
            .process(&batch(json!({ "files": [{"name": "a.txt", "size": 5}] })))
            .unwrap();
        match outcome {
            BatchOutcome::Committed(report) => report.snapshot_id,
            BatchOutcome::NoOp => panic!("expected a snapshot"),
        }
    };

    let graph = GraphStore::open(&wal, AccessMode::Shared).unwrap();
    assert_eq!(graph.session_id(), Some(session.id));
    assert_eq!(graph.stats().snapshots, 1);
    assert!(graph.schema().len() >= 3);
    assert!(graph.get(&first).is_some());

    // Schema survives: a conflicting type for a replayed attribute is refused.
    let content = layout.content_store().unwrap();
    let mut builder = SnapshotBuilder::new(graph, content, FsResolver::new(&tree));
    let outcome = builder
        .process(&batch(json!({ "files": [{"name": "b.txt", "size": "big"}] })))
        .unwrap();
    let BatchOutcome::Committed(report) = outcome else {
        panic!("expected a committed snapshot");
    };
    assert_eq!(report.files.len(), 1);
    assert_eq!(report.warnings.len(), 1);
    let file = builder.graph().get(&report.files[0]).unwrap();
    assert!(file.attribute("size").is_none());
    assert_eq!(file.attribute("filename"), Some(&ScalarValue::from("b.txt")));
    assert_eq!(builder.graph().stats().snapshots, 2);
}
