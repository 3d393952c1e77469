//! Read-only HTTP query service over a session log and the blob store.
//!
//! The server holds a reader view of the graph and refreshes it before every
//! request, so it follows a live `watch` process without ever observing a
//! half-written batch.
//!
//! Endpoints:
//! - `GET  /healthz`
//! - `GET  /status`
//! - `GET  /schema`
//! - `GET  /snapshots?limit=N`
//! - `GET  /snapshots/{id}`
//! - `GET  /blobs/{sha256}`
//! - `POST /query` (JSON [`EntityQuery`])

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use versions_store::query::{recent_snapshots, snapshot_detail};
use versions_store::{
    AttributeDecl, ContentHash, ContentStore, EntityId, EntityKind, EntityQuery, EntityView,
    GraphStore, SnapshotDetail, StoreStats, FILES_RELATION,
};

use crate::config::ServeConfig;

const DEFAULT_SNAPSHOT_LIMIT: usize = 20;
const MAX_SNAPSHOT_LIMIT: usize = 1000;

pub(crate) struct ServerState {
    config: ServeConfig,
    graph: Mutex<GraphStore>,
    content: ContentStore,
}

impl ServerState {
    pub(crate) fn open(config: ServeConfig) -> Result<Self> {
        let graph = GraphStore::open_read_only(&config.wal_path)
            .with_context(|| format!("failed to open session log {}", config.wal_path.display()))?;
        let content = ContentStore::open(&config.snapshot_dir)
            .with_context(|| format!("failed to open blob store {}", config.snapshot_dir.display()))?;
        Ok(Self {
            config,
            graph: Mutex::new(graph),
            content,
        })
    }

    /// Lock the graph after catching up with everything committed so far.
    fn current(&self) -> Result<MutexGuard<'_, GraphStore>> {
        let mut graph = self.graph.lock();
        let applied = graph.refresh()?;
        if applied > 0 {
            debug!(applied, "query view refreshed");
        }
        Ok(graph)
    }
}

pub(crate) fn cmd_serve(config: ServeConfig) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("failed to initialize tokio runtime: {e}"))?;

    rt.block_on(async move { serve_async(config).await })
}

async fn serve_async(config: ServeConfig) -> Result<()> {
    let listen = config.listen;
    let state = tokio::task::spawn_blocking(move || ServerState::open(config))
        .await
        .map_err(|e| anyhow!("serve: failed to join loader task: {e}"))??;
    let state = Arc::new(state);

    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| anyhow!("serve: failed to bind {listen}: {e}"))?;
    let bound = listener
        .local_addr()
        .map_err(|e| anyhow!("serve: failed to read bound addr: {e}"))?;

    info!(
        addr = %bound,
        wal = %state.config.wal_path.display(),
        "query server listening"
    );

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => {
                accepted.map_err(|e| anyhow!("serve: accept failed: {e}"))?
            }
            _ = tokio::signal::ctrl_c() => {
                info!("query server shutting down");
                return Ok(());
            }
        };
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, state.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                warn!(peer = %peer, error = %e, "connection error");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ServerState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let body = if method == Method::POST {
        req.into_body().collect().await?.to_bytes()
    } else {
        Bytes::new()
    };

    debug!(%method, %path, "request");

    // Refreshing reads the log from disk.
    let resp = tokio::task::spawn_blocking(move || {
        route(&state, &method, &path, query.as_deref(), &body)
    })
    .await
    .unwrap_or_else(|e| {
        json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("request task failed: {e}"),
        )
    });

    Ok(resp)
}

pub(crate) fn route(
    state: &ServerState,
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: &[u8],
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/healthz") => text_response(StatusCode::OK, "ok\n"),
        (&Method::GET, "/status") => match status_payload(state) {
            Ok(v) => json_response(StatusCode::OK, &v),
            Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        (&Method::GET, "/schema") => match schema_payload(state) {
            Ok(v) => json_response(StatusCode::OK, &v),
            Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        (&Method::GET, "/snapshots") => match snapshots_payload(state, query) {
            Ok(v) => json_response(StatusCode::OK, &v),
            Err(e) => json_error(StatusCode::BAD_REQUEST, &e.to_string()),
        },
        (&Method::GET, p) if p.starts_with("/snapshots/") => {
            let raw = &p["/snapshots/".len()..];
            match handle_snapshot_get(state, raw) {
                Ok(Some(v)) => json_response(StatusCode::OK, &v),
                Ok(None) => json_error(StatusCode::NOT_FOUND, &format!("no snapshot `{raw}`")),
                Err(e) => json_error(StatusCode::BAD_REQUEST, &e.to_string()),
            }
        }
        (&Method::GET, p) if p.starts_with("/blobs/") => {
            let raw = &p["/blobs/".len()..];
            match handle_blob_get(state, raw) {
                Ok(Some(bytes)) => blob_response(bytes),
                Ok(None) => json_error(StatusCode::NOT_FOUND, &format!("no blob `{raw}`")),
                Err(e) => json_error(StatusCode::BAD_REQUEST, &e.to_string()),
            }
        }
        (&Method::POST, "/query") => match handle_query(state, body) {
            Ok(v) => json_response(StatusCode::OK, &v),
            Err(e) => json_error(StatusCode::BAD_REQUEST, &e.to_string()),
        },
        _ => json_error(StatusCode::NOT_FOUND, "not found"),
    }
}

#[derive(Debug, Serialize)]
struct StatusPayload {
    version: &'static str,
    wal_path: String,
    snapshot_dir: String,
    blobs: usize,
    #[serde(flatten)]
    stats: StoreStats,
}

fn status_payload(state: &ServerState) -> Result<StatusPayload> {
    let stats = state.current()?.stats();
    Ok(StatusPayload {
        version: "versions_query_status_v1",
        wal_path: state.config.wal_path.display().to_string(),
        snapshot_dir: state.config.snapshot_dir.display().to_string(),
        blobs: state.content.blob_count()?,
        stats,
    })
}

#[derive(Debug, Serialize)]
struct RelationDecl {
    name: &'static str,
    from: EntityKind,
    to: EntityKind,
}

#[derive(Debug, Serialize)]
struct SchemaPayload {
    attributes: Vec<AttributeDecl>,
    relations: Vec<RelationDecl>,
}

fn schema_payload(state: &ServerState) -> Result<SchemaPayload> {
    let graph = state.current()?;
    Ok(SchemaPayload {
        attributes: graph.schema().declarations(),
        relations: vec![RelationDecl {
            name: FILES_RELATION,
            from: EntityKind::Snapshot,
            to: EntityKind::File,
        }],
    })
}

#[derive(Debug, Serialize)]
struct SnapshotsPayload {
    count: usize,
    snapshots: Vec<EntityView>,
}

fn snapshots_payload(state: &ServerState, query: Option<&str>) -> Result<SnapshotsPayload> {
    let limit = match query_param(query, "limit") {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| anyhow!("`limit` must be a non-negative integer, got `{raw}`"))?,
        None => DEFAULT_SNAPSHOT_LIMIT,
    }
    .min(MAX_SNAPSHOT_LIMIT);

    let graph = state.current()?;
    let snapshots = recent_snapshots(&graph, limit);
    Ok(SnapshotsPayload {
        count: snapshots.len(),
        snapshots,
    })
}

fn handle_snapshot_get(state: &ServerState, raw: &str) -> Result<Option<SnapshotDetail>> {
    let id = EntityId::parse(raw).ok_or_else(|| anyhow!("invalid snapshot id `{raw}`"))?;
    let graph = state.current()?;
    Ok(snapshot_detail(&graph, &id))
}

fn handle_blob_get(state: &ServerState, raw: &str) -> Result<Option<Vec<u8>>> {
    let hash = ContentHash::parse(raw)?;
    Ok(state.content.get(&hash)?)
}

#[derive(Debug, Serialize)]
struct QueryPayload {
    count: usize,
    entities: Vec<EntityView>,
}

fn handle_query(state: &ServerState, body: &[u8]) -> Result<QueryPayload> {
    let query: EntityQuery = serde_json::from_slice(body)
        .map_err(|e| anyhow!("failed to parse query JSON: {e}"))?;
    let graph = state.current()?;
    let entities = query.run(&graph)?;
    Ok(QueryPayload {
        count: entities.len(),
        entities,
    })
}

/// Build a response; a header the builder rejects degrades to a bare 500.
fn respond(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(Full::new(body))
        .unwrap_or_else(|_| {
            let mut resp = Response::new(Full::new(Bytes::new()));
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        })
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    respond(status, "text/plain; charset=utf-8", Bytes::from_static(body.as_bytes()))
}

fn blob_response(bytes: Vec<u8>) -> Response<Full<Bytes>> {
    respond(StatusCode::OK, "application/octet-stream", Bytes::from(bytes))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", Bytes::from(body)),
        Err(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to encode response: {e}"),
        ),
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

fn json_error(status: StatusCode, msg: &str) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&ErrorBody { error: msg }).unwrap_or_default();
    respond(status, "application/json", Bytes::from(body))
}

/// Last value of `key` in a urlencoded query string.
fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .filter(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .last()
}
