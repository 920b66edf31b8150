//! Server backend for the Copad collaborative text editor.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use clap::Parser;
use dashmap::DashMap;
use rand::{random, random_range};
use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant};
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crate::copad::{CLOSE_UNAUTHORIZED, Copad, Limits, constant_time_eq};
use crate::database::Database;

mod copad;
pub mod database;
pub mod ot;

/// Unique identifier for a document.
#[repr(align(64))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier([u8; Self::MAX_LEN]);

impl Identifier {
    /// Maximum length of a document ID, in bytes.
    pub const MAX_LEN: usize = 64;

    fn valid_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ' ')
    }
}

impl FromStr for Identifier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > Self::MAX_LEN {
            anyhow::bail!("Document ID is too long");
        }
        if s.is_empty() || !s.chars().all(Self::valid_char) {
            anyhow::bail!("Document ID contains invalid characters");
        }
        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self(bytes))
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(Self::MAX_LEN);
        std::str::from_utf8(&self.0[..len]).expect("document ID contains invalid UTF-8")
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl Serialize for Identifier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_ref())
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Server configuration, from command-line flags or environment variables.
#[derive(Debug, Clone, Parser)]
pub struct ServerConfig {
    /// Port to listen on.
    #[clap(long, env = "PORT", default_value_t = 3030)]
    pub port: u16,
    /// Days without activity after which stored documents are deleted.
    #[clap(long, env = "EXPIRY_DAYS", default_value_t = 7)]
    pub expiry_days: u32,
    /// Directory for document persistence; empty keeps documents in memory
    /// only.
    #[clap(long, env = "STORE_URI", default_value = "")]
    pub store_uri: String,
    /// Hours between garbage-collection sweeps.
    #[clap(long, env = "CLEANUP_INTERVAL_HOURS", default_value_t = 1)]
    pub cleanup_interval_hours: u32,
    /// Maximum size of a document, in KiB of scalar values.
    #[clap(long, env = "MAX_DOCUMENT_SIZE_KB", default_value_t = 256)]
    pub max_document_size_kb: usize,
    /// Minutes a connection may stay silent before it is dropped.
    #[clap(long, env = "WS_READ_TIMEOUT_MINUTES", default_value_t = 30)]
    pub ws_read_timeout_minutes: u64,
    /// Seconds allowed for a single outbound WebSocket write.
    #[clap(long, env = "WS_WRITE_TIMEOUT_SECONDS", default_value_t = 10)]
    pub ws_write_timeout_seconds: u64,
    /// Capacity of each subscriber's outbound update buffer.
    #[clap(long, env = "BROADCAST_BUFFER_SIZE", default_value_t = 16)]
    pub broadcast_buffer_size: usize,
    /// Default log level when RUST_LOG is not set.
    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3030,
            expiry_days: 7,
            store_uri: String::new(),
            cleanup_interval_hours: 1,
            max_document_size_kb: 256,
            ws_read_timeout_minutes: 30,
            ws_write_timeout_seconds: 10,
            broadcast_buffer_size: 16,
            log_level: "info".into(),
        }
    }
}

impl ServerConfig {
    fn limits(&self) -> Limits {
        Limits {
            max_document_len: self.max_document_size_kb * 1024,
            read_timeout: Duration::from_secs(self.ws_read_timeout_minutes * 60),
            write_timeout: Duration::from_secs(self.ws_write_timeout_seconds),
            broadcast_buffer: self.broadcast_buffer_size,
        }
    }
}

/// An entry stored in the global server map.
///
/// Each entry corresponds to a single document. It is garbage collected by a
/// background task after a day of inactivity, to keep server memory usage
/// bounded.
struct Document {
    last_accessed: Instant,
    pad: Arc<Copad>,
}

impl Document {
    fn new(pad: Arc<Copad>) -> Self {
        Self {
            last_accessed: Instant::now(),
            pad,
        }
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        self.pad.kill();
    }
}

/// The shared state of the server, accessible from request handlers.
pub struct ServerState {
    /// Concurrent map storing in-memory documents.
    documents: DashMap<Identifier, Document>,
    /// The document store, if persistence is enabled.
    database: Option<Database>,
    config: ServerConfig,
    limits: Limits,
    start_time: u64,
}

/// Outcome of looking up a session on behalf of a caller.
enum SessionAccess {
    Granted(Arc<Copad>),
    Denied,
}

impl ServerState {
    /// Constructs the server state, opening the document store when one is
    /// configured.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let database = if config.store_uri.is_empty() {
            None
        } else {
            Some(Database::new(PathBuf::from(&config.store_uri)).await?)
        };
        Ok(Self::with_database(config, database))
    }

    /// Constructs a server state with a temporary store for testing.
    pub async fn temporary() -> Result<Self> {
        let database = Database::temporary().await?;
        Ok(Self::with_database(ServerConfig::default(), Some(database)))
    }

    fn with_database(config: ServerConfig, database: Option<Database>) -> Self {
        let limits = config.limits();
        let start_time = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        Self {
            documents: DashMap::new(),
            database,
            config,
            limits,
            start_time,
        }
    }

    /// Looks up or creates the session for a document, checking any
    /// presented access token.
    ///
    /// A protected document that is not in memory has its token compared
    /// against the stored row first, so that a failed attempt never mounts
    /// the text.
    async fn acquire(&self, id: &Identifier, otp: Option<&str>) -> SessionAccess {
        use dashmap::mapref::entry::Entry;

        let mut entry = match self.documents.entry(id.clone()) {
            Entry::Occupied(e) => e.into_ref(),
            Entry::Vacant(e) => {
                let loaded = match &self.database {
                    Some(db) => db.load_document(id).await.ok(),
                    None => None,
                };
                let pad = match loaded {
                    Some(document) => {
                        if !stored_otp_allows(document.otp.as_deref(), otp) {
                            return SessionAccess::Denied;
                        }
                        Arc::new(Copad::load(self.limits, document))
                    }
                    None => Arc::new(Copad::new(self.limits)),
                };
                e.insert(Document::new(pad))
            }
        };
        let value = entry.value_mut();
        value.last_accessed = Instant::now();
        let pad = Arc::clone(&value.pad);
        drop(entry);

        if !pad.check_otp(otp).await {
            return SessionAccess::Denied;
        }
        self.spawn_persister(id, &pad);
        SessionAccess::Granted(pad)
    }

    /// Starts a persister task for the session unless one is running.
    fn spawn_persister(&self, id: &Identifier, pad: &Arc<Copad>) {
        let Some(db) = &self.database else { return };
        if pad.claim_persister() {
            start_persister(id.clone(), Arc::clone(pad), db.clone());
        }
    }

    /// Stores a document right away, ahead of the persister's schedule.
    ///
    /// Failures are logged; the session stays dirty so the persister
    /// retries later.
    async fn critical_write(&self, id: &Identifier, pad: &Copad) {
        let Some(db) = &self.database else { return };
        if let Err(e) = db.store_document(id, &pad.snapshot().await).await {
            error!("critical write for document {} failed: {:#}", id, e);
        }
    }

    /// Kills every session and flushes unpersisted changes to the store.
    ///
    /// Called once on graceful shutdown, after the listener has stopped.
    pub async fn persist_all(&self) {
        for entry in self.documents.iter() {
            entry.pad.kill();
        }
        let Some(db) = &self.database else { return };
        let ids: Vec<Identifier> = self.documents.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let Some(entry) = self.documents.get(&id) else {
                continue;
            };
            let pad = Arc::clone(&entry.pad);
            drop(entry);
            if let Some(snapshot) = pad.dirty_snapshot().await {
                if let Err(e) = db.store_document(&id, &snapshot).await {
                    error!("failed to persist document {} during shutdown: {:#}", id, e);
                }
            }
        }
    }

    /// Removes sessions that have had no subscribers for a day, flushing
    /// dirty ones first.
    async fn evict_idle_sessions(&self) {
        let mut keys = Vec::new();
        for entry in self.documents.iter() {
            if entry.pad.connections() == 0 && entry.last_accessed.elapsed() > IDLE_EVICTION {
                keys.push(entry.key().clone());
            }
        }
        if keys.is_empty() {
            return;
        }
        info!("evicting idle documents: {:?}", keys);
        for key in keys {
            if let Some((_, document)) = self.documents.remove(&key) {
                if let Some(db) = &self.database {
                    if let Some(snapshot) = document.pad.dirty_snapshot().await {
                        if let Err(e) = db.store_document(&key, &snapshot).await {
                            error!("failed to flush evicted document {}: {:#}", key, e);
                        }
                    }
                }
            }
        }
    }

    /// Deletes stored documents whose last activity is older than the
    /// configured expiry, killing their sessions if still in memory.
    async fn expire_stored_documents(&self) {
        let Some(db) = &self.database else { return };
        let max_age = Duration::from_secs(24 * 3600) * self.config.expiry_days;
        let expired = match db.expired_documents(max_age).await {
            Ok(expired) => expired,
            Err(e) => {
                warn!("expiry sweep failed: {:#}", e);
                return;
            }
        };
        if expired.is_empty() {
            return;
        }
        info!("expiring stored documents: {:?}", expired);
        for id in expired {
            if let Err(e) = db.delete_document(&id).await {
                warn!("failed to delete expired document {}: {:#}", id, e);
                continue;
            }
            self.documents.remove(&id);
        }
    }
}

/// Statistics about the server, returned from an API endpoint.
#[derive(Serialize)]
struct Stats {
    /// System time when the server started, in seconds since Unix epoch.
    start_time: u64,
    /// Number of documents currently tracked by the server.
    num_documents: usize,
    /// Number of documents persisted in the store.
    database_size: usize,
}

/// Builds the application router and starts the background sweep task.
pub fn server(state: Arc<ServerState>) -> Router {
    tokio::spawn(cleaner(Arc::clone(&state)));
    Router::new()
        .nest("/api", backend(state))
        .fallback_service(ServeDir::new("dist"))
}

/// Construct backend routes, including WebSocket handlers.
fn backend(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/socket/{id}", get(socket_handler))
        .route("/text/{id}", get(text_handler))
        .route("/stats", get(stats_handler))
        .route(
            "/document/{id}/protect",
            post(protect_handler).delete(unprotect_handler),
        )
        .with_state(state)
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct SocketQuery {
    otp: Option<String>,
}

/// Handler for the `/api/socket/{id}` endpoint.
async fn socket_handler(
    Path(id): Path<Identifier>,
    Query(query): Query<SocketQuery>,
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> Response {
    info!("socket connection for id = {}", id);
    match state.acquire(&id, query.otp.as_deref()).await {
        SessionAccess::Granted(pad) => {
            ws.on_upgrade(move |socket| async move { pad.on_connection(socket).await })
        }
        SessionAccess::Denied => {
            info!("rejecting unauthorized connection for id = {}", id);
            ws.on_upgrade(reject_connection)
        }
    }
}

/// Closes a socket that failed the access-token check, without revealing
/// anything about the document.
async fn reject_connection(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: CLOSE_UNAUTHORIZED,
        reason: "unauthorized".into(),
    };
    socket.send(Message::Close(Some(frame))).await.ok();
}

/// Handler for the `/api/text/{id}` endpoint.
async fn text_handler(
    Path(id): Path<Identifier>,
    State(state): State<Arc<ServerState>>,
) -> Result<String, StatusCode> {
    let pad = state
        .documents
        .get(&id)
        .map(|entry| Arc::clone(&entry.pad));
    if let Some(pad) = pad {
        if pad.otp().await.is_some() {
            return Err(StatusCode::FORBIDDEN);
        }
        return Ok(pad.text().await);
    }
    let Some(db) = &state.database else {
        return Ok(String::new());
    };
    match db.load_document(&id).await {
        Ok(document) if document.otp.is_some() => Err(StatusCode::FORBIDDEN),
        Ok(document) => Ok(document.text),
        Err(_) => Ok(String::new()),
    }
}

/// Handler for the `/api/stats` endpoint.
async fn stats_handler(State(state): State<Arc<ServerState>>) -> Result<Json<Stats>, StatusCode> {
    let database_size = match &state.database {
        Some(db) => db.document_count().await.map_err(|e| {
            error!("failed to count stored documents: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?,
        None => 0,
    };
    Ok(Json(Stats {
        start_time: state.start_time,
        num_documents: state.documents.len(),
        database_size,
    }))
}

/// Body of the protect and unprotect endpoints, identifying the actor.
#[derive(Debug, Deserialize)]
struct TokenRequest {
    user_id: u64,
    user_name: String,
    #[serde(default)]
    otp: Option<String>,
}

#[derive(Serialize)]
struct TokenResponse {
    otp: String,
}

/// Handler for `POST /api/document/{id}/protect`.
///
/// Sets a fresh access token on the document and stores it immediately.
/// Re-protecting with the current token returns it unchanged; any other
/// attempt on an already protected document is rejected.
async fn protect_handler(
    Path(id): Path<Identifier>,
    State(state): State<Arc<ServerState>>,
    Json(request): Json<TokenRequest>,
) -> Response {
    let pad = match state.acquire(&id, request.otp.as_deref()).await {
        SessionAccess::Granted(pad) => pad,
        SessionAccess::Denied => return StatusCode::FORBIDDEN.into_response(),
    };
    let otp = match pad.otp().await {
        Some(current) => current,
        None => {
            let otp = generate_otp();
            pad.set_otp(Some(otp.clone()), request.user_id, request.user_name)
                .await;
            state.critical_write(&id, &pad).await;
            otp
        }
    };
    Json(TokenResponse { otp }).into_response()
}

/// Handler for `DELETE /api/document/{id}/protect`.
///
/// Clears the access token when the caller presents the current one.
async fn unprotect_handler(
    Path(id): Path<Identifier>,
    State(state): State<Arc<ServerState>>,
    Json(request): Json<TokenRequest>,
) -> StatusCode {
    let pad = match state.acquire(&id, request.otp.as_deref()).await {
        SessionAccess::Granted(pad) => pad,
        SessionAccess::Denied => return StatusCode::FORBIDDEN,
    };
    let Some(current) = pad.otp().await else {
        return StatusCode::FORBIDDEN;
    };
    if !request
        .otp
        .as_deref()
        .is_some_and(|presented| constant_time_eq(presented, &current))
    {
        return StatusCode::FORBIDDEN;
    }
    pad.set_otp(None, request.user_id, request.user_name).await;
    state.critical_write(&id, &pad).await;
    StatusCode::NO_CONTENT
}

/// Generates a fresh document access token.
fn generate_otp() -> String {
    URL_SAFE_NO_PAD.encode(random::<[u8; 12]>())
}

/// Whether a stored token row admits the presented token.
fn stored_otp_allows(stored: Option<&str>, presented: Option<&str>) -> bool {
    match stored {
        Some(expected) => presented.is_some_and(|p| constant_time_eq(p, expected)),
        None => true,
    }
}

const IDLE_EVICTION: Duration = Duration::from_secs(24 * 3600);

/// Reclaims memory and storage for inactive documents.
async fn cleaner(state: Arc<ServerState>) {
    let interval = Duration::from_secs(3600) * state.config.cleanup_interval_hours;
    loop {
        time::sleep(interval).await;
        state.evict_idle_sessions().await;
        state.expire_stored_documents().await;
    }
}

const IDLE_PERSIST: Duration = Duration::from_secs(30);
const SAFETY_PERSIST_INTERVAL: Duration = Duration::from_secs(5 * 60);
const PERSIST_JITTER: Duration = Duration::from_secs(1);

/// Writes a session's changes to the store per the persistence policy:
/// thirty seconds after the last edit, at least every five minutes while
/// dirty, immediately when the last subscriber leaves, and finally on kill.
///
/// The task parks itself once the document is stored and nobody is
/// connected; the next connection starts a new one.
async fn persister(id: Identifier, pad: Arc<Copad>, db: Database) {
    let mut idle_deadline: Option<Instant> = None;
    let mut safety_deadline = Instant::now() + SAFETY_PERSIST_INTERVAL;
    while !pad.killed() {
        // Register for wakeups before inspecting the dirty flag, so a change
        // can never slip between the check and the select below.
        let changed = pad.change_notified();
        let flush = pad.flush_requested();
        if idle_deadline.is_none() && pad.is_dirty().await {
            idle_deadline = Some(Instant::now() + IDLE_PERSIST);
            safety_deadline = Instant::now() + SAFETY_PERSIST_INTERVAL;
        }
        let deadline = idle_deadline.map_or(safety_deadline, |idle| idle.min(safety_deadline));
        let write_now = tokio::select! {
            _ = changed => {
                if idle_deadline.is_none() {
                    safety_deadline = Instant::now() + SAFETY_PERSIST_INTERVAL;
                }
                let jitter = random_range(Duration::ZERO..=PERSIST_JITTER);
                idle_deadline = Some(Instant::now() + IDLE_PERSIST + jitter);
                false
            }
            _ = flush => true,
            _ = time::sleep_until(deadline), if idle_deadline.is_some() => true,
        };
        if !write_now {
            continue;
        }
        if write_snapshot(&id, &pad, &db).await {
            idle_deadline = None;
            if pad.connections() == 0 && !pad.killed() {
                break;
            }
        } else {
            idle_deadline = Some(Instant::now() + IDLE_PERSIST);
        }
    }
    // Eviction and shutdown land here; the final write covers edits that
    // were still inside the idle window.
    write_snapshot(&id, &pad, &db).await;
    pad.release_persister();
    // A connection may have arrived while this task was exiting; it saw the
    // claim still held, so take over on its behalf.
    if !pad.killed() && pad.connections() > 0 && pad.claim_persister() {
        start_persister(id, pad, db);
    }
}

/// Spawns a persister task. Factored out of [`ServerState`] so an exiting
/// task can hand its session to a fresh one.
fn start_persister(id: Identifier, pad: Arc<Copad>, db: Database) {
    tokio::spawn(persister(id, pad, db));
}

/// Stores the session's changes, if any. Returns false when the write
/// failed and should be retried.
async fn write_snapshot(id: &Identifier, pad: &Copad, db: &Database) -> bool {
    match pad.dirty_snapshot().await {
        None => true,
        Some(snapshot) => match db.store_document(id, &snapshot).await {
            Ok(()) => {
                info!("persisted document {}", id);
                true
            }
            Err(e) => {
                error!("failed to persist document {}: {:#}", id, e);
                pad.mark_dirty().await;
                false
            }
        },
    }
}
