//! Eventually consistent server-side logic for a collaborative document.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, RwLock, broadcast};
use tokio::time::{self, Instant};
use tracing::{info, warn};

use crate::database::PersistedDocument;
use crate::ot::{OperationSeq, transform_index};

/// Reserved user ID for server-initiated broadcasts; the per-session
/// counter starts at zero and can never reach it.
pub const SYSTEM_ID: u64 = u64::MAX;

/// Close code sent to a client whose edits can no longer be reconciled.
pub const CLOSE_DESYNC: u16 = 4000;

/// Close code sent when a connection fails the access-token check.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;

/// Maximum length of a displayed user name, in scalar values.
const MAX_NAME_LEN: usize = 25;

/// Editor languages recognised for syntax highlighting, matching the set
/// shipped with the front-end editor. Anything else is ignored.
const LANGUAGES: &[&str] = &[
    "plaintext",
    "abap",
    "apex",
    "azcli",
    "bat",
    "c",
    "clojure",
    "coffeescript",
    "cpp",
    "csharp",
    "css",
    "dart",
    "dockerfile",
    "elixir",
    "erlang",
    "fsharp",
    "go",
    "graphql",
    "handlebars",
    "haskell",
    "html",
    "ini",
    "java",
    "javascript",
    "json",
    "julia",
    "kotlin",
    "less",
    "lua",
    "markdown",
    "objective-c",
    "pascal",
    "perl",
    "pgsql",
    "php",
    "powershell",
    "python",
    "r",
    "razor",
    "ruby",
    "rust",
    "scala",
    "scss",
    "shell",
    "sql",
    "swift",
    "typescript",
    "vb",
    "xml",
    "yaml",
];

/// Runtime limits applied to every session, derived from the server
/// configuration.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    /// Maximum document length in scalar values; edits growing past it are
    /// rejected.
    pub max_document_len: usize,
    /// How long a connection may stay silent before it is dropped.
    pub read_timeout: Duration,
    /// Time allowed for a single outbound WebSocket write.
    pub write_timeout: Duration,
    /// Capacity of each subscriber's outbound update buffer.
    pub broadcast_buffer: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_document_len: 256 * 1024,
            read_timeout: Duration::from_secs(30 * 60),
            write_timeout: Duration::from_secs(10),
            broadcast_buffer: 16,
        }
    }
}

/// The main object representing a collaborative session.
pub struct Copad {
    /// State modified by critical sections of the code.
    state: RwLock<State>,
    /// Incremented to obtain unique user IDs.
    count: AtomicU64,
    /// Number of currently open connections.
    connections: AtomicUsize,
    /// Used to notify clients of new text operations.
    notify: Notify,
    /// Wakes the persister after any persistence-relevant mutation.
    changed: Notify,
    /// Asks the persister for an immediate write.
    flush: Notify,
    /// Used to inform all clients of metadata updates.
    update: broadcast::Sender<ServerMsg>,
    /// Set to true when the document is destroyed.
    killed: AtomicBool,
    /// Whether a persister task currently owns this session.
    persister: AtomicBool,
    limits: Limits,
}

/// Shared state involving multiple users, protected by a lock.
#[derive(Default)]
struct State {
    operations: Vec<UserOperation>,
    text: String,
    language: Option<String>,
    otp: Option<String>,
    users: HashMap<u64, UserInfo>,
    cursors: HashMap<u64, CursorData>,
    dirty: bool,
}

/// An operation with the ID of the user that committed it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserOperation {
    pub id: u64,
    pub operation: OperationSeq,
}

/// A user's display name and cursor color.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub hue: u32,
}

/// A user's cursor and selection positions, in scalar-value offsets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CursorData {
    pub cursors: Vec<u32>,
    pub selections: Vec<(u32, u32)>,
}

/// A message received from the client over WebSocket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ClientMsg {
    /// Represents a sequence of local edits from the user.
    Edit {
        revision: usize,
        operation: OperationSeq,
    },
    /// Sets the language of the editor.
    SetLanguage(String),
    /// Sets the user's current information.
    ClientInfo(UserInfo),
    /// Sets the user's cursor and selection positions.
    CursorData(CursorData),
}

/// A message sent to the client over WebSocket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ServerMsg {
    /// Informs the client of their unique socket ID.
    Identity(u64),
    /// Broadcasts text operations to all clients.
    History {
        start: usize,
        operations: Vec<UserOperation>,
    },
    /// Broadcasts the current language, last writer wins.
    Language {
        language: String,
        user_id: u64,
        user_name: String,
    },
    /// Broadcasts a user's information, or `None` on disconnect.
    UserInfo { id: u64, info: Option<UserInfo> },
    /// Broadcasts a user's cursor position.
    UserCursor { id: u64, data: CursorData },
    /// Broadcasts the document's access token, or `None` when cleared.
    #[serde(rename = "OTP")]
    Otp {
        otp: Option<String>,
        user_id: u64,
        user_name: String,
    },
}

impl From<ServerMsg> for Message {
    fn from(msg: ServerMsg) -> Self {
        let serialized = serde_json::to_string(&msg).expect("failed serialize");
        Message::text(serialized)
    }
}

impl Copad {
    /// Creates an empty session.
    pub fn new(limits: Limits) -> Self {
        Self::with_state(limits, State::default())
    }

    /// Creates a session from a persisted document.
    ///
    /// The stored text enters the log as a bootstrap insert attributed to
    /// the system ID, so that late joiners replay it like any other edit.
    pub fn load(limits: Limits, document: PersistedDocument) -> Self {
        let mut operation = OperationSeq::default();
        operation.insert(&document.text);

        let mut operations = Vec::new();
        if !operation.is_noop() {
            operations.push(UserOperation {
                id: SYSTEM_ID,
                operation,
            });
        }
        let state = State {
            operations,
            text: document.text,
            language: document.language,
            otp: document.otp,
            ..State::default()
        };
        Self::with_state(limits, state)
    }

    fn with_state(limits: Limits, state: State) -> Self {
        let (tx, _) = broadcast::channel(limits.broadcast_buffer);
        Self {
            state: RwLock::new(state),
            count: Default::default(),
            connections: Default::default(),
            notify: Default::default(),
            changed: Default::default(),
            flush: Default::default(),
            update: tx,
            killed: AtomicBool::new(false),
            persister: AtomicBool::new(false),
            limits,
        }
    }

    /// Handle a connection from a WebSocket.
    pub async fn on_connection(&self, mut socket: WebSocket) {
        let id = self.count.fetch_add(1, Ordering::Relaxed);
        self.connections.fetch_add(1, Ordering::Relaxed);
        info!("connection! id = {}", id);
        if let Err(e) = self.handle_connection(id, &mut socket).await {
            warn!("connection terminated early: {:#}", e);
            let frame = CloseFrame {
                code: CLOSE_DESYNC,
                reason: "desynchronized".into(),
            };
            time::timeout(
                self.limits.write_timeout,
                socket.send(Message::Close(Some(frame))),
            )
            .await
            .ok();
        }
        info!("disconnection, id = {}", id);
        {
            let mut state = self.state.write().await;
            state.users.remove(&id);
            state.cursors.remove(&id);
        }
        self.update.send(ServerMsg::UserInfo { id, info: None }).ok();
        if self.connections.fetch_sub(1, Ordering::Relaxed) == 1 {
            // Last subscriber gone; have the persister write immediately.
            self.flush.notify_waiters();
        }
    }

    /// Returns a snapshot of the latest text.
    pub async fn text(&self) -> String {
        let state = self.state.read().await;
        state.text.clone()
    }

    /// Returns a snapshot of the current document for persistence.
    pub async fn snapshot(&self) -> PersistedDocument {
        let state = self.state.read().await;
        PersistedDocument {
            text: state.text.clone(),
            language: state.language.clone(),
            otp: state.otp.clone(),
        }
    }

    /// Returns the current revision.
    pub async fn revision(&self) -> usize {
        let state = self.state.read().await;
        state.operations.len()
    }

    /// Returns the current access token, if the document is protected.
    pub async fn otp(&self) -> Option<String> {
        let state = self.state.read().await;
        state.otp.clone()
    }

    /// Compares a presented token against the session's, in constant time.
    ///
    /// Always passes when the document is unprotected.
    pub async fn check_otp(&self, presented: Option<&str>) -> bool {
        let state = self.state.read().await;
        match &state.otp {
            Some(expected) => presented.is_some_and(|p| constant_time_eq(p, expected)),
            None => true,
        }
    }

    /// Sets or clears the access token and broadcasts the change on behalf
    /// of the acting user.
    pub async fn set_otp(&self, otp: Option<String>, user_id: u64, user_name: String) {
        {
            let mut state = self.state.write().await;
            state.otp = otp.clone();
            state.dirty = true;
        }
        self.changed.notify_waiters();
        self.update
            .send(ServerMsg::Otp {
                otp,
                user_id,
                user_name,
            })
            .ok();
    }

    /// Returns the document if it has been modified since the last call,
    /// and resets the dirty flag.
    ///
    /// Has to be done as one operation to avoid losing a concurrent edit.
    pub async fn dirty_snapshot(&self) -> Option<PersistedDocument> {
        let mut state = self.state.write().await;
        if state.dirty {
            state.dirty = false;
            Some(PersistedDocument {
                text: state.text.clone(),
                language: state.language.clone(),
                otp: state.otp.clone(),
            })
        } else {
            None
        }
    }

    /// Re-marks the document as dirty, after a failed store write.
    pub async fn mark_dirty(&self) {
        let mut state = self.state.write().await;
        state.dirty = true;
    }

    /// Whether unpersisted changes exist.
    pub async fn is_dirty(&self) -> bool {
        let state = self.state.read().await;
        state.dirty
    }

    /// Number of currently open connections.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Completes after the next persistence-relevant change.
    pub fn change_notified(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Completes when an immediate write is requested.
    pub fn flush_requested(&self) -> Notified<'_> {
        self.flush.notified()
    }

    /// Marks this session as owned by a persister task; returns false if
    /// one is already running.
    pub fn claim_persister(&self) -> bool {
        !self.persister.swap(true, Ordering::Relaxed)
    }

    /// Releases persister ownership when its task exits.
    pub fn release_persister(&self) {
        self.persister.store(false, Ordering::Relaxed);
    }

    /// Kill this object immediately, dropping all current connections.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
        self.changed.notify_waiters();
        self.flush.notify_waiters();
    }

    /// Returns if this session has been killed.
    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    async fn handle_connection(&self, id: u64, socket: &mut WebSocket) -> Result<()> {
        let mut update_rx = self.update.subscribe();

        let mut revision = self.send_initial(id, socket).await?;
        let mut read_deadline = Instant::now() + self.limits.read_timeout;

        loop {
            // In order to avoid the "lost wakeup" problem, we first request a
            // notification, **then** check the current state for new revisions.
            // This is the same approach that `tokio::sync::watch` takes.
            let notified = self.notify.notified();
            if self.killed() {
                break;
            }
            if self.revision().await > revision {
                revision = self.send_history(revision, socket).await?;
            }

            tokio::select! {
                _ = notified => {}
                update = update_rx.recv() => {
                    // A lagged receiver is one that cannot keep its bounded
                    // buffer drained; the error below disconnects it.
                    self.send(socket, update?.into()).await?;
                }
                result = socket.next() => {
                    match result {
                        None => break,
                        Some(message) => {
                            read_deadline = Instant::now() + self.limits.read_timeout;
                            self.handle_message(id, message?).await?;
                        }
                    }
                }
                _ = time::sleep_until(read_deadline) => {
                    bail!("idle for {:?}, closing connection", self.limits.read_timeout);
                }
            }
        }
        Ok(())
    }

    async fn send(&self, socket: &mut WebSocket, msg: Message) -> Result<()> {
        time::timeout(self.limits.write_timeout, socket.send(msg))
            .await
            .context("write timed out")??;
        Ok(())
    }

    async fn send_initial(&self, id: u64, socket: &mut WebSocket) -> Result<usize> {
        self.send(socket, ServerMsg::Identity(id).into()).await?;
        let mut messages = Vec::new();
        let revision = {
            let state = self.state.read().await;
            if !state.operations.is_empty() {
                messages.push(ServerMsg::History {
                    start: 0,
                    operations: state.operations.clone(),
                });
            }
            if let Some(language) = &state.language {
                messages.push(ServerMsg::Language {
                    language: language.clone(),
                    user_id: SYSTEM_ID,
                    user_name: String::new(),
                });
            }
            if let Some(otp) = &state.otp {
                messages.push(ServerMsg::Otp {
                    otp: Some(otp.clone()),
                    user_id: SYSTEM_ID,
                    user_name: String::new(),
                });
            }
            for (&id, info) in &state.users {
                messages.push(ServerMsg::UserInfo {
                    id,
                    info: Some(info.clone()),
                });
            }
            for (&id, data) in &state.cursors {
                messages.push(ServerMsg::UserCursor {
                    id,
                    data: data.clone(),
                });
            }
            state.operations.len()
        };
        for msg in messages {
            self.send(socket, msg.into()).await?;
        }
        Ok(revision)
    }

    async fn send_history(&self, start: usize, socket: &mut WebSocket) -> Result<usize> {
        let operations = {
            let state = self.state.read().await;
            let len = state.operations.len();
            if start < len {
                state.operations[start..].to_owned()
            } else {
                Vec::new()
            }
        };
        let num_ops = operations.len();
        if num_ops > 0 {
            self.send(socket, ServerMsg::History { start, operations }.into())
                .await?;
        }
        Ok(start + num_ops)
    }

    async fn handle_message(&self, id: u64, message: Message) -> Result<()> {
        let Message::Text(text) = message else {
            return Ok(()); // Ignore non-text messages
        };
        let msg: ClientMsg =
            serde_json::from_str(&text).context("failed to deserialize message")?;
        match msg {
            ClientMsg::Edit {
                revision,
                operation,
            } => {
                self.apply_edit(id, revision, operation)
                    .await
                    .context("invalid edit operation")?;
                self.notify.notify_waiters();
                self.changed.notify_waiters();
            }
            ClientMsg::SetLanguage(language) => {
                if !LANGUAGES.contains(&language.as_str()) {
                    warn!("ignoring unrecognized language: {}", language);
                    return Ok(());
                }
                let user_name = {
                    let mut state = self.state.write().await;
                    state.language = Some(language.clone());
                    state.dirty = true;
                    state
                        .users
                        .get(&id)
                        .map(|info| info.name.clone())
                        .unwrap_or_default()
                };
                self.changed.notify_waiters();
                self.update
                    .send(ServerMsg::Language {
                        language,
                        user_id: id,
                        user_name,
                    })
                    .ok();
            }
            ClientMsg::ClientInfo(info) => {
                let info = UserInfo {
                    name: info.name.chars().take(MAX_NAME_LEN).collect(),
                    hue: info.hue % 360,
                };
                self.state.write().await.users.insert(id, info.clone());
                let msg = ServerMsg::UserInfo {
                    id,
                    info: Some(info),
                };
                self.update.send(msg).ok();
            }
            ClientMsg::CursorData(data) => {
                self.state.write().await.cursors.insert(id, data.clone());
                let msg = ServerMsg::UserCursor { id, data };
                self.update.send(msg).ok();
            }
        }
        Ok(())
    }

    async fn apply_edit(&self, id: u64, revision: usize, operation: OperationSeq) -> Result<()> {
        info!(
            "edit: id = {}, revision = {}, base_len = {}, target_len = {}",
            id,
            revision,
            operation.base_len(),
            operation.target_len()
        );
        let mut state = self.state.write().await;
        let len = state.operations.len();
        if revision > len {
            bail!("got revision {}, but current is {}", revision, len);
        }
        let mut operation = operation;
        for history_op in &state.operations[revision..] {
            // Rebase onto each committed operation; committed inserts keep
            // position priority over the incoming one.
            operation = history_op.operation.transform(&operation)?.1;
        }
        if operation.target_len() > self.limits.max_document_len {
            bail!(
                "target length {} exceeds the {} scalar maximum",
                operation.target_len(),
                self.limits.max_document_len
            );
        }
        let new_text = operation.apply(&state.text)?;
        for data in state.cursors.values_mut() {
            for cursor in data.cursors.iter_mut() {
                *cursor = transform_index(&operation, *cursor);
            }
            for (start, end) in data.selections.iter_mut() {
                *start = transform_index(&operation, *start);
                *end = transform_index(&operation, *end);
            }
        }
        state.operations.push(UserOperation { id, operation });
        state.text = new_text;
        state.dirty = true;
        Ok(())
    }
}

/// Byte-wise string comparison that does not exit early, so that timing
/// does not reveal how much of a token matched.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
