//! In-process collection server.
//!
//! [`RemoteCollection`] plays the server side of the collection protocol over
//! a [`CollectionState`]: it hands out rows and objects with
//! `usn >= minUsn`, merges incoming small objects by `mod`, keeps client rows
//! as stamped, records client graves at its own usn and bumps the usn counter
//! on `finish`. An aborted session restores the state it started from.

use flashsync_engine::{
    Clock, CollectionRemote, CollectionState, SyncError, SyncResult, SystemClock,
};
use flashsync_protocol::{
    remote_wins, Changes, Chunk, Graves, MetaRequest, MetaResponse, ObjectKind, SanityCounts,
    StartRequest, Table, Usn,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::debug;

/// Host key handed out by [`RemoteCollection::host_key`].
pub const TEST_HOST_KEY: &str = "test-host-key";

/// Rows per server chunk unless configured.
const DEFAULT_CHUNK_SIZE: usize = 250;

struct Session {
    min_usn: Usn,
    client_newer: bool,
    tables: VecDeque<Table>,
    after_id: Option<i64>,
    snapshot: CollectionState,
}

struct Inner {
    state: CollectionState,
    session: Option<Session>,
    collection_file: Vec<u8>,
}

#[derive(Default)]
struct Script {
    message: String,
    refuse: bool,
    failing: Option<(String, String)>,
    sanity: Option<SanityCounts>,
    password: Option<String>,
    media_usn: Usn,
}

/// A collection server kept in memory.
pub struct RemoteCollection {
    inner: Mutex<Inner>,
    script: Mutex<Script>,
    calls: Mutex<Vec<String>>,
    clock: Arc<dyn Clock>,
    chunk_size: usize,
}

impl Default for RemoteCollection {
    fn default() -> Self {
        Self::new(CollectionState::default())
    }
}

impl RemoteCollection {
    /// Creates a server holding `state`.
    pub fn new(state: CollectionState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                session: None,
                collection_file: Vec::new(),
            }),
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Vec::new()),
            clock: Arc::new(SystemClock),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Uses `clock` for the `ts` field of `meta`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the rows per downloaded chunk.
    pub fn with_chunk_size(mut self, rows: usize) -> Self {
        self.chunk_size = rows.max(1);
        self
    }

    /// Only accepts logins with this password.
    pub fn with_password(self, password: impl Into<String>) -> Self {
        self.script.lock().password = Some(password.into());
        self
    }

    /// A copy of the server state.
    pub fn state(&self) -> CollectionState {
        self.inner.lock().state.clone()
    }

    /// Edits the server state, as another client syncing in between would.
    pub fn edit(&self, f: impl FnOnce(&mut CollectionState)) {
        f(&mut self.inner.lock().state);
    }

    /// Sends `message` with every `meta` reply.
    pub fn set_message(&self, message: impl Into<String>) {
        self.script.lock().message = message.into();
    }

    /// Answers `meta` with `cont == false` and `message`.
    pub fn refuse(&self, message: impl Into<String>) {
        let mut script = self.script.lock();
        script.refuse = true;
        script.message = message.into();
    }

    /// Makes `method` fail with an error envelope carrying `error`.
    pub fn fail_on(&self, method: &str, error: impl Into<String>) {
        self.script.lock().failing = Some((method.to_string(), error.into()));
    }

    /// Replies to `sanityCheck` with `counts` instead of the real ones.
    pub fn override_sanity(&self, counts: SanityCounts) {
        self.script.lock().sanity = Some(counts);
    }

    /// Media usn reported by `meta`.
    pub fn set_media_usn(&self, usn: Usn) {
        self.script.lock().media_usn = usn;
    }

    /// Methods called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// True while a session is open.
    pub fn in_session(&self) -> bool {
        self.inner.lock().session.is_some()
    }

    /// The collection file last received by `upload`.
    pub fn uploaded_file(&self) -> Vec<u8> {
        self.inner.lock().collection_file.clone()
    }

    /// Sets the collection file served by `download`.
    pub fn set_collection_file(&self, bytes: impl Into<Vec<u8>>) {
        self.inner.lock().collection_file = bytes.into();
    }

    fn enter(&self, method: &str) -> SyncResult<()> {
        self.calls.lock().push(method.to_string());
        match &self.script.lock().failing {
            Some((failing, error)) if failing == method => Err(SyncError::Remote(error.clone())),
            _ => Ok(()),
        }
    }

    fn with_session<T>(
        &self,
        f: impl FnOnce(&mut Session, &mut CollectionState) -> T,
    ) -> SyncResult<T> {
        let mut inner = self.inner.lock();
        let Inner { state, session, .. } = &mut *inner;
        let session = session
            .as_mut()
            .ok_or_else(|| SyncError::Remote("no sync session in progress".into()))?;
        Ok(f(session, state))
    }
}

/// Objects changed since `min_usn`, with config and creation time if asked.
fn changes_since(state: &CollectionState, min_usn: Usn, with_conf: bool) -> Changes {
    let mut changes = Changes {
        models: state
            .models
            .values()
            .filter(|m| m.usn >= min_usn)
            .cloned()
            .collect(),
        tags: state
            .tags
            .iter()
            .filter(|(_, usn)| **usn >= min_usn)
            .map(|(tag, _)| tag.clone())
            .collect(),
        ..Changes::default()
    };
    changes.decks.0 = state
        .decks
        .values()
        .filter(|d| d.usn >= min_usn)
        .cloned()
        .collect();
    changes.decks.1 = state
        .deck_configs
        .values()
        .filter(|c| c.usn >= min_usn)
        .cloned()
        .collect();
    if with_conf {
        changes.conf = Some(state.config.clone());
        changes.crt = Some(state.crt);
    }
    changes
}

fn merge_changes(state: &mut CollectionState, incoming: &Changes) {
    for model in &incoming.models {
        if remote_wins(state.models.get(&model.id).map(|m| m.modified), model.modified) {
            state.models.insert(model.id, model.clone());
        }
    }
    for deck in &incoming.decks.0 {
        if remote_wins(state.decks.get(&deck.id).map(|d| d.modified), deck.modified) {
            state.decks.insert(deck.id, deck.clone());
        }
    }
    for conf in &incoming.decks.1 {
        if remote_wins(
            state.deck_configs.get(&conf.id).map(|c| c.modified),
            conf.modified,
        ) {
            state.deck_configs.insert(conf.id, conf.clone());
        }
    }
    for tag in &incoming.tags {
        state.tags.insert(tag.clone(), state.usn);
    }
    if let Some(conf) = &incoming.conf {
        state.config = conf.clone();
    }
    if let Some(crt) = incoming.crt {
        state.crt = crt;
    }
}

impl CollectionRemote for RemoteCollection {
    fn host_key(&self, _user: &str, password: &str) -> SyncResult<String> {
        self.enter("hostKey")?;
        match &self.script.lock().password {
            Some(expected) if expected != password => Err(SyncError::Unauthenticated),
            _ => Ok(TEST_HOST_KEY.to_string()),
        }
    }

    fn meta(&self, _request: &MetaRequest) -> SyncResult<MetaResponse> {
        self.enter("meta")?;
        let script = self.script.lock();
        let inner = self.inner.lock();
        Ok(MetaResponse {
            modified: inner.state.modified,
            scm: inner.state.scm,
            usn: inner.state.usn,
            ts: self.clock.now_secs(),
            musn: script.media_usn,
            msg: script.message.clone(),
            cont: !script.refuse,
        })
    }

    fn start(&self, request: &StartRequest) -> SyncResult<Graves> {
        self.enter("start")?;
        let mut inner = self.inner.lock();
        let snapshot = inner.state.clone();
        let state = &mut inner.state;

        let outgoing: Graves = state
            .graves
            .iter()
            .filter(|g| g.usn >= request.min_usn)
            .cloned()
            .collect();
        let usn = state.usn;
        state.delete_with_graves(ObjectKind::Note, &request.graves.notes, usn);
        state.delete_with_graves(ObjectKind::Card, &request.graves.cards, usn);
        state.delete_with_graves(ObjectKind::Deck, &request.graves.decks, usn);

        inner.session = Some(Session {
            min_usn: request.min_usn,
            client_newer: request.lnewer,
            tables: Table::CHUNK_ORDER.into_iter().collect(),
            after_id: None,
            snapshot,
        });
        debug!(min_usn = request.min_usn, sent = outgoing.len(), "server session started");
        Ok(outgoing)
    }

    fn apply_changes(&self, changes: &Changes) -> SyncResult<Changes> {
        self.enter("applyChanges")?;
        self.with_session(|session, state| {
            let outgoing = changes_since(state, session.min_usn, !session.client_newer);
            merge_changes(state, changes);
            outgoing
        })
    }

    fn chunk(&self) -> SyncResult<Chunk> {
        self.enter("chunk")?;
        let limit = self.chunk_size;
        self.with_session(|session, state| {
            let mut chunk = Chunk::default();
            let mut remaining = limit;
            while remaining > 0 {
                let Some(&table) = session.tables.front() else {
                    break;
                };
                let rows = state.rows_since(table, session.min_usn, session.after_id, remaining);
                if rows.len() < remaining {
                    session.tables.pop_front();
                    session.after_id = None;
                } else {
                    session.after_id = rows.last().and_then(|r| r.id());
                }
                remaining -= rows.len();
                if !rows.is_empty() {
                    chunk.set_rows(table, rows);
                }
            }
            chunk.done = session.tables.is_empty();
            chunk
        })
    }

    fn apply_chunk(&self, chunk: &Chunk) -> SyncResult<()> {
        self.enter("applyChunk")?;
        self.with_session(|_, state| {
            for table in Table::CHUNK_ORDER {
                let Some(rows) = chunk.rows(table) else {
                    continue;
                };
                let target = state.rows_mut(table);
                for row in rows {
                    let Some(id) = row.id() else {
                        continue;
                    };
                    if table == Table::Revlog {
                        target.entry(id).or_insert_with(|| row.clone());
                    } else {
                        target.insert(id, row.clone());
                    }
                }
            }
        })
    }

    fn sanity_check(&self) -> SyncResult<SanityCounts> {
        self.enter("sanityCheck")?;
        if let Some(counts) = self.script.lock().sanity {
            return Ok(counts);
        }
        self.with_session(|_, state| state.sanity_counts())
    }

    fn finish(&self) -> SyncResult<i64> {
        self.enter("finish")?;
        let mut inner = self.inner.lock();
        if inner.session.take().is_none() {
            return Err(SyncError::Remote("no sync session in progress".into()));
        }
        let state = &mut inner.state;
        let modified = (self.clock.now_secs() * 1000).max(state.modified + 1);
        state.modified = modified;
        state.last_sync = modified;
        state.usn += 1;
        debug!(modified, usn = state.usn, "server session finished");
        Ok(modified)
    }

    fn abort(&self) -> SyncResult<()> {
        self.enter("abort")?;
        let mut inner = self.inner.lock();
        if let Some(session) = inner.session.take() {
            inner.state = session.snapshot;
        }
        Ok(())
    }

    fn upload(&self, collection: &mut dyn Read) -> SyncResult<()> {
        self.enter("upload")?;
        let mut bytes = Vec::new();
        collection.read_to_end(&mut bytes)?;
        self.inner.lock().collection_file = bytes;
        Ok(())
    }

    fn download(&self, out: &mut dyn Write) -> SyncResult<u64> {
        self.enter("download")?;
        let inner = self.inner.lock();
        out.write_all(&inner.collection_file)?;
        Ok(inner.collection_file.len() as u64)
    }
}
