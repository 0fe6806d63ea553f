//! The caller-facing sync client.

use crate::clock::{Clock, SystemClock};
use crate::collection::CollectionSyncer;
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::http::{HttpClient, ReqwestClient, Transport};
use crate::media::MediaSyncer;
use crate::outcome::SyncOutcome;
use crate::progress::{CancellationToken, Monitor, ProgressSink, TransferCounters};
use crate::remote::{CollectionRemote, RemoteMediaServer, RemoteServer};
use crate::state::SyncStats;
use crate::store::{CollectionStore, MediaStore};
use parking_lot::RwLock;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{info, warn};

/// Runs collection and media syncs for one account.
///
/// The client owns the host key, a random session id sent with every
/// collection request, and the byte counters shared with progress sinks.
/// Each sync call builds fresh remotes bound to that call's sink and
/// cancellation token.
pub struct SyncClient<C: HttpClient> {
    config: SyncConfig,
    http: Arc<C>,
    host_key: RwLock<Option<String>>,
    session_id: String,
    counters: Arc<TransferCounters>,
    clock: Arc<dyn Clock>,
    stats: RwLock<SyncStats>,
    server_message: RwLock<Option<String>>,
}

impl SyncClient<ReqwestClient> {
    /// Creates a client talking HTTP through `reqwest`.
    pub fn connect(config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        let http = ReqwestClient::new(config.timeout)?;
        Ok(Self::new(config, http))
    }
}

impl<C: HttpClient> SyncClient<C> {
    /// Creates a client over `http`. The host key is taken from `config`.
    pub fn new(config: SyncConfig, http: C) -> Self {
        let host_key = config.host_key.clone();
        Self {
            config,
            http: Arc::new(http),
            host_key: RwLock::new(host_key),
            session_id: hex::encode(rand::random::<[u8; 4]>()),
            counters: Arc::new(TransferCounters::new()),
            clock: Arc::new(SystemClock),
            stats: RwLock::new(SyncStats::default()),
            server_message: RwLock::new(None),
        }
    }

    /// Uses `clock` for the skew check.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Reports byte totals into caller-owned counters.
    pub fn with_counters(mut self, counters: Arc<TransferCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Byte totals across all requests of this client.
    pub fn counters(&self) -> &Arc<TransferCounters> {
        &self.counters
    }

    /// Counters of the last collection or media sync.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// The last non-empty message sent by the server.
    pub fn server_message(&self) -> Option<String> {
        self.server_message.read().clone()
    }

    /// The current host key.
    pub fn host_key(&self) -> Option<String> {
        self.host_key.read().clone()
    }

    /// The session id sent as `s`.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Exchanges credentials for a host key and keeps it for later syncs.
    pub fn login(&self, user: &str, password: &str) -> SyncResult<String> {
        let remote = RemoteServer::new(self.transport(&self.config.sync_url, Monitor::detached()));
        let key = remote.host_key(user, password)?;
        info!("logged in");
        *self.host_key.write() = Some(key.clone());
        Ok(key)
    }

    /// Runs an incremental collection sync.
    pub fn sync_collection<S: CollectionStore>(
        &self,
        store: &mut S,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> SyncOutcome {
        let remote = match self.collection_remote(sink.clone(), cancel) {
            Ok(remote) => remote,
            Err(outcome) => return outcome,
        };
        let mut syncer = CollectionSyncer::new(&remote, store, &self.config)
            .with_clock(self.clock.clone())
            .with_monitor(self.monitor(sink, cancel));
        let outcome = syncer.sync();

        *self.stats.write() = syncer.stats().clone();
        if let Some(message) = syncer.server_message() {
            *self.server_message.write() = Some(message.to_string());
        }
        outcome
    }

    /// Runs a media sync.
    pub fn sync_media<S: MediaStore>(
        &self,
        store: &mut S,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> SyncOutcome {
        if let Err(e) = self.config.validate() {
            return e.into();
        }
        let Some(host_key) = self.host_key() else {
            warn!("media sync without host key");
            return SyncOutcome::BadAuth;
        };
        let monitor = self.monitor(sink, cancel);
        let transport = self.transport(&self.config.media_url, monitor.clone());
        let remote = RemoteMediaServer::new(transport, host_key, self.config.client_version.clone());

        let mut syncer = MediaSyncer::new(&remote, store, &self.config).with_monitor(monitor);
        let outcome = syncer.sync();
        *self.stats.write() = syncer.stats().clone();
        outcome
    }

    /// Replaces the remote collection with the bytes read from `collection`.
    pub fn full_upload(
        &self,
        collection: &mut dyn Read,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> SyncOutcome {
        let remote = match self.collection_remote(sink, cancel) {
            Ok(remote) => remote,
            Err(outcome) => return outcome,
        };
        match remote.upload(collection) {
            Ok(()) => {
                info!("full upload finished");
                SyncOutcome::Success
            }
            Err(e) => e.into(),
        }
    }

    /// Streams the remote collection file into `out`.
    pub fn full_download(
        &self,
        out: &mut dyn Write,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> SyncOutcome {
        let remote = match self.collection_remote(sink, cancel) {
            Ok(remote) => remote,
            Err(outcome) => return outcome,
        };
        match remote.download(out) {
            Ok(bytes) => {
                info!(bytes, "full download finished");
                SyncOutcome::Success
            }
            Err(e) => e.into(),
        }
    }

    fn collection_remote(
        &self,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<RemoteServer<C>, SyncOutcome> {
        self.config.validate().map_err(SyncOutcome::from)?;
        let host_key = self.host_key().ok_or_else(|| {
            warn!("collection sync without host key");
            SyncOutcome::BadAuth
        })?;
        let transport = self.transport(&self.config.sync_url, self.monitor(sink, cancel));
        transport.set_post_vars(vec![
            ("k".into(), host_key),
            ("s".into(), self.session_id.clone()),
        ]);
        Ok(RemoteServer::new(transport))
    }

    fn transport(&self, base_url: &str, monitor: Monitor) -> Transport<C> {
        Transport::new(self.http.clone(), base_url, monitor)
            .with_compression_level(self.config.compression_level)
            .with_buffer_size(self.config.buffer_size)
            .with_scratch_dir(self.config.scratch_dir.clone())
    }

    fn monitor(&self, sink: Arc<dyn ProgressSink>, cancel: &CancellationToken) -> Monitor {
        Monitor::new(
            self.counters.clone(),
            sink,
            cancel.clone(),
            self.config.progress_granularity,
        )
    }
}

impl<C: HttpClient> std::fmt::Debug for SyncClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("sync_url", &self.config.sync_url)
            .field("media_url", &self.config.media_url)
            .field("logged_in", &self.host_key.read().is_some())
            .field("session_id", &self.session_id)
            .finish()
    }
}
