//! Per-session state, phases and counters.

use flashsync_protocol::{MetaResponse, Usn};
use std::time::Duration;

/// Phases reported to the progress sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Flushing local writes and unburying cards.
    Prepare,
    /// Exchanging collection summaries.
    Meta,
    /// Exchanging graves.
    Deletions,
    /// Exchanging decks, configs, models, tags.
    SmallObjects,
    /// Downloading row chunks.
    DownloadChunks,
    /// Uploading row chunks.
    UploadChunks,
    /// Comparing count vectors.
    Sanity,
    /// Committing the new baseline.
    Finish,
    /// Reading the remote media log.
    MediaPull,
    /// Uploading dirty media.
    MediaPush,
    /// Comparing media counts.
    MediaSanity,
}

/// Values computed once per collection sync from the `meta` exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    /// Remote modification time.
    pub remote_mod: i64,
    /// Remote schema version.
    pub remote_scm: i64,
    /// Remote usn counter; rows sent or acknowledged get this usn.
    pub max_usn: Usn,
    /// Remote clock.
    pub remote_ts: i64,
    /// Remote media usn.
    pub media_usn: Usn,
    /// Local modification time.
    pub local_mod: i64,
    /// Local schema version.
    pub local_scm: i64,
    /// Local usn counter; lower bound of the window the server sends.
    pub min_usn: Usn,
    /// Local clock.
    pub local_ts: i64,
    /// True if the local side was modified more recently.
    pub local_is_newer: bool,
}

/// Local collection summary, as compared against [`MetaResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMeta {
    /// Modification time.
    pub modified: i64,
    /// Schema version.
    pub scm: i64,
    /// Usn counter.
    pub usn: Usn,
    /// Clock.
    pub ts: i64,
}

impl SessionState {
    /// Combines both summaries.
    pub fn new(remote: &MetaResponse, local: LocalMeta) -> Self {
        Self {
            remote_mod: remote.modified,
            remote_scm: remote.scm,
            max_usn: remote.usn,
            remote_ts: remote.ts,
            media_usn: remote.musn,
            local_mod: local.modified,
            local_scm: local.scm,
            min_usn: local.usn,
            local_ts: local.ts,
            local_is_newer: local.modified > remote.modified,
        }
    }

    /// Absolute clock difference in seconds.
    pub fn clock_delta(&self) -> i64 {
        (self.remote_ts - self.local_ts).abs()
    }

    /// Returns the clock delta if it exceeds `tolerance`.
    pub fn clock_off(&self, tolerance: Duration) -> Option<i64> {
        let delta = self.clock_delta();
        (delta > tolerance.as_secs() as i64).then_some(delta)
    }
}

/// Counters for the last sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Local graves sent.
    pub graves_sent: u64,
    /// Remote graves applied.
    pub graves_received: u64,
    /// Small objects sent.
    pub objects_sent: u64,
    /// Small objects received.
    pub objects_received: u64,
    /// Rows uploaded.
    pub rows_sent: u64,
    /// Rows downloaded.
    pub rows_received: u64,
    /// Chunks downloaded.
    pub chunks_received: u64,
    /// Chunks uploaded.
    pub chunks_sent: u64,
    /// Media files downloaded.
    pub media_downloaded: u64,
    /// Media files uploaded or deleted remotely.
    pub media_uploaded: u64,
    /// Local media files deleted on remote request.
    pub media_deleted: u64,
    /// Media restarts after a usn race.
    pub media_restarts: u32,
}
