//! Media sync: pull the remote change log, push local changes, compare counts.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::media_bundle::{build_upload, extract_download, BundleLimits};
use crate::outcome::SyncOutcome;
use crate::progress::Monitor;
use crate::remote::MediaRemote;
use crate::state::{SyncPhase, SyncStats};
use crate::store::MediaStore;
use flashsync_protocol::{
    classify_media, MediaAction, MediaChange, UploadResult, Usn, MEDIA_SANITY_OK,
};
use tracing::{debug, info, warn};

/// Drives one media sync against a remote.
pub struct MediaSyncer<'a, R: MediaRemote, S: MediaStore> {
    remote: &'a R,
    store: &'a mut S,
    config: &'a SyncConfig,
    monitor: Monitor,
    stats: SyncStats,
}

/// How a push pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushResult {
    Done,
    Raced,
}

impl<'a, R: MediaRemote, S: MediaStore> MediaSyncer<'a, R, S> {
    /// Creates a syncer with no progress reporting.
    pub fn new(remote: &'a R, store: &'a mut S, config: &'a SyncConfig) -> Self {
        Self {
            remote,
            store,
            config,
            monitor: Monitor::detached(),
            stats: SyncStats::default(),
        }
    }

    /// Reports progress and observes cancellation through `monitor`.
    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = monitor;
        self
    }

    /// Counters of the run.
    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Runs the media sync and reports how it ended.
    pub fn sync(&mut self) -> SyncOutcome {
        match self.run() {
            Ok(outcome) => {
                info!(%outcome, stats = ?self.stats, "media sync ended");
                outcome
            }
            Err(e) => {
                warn!(error = %e, "media sync failed");
                e.into()
            }
        }
    }

    fn run(&mut self) -> SyncResult<SyncOutcome> {
        self.store.scan_if_needed()?;

        loop {
            self.checkpoint(SyncPhase::MediaPull)?;
            let session = self.remote.begin()?;
            let local_usn = self.store.last_usn()?;
            if local_usn == session.usn && self.store.dirty_count()? == 0 {
                info!(usn = local_usn, "media up to date");
                return Ok(SyncOutcome::NoChanges);
            }
            self.pull()?;

            self.checkpoint(SyncPhase::MediaPush)?;
            if self.push()? == PushResult::Raced {
                if self.stats.media_restarts < self.config.max_media_restarts {
                    self.stats.media_restarts += 1;
                    warn!(restart = self.stats.media_restarts, "media usn race, restarting");
                    continue;
                }
                warn!("media usn race persists, giving up on restarts");
            }
            break;
        }

        self.checkpoint(SyncPhase::MediaSanity)?;
        let count = self.store.media_count()?;
        let reply = self.remote.media_sanity(count)?;
        if reply != MEDIA_SANITY_OK {
            warn!(count, %reply, "media sanity check failed, forcing resync");
            self.store.force_resync()?;
            return Ok(SyncOutcome::SanityCheckFailed(format!(
                "media sanity check failed: local {count} files, server replied {reply}"
            )));
        }
        Ok(SyncOutcome::Success)
    }

    /// Applies remote change log pages until the log is exhausted.
    fn pull(&mut self) -> SyncResult<()> {
        loop {
            self.monitor.check_cancelled()?;
            let last_usn = self.store.last_usn()?;
            let changes = self.remote.media_changes(last_usn)?;
            let Some(page_usn) = changes.last().map(MediaChange::usn) else {
                return Ok(());
            };
            debug!(entries = changes.len(), last_usn, "media changes page");
            let need = self.apply_page(&changes)?;
            self.download(need)?;
            self.store.set_last_usn(page_usn)?;
        }
    }

    /// Reconciles one page against local records. Returns the files to fetch.
    fn apply_page(&mut self, changes: &[MediaChange]) -> SyncResult<Vec<String>> {
        let mut need = Vec::new();
        let mut clean = Vec::new();
        for change in changes {
            let fname = change.fname();
            let local = self.store.record(fname)?;
            let (checksum, dirty) = local
                .as_ref()
                .map_or((None, false), |r| (r.checksum.as_deref(), r.dirty));
            match classify_media(checksum, dirty, change.checksum()) {
                MediaAction::Fetch => {
                    need.push(fname.to_string());
                    clean.push(fname.to_string());
                }
                MediaAction::AlreadyCurrent | MediaAction::BothDeleted => {
                    clean.push(fname.to_string());
                }
                MediaAction::DeleteLocal => {
                    self.store.sync_delete(fname)?;
                    self.stats.media_deleted += 1;
                }
                MediaAction::KeepLocal => {
                    debug!(fname, "keeping locally changed file over remote deletion");
                }
            }
        }
        self.store.mark_clean(&clean)?;
        Ok(need)
    }

    fn download(&mut self, mut need: Vec<String>) -> SyncResult<()> {
        let batch = self.config.media_download_batch;
        while !need.is_empty() {
            self.monitor.check_cancelled()?;
            let take = need.len().min(batch);
            let file = self.remote.download_files(&need[..take])?;
            let count = extract_download(file, &mut *self.store)?;
            if count == 0 {
                return Err(SyncError::Protocol("server returned an empty media zip".into()));
            }
            need.drain(..count.min(need.len()));
            self.stats.media_downloaded += count as u64;
            self.monitor
                .sink()
                .media(self.stats.media_downloaded, self.stats.media_uploaded);
            debug!(count, remaining = need.len(), "media batch downloaded");
        }
        Ok(())
    }

    fn push(&mut self) -> SyncResult<PushResult> {
        let limits = BundleLimits {
            max_files: self.config.media_upload_files,
            max_bytes: self.config.media_upload_bytes,
        };
        let mut result = PushResult::Done;
        loop {
            self.monitor.check_cancelled()?;
            let Some(bundle) =
                build_upload(&mut *self.store, limits, self.config.scratch_dir.as_deref())?
            else {
                return Ok(result);
            };
            let reply = self.remote.upload_changes(bundle.file)?;
            let (processed, processed_usn) = processed_count(&reply)?;
            if processed == 0 {
                return Err(SyncError::Protocol("server processed no media changes".into()));
            }
            let done = &bundle.fnames[..processed.min(bundle.fnames.len())];
            self.store.mark_clean(done)?;
            self.stats.media_uploaded += done.len() as u64;
            self.monitor
                .sink()
                .media(self.stats.media_downloaded, self.stats.media_uploaded);

            let last_usn = self.store.last_usn()?;
            if reply.server_usn().checked_sub(processed_usn) == Some(last_usn) {
                self.store.set_last_usn(reply.server_usn())?;
            } else {
                warn!(
                    server_usn = reply.server_usn(),
                    processed,
                    last_usn,
                    "media usn moved during upload"
                );
                result = PushResult::Raced;
            }
            debug!(processed, bytes = bundle.bytes, "media batch uploaded");
        }
    }

    fn checkpoint(&self, phase: SyncPhase) -> SyncResult<()> {
        self.monitor.check_cancelled()?;
        debug!(?phase, "phase");
        self.monitor.sink().phase(phase);
        Ok(())
    }
}

/// The server's processed count as an index and as a usn delta.
fn processed_count(reply: &UploadResult) -> SyncResult<(usize, Usn)> {
    let out_of_range =
        || SyncError::Protocol(format!("processed count {} out of range", reply.processed()));
    let processed = usize::try_from(reply.processed()).map_err(|_| out_of_range())?;
    let processed_usn = Usn::try_from(reply.processed()).map_err(|_| out_of_range())?;
    Ok((processed, processed_usn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_bundle::write_download;
    use crate::memory::MemoryMedia;
    use flashsync_protocol::MediaSession;
    use parking_lot::Mutex;
    use std::fs::File;
    use std::io::{Seek, Write};

    /// A remote with a fixed change log and no concurrent writers.
    #[derive(Default)]
    struct LogRemote {
        usn: Usn,
        log: Vec<MediaChange>,
        files: Vec<(String, Vec<u8>)>,
        uploads: Mutex<Vec<Vec<String>>>,
        processed: Option<u64>,
    }

    impl MediaRemote for LogRemote {
        fn begin(&self) -> SyncResult<MediaSession> {
            Ok(MediaSession {
                sk: "sk".into(),
                usn: self.usn + self.uploads.lock().len() as Usn,
            })
        }

        fn media_changes(&self, last_usn: Usn) -> SyncResult<Vec<MediaChange>> {
            Ok(self
                .log
                .iter()
                .filter(|c| c.usn() > last_usn)
                .cloned()
                .collect())
        }

        fn download_files(&self, files: &[String]) -> SyncResult<File> {
            let wanted: Vec<_> = self
                .files
                .iter()
                .filter(|(name, _)| files.contains(name))
                .cloned()
                .collect();
            let mut file = tempfile::tempfile()?;
            let zip = write_download(std::io::Cursor::new(Vec::new()), &wanted)?;
            file.write_all(&zip.into_inner())?;
            file.rewind()?;
            Ok(file)
        }

        fn upload_changes(&self, zip: File) -> SyncResult<UploadResult> {
            let entries = crate::media_bundle::read_upload(zip)?;
            let names: Vec<String> = entries.into_iter().map(|(n, _)| n).collect();
            let count = self.processed.unwrap_or(names.len() as u64);
            let mut uploads = self.uploads.lock();
            uploads.push(names);
            Ok(UploadResult(count, self.usn + uploads.len() as Usn))
        }

        fn media_sanity(&self, _: u64) -> SyncResult<String> {
            Ok(MEDIA_SANITY_OK.into())
        }
    }

    #[test]
    fn pull_applies_conflict_rules() {
        let remote = LogRemote {
            usn: 3,
            log: vec![
                MediaChange("new.png".into(), 1, Some(crate::checksum::checksum(b"new"))),
                MediaChange("kept.png".into(), 2, None),
                MediaChange("gone.png".into(), 3, None),
            ],
            files: vec![("new.png".into(), b"new".to_vec())],
            ..Default::default()
        };
        let mut media = MemoryMedia::new();
        media.add_local("kept.png", b"mine".to_vec());
        media.add_local("gone.png", b"old".to_vec());
        media.mark_clean(&["gone.png".to_string()]).unwrap();

        let config = SyncConfig::default();
        let mut syncer = MediaSyncer::new(&remote, &mut media, &config);
        // kept.png stays dirty and is pushed, so the watermark ends at 4.
        assert_eq!(syncer.sync(), SyncOutcome::Success);
        assert_eq!(syncer.stats().media_downloaded, 1);
        assert_eq!(syncer.stats().media_deleted, 1);

        assert_eq!(media.file("new.png"), Some(&b"new"[..]));
        assert_eq!(media.file("gone.png"), None);
        assert_eq!(media.file("kept.png"), Some(&b"mine"[..]));
        assert_eq!(remote.uploads.lock().as_slice(), &[vec!["kept.png".to_string()]]);
        assert_eq!(media.last_usn().unwrap(), 4);
    }

    #[test]
    fn oversized_processed_count_is_rejected() {
        let remote = LogRemote {
            processed: Some(u64::from(u32::MAX) + 2),
            ..Default::default()
        };
        let mut media = MemoryMedia::new();
        media.add_local("a.png", b"aaa".to_vec());

        let config = SyncConfig::default();
        let outcome = MediaSyncer::new(&remote, &mut media, &config).sync();
        assert!(matches!(
            outcome,
            SyncOutcome::TransportFailure(ref m) if m.contains("out of range")
        ));
        assert!(media.record("a.png").unwrap().unwrap().dirty);
        assert_eq!(media.last_usn().unwrap(), 0);
    }

    #[test]
    fn up_to_date_is_no_changes() {
        let remote = LogRemote::default();
        let mut media = MemoryMedia::new();
        let config = SyncConfig::default();
        assert_eq!(
            MediaSyncer::new(&remote, &mut media, &config).sync(),
            SyncOutcome::NoChanges
        );
    }

    #[test]
    fn cancellation_stops_before_begin() {
        let remote = LogRemote::default();
        let mut media = MemoryMedia::new();
        let config = SyncConfig::default();
        let monitor = Monitor::detached();
        monitor.cancel_token().cancel();
        let outcome = MediaSyncer::new(&remote, &mut media, &config)
            .with_monitor(monitor)
            .sync();
        assert_eq!(outcome, SyncOutcome::Cancelled);
    }
}
