//! In-process media server.

use flashsync_engine::{checksum, read_upload, write_download, MediaRemote, SyncError, SyncResult};
use flashsync_protocol::{MediaChange, MediaSession, UploadResult, Usn, MEDIA_SANITY_OK};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Seek;

/// Session key handed out by `begin`.
pub const TEST_MEDIA_SESSION: &str = "test-media-session";

#[derive(Default)]
struct Inner {
    files: BTreeMap<String, Vec<u8>>,
    /// Latest change per file: `(usn, checksum)`.
    log: BTreeMap<String, (Usn, Option<String>)>,
    usn: Usn,
    races: u32,
    sanity_reply: Option<String>,
    calls: Vec<String>,
}

impl Inner {
    fn add(&mut self, fname: &str, data: Vec<u8>) {
        self.usn += 1;
        self.log
            .insert(fname.to_string(), (self.usn, Some(checksum(&data))));
        self.files.insert(fname.to_string(), data);
    }

    fn delete(&mut self, fname: &str) {
        self.usn += 1;
        self.log.insert(fname.to_string(), (self.usn, None));
        self.files.remove(fname);
    }
}

/// A media server kept in memory.
///
/// Every change gets the next usn; the change log keeps the latest entry per
/// file. [`RemoteMedia::inject_races`] simulates another client uploading
/// between a client's zips.
pub struct RemoteMedia {
    inner: Mutex<Inner>,
    page_size: usize,
}

impl Default for RemoteMedia {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteMedia {
    /// Creates an empty server.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            page_size: 250,
        }
    }

    /// Sets the entries per `mediaChanges` page.
    pub fn with_page_size(mut self, entries: usize) -> Self {
        self.page_size = entries.max(1);
        self
    }

    /// Adds or replaces a file, as another client would.
    pub fn add_file(&self, fname: &str, data: impl Into<Vec<u8>>) {
        self.inner.lock().add(fname, data.into());
    }

    /// Deletes a file, as another client would.
    pub fn delete_file(&self, fname: &str) {
        self.inner.lock().delete(fname);
    }

    /// Contents of a file.
    pub fn file(&self, fname: &str) -> Option<Vec<u8>> {
        self.inner.lock().files.get(fname).cloned()
    }

    /// Names of all files.
    pub fn file_names(&self) -> Vec<String> {
        self.inner.lock().files.keys().cloned().collect()
    }

    /// Current media usn.
    pub fn usn(&self) -> Usn {
        self.inner.lock().usn
    }

    /// Makes the next `count` uploads observe a concurrent writer.
    pub fn inject_races(&self, count: u32) {
        self.inner.lock().races = count;
    }

    /// Replies to `mediaSanity` with `reply` regardless of counts.
    pub fn set_sanity_reply(&self, reply: impl Into<String>) {
        self.inner.lock().sanity_reply = Some(reply.into());
    }

    /// Methods called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    fn enter(&self, method: &str) -> parking_lot::MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock();
        inner.calls.push(method.to_string());
        inner
    }
}

impl MediaRemote for RemoteMedia {
    fn begin(&self) -> SyncResult<MediaSession> {
        let inner = self.enter("begin");
        Ok(MediaSession {
            sk: TEST_MEDIA_SESSION.to_string(),
            usn: inner.usn,
        })
    }

    fn media_changes(&self, last_usn: Usn) -> SyncResult<Vec<MediaChange>> {
        let inner = self.enter("mediaChanges");
        let mut changes: Vec<MediaChange> = inner
            .log
            .iter()
            .filter(|(_, (usn, _))| *usn > last_usn)
            .map(|(fname, (usn, sum))| MediaChange(fname.clone(), *usn, sum.clone()))
            .collect();
        changes.sort_by_key(MediaChange::usn);
        changes.truncate(self.page_size);
        Ok(changes)
    }

    fn download_files(&self, files: &[String]) -> SyncResult<File> {
        let inner = self.enter("downloadFiles");
        let wanted: Vec<(String, Vec<u8>)> = files
            .iter()
            .filter_map(|f| inner.files.get(f).map(|data| (f.clone(), data.clone())))
            .collect();
        let mut file = write_download(tempfile::tempfile()?, &wanted)?;
        file.rewind()?;
        Ok(file)
    }

    fn upload_changes(&self, zip: File) -> SyncResult<UploadResult> {
        let entries = read_upload(zip)?;
        let mut inner = self.enter("uploadChanges");
        if inner.races > 0 {
            inner.races -= 1;
            let name = format!("concurrent-{}.txt", inner.usn);
            inner.add(&name, name.clone().into_bytes());
        }
        let processed = entries.len() as u64;
        for (fname, data) in entries {
            if fname.contains('/') {
                return Err(SyncError::Remote(format!("bad file name {fname}")));
            }
            match data {
                Some(data) => inner.add(&fname, data),
                None => inner.delete(&fname),
            }
        }
        Ok(UploadResult(processed, inner.usn))
    }

    fn media_sanity(&self, local_count: u64) -> SyncResult<String> {
        let inner = self.enter("mediaSanity");
        if let Some(reply) = &inner.sanity_reply {
            return Ok(reply.clone());
        }
        Ok(if local_count == inner.files.len() as u64 {
            MEDIA_SANITY_OK.to_string()
        } else {
            "FAILED".to_string()
        })
    }
}
