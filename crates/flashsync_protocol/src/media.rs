//! Request and response bodies of the media protocol.

use crate::record::Usn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the manifest entry inside media zips.
pub const ZIP_META_ENTRY: &str = "_meta";

/// `begin` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSession {
    /// Media session key.
    pub sk: String,
    /// Remote media usn.
    pub usn: Usn,
}

/// One entry of the remote media log: `[fname, usn, checksum|null]`.
///
/// A missing checksum means the file was deleted remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaChange(pub String, pub Usn, pub Option<String>);

impl MediaChange {
    /// File name.
    pub fn fname(&self) -> &str {
        &self.0
    }

    /// Usn of the change.
    pub fn usn(&self) -> Usn {
        self.1
    }

    /// Remote checksum, `None` (or empty) for a deletion.
    pub fn checksum(&self) -> Option<&str> {
        self.2.as_deref().filter(|c| !c.is_empty())
    }
}

/// `mediaChanges` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaChangesRequest {
    /// Usn watermark of the last applied change.
    #[serde(rename = "lastUsn")]
    pub last_usn: Usn,
}

/// `downloadFiles` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFilesRequest {
    /// Names of files to bundle.
    pub files: Vec<String>,
}

/// `mediaSanity` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSanityRequest {
    /// Local media file count.
    pub local: u64,
}

/// `uploadChanges` response: `[processed, serverLastUsn]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult(pub u64, pub Usn);

impl UploadResult {
    /// Number of leading entries of the zip the server applied.
    pub fn processed(&self) -> u64 {
        self.0
    }

    /// Server media usn after applying.
    pub fn server_usn(&self) -> Usn {
        self.1
    }
}

/// Manifest of an uploaded zip: `[[fname, zipEntry], ...]`.
///
/// An empty entry name marks a deletion.
pub type UploadManifest = Vec<(String, String)>;

/// Manifest of a downloaded zip: `{zipEntry: fname}`.
pub type DownloadManifest = BTreeMap<String, String>;

/// The reply that marks a passing media sanity check.
pub const MEDIA_SANITY_OK: &str = "OK";
