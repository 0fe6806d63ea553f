//! An [`HttpClient`] that answers requests in-process.
//!
//! [`LoopbackClient`] parses the multipart body the transport writes, unzips
//! the `data` part when `c=1`, and dispatches by URL to a [`RemoteCollection`]
//! or a [`RemoteMedia`]. Replies use the same shapes as the real service, so
//! `SyncClient` runs end to end without a network.

use crate::remote_collection::{RemoteCollection, TEST_HOST_KEY};
use crate::remote_media::{RemoteMedia, TEST_MEDIA_SESSION};
use flashsync_engine::{
    CollectionRemote, HttpClient, HttpRequest, HttpResponse, MediaRemote, SyncError, SyncResult,
    BOUNDARY,
};
use flashsync_protocol::{
    ApplyChangesRequest, ApplyChunkRequest, DownloadFilesRequest, Envelope, HostKeyRequest,
    HostKeyResponse, MediaChangesRequest, MediaSanityRequest, MetaRequest, StartRequest,
};
use flate2::read::GzDecoder;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Seek, Write};
use std::sync::Arc;
use tracing::debug;

/// Parsed multipart form.
#[derive(Debug, Default)]
pub struct Form {
    fields: HashMap<String, Vec<u8>>,
}

impl Form {
    /// Parses a body written with [`BOUNDARY`].
    pub fn parse(body: &[u8]) -> Result<Self, String> {
        let delimiter = format!("--{BOUNDARY}");
        let separator = format!("\r\n--{BOUNDARY}");
        let mut fields = HashMap::new();
        let mut rest = body
            .strip_prefix(delimiter.as_bytes())
            .ok_or("body does not start with the boundary")?;
        while !rest.starts_with(b"--") {
            rest = rest.strip_prefix(b"\r\n").ok_or("missing line break")?;
            let header_end = find(rest, b"\r\n\r\n").ok_or("unterminated part header")?;
            let header = String::from_utf8_lossy(&rest[..header_end]);
            let name = header
                .split("name=\"")
                .nth(1)
                .and_then(|s| s.split('"').next())
                .ok_or("part without name")?
                .to_string();
            let content = &rest[header_end + 4..];
            let end = find(content, separator.as_bytes()).ok_or("unterminated part")?;
            fields.insert(name, content[..end].to_vec());
            rest = &content[end + 2 + delimiter.len()..];
        }
        Ok(Self { fields })
    }

    /// A text field.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// The `data` part, decompressed if `c=1`.
    pub fn data(&self) -> Result<Vec<u8>, String> {
        let Some(raw) = self.fields.get("data") else {
            return Ok(Vec::new());
        };
        if self.text("c") == Some("1") {
            let mut out = Vec::new();
            GzDecoder::new(&raw[..])
                .read_to_end(&mut out)
                .map_err(|e| e.to_string())?;
            Ok(out)
        } else {
            Ok(raw.clone())
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Serves [`RemoteCollection`] under `…/sync/` and [`RemoteMedia`] under
/// `…/msync/`.
pub struct LoopbackClient {
    collection: Arc<RemoteCollection>,
    media: Arc<RemoteMedia>,
    forced_status: Mutex<Option<u16>>,
    requests: Mutex<Vec<(String, Form)>>,
}

impl LoopbackClient {
    /// Creates a client backed by the given servers.
    pub fn new(collection: Arc<RemoteCollection>, media: Arc<RemoteMedia>) -> Self {
        Self {
            collection,
            media,
            forced_status: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answers the next request with `status` and an empty body.
    pub fn fail_next(&self, status: u16) {
        *self.forced_status.lock() = Some(status);
    }

    /// Methods requested so far, with the value of field `name` if present.
    pub fn field_values(&self, name: &str) -> Vec<(String, Option<String>)> {
        self.requests
            .lock()
            .iter()
            .map(|(method, form)| (method.clone(), form.text(name).map(str::to_string)))
            .collect()
    }

    fn dispatch(&self, url: &str, form: &Form) -> SyncResult<Vec<u8>> {
        let (prefix, method) = url
            .rsplit_once('/')
            .ok_or_else(|| SyncError::Protocol(format!("bad url {url}")))?;
        let data = form.data().map_err(SyncError::Protocol)?;
        if prefix.ends_with("/msync") {
            self.media_call(method, form, &data)
        } else {
            self.collection_call(method, form, &data)
        }
    }

    fn collection_call(&self, method: &str, form: &Form, data: &[u8]) -> SyncResult<Vec<u8>> {
        let server = &self.collection;
        if method == "hostKey" {
            let request: HostKeyRequest = decode(data)?;
            let key = server.host_key(&request.u, &request.p)?;
            return envelope(HostKeyResponse { key });
        }
        if form.text("k") != Some(TEST_HOST_KEY) {
            return Err(SyncError::Unauthenticated);
        }
        match method {
            "meta" => envelope(server.meta(&decode::<MetaRequest>(data)?)?),
            "start" => envelope(server.start(&decode::<StartRequest>(data)?)?),
            "applyChanges" => {
                let request: ApplyChangesRequest = decode(data)?;
                envelope(server.apply_changes(&request.changes)?)
            }
            "chunk" => envelope(server.chunk()?),
            "applyChunk" => {
                let request: ApplyChunkRequest = decode(data)?;
                server.apply_chunk(&request.chunk)?;
                envelope(serde_json::Value::Null)
            }
            "sanityCheck" => Ok(serde_json::to_vec(&server.sanity_check()?)?),
            "finish" => Ok(server.finish()?.to_string().into_bytes()),
            "abort" => {
                server.abort()?;
                envelope(serde_json::Value::Null)
            }
            "upload" => {
                let mut reader = data;
                server.upload(&mut reader)?;
                Ok(b"OK".to_vec())
            }
            "download" => {
                let mut out = Vec::new();
                server.download(&mut out)?;
                Ok(out)
            }
            other => Err(SyncError::Protocol(format!("unknown method {other}"))),
        }
    }

    fn media_call(&self, method: &str, form: &Form, data: &[u8]) -> SyncResult<Vec<u8>> {
        let server = &self.media;
        let authorized = if method == "begin" {
            form.text("k") == Some(TEST_HOST_KEY)
        } else {
            form.text("sk") == Some(TEST_MEDIA_SESSION)
        };
        if !authorized {
            return Err(SyncError::Unauthenticated);
        }
        match method {
            "begin" => envelope(server.begin()?),
            "mediaChanges" => {
                let request: MediaChangesRequest = decode(data)?;
                envelope(server.media_changes(request.last_usn)?)
            }
            "downloadFiles" => {
                let request: DownloadFilesRequest = decode(data)?;
                let mut zip = server.download_files(&request.files)?;
                let mut out = Vec::new();
                zip.read_to_end(&mut out)?;
                Ok(out)
            }
            "uploadChanges" => {
                let mut zip = tempfile::tempfile()?;
                zip.write_all(data)?;
                zip.rewind()?;
                envelope(server.upload_changes(zip)?)
            }
            "mediaSanity" => {
                let request: MediaSanityRequest = decode(data)?;
                envelope(server.media_sanity(request.local)?)
            }
            other => Err(SyncError::Protocol(format!("unknown media method {other}"))),
        }
    }
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> SyncResult<T> {
    Ok(serde_json::from_slice(data)?)
}

fn envelope<T: Serialize>(data: T) -> SyncResult<Vec<u8>> {
    Ok(serde_json::to_vec(&Envelope::success(data))?)
}

impl HttpClient for LoopbackClient {
    fn post(&self, mut request: HttpRequest) -> Result<HttpResponse, String> {
        let mut body = Vec::new();
        request
            .body
            .read_to_end(&mut body)
            .map_err(|e| e.to_string())?;
        if let Some(status) = self.forced_status.lock().take() {
            return Ok(HttpResponse::from_bytes(status, "Forced", Vec::new()));
        }

        let form = Form::parse(&body)?;
        let method = request.url.rsplit('/').next().unwrap_or_default().to_string();
        debug!(%method, bytes = body.len(), "loopback request");
        let result = self.dispatch(&request.url, &form);
        self.requests.lock().push((method, form));

        Ok(match result {
            Ok(bytes) => HttpResponse::from_bytes(200, "OK", bytes),
            Err(SyncError::Unauthenticated) => HttpResponse::from_bytes(403, "Forbidden", Vec::new()),
            Err(SyncError::Remote(message)) => HttpResponse::from_bytes(
                200,
                "OK",
                serde_json::to_vec(&Envelope::<()>::error(message)).map_err(|e| e.to_string())?,
            ),
            Err(other) => HttpResponse::from_bytes(500, other.to_string(), Vec::new()),
        })
    }
}
