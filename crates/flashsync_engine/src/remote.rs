//! Typed remote operations and their HTTP implementations.

use crate::error::{SyncError, SyncResult};
use crate::http::{HttpClient, Transport};
use flashsync_protocol::{
    ApplyChangesRequest, ApplyChunkRequest, Changes, Chunk, DownloadFilesRequest, Envelope,
    Graves, HostKeyRequest, HostKeyResponse, MediaChange, MediaChangesRequest,
    MediaSanityRequest, MediaSession, MetaRequest, MetaResponse, SanityCounts, StartRequest,
    UploadResult, Usn,
};
use serde_json::{json, Value};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::debug;

/// The collection endpoints of the remote.
pub trait CollectionRemote {
    /// Exchanges credentials for a host key.
    fn host_key(&self, user: &str, password: &str) -> SyncResult<String>;

    /// Fetches the remote collection summary.
    fn meta(&self, request: &MetaRequest) -> SyncResult<MetaResponse>;

    /// Starts the session, sending local graves and receiving remote ones.
    fn start(&self, request: &StartRequest) -> SyncResult<Graves>;

    /// Exchanges small-object changes.
    fn apply_changes(&self, changes: &Changes) -> SyncResult<Changes>;

    /// Fetches the next chunk of remote rows.
    fn chunk(&self) -> SyncResult<Chunk>;

    /// Sends a chunk of local rows.
    fn apply_chunk(&self, chunk: &Chunk) -> SyncResult<()>;

    /// Fetches the remote count vector.
    fn sanity_check(&self) -> SyncResult<SanityCounts>;

    /// Finishes the session, returning the new modification time.
    fn finish(&self) -> SyncResult<i64>;

    /// Abandons the session.
    fn abort(&self) -> SyncResult<()>;

    /// Replaces the remote collection with the given file.
    fn upload(&self, collection: &mut dyn Read) -> SyncResult<()>;

    /// Streams the remote collection file into `out`.
    fn download(&self, out: &mut dyn Write) -> SyncResult<u64>;
}

/// The media endpoints of the remote.
pub trait MediaRemote {
    /// Starts a media session.
    fn begin(&self) -> SyncResult<MediaSession>;

    /// Remote media log entries after `last_usn`, oldest first.
    fn media_changes(&self, last_usn: Usn) -> SyncResult<Vec<MediaChange>>;

    /// Downloads a zip of the named files.
    fn download_files(&self, files: &[String]) -> SyncResult<File>;

    /// Uploads a zip of local changes.
    fn upload_changes(&self, zip: File) -> SyncResult<UploadResult>;

    /// Compares the remote media count against `local_count`.
    fn media_sanity(&self, local_count: u64) -> SyncResult<String>;
}

/// Reply of a successful full upload.
const UPLOAD_OK: &str = "OK";

/// [`CollectionRemote`] over HTTP.
pub struct RemoteServer<C: HttpClient> {
    transport: Transport<C>,
}

impl<C: HttpClient> RemoteServer<C> {
    /// Creates a remote over `transport`. Its post vars should carry `k` and `s`.
    pub fn new(transport: Transport<C>) -> Self {
        Self { transport }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Transport<C> {
        &self.transport
    }

    fn call<T: serde::de::DeserializeOwned>(&self, method: &str, body: &Value) -> SyncResult<T> {
        let text = self.transport.post_json(method, body, true)?;
        debug!(method, bytes = text.len(), "response received");
        Ok(Envelope::<T>::decode(&text)?)
    }
}

impl<C: HttpClient> CollectionRemote for RemoteServer<C> {
    fn host_key(&self, user: &str, password: &str) -> SyncResult<String> {
        let request = HostKeyRequest {
            u: user.to_string(),
            p: password.to_string(),
        };
        let text = self.transport.post_json("hostKey", &request, false)?;
        let response: HostKeyResponse = Envelope::decode(&text)?;
        Ok(response.key)
    }

    fn meta(&self, request: &MetaRequest) -> SyncResult<MetaResponse> {
        self.call("meta", &serde_json::to_value(request)?)
    }

    fn start(&self, request: &StartRequest) -> SyncResult<Graves> {
        self.call("start", &serde_json::to_value(request)?)
    }

    fn apply_changes(&self, changes: &Changes) -> SyncResult<Changes> {
        let request = ApplyChangesRequest {
            changes: changes.clone(),
        };
        self.call("applyChanges", &serde_json::to_value(&request)?)
    }

    fn chunk(&self) -> SyncResult<Chunk> {
        self.call("chunk", &json!({}))
    }

    fn apply_chunk(&self, chunk: &Chunk) -> SyncResult<()> {
        let request = ApplyChunkRequest {
            chunk: chunk.clone(),
        };
        let text = self.transport.post_json("applyChunk", &request, true)?;
        let envelope: Envelope<Value> = serde_json::from_str(&text)?;
        Ok(envelope.into_ack()?)
    }

    fn sanity_check(&self) -> SyncResult<SanityCounts> {
        let text = self.transport.post_json("sanityCheck", &json!({}), true)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn finish(&self) -> SyncResult<i64> {
        let text = self.transport.post_json("finish", &json!({}), true)?;
        text.trim()
            .parse()
            .map_err(|_| SyncError::Protocol(format!("finish returned {text:?}")))
    }

    fn abort(&self) -> SyncResult<()> {
        self.transport.post_json("abort", &json!({}), true)?;
        Ok(())
    }

    fn upload(&self, collection: &mut dyn Read) -> SyncResult<()> {
        let level = self.transport.compression_level();
        let response = self.transport.request("upload", Some(collection), level, true)?;
        let text = self.transport.read_text(response)?;
        if text.trim() == UPLOAD_OK {
            Ok(())
        } else {
            Err(SyncError::Remote(text))
        }
    }

    fn download(&self, out: &mut dyn Write) -> SyncResult<u64> {
        let level = self.transport.compression_level();
        let response = self.transport.request("download", None, level, true)?;
        self.transport.copy_to(response, out)
    }
}

/// [`MediaRemote`] over HTTP.
///
/// `begin` authenticates with the host key; later calls carry the media
/// session key `sk` it returns.
pub struct RemoteMediaServer<C: HttpClient> {
    transport: Transport<C>,
    host_key: String,
    client_version: String,
}

impl<C: HttpClient> RemoteMediaServer<C> {
    /// Creates a media remote over `transport`.
    pub fn new(
        transport: Transport<C>,
        host_key: impl Into<String>,
        client_version: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            host_key: host_key.into(),
            client_version: client_version.into(),
        }
    }

    fn call<T: serde::de::DeserializeOwned>(&self, method: &str, body: &Value) -> SyncResult<T> {
        let text = self.transport.post_json(method, body, true)?;
        Ok(Envelope::<T>::decode(&text)?)
    }
}

impl<C: HttpClient> MediaRemote for RemoteMediaServer<C> {
    fn begin(&self) -> SyncResult<MediaSession> {
        self.transport.set_post_vars(vec![
            ("k".into(), self.host_key.clone()),
            ("v".into(), self.client_version.clone()),
        ]);
        let session: MediaSession = self.call("begin", &json!({}))?;
        self.transport
            .set_post_vars(vec![("sk".into(), session.sk.clone())]);
        Ok(session)
    }

    fn media_changes(&self, last_usn: Usn) -> SyncResult<Vec<MediaChange>> {
        self.call(
            "mediaChanges",
            &serde_json::to_value(MediaChangesRequest { last_usn })?,
        )
    }

    fn download_files(&self, files: &[String]) -> SyncResult<File> {
        let request = DownloadFilesRequest {
            files: files.to_vec(),
        };
        let bytes = serde_json::to_vec(&request)?;
        let mut payload: &[u8] = &bytes;
        let level = self.transport.compression_level();
        let response = self
            .transport
            .request("downloadFiles", Some(&mut payload), level, true)?;
        let mut zip = tempfile::tempfile()?;
        self.transport.copy_to(response, &mut zip)?;
        zip.seek(SeekFrom::Start(0))?;
        Ok(zip)
    }

    fn upload_changes(&self, mut zip: File) -> SyncResult<UploadResult> {
        let response = self
            .transport
            .request("uploadChanges", Some(&mut zip), 0, true)?;
        let text = self.transport.read_text(response)?;
        Ok(Envelope::<UploadResult>::decode(&text)?)
    }

    fn media_sanity(&self, local_count: u64) -> SyncResult<String> {
        self.call(
            "mediaSanity",
            &serde_json::to_value(MediaSanityRequest { local: local_count })?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, SystemClock};
    use crate::collection::CollectionSyncer;
    use crate::config::SyncConfig;
    use crate::http::tests::{json_payload, ExhaustedBody, ScriptedClient};
    use crate::memory::MemoryCollection;
    use crate::outcome::SyncOutcome;
    use crate::progress::Monitor;
    use flashsync_protocol::UNSYNCED_USN;
    use std::sync::Arc;

    fn remote(client: Arc<ScriptedClient>) -> RemoteServer<ScriptedClient> {
        let transport = Transport::new(client, "https://example.com/sync/", Monitor::detached());
        transport.set_post_vars(vec![("k".into(), "key".into()), ("s".into(), "sess".into())]);
        RemoteServer::new(transport)
    }

    #[test]
    fn meta_decodes_envelope() {
        let client = Arc::new(ScriptedClient::default());
        client.respond(
            200,
            r#"{"data":{"mod":5,"scm":1,"usn":3,"ts":100,"musn":2,"msg":"hi","cont":true},"err":""}"#,
        );
        let meta = remote(client.clone())
            .meta(&MetaRequest::new("test,1"))
            .unwrap();
        assert_eq!(meta.usn, 3);
        assert_eq!(meta.msg, "hi");

        let requests = client.requests.lock();
        assert!(requests[0].url.ends_with("/sync/meta"));
        assert_eq!(json_payload(&requests[0].body)["cv"], "test,1");
    }

    #[test]
    fn error_envelope_becomes_remote_error() {
        let client = Arc::new(ScriptedClient::default());
        client.respond(200, r#"{"data":null,"err":"collection locked"}"#);
        let err = remote(client).chunk().unwrap_err();
        assert!(matches!(err, SyncError::Remote(ref m) if m == "collection locked"));
    }

    #[test]
    fn bare_finish_and_sanity_bodies() {
        let client = Arc::new(ScriptedClient::default());
        client.respond(200, "[[0,0,0],1,1,0,0,1,1,1]");
        client.respond(200, "1700000000000");
        client.respond(200, "oops");
        let remote = remote(client);
        assert_eq!(remote.sanity_check().unwrap().cards, 1);
        assert_eq!(remote.finish().unwrap(), 1_700_000_000_000);
        assert!(matches!(remote.finish(), Err(SyncError::Protocol(_))));
    }

    #[test]
    fn exhausted_chunk_body_rolls_back_the_sync() {
        let client = Arc::new(ScriptedClient::default());
        let now = SystemClock.now_secs();
        client.respond(
            200,
            format!(
                r#"{{"data":{{"mod":1000,"scm":0,"usn":0,"ts":{now},"musn":0,"msg":"","cont":true}},"err":""}}"#
            ),
        );
        client.respond(200, r#"{"data":{"cards":[],"notes":[],"decks":[]},"err":""}"#);
        client.respond(200, r#"{"data":{"models":[],"decks":[[],[]],"tags":[]},"err":""}"#);
        client.respond_with(200, ExhaustedBody);
        client.respond(200, "");

        let mut store = MemoryCollection::default();
        store.state_mut().modified = 2_000;
        store.state_mut().tags.insert("verb".into(), UNSYNCED_USN);
        let before = store.state().clone();

        let remote = remote(client.clone());
        let config = SyncConfig::default();
        let outcome = CollectionSyncer::new(&remote, &mut store, &config).sync();
        assert!(matches!(outcome, SyncOutcome::ResourceExhausted(_)));
        assert!(!outcome.is_retryable());
        assert_eq!(store.state(), &before);
        assert!(!store.in_transaction());

        let requests = client.requests.lock();
        let methods: Vec<_> = requests
            .iter()
            .filter_map(|r| r.url.rsplit('/').next())
            .collect();
        assert_eq!(methods, ["meta", "start", "applyChanges", "chunk", "abort"]);
    }

    #[test]
    fn host_key_is_sent_without_session_fields() {
        let client = Arc::new(ScriptedClient::default());
        client.respond(200, r#"{"data":{"key":"abc"},"err":""}"#);
        let key = remote(client.clone()).host_key("user", "pass").unwrap();
        assert_eq!(key, "abc");
        let requests = client.requests.lock();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(!body.contains("name=\"k\""));
        assert_eq!(json_payload(&requests[0].body)["u"], "user");
    }

    #[test]
    fn upload_expects_ok() {
        let client = Arc::new(ScriptedClient::default());
        client.respond(200, "OK");
        client.respond(200, "storage full");
        let remote = remote(client);
        let mut data: &[u8] = b"collection";
        remote.upload(&mut data).unwrap();
        let mut data: &[u8] = b"collection";
        assert!(matches!(remote.upload(&mut data), Err(SyncError::Remote(_))));
    }

    #[test]
    fn media_begin_switches_to_session_key() {
        let client = Arc::new(ScriptedClient::default());
        client.respond(200, r#"{"data":{"sk":"media-sk","usn":4},"err":""}"#);
        client.respond(200, r#"{"data":[["a.png",5,"abc"]],"err":""}"#);
        let transport =
            Transport::new(client.clone(), "https://example.com/msync/", Monitor::detached());
        let media = RemoteMediaServer::new(transport, "hk", "test,1");

        let session = media.begin().unwrap();
        assert_eq!(session.usn, 4);
        let changes = media.media_changes(0).unwrap();
        assert_eq!(changes[0].fname(), "a.png");

        let requests = client.requests.lock();
        let begin = String::from_utf8_lossy(&requests[0].body);
        assert!(begin.contains("name=\"k\"\r\n\r\nhk\r\n"));
        let later = String::from_utf8_lossy(&requests[1].body);
        assert!(later.contains("name=\"sk\"\r\n\r\nmedia-sk\r\n"));
        assert!(!later.contains("name=\"k\""));
    }
}
