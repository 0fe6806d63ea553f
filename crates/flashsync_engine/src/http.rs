//! HTTP transport implementation.
//!
//! Every request is a multipart POST with a compression flag `c`, the session
//! fields (`k`, `s` or `sk`) and an optional `data` part. The body is staged in
//! an unnamed scratch file so large payloads never sit in memory, then
//! streamed to the [`HttpClient`] while the [`Monitor`] counts bytes.

use crate::error::{SyncError, SyncResult};
use crate::progress::{is_cancellation, Monitor};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Multipart boundary expected by the sync service.
pub const BOUNDARY: &str = "Anki-sync-boundary";

/// A request handed to the [`HttpClient`].
pub struct HttpRequest {
    /// Full endpoint URL.
    pub url: String,
    /// Value of the `Content-Type` header.
    pub content_type: String,
    /// Exact body length in bytes.
    pub content_length: u64,
    /// Streamed body.
    pub body: Box<dyn Read + Send>,
}

/// A response returned by the [`HttpClient`].
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Reason phrase.
    pub reason: String,
    /// Streamed body.
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    /// Creates a response from an in-memory body.
    pub fn from_bytes(status: u16, reason: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            reason: reason.into(),
            body: Box::new(io::Cursor::new(body.into())),
        }
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to route requests through a different HTTP stack,
/// or to answer them in-process in tests.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request. Errors are connection-level failures only;
    /// non-200 statuses are returned as responses.
    fn post(&self, request: HttpRequest) -> Result<HttpResponse, String>;
}

/// [`HttpClient`] backed by `reqwest`'s blocking client.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

impl ReqwestClient {
    /// Creates a client with the given request timeout.
    pub fn new(timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::transport_fatal(e.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    fn post(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        let response = self
            .client
            .post(&request.url)
            .header(reqwest::header::CONTENT_TYPE, request.content_type)
            .body(reqwest::blocking::Body::sized(
                request.body,
                request.content_length,
            ))
            .send()
            .map_err(|e| e.to_string())?;
        let status = response.status();
        Ok(HttpResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            body: Box::new(response),
        })
    }
}

impl<C: HttpClient + ?Sized> HttpClient for Arc<C> {
    fn post(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        (**self).post(request)
    }
}

/// Sends multipart requests to one endpoint prefix.
pub struct Transport<C: HttpClient> {
    client: Arc<C>,
    base_url: String,
    post_vars: RwLock<Vec<(String, String)>>,
    monitor: Monitor,
    compression_level: u32,
    buffer_size: usize,
    scratch_dir: Option<PathBuf>,
}

impl<C: HttpClient> Transport<C> {
    /// Creates a transport posting to `<base_url><method>`.
    pub fn new(client: Arc<C>, base_url: impl Into<String>, monitor: Monitor) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            post_vars: RwLock::new(Vec::new()),
            monitor,
            compression_level: 6,
            buffer_size: 64 * 1024,
            scratch_dir: None,
        }
    }

    /// Sets the gzip level used by [`Transport::post_json`].
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    /// Sets the copy buffer size.
    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes.max(1);
        self
    }

    /// Stages request bodies under `dir` instead of the system temp dir.
    pub fn with_scratch_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.scratch_dir = dir;
        self
    }

    /// Replaces the session fields sent with keyed requests.
    pub fn set_post_vars(&self, vars: Vec<(String, String)>) {
        *self.post_vars.write() = vars;
    }

    /// Returns the session fields.
    pub fn post_vars(&self) -> Vec<(String, String)> {
        self.post_vars.read().clone()
    }

    /// Returns the endpoint prefix.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the progress monitor.
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Performs one request and returns the 200 response.
    ///
    /// A 403 maps to [`SyncError::Unauthenticated`], any other non-200 to
    /// [`SyncError::Server`].
    #[instrument(skip(self, payload), fields(url = %self.base_url, has_payload = payload.is_some()))]
    pub fn request(
        &self,
        method: &str,
        payload: Option<&mut dyn Read>,
        compression: u32,
        include_session_key: bool,
    ) -> SyncResult<HttpResponse> {
        self.monitor.check_cancelled()?;

        let mut scratch = match &self.scratch_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        let content_length =
            self.write_body(&mut scratch, payload, compression, include_session_key)?;
        debug!(content_length, "request body staged");

        self.monitor.check_cancelled()?;
        let request = HttpRequest {
            url: format!("{}{}", self.base_url, method),
            content_type: format!("multipart/form-data; boundary={BOUNDARY}"),
            content_length,
            body: Box::new(self.monitor.upload(scratch)),
        };
        let response = self.client.post(request).map_err(|e| {
            if self.monitor.cancel_token().is_cancelled() {
                SyncError::Cancelled
            } else {
                SyncError::transport_retryable(e)
            }
        })?;

        match response.status {
            200 => Ok(response),
            403 => Err(SyncError::Unauthenticated),
            code => Err(SyncError::Server {
                code,
                reason: response.reason,
            }),
        }
    }

    /// Posts `body` as JSON and returns the response text.
    pub fn post_json<T: Serialize + ?Sized>(
        &self,
        method: &str,
        body: &T,
        include_session_key: bool,
    ) -> SyncResult<String> {
        let bytes = serde_json::to_vec(body)?;
        let mut payload: &[u8] = &bytes;
        let response = self.request(
            method,
            Some(&mut payload),
            self.compression_level,
            include_session_key,
        )?;
        self.read_text(response)
    }

    /// The gzip level used for JSON payloads.
    pub fn compression_level(&self) -> u32 {
        self.compression_level
    }

    /// Reads a whole response body as UTF-8.
    pub fn read_text(&self, response: HttpResponse) -> SyncResult<String> {
        let mut reader = self.monitor.download(response.body);
        let mut bytes: Vec<u8> = Vec::new();
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let n = reader.read(&mut buf).map_err(network_error)?;
            if n == 0 {
                break;
            }
            bytes
                .try_reserve(n)
                .map_err(|e| SyncError::ResourceExhausted(e.to_string()))?;
            bytes.extend_from_slice(&buf[..n]);
        }
        String::from_utf8(bytes)
            .map_err(|e| SyncError::Protocol(format!("response is not UTF-8: {e}")))
    }

    /// Streams a response body into `out`, returning the byte count.
    pub fn copy_to(&self, response: HttpResponse, out: &mut dyn Write) -> SyncResult<u64> {
        let mut reader = self.monitor.download(response.body);
        let mut buf = vec![0u8; self.buffer_size];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).map_err(network_error)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            total += n as u64;
        }
        out.flush()?;
        Ok(total)
    }

    fn write_body(
        &self,
        file: &mut File,
        payload: Option<&mut dyn Read>,
        compression: u32,
        include_session_key: bool,
    ) -> SyncResult<u64> {
        {
            let mut out = BufWriter::with_capacity(self.buffer_size, &mut *file);
            write_field(&mut out, "c", if compression > 0 { "1" } else { "0" })?;
            if include_session_key {
                for (name, value) in self.post_vars.read().iter() {
                    write_field(&mut out, name, value)?;
                }
            }
            if let Some(payload) = payload {
                write!(
                    out,
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"data\"; filename=\"data\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )?;
                if compression > 0 {
                    let mut encoder = GzEncoder::new(&mut out, Compression::new(compression.min(9)));
                    self.pump(payload, &mut encoder)?;
                    encoder.finish()?;
                } else {
                    self.pump(payload, &mut out)?;
                }
                out.write_all(b"\r\n")?;
            }
            write!(out, "--{BOUNDARY}--\r\n")?;
            out.flush()?;
        }
        let length = file.stream_position()?;
        file.seek(SeekFrom::Start(0))?;
        Ok(length)
    }

    fn pump(&self, from: &mut dyn Read, to: &mut dyn Write) -> SyncResult<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let n = from.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            to.write_all(&buf[..n])?;
            self.monitor.check_cancelled()?;
        }
    }
}

fn write_field(out: &mut impl Write, name: &str, value: &str) -> io::Result<()> {
    write!(
        out,
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
    )
}

fn network_error(err: io::Error) -> SyncError {
    if is_cancellation(&err) {
        SyncError::Cancelled
    } else if err.kind() == io::ErrorKind::OutOfMemory {
        SyncError::ResourceExhausted(err.to_string())
    } else {
        SyncError::transport_retryable(err.to_string())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// A captured request: URL and full body.
    pub(crate) struct Captured {
        pub url: String,
        pub body: Vec<u8>,
    }

    /// Answers with queued responses and records every request.
    #[derive(Default)]
    pub(crate) struct ScriptedClient {
        pub requests: Mutex<Vec<Captured>>,
        pub responses: Mutex<VecDeque<(u16, Box<dyn Read + Send>)>>,
    }

    impl ScriptedClient {
        pub fn respond(&self, status: u16, body: impl Into<Vec<u8>>) {
            self.respond_with(status, io::Cursor::new(body.into()));
        }

        /// Queues a response whose body is read from `body`.
        pub fn respond_with(&self, status: u16, body: impl Read + Send + 'static) {
            self.responses.lock().push_back((status, Box::new(body)));
        }
    }

    /// A body whose first read fails with `OutOfMemory`.
    pub(crate) struct ExhaustedBody;

    impl Read for ExhaustedBody {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::OutOfMemory, "allocation failed"))
        }
    }

    impl HttpClient for ScriptedClient {
        fn post(&self, mut request: HttpRequest) -> Result<HttpResponse, String> {
            let mut body = Vec::new();
            request.body.read_to_end(&mut body).map_err(|e| e.to_string())?;
            assert_eq!(body.len() as u64, request.content_length);
            self.requests.lock().push(Captured {
                url: request.url,
                body,
            });
            let (status, body) = self
                .responses
                .lock()
                .pop_front()
                .ok_or_else(|| "connection refused".to_string())?;
            Ok(HttpResponse {
                status,
                reason: "Scripted".into(),
                body,
            })
        }
    }

    /// Extracts the `data` part of a captured multipart body.
    pub(crate) fn data_part(body: &[u8]) -> Option<Vec<u8>> {
        let header = b"Content-Type: application/octet-stream\r\n\r\n";
        let trailer = format!("\r\n--{BOUNDARY}--\r\n");
        let start = find(body, header)? + header.len();
        let end = body.len().checked_sub(trailer.len())?;
        Some(body[start..end].to_vec())
    }

    /// Gunzips the `data` part of a captured body.
    pub(crate) fn json_payload(body: &[u8]) -> serde_json::Value {
        let data = data_part(body).expect("data part");
        let mut text = String::new();
        GzDecoder::new(&data[..]).read_to_string(&mut text).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    fn transport(client: Arc<ScriptedClient>) -> Transport<ScriptedClient> {
        let transport = Transport::new(client, "https://example.com/sync/", Monitor::detached());
        transport.set_post_vars(vec![
            ("k".into(), "hostkey".into()),
            ("s".into(), "1a2b3c4d".into()),
        ]);
        transport
    }

    #[test]
    fn multipart_fields_and_gzip_payload() {
        let client = Arc::new(ScriptedClient::default());
        client.respond(200, r#"{"data":1,"err":""}"#);
        let transport = transport(client.clone());

        let text = transport
            .post_json("meta", &serde_json::json!({"v": 8}), true)
            .unwrap();
        assert_eq!(text, r#"{"data":1,"err":""}"#);

        let requests = client.requests.lock();
        assert_eq!(requests[0].url, "https://example.com/sync/meta");
        let body = String::from_utf8_lossy(&requests[0].body).to_string();
        assert!(body.starts_with(
            "--Anki-sync-boundary\r\nContent-Disposition: form-data; name=\"c\"\r\n\r\n1\r\n"
        ));
        assert!(body.contains("name=\"k\"\r\n\r\nhostkey\r\n"));
        assert!(body.contains("name=\"s\"\r\n\r\n1a2b3c4d\r\n"));
        assert!(body.contains("name=\"data\"; filename=\"data\""));
        assert_eq!(json_payload(&requests[0].body)["v"], 8);
    }

    #[test]
    fn uncompressed_payload_without_keys() {
        let client = Arc::new(ScriptedClient::default());
        client.respond(200, "OK");
        let transport = transport(client.clone());

        let mut payload: &[u8] = b"raw bytes";
        let response = transport
            .request("upload", Some(&mut payload), 0, false)
            .unwrap();
        assert_eq!(transport.read_text(response).unwrap(), "OK");

        let requests = client.requests.lock();
        let body = &requests[0].body;
        assert_eq!(data_part(body).unwrap(), b"raw bytes");
        let text = String::from_utf8_lossy(body);
        assert!(text.contains("name=\"c\"\r\n\r\n0\r\n"));
        assert!(!text.contains("hostkey"));
    }

    #[test]
    fn counters_track_both_directions() {
        let client = Arc::new(ScriptedClient::default());
        client.respond(200, vec![b'x'; 5000]);
        let transport = transport(client.clone());

        let response = transport.request("chunk", None, 6, true).unwrap();
        let text = transport.read_text(response).unwrap();
        assert_eq!(text.len(), 5000);

        let sent = client.requests.lock()[0].body.len() as u64;
        let counters = transport.monitor().counters();
        assert_eq!(counters.sent(), sent);
        assert_eq!(counters.received(), 5000);
    }

    #[test]
    fn status_mapping() {
        let client = Arc::new(ScriptedClient::default());
        client.respond(403, "");
        client.respond(500, "");
        let transport = transport(client);

        assert!(matches!(
            transport.request("meta", None, 0, true),
            Err(SyncError::Unauthenticated)
        ));
        assert!(matches!(
            transport.request("meta", None, 0, true),
            Err(SyncError::Server { code: 500, .. })
        ));
        assert!(matches!(
            transport.request("meta", None, 0, true),
            Err(SyncError::Transport { retryable: true, .. })
        ));
    }

    #[test]
    fn exhausted_body_is_resource_exhausted() {
        let client = Arc::new(ScriptedClient::default());
        client.respond_with(200, ExhaustedBody);
        let transport = transport(client);
        assert!(matches!(
            transport.post_json("chunk", &serde_json::json!({}), true),
            Err(SyncError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn cancelled_before_send() {
        let client = Arc::new(ScriptedClient::default());
        let transport = transport(client.clone());
        transport.monitor().cancel_token().cancel();
        assert!(matches!(
            transport.request("meta", None, 0, true),
            Err(SyncError::Cancelled)
        ));
        assert!(client.requests.lock().is_empty());
    }

    #[test]
    fn scratch_dir_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::default());
        client.respond(200, "1");
        let transport = transport(client).with_scratch_dir(Some(dir.path().to_path_buf()));
        let response = transport.request("finish", None, 0, true).unwrap();
        assert_eq!(transport.read_text(response).unwrap(), "1");
        // unnamed scratch files leave nothing behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
