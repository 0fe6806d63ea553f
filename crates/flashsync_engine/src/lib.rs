//! # flashsync engine
//!
//! Incremental sync client for a flashcard collection and its media.
//!
//! This crate provides:
//! - Multipart HTTP transport with gzip payloads, progress and cancellation
//! - Typed remote clients for the collection and media endpoints
//! - The collection syncer (meta, graves, small objects, chunks, sanity, finish)
//! - The media syncer (change log pull, zip push, sanity)
//! - Store traits with in-memory implementations
//!
//! ## Architecture
//!
//! A [`SyncClient`] owns the account state (host key, session id, byte
//! counters). Each call builds a [`RemoteServer`] or [`RemoteMediaServer`]
//! over a [`Transport`] and hands it to a [`CollectionSyncer`] or
//! [`MediaSyncer`] together with the caller's store.
//!
//! ## Key Invariants
//!
//! - A collection sync runs inside one store transaction, committed only on success
//! - Every local row sent is stamped with the server's usn
//! - Remote deletions are applied before any object exchange
//! - The media watermark only moves after a whole change page was applied
//! - Nothing is retried implicitly except the media restart after a usn race

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checksum;
mod client;
mod clock;
mod collection;
mod config;
mod error;
mod http;
mod media;
mod media_bundle;
mod memory;
mod outcome;
mod progress;
mod remote;
mod state;
mod store;

pub use checksum::{checksum, checksum_reader, HashingReader};
pub use client::SyncClient;
pub use clock::{Clock, FixedClock, SystemClock};
pub use collection::CollectionSyncer;
pub use config::{SyncConfig, DEFAULT_BASE_URL};
pub use error::{SyncError, SyncResult};
pub use http::{HttpClient, HttpRequest, HttpResponse, ReqwestClient, Transport, BOUNDARY};
pub use media::MediaSyncer;
pub use media_bundle::{
    build_upload, extract_download, read_upload, write_download, BundleLimits, UploadBundle,
};
pub use memory::{CollectionState, MemoryCollection, MemoryMedia, CARD_QUEUE_INDEX, CARD_TYPE_INDEX};
pub use outcome::SyncOutcome;
pub use progress::{
    CancellationToken, Monitor, NoProgress, ProgressReader, ProgressSink, TransferCancelled,
    TransferCounters,
};
pub use remote::{CollectionRemote, MediaRemote, RemoteMediaServer, RemoteServer};
pub use state::{LocalMeta, SessionState, SyncPhase, SyncStats};
pub use store::{
    CollectionStore, MediaRecord, MediaStore, RowVersion, StoreError, StoreResult,
};
