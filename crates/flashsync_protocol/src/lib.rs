//! # flashsync protocol
//!
//! Wire types for the flashcard collection and media sync protocols.
//!
//! This crate provides:
//! - `Record` and `Table` for the streamed tables (revlog, cards, notes)
//! - `Graves` for deletions
//! - Small objects (`Deck`, `DeckConfig`, `Model`) that round-trip unknown keys
//! - Collection messages (`MetaResponse`, `StartRequest`, `Changes`, `Chunk`,
//!   `SanityCounts`) and the `{data, err}` `Envelope`
//! - Media messages (`MediaSession`, `MediaChange`, zip manifests)
//! - Merge policies (`remote_wins`, `classify_media`)
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod graves;
mod media;
mod merge;
mod messages;
mod objects;
mod record;

pub use error::{ProtocolError, ProtocolResult};
pub use graves::{Grave, Graves, ObjectKind};
pub use media::{
    DownloadFilesRequest, DownloadManifest, MediaChange, MediaChangesRequest, MediaSanityRequest,
    MediaSession, UploadManifest, UploadResult, MEDIA_SANITY_OK, ZIP_META_ENTRY,
};
pub use merge::{classify_media, remote_wins, MediaAction};
pub use messages::{
    ApplyChangesRequest, ApplyChunkRequest, Changes, Chunk, Envelope, HostKeyRequest,
    HostKeyResponse, MetaRequest, MetaResponse, SanityCounts, StartRequest, SYNC_VERSION,
};
pub use objects::{Deck, DeckConfig, Model, Versioned};
pub use record::{Field, Record, Table, Usn, UNSYNCED_USN};
