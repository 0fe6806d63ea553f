//! Local collaborators: the collection store and the media store.
//!
//! The syncers only talk to local data through these traits. Implementations
//! are expected to wrap a real database; [`crate::MemoryCollection`] and
//! [`crate::MemoryMedia`] are in-memory versions.

use flashsync_protocol::{Deck, DeckConfig, Grave, Model, Record, SanityCounts, Table, Usn};
use serde_json::{Map, Value};
use std::io::Read;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors reported by a local store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The underlying database failed.
    #[error("backend failure: {0}")]
    Backend(String),

    /// A transaction call was made in the wrong state.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Local data violates an invariant.
    #[error("corrupt local data: {0}")]
    Corrupt(String),

    /// File I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Version columns of an existing local row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowVersion {
    /// The `mod` column, `None` for revlog rows.
    pub modified: Option<i64>,
    /// The `usn` column.
    pub usn: Usn,
}

/// The local collection as seen by the collection syncer.
///
/// Everything between [`CollectionStore::begin_transaction`] and
/// [`CollectionStore::commit`] must be undone by [`CollectionStore::rollback`].
pub trait CollectionStore {
    /// Flushes pending writes and returns buried cards to their queues.
    ///
    /// Runs inside the sync transaction. Reclaimed cards are left pending and
    /// the collection modification time moves to at least `now_ms`, so the
    /// meta exchange sees local changes.
    fn prepare_for_sync(&mut self, now_ms: i64) -> StoreResult<()>;

    /// Starts the sync transaction.
    fn begin_transaction(&mut self) -> StoreResult<()>;

    /// Commits the sync transaction.
    fn commit(&mut self) -> StoreResult<()>;

    /// Discards the sync transaction.
    fn rollback(&mut self) -> StoreResult<()>;

    /// Collection modification time.
    fn modified(&self) -> StoreResult<i64>;

    /// Schema version.
    fn schema_version(&self) -> StoreResult<i64>;

    /// The usn counter: next usn the server will hand out as last seen.
    fn current_usn_counter(&self) -> StoreResult<Usn>;

    /// Graves with `usn == -1`.
    fn pending_graves(&self) -> StoreResult<Vec<Grave>>;

    /// Stamps all pending graves with `usn`.
    fn acknowledge_graves(&mut self, usn: Usn) -> StoreResult<()>;

    /// Deletes notes named by remote graves, recording the graves at `usn`.
    fn remove_notes(&mut self, ids: &[i64], usn: Usn) -> StoreResult<()>;

    /// Deletes cards named by remote graves, recording the graves at `usn`.
    fn remove_cards(&mut self, ids: &[i64], usn: Usn) -> StoreResult<()>;

    /// Deletes decks named by remote graves, recording the graves at `usn`.
    fn remove_decks(&mut self, ids: &[i64], usn: Usn) -> StoreResult<()>;

    /// All decks.
    fn all_decks(&self) -> StoreResult<Vec<Deck>>;

    /// All deck configs.
    fn all_deck_configs(&self) -> StoreResult<Vec<DeckConfig>>;

    /// All note types.
    fn all_models(&self) -> StoreResult<Vec<Model>>;

    /// All tags with their usn.
    fn all_tags(&self) -> StoreResult<Vec<(String, Usn)>>;

    /// Collection config.
    fn all_config(&self) -> StoreResult<Map<String, Value>>;

    /// Collection creation time.
    fn creation_time(&self) -> StoreResult<i64>;

    /// Inserts or replaces a deck.
    fn update_deck(&mut self, deck: Deck) -> StoreResult<()>;

    /// Inserts or replaces a deck config.
    fn update_deck_config(&mut self, config: DeckConfig) -> StoreResult<()>;

    /// Inserts or replaces a note type.
    fn update_model(&mut self, model: Model) -> StoreResult<()>;

    /// Registers tags, setting their usn.
    fn register_tags(&mut self, tags: &[String], usn: Usn) -> StoreResult<()>;

    /// Replaces the collection config.
    fn set_config(&mut self, config: Map<String, Value>) -> StoreResult<()>;

    /// Sets the collection creation time.
    fn set_creation_time(&mut self, crt: i64) -> StoreResult<()>;

    /// Rows in the change window starting at `usn`, ordered by id.
    ///
    /// `usn == -1` selects pending rows; any other value selects rows with
    /// `usn >= usn`. Only rows with id greater than `after_id` are returned,
    /// at most `limit` of them.
    fn query_rows_since(
        &self,
        table: Table,
        usn: Usn,
        after_id: Option<i64>,
        limit: usize,
    ) -> StoreResult<Vec<Record>>;

    /// Version columns of the row with `id`, if present.
    fn row_version(&self, table: Table, id: i64) -> StoreResult<Option<RowVersion>>;

    /// Inserts rows, replacing existing rows with the same id.
    fn insert_or_replace(&mut self, table: Table, rows: Vec<Record>) -> StoreResult<()>;

    /// Inserts rows whose id is not present yet.
    fn insert_if_absent(&mut self, table: Table, rows: Vec<Record>) -> StoreResult<()>;

    /// Sets the usn of the given rows.
    fn mark_acknowledged(&mut self, table: Table, ids: &[i64], usn: Usn) -> StoreResult<()>;

    /// Names the first kind of object still at `usn == -1`, if any.
    fn first_unsynced(&self) -> StoreResult<Option<String>>;

    /// The count vector compared by the sanity check.
    fn sanity_counts(&self) -> StoreResult<SanityCounts>;

    /// Records a finished sync: `mod` and last-sync time become `modified`,
    /// the usn counter becomes `next_usn`.
    fn finish_sync(&mut self, modified: i64, next_usn: Usn) -> StoreResult<()>;
}

/// State of one media file as tracked locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRecord {
    /// File name.
    pub fname: String,
    /// Checksum, `None` once the file was deleted.
    pub checksum: Option<String>,
    /// True if changed since the last sync.
    pub dirty: bool,
}

/// The local media folder and its change log.
pub trait MediaStore {
    /// Picks up files changed outside the app. Called once before each media sync.
    fn scan_if_needed(&mut self) -> StoreResult<()> {
        Ok(())
    }

    /// Usn of the last applied remote change.
    fn last_usn(&self) -> StoreResult<Usn>;

    /// Sets the usn watermark.
    fn set_last_usn(&mut self, usn: Usn) -> StoreResult<()>;

    /// The record for a file, if tracked.
    fn record(&self, fname: &str) -> StoreResult<Option<MediaRecord>>;

    /// Number of dirty records.
    fn dirty_count(&self) -> StoreResult<u64>;

    /// Up to `limit` dirty records, oldest first.
    fn dirty_records(&self, limit: usize) -> StoreResult<Vec<MediaRecord>>;

    /// Clears the dirty flag. Records without a checksum are forgotten.
    fn mark_clean(&mut self, fnames: &[String]) -> StoreResult<()>;

    /// Deletes a file and its record on remote request.
    fn sync_delete(&mut self, fname: &str) -> StoreResult<()>;

    /// Opens a file for reading, `None` if it is gone.
    fn open_file(&self, fname: &str) -> StoreResult<Option<Box<dyn Read + '_>>>;

    /// Writes a file received from the remote, replacing any existing one.
    fn write_file(&mut self, fname: &str, data: &mut dyn Read) -> StoreResult<u64>;

    /// Records a file received from the remote as clean with `checksum`.
    fn add_synced(&mut self, fname: &str, checksum: &str) -> StoreResult<()>;

    /// Turns a dirty record whose file vanished into a pending deletion.
    fn mark_missing(&mut self, fname: &str) -> StoreResult<()>;

    /// Number of files present.
    fn media_count(&self) -> StoreResult<u64>;

    /// Forgets the watermark so the next sync compares every file.
    fn force_resync(&mut self) -> StoreResult<()>;
}
