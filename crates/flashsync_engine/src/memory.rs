//! In-memory stores.
//!
//! [`CollectionState`] holds a whole collection; [`MemoryCollection`] wraps it
//! with snapshot transactions to implement [`CollectionStore`].
//! [`MemoryMedia`] implements [`MediaStore`] over a map of file contents.

use crate::checksum::checksum;
use crate::store::{
    CollectionStore, MediaRecord, MediaStore, RowVersion, StoreError, StoreResult,
};
use flashsync_protocol::{
    Deck, DeckConfig, Grave, Model, ObjectKind, Record, SanityCounts, Table, Usn, Versioned,
    UNSYNCED_USN,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Read;

/// Index of the `type` column of a card row.
pub const CARD_TYPE_INDEX: usize = 6;
/// Index of the `queue` column of a card row.
pub const CARD_QUEUE_INDEX: usize = 7;

/// Everything a collection holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionState {
    /// Modification time.
    pub modified: i64,
    /// Time of the last successful sync.
    pub last_sync: i64,
    /// Schema version.
    pub scm: i64,
    /// Usn counter.
    pub usn: Usn,
    /// Creation time.
    pub crt: i64,
    /// Cards by id.
    pub cards: BTreeMap<i64, Record>,
    /// Notes by id.
    pub notes: BTreeMap<i64, Record>,
    /// Review log by id.
    pub revlog: BTreeMap<i64, Record>,
    /// Deletion records.
    pub graves: Vec<Grave>,
    /// Decks by id.
    pub decks: BTreeMap<i64, Deck>,
    /// Deck configs by id.
    pub deck_configs: BTreeMap<i64, DeckConfig>,
    /// Note types by id.
    pub models: BTreeMap<i64, Model>,
    /// Tags and their usn.
    pub tags: BTreeMap<String, Usn>,
    /// Collection config.
    pub config: Map<String, Value>,
}

impl CollectionState {
    /// Rows of a table.
    pub fn rows(&self, table: Table) -> &BTreeMap<i64, Record> {
        match table {
            Table::Revlog => &self.revlog,
            Table::Cards => &self.cards,
            Table::Notes => &self.notes,
        }
    }

    /// Mutable rows of a table.
    pub fn rows_mut(&mut self, table: Table) -> &mut BTreeMap<i64, Record> {
        match table {
            Table::Revlog => &mut self.revlog,
            Table::Cards => &mut self.cards,
            Table::Notes => &mut self.notes,
        }
    }

    /// Rows in the change window starting at `usn`; see
    /// [`CollectionStore::query_rows_since`].
    pub fn rows_since(
        &self,
        table: Table,
        usn: Usn,
        after_id: Option<i64>,
        limit: usize,
    ) -> Vec<Record> {
        let lower = after_id.map_or(i64::MIN, |id| id.saturating_add(1));
        self.rows(table)
            .range(lower..)
            .map(|(_, row)| row)
            .filter(|row| {
                let row_usn = table.usn_of(row).unwrap_or(UNSYNCED_USN);
                if usn == UNSYNCED_USN {
                    row_usn == UNSYNCED_USN
                } else {
                    row_usn >= usn
                }
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// Deletes objects without creating graves.
    pub fn remove_objects(&mut self, kind: ObjectKind, ids: &[i64]) {
        for id in ids {
            match kind {
                ObjectKind::Note => {
                    self.notes.remove(id);
                }
                ObjectKind::Card => {
                    self.cards.remove(id);
                }
                ObjectKind::Deck => {
                    self.decks.remove(id);
                }
            }
        }
    }

    /// Deletes objects and records their graves at `usn`.
    pub fn delete_with_graves(&mut self, kind: ObjectKind, ids: &[i64], usn: Usn) {
        self.remove_objects(kind, ids);
        self.graves
            .extend(ids.iter().map(|&oid| Grave { oid, kind, usn }));
    }

    /// The canonical count vector.
    pub fn sanity_counts(&self) -> SanityCounts {
        let mut due = [0i64; 3];
        for card in self.cards.values() {
            match card.int(CARD_QUEUE_INDEX) {
                Some(0) => due[0] += 1,
                Some(1) | Some(3) => due[1] += 1,
                Some(2) => due[2] += 1,
                _ => {}
            }
        }
        SanityCounts {
            due,
            cards: self.cards.len() as i64,
            notes: self.notes.len() as i64,
            revlog: self.revlog.len() as i64,
            graves: self.graves.len() as i64,
            models: self.models.len() as i64,
            decks: self.decks.len() as i64,
            deck_configs: self.deck_configs.len() as i64,
        }
    }

    /// Names the first kind of object still at `usn == -1`.
    pub fn first_unsynced(&self) -> Option<String> {
        for table in Table::CHUNK_ORDER {
            if self
                .rows(table)
                .values()
                .any(|row| table.usn_of(row) == Some(UNSYNCED_USN))
            {
                return Some(table.name().to_string());
            }
        }
        let pending = [
            ("graves", self.graves.iter().any(|g| g.usn == UNSYNCED_USN)),
            ("decks", any_pending(self.decks.values())),
            ("deck configs", any_pending(self.deck_configs.values())),
            ("models", any_pending(self.models.values())),
            ("tags", self.tags.values().any(|usn| *usn == UNSYNCED_USN)),
        ];
        pending
            .iter()
            .find(|(_, pending)| *pending)
            .map(|(name, _)| (*name).to_string())
    }
}

fn any_pending<'a, T: Versioned + 'a>(mut objects: impl Iterator<Item = &'a T>) -> bool {
    objects.any(|o| o.usn() == UNSYNCED_USN)
}

/// A [`CollectionStore`] over a [`CollectionState`], with snapshot transactions.
#[derive(Debug, Default)]
pub struct MemoryCollection {
    state: CollectionState,
    snapshot: Option<CollectionState>,
}

impl MemoryCollection {
    /// Wraps a state.
    pub fn new(state: CollectionState) -> Self {
        Self {
            state,
            snapshot: None,
        }
    }

    /// The current state.
    pub fn state(&self) -> &CollectionState {
        &self.state
    }

    /// Mutable access for local edits.
    pub fn state_mut(&mut self) -> &mut CollectionState {
        &mut self.state
    }

    /// True between `begin_transaction` and `commit` / `rollback`.
    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Unwraps the state.
    pub fn into_state(self) -> CollectionState {
        self.state
    }
}

impl CollectionStore for MemoryCollection {
    fn prepare_for_sync(&mut self, now_ms: i64) -> StoreResult<()> {
        let mut reclaimed = 0usize;
        for card in self.state.cards.values_mut() {
            if matches!(card.int(CARD_QUEUE_INDEX), Some(-2) | Some(-3)) {
                let card_type = card.int(CARD_TYPE_INDEX).unwrap_or(0);
                card.set_int(CARD_QUEUE_INDEX, card_type);
                Table::Cards.stamp(card, UNSYNCED_USN);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            self.state.modified = now_ms.max(self.state.modified.saturating_add(1));
        }
        Ok(())
    }

    fn begin_transaction(&mut self) -> StoreResult<()> {
        if self.snapshot.is_some() {
            return Err(StoreError::Transaction("transaction already open".into()));
        }
        self.snapshot = Some(self.state.clone());
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        self.snapshot
            .take()
            .map(|_| ())
            .ok_or_else(|| StoreError::Transaction("no open transaction".into()))
    }

    fn rollback(&mut self) -> StoreResult<()> {
        let snapshot = self
            .snapshot
            .take()
            .ok_or_else(|| StoreError::Transaction("no open transaction".into()))?;
        self.state = snapshot;
        Ok(())
    }

    fn modified(&self) -> StoreResult<i64> {
        Ok(self.state.modified)
    }

    fn schema_version(&self) -> StoreResult<i64> {
        Ok(self.state.scm)
    }

    fn current_usn_counter(&self) -> StoreResult<Usn> {
        Ok(self.state.usn)
    }

    fn pending_graves(&self) -> StoreResult<Vec<Grave>> {
        Ok(self
            .state
            .graves
            .iter()
            .filter(|g| g.usn == UNSYNCED_USN)
            .copied()
            .collect())
    }

    fn acknowledge_graves(&mut self, usn: Usn) -> StoreResult<()> {
        for grave in self
            .state
            .graves
            .iter_mut()
            .filter(|g| g.usn == UNSYNCED_USN)
        {
            grave.usn = usn;
        }
        Ok(())
    }

    fn remove_notes(&mut self, ids: &[i64], usn: Usn) -> StoreResult<()> {
        self.state.delete_with_graves(ObjectKind::Note, ids, usn);
        Ok(())
    }

    fn remove_cards(&mut self, ids: &[i64], usn: Usn) -> StoreResult<()> {
        self.state.delete_with_graves(ObjectKind::Card, ids, usn);
        Ok(())
    }

    fn remove_decks(&mut self, ids: &[i64], usn: Usn) -> StoreResult<()> {
        self.state.delete_with_graves(ObjectKind::Deck, ids, usn);
        Ok(())
    }

    fn all_decks(&self) -> StoreResult<Vec<Deck>> {
        Ok(self.state.decks.values().cloned().collect())
    }

    fn all_deck_configs(&self) -> StoreResult<Vec<DeckConfig>> {
        Ok(self.state.deck_configs.values().cloned().collect())
    }

    fn all_models(&self) -> StoreResult<Vec<Model>> {
        Ok(self.state.models.values().cloned().collect())
    }

    fn all_tags(&self) -> StoreResult<Vec<(String, Usn)>> {
        Ok(self
            .state
            .tags
            .iter()
            .map(|(tag, usn)| (tag.clone(), *usn))
            .collect())
    }

    fn all_config(&self) -> StoreResult<Map<String, Value>> {
        Ok(self.state.config.clone())
    }

    fn creation_time(&self) -> StoreResult<i64> {
        Ok(self.state.crt)
    }

    fn update_deck(&mut self, deck: Deck) -> StoreResult<()> {
        self.state.decks.insert(deck.id, deck);
        Ok(())
    }

    fn update_deck_config(&mut self, config: DeckConfig) -> StoreResult<()> {
        self.state.deck_configs.insert(config.id, config);
        Ok(())
    }

    fn update_model(&mut self, model: Model) -> StoreResult<()> {
        self.state.models.insert(model.id, model);
        Ok(())
    }

    fn register_tags(&mut self, tags: &[String], usn: Usn) -> StoreResult<()> {
        for tag in tags {
            self.state.tags.insert(tag.clone(), usn);
        }
        Ok(())
    }

    fn set_config(&mut self, config: Map<String, Value>) -> StoreResult<()> {
        self.state.config = config;
        Ok(())
    }

    fn set_creation_time(&mut self, crt: i64) -> StoreResult<()> {
        self.state.crt = crt;
        Ok(())
    }

    fn query_rows_since(
        &self,
        table: Table,
        usn: Usn,
        after_id: Option<i64>,
        limit: usize,
    ) -> StoreResult<Vec<Record>> {
        Ok(self.state.rows_since(table, usn, after_id, limit))
    }

    fn row_version(&self, table: Table, id: i64) -> StoreResult<Option<RowVersion>> {
        Ok(self.state.rows(table).get(&id).map(|row| RowVersion {
            modified: table.mod_of(row),
            usn: table.usn_of(row).unwrap_or(UNSYNCED_USN),
        }))
    }

    fn insert_or_replace(&mut self, table: Table, rows: Vec<Record>) -> StoreResult<()> {
        let target = self.state.rows_mut(table);
        for row in rows {
            let id = row
                .id()
                .ok_or_else(|| StoreError::Corrupt(format!("{table} row without id")))?;
            target.insert(id, row);
        }
        Ok(())
    }

    fn insert_if_absent(&mut self, table: Table, rows: Vec<Record>) -> StoreResult<()> {
        let target = self.state.rows_mut(table);
        for row in rows {
            let id = row
                .id()
                .ok_or_else(|| StoreError::Corrupt(format!("{table} row without id")))?;
            target.entry(id).or_insert(row);
        }
        Ok(())
    }

    fn mark_acknowledged(&mut self, table: Table, ids: &[i64], usn: Usn) -> StoreResult<()> {
        let target = self.state.rows_mut(table);
        for id in ids {
            if let Some(row) = target.get_mut(id) {
                table.stamp(row, usn);
            }
        }
        Ok(())
    }

    fn first_unsynced(&self) -> StoreResult<Option<String>> {
        Ok(self.state.first_unsynced())
    }

    fn sanity_counts(&self) -> StoreResult<SanityCounts> {
        Ok(self.state.sanity_counts())
    }

    fn finish_sync(&mut self, modified: i64, next_usn: Usn) -> StoreResult<()> {
        self.state.modified = modified;
        self.state.last_sync = modified;
        self.state.usn = next_usn;
        Ok(())
    }
}

/// A [`MediaStore`] keeping file contents in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryMedia {
    files: BTreeMap<String, Vec<u8>>,
    records: BTreeMap<String, MediaRecord>,
    last_usn: Usn,
}

impl MemoryMedia {
    /// Creates an empty media folder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or changes a file locally, marking it dirty.
    pub fn add_local(&mut self, fname: &str, data: impl Into<Vec<u8>>) {
        let data = data.into();
        let sum = checksum(&data);
        self.files.insert(fname.to_string(), data);
        self.records.insert(
            fname.to_string(),
            MediaRecord {
                fname: fname.to_string(),
                checksum: Some(sum),
                dirty: true,
            },
        );
    }

    /// Deletes a file locally, leaving a dirty deletion record.
    pub fn remove_local(&mut self, fname: &str) {
        self.files.remove(fname);
        self.records.insert(
            fname.to_string(),
            MediaRecord {
                fname: fname.to_string(),
                checksum: None,
                dirty: true,
            },
        );
    }

    /// Drops a file's bytes without touching its record.
    pub fn lose_file(&mut self, fname: &str) {
        self.files.remove(fname);
    }

    /// File contents, if present.
    pub fn file(&self, fname: &str) -> Option<&[u8]> {
        self.files.get(fname).map(Vec::as_slice)
    }

    /// All tracked records.
    pub fn records(&self) -> impl Iterator<Item = &MediaRecord> {
        self.records.values()
    }
}

impl MediaStore for MemoryMedia {
    fn last_usn(&self) -> StoreResult<Usn> {
        Ok(self.last_usn)
    }

    fn set_last_usn(&mut self, usn: Usn) -> StoreResult<()> {
        self.last_usn = usn;
        Ok(())
    }

    fn record(&self, fname: &str) -> StoreResult<Option<MediaRecord>> {
        Ok(self.records.get(fname).cloned())
    }

    fn dirty_count(&self) -> StoreResult<u64> {
        Ok(self.records.values().filter(|r| r.dirty).count() as u64)
    }

    fn dirty_records(&self, limit: usize) -> StoreResult<Vec<MediaRecord>> {
        Ok(self
            .records
            .values()
            .filter(|r| r.dirty)
            .take(limit)
            .cloned()
            .collect())
    }

    fn mark_clean(&mut self, fnames: &[String]) -> StoreResult<()> {
        for fname in fnames {
            let forget = match self.records.get_mut(fname) {
                Some(record) if record.checksum.is_some() => {
                    record.dirty = false;
                    false
                }
                Some(_) => true,
                None => false,
            };
            if forget {
                self.records.remove(fname);
            }
        }
        Ok(())
    }

    fn sync_delete(&mut self, fname: &str) -> StoreResult<()> {
        self.files.remove(fname);
        self.records.remove(fname);
        Ok(())
    }

    fn open_file(&self, fname: &str) -> StoreResult<Option<Box<dyn Read + '_>>> {
        Ok(self
            .files
            .get(fname)
            .map(|data| Box::new(data.as_slice()) as Box<dyn Read + '_>))
    }

    fn write_file(&mut self, fname: &str, data: &mut dyn Read) -> StoreResult<u64> {
        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes)?;
        let len = bytes.len() as u64;
        self.files.insert(fname.to_string(), bytes);
        Ok(len)
    }

    fn add_synced(&mut self, fname: &str, checksum: &str) -> StoreResult<()> {
        self.records.insert(
            fname.to_string(),
            MediaRecord {
                fname: fname.to_string(),
                checksum: Some(checksum.to_string()),
                dirty: false,
            },
        );
        Ok(())
    }

    fn mark_missing(&mut self, fname: &str) -> StoreResult<()> {
        self.files.remove(fname);
        if let Some(record) = self.records.get_mut(fname) {
            record.checksum = None;
            record.dirty = true;
        }
        Ok(())
    }

    fn media_count(&self) -> StoreResult<u64> {
        Ok(self
            .records
            .values()
            .filter(|r| r.checksum.is_some())
            .count() as u64)
    }

    fn force_resync(&mut self) -> StoreResult<()> {
        self.last_usn = 0;
        self.records.retain(|_, r| r.checksum.is_some());
        for record in self.records.values_mut() {
            record.dirty = true;
        }
        Ok(())
    }
}
