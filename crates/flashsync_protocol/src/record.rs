//! Rows of the streamed tables and their column layouts.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Update sequence number.
///
/// Servers hand out non-negative, monotonically increasing values. Locally,
/// [`UNSYNCED_USN`] marks a record changed since the last successful sync.
pub type Usn = i32;

/// Local marker for "modified since last sync".
pub const UNSYNCED_USN: Usn = -1;

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Field {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Int(i64),
    /// Floating point value.
    Real(f64),
    /// UTF-8 text.
    Text(String),
}

impl Field {
    /// Returns the integer value, if this is an integer column.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Field::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the text value, if this is a text column.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Field::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Field {
    fn from(v: i64) -> Self {
        Field::Int(v)
    }
}

impl From<i32> for Field {
    fn from(v: i32) -> Self {
        Field::Int(i64::from(v))
    }
}

impl From<f64> for Field {
    fn from(v: f64) -> Self {
        Field::Real(v)
    }
}

impl From<&str> for Field {
    fn from(v: &str) -> Self {
        Field::Text(v.to_string())
    }
}

impl From<String> for Field {
    fn from(v: String) -> Self {
        Field::Text(v)
    }
}

/// An ordered row of a streamed table, in wire column order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub Vec<Field>);

impl Record {
    /// Creates a record from its columns.
    pub fn new(fields: Vec<Field>) -> Self {
        Self(fields)
    }

    /// Returns the primary key (column 0).
    pub fn id(&self) -> Option<i64> {
        self.int(0)
    }

    /// Returns the integer in column `index`.
    pub fn int(&self, index: usize) -> Option<i64> {
        self.0.get(index).and_then(Field::as_int)
    }

    /// Overwrites column `index` with an integer. Out-of-range indices are ignored.
    pub fn set_int(&mut self, index: usize, value: i64) {
        if let Some(slot) = self.0.get_mut(index) {
            *slot = Field::Int(value);
        }
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the record has no columns.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the columns.
    pub fn fields(&self) -> &[Field] {
        &self.0
    }
}

/// The three tables exchanged in chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// Review history. Append-only.
    Revlog,
    /// Cards.
    Cards,
    /// Notes.
    Notes,
}

impl Table {
    /// The order tables are streamed in, both directions.
    pub const CHUNK_ORDER: [Table; 3] = [Table::Revlog, Table::Cards, Table::Notes];

    /// Wire name, also the key inside a chunk.
    pub fn name(self) -> &'static str {
        match self {
            Table::Revlog => "revlog",
            Table::Cards => "cards",
            Table::Notes => "notes",
        }
    }

    /// Parses a wire name.
    pub fn from_name(name: &str) -> ProtocolResult<Self> {
        match name {
            "revlog" => Ok(Table::Revlog),
            "cards" => Ok(Table::Cards),
            "notes" => Ok(Table::Notes),
            other => Err(ProtocolError::UnknownTable(other.to_string())),
        }
    }

    /// Number of columns in a row.
    ///
    /// - revlog: `id, cid, usn, ease, ivl, lastIvl, factor, time, type`
    /// - cards: `id, nid, did, ord, mod, usn, type, queue, due, ivl, factor,
    ///   reps, lapses, left, odue, odid, flags, data`
    /// - notes: `id, guid, mid, mod, usn, tags, flds, sfld, csum, flags, data`
    pub fn column_count(self) -> usize {
        match self {
            Table::Revlog => 9,
            Table::Cards => 18,
            Table::Notes => 11,
        }
    }

    /// Index of the `mod` column. Revlog rows are immutable and have none.
    pub fn mod_index(self) -> Option<usize> {
        match self {
            Table::Revlog => None,
            Table::Cards => Some(4),
            Table::Notes => Some(3),
        }
    }

    /// Index of the `usn` column.
    pub fn usn_index(self) -> usize {
        match self {
            Table::Revlog => 2,
            Table::Cards => 5,
            Table::Notes => 4,
        }
    }

    /// Checks the shape of a row: column count, integer id and usn.
    pub fn validate(self, record: &Record) -> ProtocolResult<()> {
        if record.len() != self.column_count() {
            return Err(ProtocolError::ColumnCount {
                table: self.name(),
                expected: self.column_count(),
                actual: record.len(),
            });
        }
        let mut int_columns = vec![0, self.usn_index()];
        int_columns.extend(self.mod_index());
        for index in int_columns {
            if record.int(index).is_none() {
                return Err(ProtocolError::NotAnInteger {
                    table: self.name(),
                    index,
                });
            }
        }
        Ok(())
    }

    /// Returns the usn of a row of this table.
    pub fn usn_of(self, record: &Record) -> Option<Usn> {
        record
            .int(self.usn_index())
            .and_then(|v| Usn::try_from(v).ok())
    }

    /// Returns the mod time of a row of this table.
    pub fn mod_of(self, record: &Record) -> Option<i64> {
        self.mod_index().and_then(|i| record.int(i))
    }

    /// Rewrites the usn of a row of this table.
    pub fn stamp(self, record: &mut Record, usn: Usn) {
        record.set_int(self.usn_index(), i64::from(usn));
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: i64, modified: i64, usn: i64) -> Record {
        Record::new(vec![
            id.into(),
            "guid".into(),
            1.into(),
            modified.into(),
            usn.into(),
            "".into(),
            "front\u{1f}back".into(),
            "front".into(),
            12345.into(),
            0.into(),
            "".into(),
        ])
    }

    #[test]
    fn fields_decode_untagged() {
        let record: Record = serde_json::from_str(r#"[1, null, 2.5, "x"]"#).unwrap();
        assert_eq!(
            record.fields(),
            &[
                Field::Int(1),
                Field::Null,
                Field::Real(2.5),
                Field::Text("x".into())
            ]
        );
        assert_eq!(serde_json::to_string(&record).unwrap(), r#"[1,null,2.5,"x"]"#);
    }

    #[test]
    fn note_layout() {
        let row = note(7, 100, -1);
        assert!(Table::Notes.validate(&row).is_ok());
        assert_eq!(Table::Notes.mod_of(&row), Some(100));
        assert_eq!(Table::Notes.usn_of(&row), Some(UNSYNCED_USN));
    }

    #[test]
    fn stamp_rewrites_usn_only() {
        let mut row = note(7, 100, -1);
        Table::Notes.stamp(&mut row, 42);
        assert_eq!(Table::Notes.usn_of(&row), Some(42));
        assert_eq!(row.id(), Some(7));
        assert_eq!(Table::Notes.mod_of(&row), Some(100));
    }

    #[test]
    fn validate_rejects_short_rows() {
        let row = Record::new(vec![1.into(), 2.into()]);
        assert!(matches!(
            Table::Cards.validate(&row),
            Err(ProtocolError::ColumnCount { expected: 18, .. })
        ));
    }

    #[test]
    fn validate_rejects_text_usn() {
        let mut row = note(1, 1, 1);
        row.0[4] = "oops".into();
        assert!(matches!(
            Table::Notes.validate(&row),
            Err(ProtocolError::NotAnInteger { index: 4, .. })
        ));
    }

    #[test]
    fn revlog_has_no_mod() {
        assert_eq!(Table::Revlog.mod_index(), None);
        assert_eq!(Table::from_name("revlog").unwrap(), Table::Revlog);
        assert!(Table::from_name("graves").is_err());
    }
}
