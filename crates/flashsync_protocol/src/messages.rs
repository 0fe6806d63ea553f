//! Request and response bodies of the collection protocol.

use crate::error::{ProtocolError, ProtocolResult};
use crate::graves::Graves;
use crate::objects::{Deck, DeckConfig, Model};
use crate::record::{Record, Table, Usn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Protocol version sent with `meta`.
pub const SYNC_VERSION: u32 = 8;

/// Response wrapper: `{"data": ..., "err": ""}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Payload, absent on error.
    pub data: Option<T>,
    /// Error text, empty on success.
    #[serde(default)]
    pub err: String,
}

impl<T> Envelope<T> {
    /// Creates a successful envelope.
    pub fn success(data: T) -> Self {
        Self {
            data: Some(data),
            err: String::new(),
        }
    }

    /// Creates an error envelope.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: None,
            err: message.into(),
        }
    }

    /// Returns the payload, or the remote error.
    pub fn into_result(self) -> ProtocolResult<T> {
        if !self.err.is_empty() {
            return Err(ProtocolError::Remote(self.err));
        }
        self.data.ok_or(ProtocolError::MissingData)
    }

    /// Checks only the error field, for endpoints whose payload is null.
    pub fn into_ack(self) -> ProtocolResult<()> {
        if self.err.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::Remote(self.err))
        }
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Decodes an envelope from a response body and unwraps its payload.
    pub fn decode(body: &str) -> ProtocolResult<T> {
        let envelope: Envelope<T> = serde_json::from_str(body)?;
        envelope.into_result()
    }
}

/// `hostKey` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostKeyRequest {
    /// User name.
    pub u: String,
    /// Password.
    pub p: String,
}

/// `hostKey` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostKeyResponse {
    /// Session key for later requests.
    pub key: String,
}

/// `meta` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRequest {
    /// Protocol version.
    pub v: u32,
    /// Client version string.
    pub cv: String,
}

impl MetaRequest {
    /// Creates a meta request at the current protocol version.
    pub fn new(client_version: impl Into<String>) -> Self {
        Self {
            v: SYNC_VERSION,
            cv: client_version.into(),
        }
    }
}

/// `meta` response: the remote collection's summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaResponse {
    /// Remote modification time (ms).
    #[serde(rename = "mod")]
    pub modified: i64,
    /// Remote schema version.
    pub scm: i64,
    /// Remote usn counter; becomes the session's `maxUsn`.
    pub usn: Usn,
    /// Remote clock in seconds.
    pub ts: i64,
    /// Remote media usn.
    #[serde(default)]
    pub musn: Usn,
    /// Message for the user, possibly empty.
    #[serde(default)]
    pub msg: String,
    /// False if the server refuses to continue.
    #[serde(default = "yes")]
    pub cont: bool,
}

fn yes() -> bool {
    true
}

/// `start` request: begins the session and sends local graves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    /// Lower bound of the change window.
    #[serde(rename = "minUsn")]
    pub min_usn: Usn,
    /// True if the local collection was modified more recently.
    pub lnewer: bool,
    /// Local deletions.
    pub graves: Graves,
}

/// Small-object change bundle, exchanged once per sync.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Changes {
    /// Changed note types.
    #[serde(default)]
    pub models: Vec<Model>,
    /// Changed decks and deck configs.
    #[serde(default)]
    pub decks: (Vec<Deck>, Vec<DeckConfig>),
    /// Changed tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Collection config, only sent by the newer side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf: Option<Map<String, Value>>,
    /// Collection creation time, only sent by the newer side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crt: Option<i64>,
}

impl Changes {
    /// Total number of objects carried.
    pub fn object_count(&self) -> usize {
        self.models.len()
            + self.decks.0.len()
            + self.decks.1.len()
            + self.tags.len()
            + usize::from(self.conf.is_some())
            + usize::from(self.crt.is_some())
    }
}

/// `applyChanges` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyChangesRequest {
    /// Local changes.
    pub changes: Changes,
}

/// A page of streamed rows.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Chunk {
    /// True on the last chunk.
    pub done: bool,
    /// Review log rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revlog: Option<Vec<Record>>,
    /// Card rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cards: Option<Vec<Record>>,
    /// Note rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<Vec<Record>>,
}

impl Chunk {
    /// Returns the rows for a table, if present.
    pub fn rows(&self, table: Table) -> Option<&[Record]> {
        match table {
            Table::Revlog => self.revlog.as_deref(),
            Table::Cards => self.cards.as_deref(),
            Table::Notes => self.notes.as_deref(),
        }
    }

    /// Sets the rows for a table.
    pub fn set_rows(&mut self, table: Table, rows: Vec<Record>) {
        let slot = match table {
            Table::Revlog => &mut self.revlog,
            Table::Cards => &mut self.cards,
            Table::Notes => &mut self.notes,
        };
        *slot = Some(rows);
    }

    /// Total rows across tables.
    pub fn row_count(&self) -> usize {
        Table::CHUNK_ORDER
            .iter()
            .map(|t| self.rows(*t).map_or(0, |r| r.len()))
            .sum()
    }
}

/// `applyChunk` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyChunkRequest {
    /// Local rows.
    pub chunk: Chunk,
}

/// Canonical count vector compared by the sanity check.
///
/// On the wire: `[[new, learn, review], cards, notes, revlog, graves,
/// models, decks, deckConfigs]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "SanityTuple", into = "SanityTuple")]
pub struct SanityCounts {
    /// Due counts: new, learning, review.
    pub due: [i64; 3],
    /// Card count.
    pub cards: i64,
    /// Note count.
    pub notes: i64,
    /// Review log count.
    pub revlog: i64,
    /// Grave count.
    pub graves: i64,
    /// Note type count.
    pub models: i64,
    /// Deck count.
    pub decks: i64,
    /// Deck config count.
    pub deck_configs: i64,
}

type SanityTuple = ([i64; 3], i64, i64, i64, i64, i64, i64, i64);

impl From<SanityTuple> for SanityCounts {
    fn from(t: SanityTuple) -> Self {
        Self {
            due: t.0,
            cards: t.1,
            notes: t.2,
            revlog: t.3,
            graves: t.4,
            models: t.5,
            decks: t.6,
            deck_configs: t.7,
        }
    }
}

impl From<SanityCounts> for SanityTuple {
    fn from(c: SanityCounts) -> Self {
        (
            c.due,
            c.cards,
            c.notes,
            c.revlog,
            c.graves,
            c.models,
            c.decks,
            c.deck_configs,
        )
    }
}

impl fmt::Display for SanityCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[[{}, {}, {}], {}, {}, {}, {}, {}, {}, {}]",
            self.due[0],
            self.due[1],
            self.due[2],
            self.cards,
            self.notes,
            self.revlog,
            self.graves,
            self.models,
            self.decks,
            self.deck_configs
        )
    }
}

impl SanityCounts {
    /// Describes the mismatch against the remote vector, or `None` if equal.
    pub fn mismatch(&self, remote: &SanityCounts) -> Option<String> {
        if self == remote {
            None
        } else {
            Some(format!("sanity check failed: local: {self}, remote: {remote}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_defaults() {
        let meta: MetaResponse =
            serde_json::from_str(r#"{"mod":10,"scm":1,"usn":5,"ts":1000}"#).unwrap();
        assert!(meta.cont);
        assert!(meta.msg.is_empty());
        assert_eq!(meta.musn, 0);
    }

    #[test]
    fn start_request_wire_names() {
        let req = StartRequest {
            min_usn: 3,
            lnewer: true,
            graves: Graves::default(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["minUsn"], 3);
        assert_eq!(json["lnewer"], true);
        assert!(json["graves"]["cards"].as_array().unwrap().is_empty());
    }

    #[test]
    fn changes_omit_conf_unless_set() {
        let changes = Changes::default();
        let json = serde_json::to_string(&changes).unwrap();
        assert_eq!(json, r#"{"models":[],"decks":[[],[]],"tags":[]}"#);

        let changes = Changes {
            crt: Some(1),
            conf: Some(Map::new()),
            ..Default::default()
        };
        assert_eq!(changes.object_count(), 2);
        let json = serde_json::to_value(&changes).unwrap();
        assert_eq!(json["crt"], 1);
    }

    #[test]
    fn chunk_rows_by_table() {
        let mut chunk = Chunk::default();
        chunk.set_rows(Table::Cards, vec![Record::default(), Record::default()]);
        assert_eq!(chunk.row_count(), 2);
        assert!(chunk.rows(Table::Notes).is_none());
        let json = serde_json::to_string(&chunk).unwrap();
        assert_eq!(json, r#"{"done":false,"cards":[[],[]]}"#);
    }

    #[test]
    fn sanity_counts_are_an_array() {
        let counts = SanityCounts {
            due: [1, 2, 3],
            cards: 4,
            notes: 5,
            revlog: 6,
            graves: 0,
            models: 1,
            decks: 2,
            deck_configs: 1,
        };
        let json = serde_json::to_string(&counts).unwrap();
        assert_eq!(json, "[[1,2,3],4,5,6,0,1,2,1]");
        let back: SanityCounts = serde_json::from_str(&json).unwrap();
        assert_eq!(back, counts);
        assert!(counts.mismatch(&back).is_none());

        let other = SanityCounts { notes: 6, ..counts };
        let details = counts.mismatch(&other).unwrap();
        assert!(details.contains("local: [[1, 2, 3], 4, 5"));
        assert!(details.contains("remote: [[1, 2, 3], 4, 6"));
    }

    #[test]
    fn envelope_error_wins() {
        let result = Envelope::<i64>::decode(r#"{"data":null,"err":"busy"}"#);
        assert!(matches!(result, Err(ProtocolError::Remote(ref e)) if e == "busy"));

        let value = Envelope::<i64>::decode(r#"{"data":7,"err":""}"#).unwrap();
        assert_eq!(value, 7);

        let missing = Envelope::<i64>::decode(r#"{"err":""}"#);
        assert!(matches!(missing, Err(ProtocolError::MissingData)));

        let ack: Envelope<Value> = serde_json::from_str(r#"{"data":null,"err":""}"#).unwrap();
        assert!(ack.into_ack().is_ok());
    }
}
