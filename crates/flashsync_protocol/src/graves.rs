//! Deletion records.

use crate::record::Usn;
use serde::{Deserialize, Serialize};

/// The kinds of object a grave can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// A card.
    Card,
    /// A note.
    Note,
    /// A deck.
    Deck,
}

/// A locally stored deletion record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grave {
    /// Id of the deleted object.
    pub oid: i64,
    /// Kind of the deleted object.
    pub kind: ObjectKind,
    /// Usn of the deletion.
    pub usn: Usn,
}

/// Deleted object ids grouped by kind, as exchanged in `start`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Graves {
    /// Deleted card ids.
    #[serde(default)]
    pub cards: Vec<i64>,
    /// Deleted note ids.
    #[serde(default)]
    pub notes: Vec<i64>,
    /// Deleted deck ids.
    #[serde(default)]
    pub decks: Vec<i64>,
}

impl Graves {
    /// Adds an id under its kind.
    pub fn push(&mut self, kind: ObjectKind, oid: i64) {
        match kind {
            ObjectKind::Card => self.cards.push(oid),
            ObjectKind::Note => self.notes.push(oid),
            ObjectKind::Deck => self.decks.push(oid),
        }
    }

    /// Returns the ids of one kind.
    pub fn ids(&self, kind: ObjectKind) -> &[i64] {
        match kind {
            ObjectKind::Card => &self.cards,
            ObjectKind::Note => &self.notes,
            ObjectKind::Deck => &self.decks,
        }
    }

    /// Total number of ids.
    pub fn len(&self) -> usize {
        self.cards.len() + self.notes.len() + self.decks.len()
    }

    /// Returns true if no ids are present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<Grave> for Graves {
    fn from_iter<I: IntoIterator<Item = Grave>>(iter: I) -> Self {
        let mut graves = Graves::default();
        for grave in iter {
            graves.push(grave.kind, grave.oid);
        }
        graves
    }
}
