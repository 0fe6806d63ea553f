//! Small objects: decks, deck configs and note types.
//!
//! Each carries `id`, `mod` and `usn`; every other key is kept verbatim in
//! `extra` so it round-trips unchanged.

use crate::record::Usn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Access to the versioning fields shared by all small objects.
pub trait Versioned {
    /// Object id.
    fn id(&self) -> i64;
    /// Modification time in seconds.
    fn modified(&self) -> i64;
    /// Current usn.
    fn usn(&self) -> Usn;
    /// Rewrites the usn.
    fn set_usn(&mut self, usn: Usn);
}

macro_rules! small_object {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            /// Object id.
            pub id: i64,
            /// Display name.
            #[serde(default)]
            pub name: String,
            /// Modification time in seconds.
            #[serde(rename = "mod")]
            pub modified: i64,
            /// Update sequence number.
            pub usn: Usn,
            /// Remaining keys, preserved as received.
            #[serde(flatten)]
            pub extra: Map<String, Value>,
        }

        impl $name {
            /// Creates an object with no extra keys.
            pub fn new(id: i64, name: impl Into<String>, modified: i64, usn: Usn) -> Self {
                Self {
                    id,
                    name: name.into(),
                    modified,
                    usn,
                    extra: Map::new(),
                }
            }
        }

        impl Versioned for $name {
            fn id(&self) -> i64 {
                self.id
            }

            fn modified(&self) -> i64 {
                self.modified
            }

            fn usn(&self) -> Usn {
                self.usn
            }

            fn set_usn(&mut self, usn: Usn) {
                self.usn = usn;
            }
        }
    };
}

small_object! {
    /// A deck.
    Deck
}

small_object! {
    /// A deck options group.
    DeckConfig
}

small_object! {
    /// A note type (fields and card templates live in `extra`).
    Model
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_round_trip() {
        let json = r#"{"id":1,"name":"Default","mod":20,"usn":-1,"collapsed":false,"desc":"d"}"#;
        let deck: Deck = serde_json::from_str(json).unwrap();
        assert_eq!(deck.modified, 20);
        assert_eq!(deck.extra.get("desc"), Some(&Value::from("d")));

        let back: Value = serde_json::to_value(&deck).unwrap();
        let original: Value = serde_json::from_str(json).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn set_usn_through_trait() {
        let mut model = Model::new(3, "Basic", 5, -1);
        model.set_usn(9);
        assert_eq!(Versioned::usn(&model), 9);
        assert_eq!(Versioned::id(&model), 3);
    }
}
