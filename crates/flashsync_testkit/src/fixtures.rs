//! Row and object builders plus a shared starting collection.

use flashsync_engine::{CollectionState, MemoryCollection};
use flashsync_protocol::{Deck, DeckConfig, Field, Model, Record, Usn};
use serde_json::json;

/// Schema version of collections built here.
pub const TEST_SCHEMA: i64 = 1_600_000_000_000;

/// A note row.
pub fn note(id: i64, modified: i64, usn: Usn) -> Record {
    Record::new(vec![
        Field::Int(id),
        Field::Text(format!("guid{id}")),
        Field::Int(1),
        Field::Int(modified),
        Field::Int(usn.into()),
        Field::Text(String::new()),
        Field::Text("front\u{1f}back".into()),
        Field::Text("front".into()),
        Field::Int(id % 1000),
        Field::Int(0),
        Field::Text(String::new()),
    ])
}

/// A card row in queue `queue` (its type follows the queue for 0..=2).
pub fn card(id: i64, nid: i64, modified: i64, usn: Usn, queue: i64) -> Record {
    let card_type = queue.clamp(0, 2);
    Record::new(vec![
        Field::Int(id),
        Field::Int(nid),
        Field::Int(1),
        Field::Int(0),
        Field::Int(modified),
        Field::Int(usn.into()),
        Field::Int(card_type),
        Field::Int(queue),
        Field::Int(id),
        Field::Int(0),
        Field::Int(2500),
        Field::Int(0),
        Field::Int(0),
        Field::Int(0),
        Field::Int(0),
        Field::Int(0),
        Field::Int(0),
        Field::Text(String::new()),
    ])
}

/// A review log row.
pub fn revlog(id: i64, cid: i64, usn: Usn) -> Record {
    Record::new(vec![
        Field::Int(id),
        Field::Int(cid),
        Field::Int(usn.into()),
        Field::Int(3),
        Field::Int(1),
        Field::Int(0),
        Field::Int(2500),
        Field::Int(6000),
        Field::Int(1),
    ])
}

/// A deck with one extra key that must survive a round trip.
pub fn deck(id: i64, name: &str, modified: i64, usn: Usn) -> Deck {
    let mut deck = Deck::new(id, name, modified, usn);
    deck.extra.insert("conf".into(), json!(1));
    deck
}

/// A deck config.
pub fn deck_config(id: i64, modified: i64, usn: Usn) -> DeckConfig {
    let mut conf = DeckConfig::new(id, "Default", modified, usn);
    conf.extra.insert("new".into(), json!({"perDay": 20}));
    conf
}

/// A note type.
pub fn model(id: i64, name: &str, modified: i64, usn: Usn) -> Model {
    let mut model = Model::new(id, name, modified, usn);
    model.extra.insert("flds".into(), json!([{"name": "Front"}, {"name": "Back"}]));
    model
}

/// A collection both sides hold after an earlier successful sync at usn 5.
///
/// It has one deck, deck config and note type, one note with a card, and
/// one review. Everything is acknowledged.
pub fn synced_collection() -> CollectionState {
    let mut state = CollectionState {
        modified: 1_000,
        last_sync: 1_000,
        scm: TEST_SCHEMA,
        usn: 5,
        crt: 1_500_000_000,
        ..CollectionState::default()
    };
    state.decks.insert(1, deck(1, "Default", 10, 0));
    state.deck_configs.insert(1, deck_config(1, 10, 0));
    state.models.insert(1, model(1, "Basic", 10, 0));
    state.notes.insert(100, note(100, 10, 0));
    state.cards.insert(200, card(200, 100, 10, 0, 0));
    state.revlog.insert(300, revlog(300, 200, 0));
    state.tags.insert("shared".into(), 0);
    state.config.insert("curDeck".into(), json!(1));
    state
}

/// A client and a server state starting from [`synced_collection`].
///
/// The client's usn counter is the server's usn, as left by the last finish.
pub fn synced_pair() -> (MemoryCollection, CollectionState) {
    let server = synced_collection();
    (MemoryCollection::new(server.clone()), server)
}

/// Marks a local edit: bumps the collection `mod` so the next sync is not
/// skipped as unchanged.
pub fn touch(state: &mut CollectionState, modified: i64) {
    state.modified = modified;
}
