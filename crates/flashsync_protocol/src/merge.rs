//! Conflict policies.
//!
//! Collection objects resolve by modification time: a remote object wins only
//! when it is missing locally or strictly newer. Media resolves by checksum and
//! prefers a pending local add over a remote delete.

/// Returns true if a remote object should replace the local one.
///
/// `local_mod` is `None` when the object does not exist locally. Equal mod
/// times keep the local object.
pub fn remote_wins(local_mod: Option<i64>, remote_mod: i64) -> bool {
    match local_mod {
        None => true,
        Some(local) => remote_mod > local,
    }
}

/// What to do with one remote media log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaAction {
    /// Download the remote file, then mark it clean.
    Fetch,
    /// The local copy already matches; mark it clean.
    AlreadyCurrent,
    /// Remote deleted a clean local file; delete it.
    DeleteLocal,
    /// Remote deleted a file with a pending local change; keep it dirty.
    KeepLocal,
    /// Neither side has the file; mark it clean.
    BothDeleted,
}

/// Classifies a remote media log entry against the local record.
///
/// Empty checksums are treated as absent.
pub fn classify_media(
    local_checksum: Option<&str>,
    local_dirty: bool,
    remote_checksum: Option<&str>,
) -> MediaAction {
    let local = local_checksum.filter(|c| !c.is_empty());
    let remote = remote_checksum.filter(|c| !c.is_empty());
    match (local, remote) {
        (Some(l), Some(r)) if l == r => MediaAction::AlreadyCurrent,
        (_, Some(_)) => MediaAction::Fetch,
        (Some(_), None) if local_dirty => MediaAction::KeepLocal,
        (Some(_), None) => MediaAction::DeleteLocal,
        (None, None) => MediaAction::BothDeleted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn newer_remote_wins() {
        assert!(remote_wins(Some(100), 200));
        assert!(!remote_wins(Some(200), 100));
        assert!(!remote_wins(Some(100), 100));
        assert!(remote_wins(None, 0));
    }

    #[test]
    fn media_table() {
        assert_eq!(classify_media(None, false, Some("a")), MediaAction::Fetch);
        assert_eq!(classify_media(Some("b"), true, Some("a")), MediaAction::Fetch);
        assert_eq!(classify_media(Some("a"), true, Some("a")), MediaAction::AlreadyCurrent);
        assert_eq!(classify_media(Some("a"), true, None), MediaAction::KeepLocal);
        assert_eq!(classify_media(Some("a"), false, None), MediaAction::DeleteLocal);
        assert_eq!(classify_media(None, true, None), MediaAction::BothDeleted);
        assert_eq!(classify_media(Some(""), false, Some("")), MediaAction::BothDeleted);
    }

    proptest! {
        #[test]
        fn remote_wins_is_antisymmetric(a in any::<i64>(), b in any::<i64>()) {
            // At most one side can win a tie-break between two existing objects.
            prop_assert!(!(remote_wins(Some(a), b) && remote_wins(Some(b), a)));
            if a != b {
                prop_assert!(remote_wins(Some(a), b) ^ remote_wins(Some(b), a));
            }
        }

        #[test]
        fn dirty_local_is_never_deleted(
            local in proptest::option::of("[a-f0-9]{1,8}"),
            remote in proptest::option::of("[a-f0-9]{0,8}"),
        ) {
            let action = classify_media(local.as_deref(), true, remote.as_deref());
            prop_assert_ne!(action, MediaAction::DeleteLocal);
        }

        #[test]
        fn remote_checksum_never_deletes(
            local in proptest::option::of("[a-f0-9]{0,8}"),
            dirty in any::<bool>(),
            remote in "[a-f0-9]{1,8}",
        ) {
            let action = classify_media(local.as_deref(), dirty, Some(&remote));
            prop_assert!(matches!(action, MediaAction::Fetch | MediaAction::AlreadyCurrent));
        }
    }
}
