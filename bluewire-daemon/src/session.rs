/*!
 * Session Tracker
 * OBEX sessions as announced by the transfer service
 */

use chrono::Utc;
use std::collections::HashMap;

use crate::model::{Session, SessionMetadata, TransferState};

#[derive(Debug)]
struct Entry {
    session: Session,
    generation: u64,
}

/// Owns every live session, keyed by identifier. Entries are only created
/// and removed by service notifications.
#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: HashMap<String, Entry>,
    next_generation: u64,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a new session, replacing any entry with the same id. The
    /// returned generation identifies this incarnation for a later
    /// [`SessionTracker::fill_metadata`].
    pub fn on_session_created(&mut self, id: &str, metadata: SessionMetadata) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;

        let session = Session {
            id: id.to_string(),
            device_address: metadata.device_address,
            kind: metadata.kind,
            transfer: TransferState::Idle,
            created_at: Utc::now(),
        };
        if self.sessions.insert(id.to_string(), Entry { session, generation }).is_some() {
            tracing::debug!("Session {} replaced", id);
        } else {
            tracing::debug!("Session {} created", id);
        }
        generation
    }

    /// Removing an unknown session is a no-op.
    pub fn on_session_removed(&mut self, id: &str) -> Option<Session> {
        let removed = self.sessions.remove(id).map(|entry| entry.session);
        if removed.is_some() {
            tracing::debug!("Session {} removed", id);
        }
        removed
    }

    pub fn lookup(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id).map(|entry| &entry.session)
    }

    /// Applies metadata fetched after creation. Ignored if the session was
    /// removed or replaced in the meantime.
    pub fn fill_metadata(&mut self, id: &str, generation: u64, metadata: SessionMetadata) -> bool {
        match self.sessions.get_mut(id) {
            Some(entry) if entry.generation == generation => {
                entry.session.device_address = metadata.device_address;
                entry.session.kind = metadata.kind;
                true
            }
            _ => false,
        }
    }

    pub fn set_transfer(&mut self, id: &str, transfer: TransferState) -> bool {
        match self.sessions.get_mut(id) {
            Some(entry) => {
                entry.session.transfer = transfer;
                true
            }
            None => false,
        }
    }

    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> =
            self.sessions.values().map(|entry| entry.session.clone()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionKind;

    fn metadata(address: &str) -> SessionMetadata {
        SessionMetadata {
            device_address: address.to_string(),
            kind: SessionKind::FileTransfer,
        }
    }

    #[test]
    fn lookup_follows_latest_notification() {
        let mut tracker = SessionTracker::new();
        let steps: [(&str, bool); 7] = [
            ("session0", true),
            ("session1", true),
            ("session0", false),
            ("session0", true),
            ("session1", false),
            ("session1", false),
            ("session2", true),
        ];

        let mut latest: HashMap<&str, bool> = HashMap::new();
        for (id, created) in steps {
            if created {
                tracker.on_session_created(id, metadata("AA:BB:CC:DD:EE:FF"));
            } else {
                tracker.on_session_removed(id);
            }
            latest.insert(id, created);

            for (known, alive) in &latest {
                assert_eq!(tracker.lookup(known).is_some(), *alive, "after {id} {created}");
            }
        }
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn removing_unknown_session_changes_nothing() {
        let mut tracker = SessionTracker::new();
        tracker.on_session_created("session0", metadata("AA:BB:CC:DD:EE:FF"));
        let before = tracker.sessions();

        assert!(tracker.on_session_removed("session9").is_none());
        assert_eq!(tracker.sessions(), before);
    }

    #[test]
    fn creation_replaces_existing_entry() {
        let mut tracker = SessionTracker::new();
        tracker.on_session_created("session0", metadata("AA:BB:CC:DD:EE:FF"));
        tracker.on_session_created("session0", metadata("11:22:33:44:55:66"));

        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.lookup("session0").unwrap().device_address, "11:22:33:44:55:66");
    }

    #[test]
    fn stale_metadata_is_ignored() {
        let mut tracker = SessionTracker::new();
        let first = tracker.on_session_created("session0", SessionMetadata::default());
        let second = tracker.on_session_created("session0", SessionMetadata::default());

        assert!(!tracker.fill_metadata("session0", first, metadata("AA:BB:CC:DD:EE:FF")));
        assert!(tracker.fill_metadata("session0", second, metadata("11:22:33:44:55:66")));
        assert_eq!(tracker.lookup("session0").unwrap().device_address, "11:22:33:44:55:66");

        tracker.on_session_removed("session0");
        assert!(!tracker.fill_metadata("session0", second, metadata("AA:BB:CC:DD:EE:FF")));
        assert!(tracker.is_empty());
    }

    #[test]
    fn partial_metadata_still_resolves_removal() {
        let mut tracker = SessionTracker::new();
        tracker.on_session_created("session0", SessionMetadata::default());
        assert_eq!(tracker.lookup("session0").unwrap().kind, SessionKind::Unknown);
        assert!(tracker.on_session_removed("session0").is_some());
    }
}
