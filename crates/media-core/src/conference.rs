//! Conference participant positioning.
//!
//! Participants are kept sorted by remote user id so every endpoint
//! derives the same positional order. On each change the application
//! receives the new order and the media engine receives the decoder
//! handles for positional mixing.

use crate::flow::DecoderHandle;

/// One conference participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfPart {
    pub user_id: String,
    pub decoder: Option<DecoderHandle>,
}

/// The sorted participant list of one call.
#[derive(Debug, Clone, Default)]
pub struct ConferenceRoster {
    parts: Vec<ConfPart>,
}

impl ConferenceRoster {
    /// Add a participant, keeping the roster sorted. Returns `false`
    /// when the user is already present.
    pub fn add(&mut self, user_id: &str, decoder: Option<DecoderHandle>) -> bool {
        if self.contains(user_id) {
            return false;
        }
        self.parts.push(ConfPart {
            user_id: user_id.to_string(),
            decoder,
        });
        self.sort();
        true
    }

    /// Remove a participant. Returns `true` when it was present.
    pub fn remove(&mut self, user_id: &str) -> bool {
        let before = self.parts.len();
        self.parts.retain(|p| p.user_id != user_id);
        self.parts.len() != before
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.parts.iter().any(|p| p.user_id == user_id)
    }

    fn sort(&mut self) {
        self.parts.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    }

    /// Participant user ids in positional order.
    pub fn order(&self) -> Vec<String> {
        self.parts.iter().map(|p| p.user_id.clone()).collect()
    }

    /// Active decoder handles in positional order.
    pub fn decoders(&self) -> Vec<DecoderHandle> {
        self.parts.iter().filter_map(|p| p.decoder).collect()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn clear(&mut self) {
        self.parts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn roster_stays_sorted_by_user_id() {
        let mut roster = ConferenceRoster::default();
        assert!(roster.add("charlie", Some(DecoderHandle(3))));
        assert!(roster.add("alice", Some(DecoderHandle(1))));
        assert!(roster.add("bob", None));
        assert_eq!(roster.order(), vec!["alice", "bob", "charlie"]);
        assert_eq!(roster.decoders(), vec![DecoderHandle(1), DecoderHandle(3)]);
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let mut roster = ConferenceRoster::default();
        assert!(roster.add("alice", None));
        assert!(!roster.add("alice", Some(DecoderHandle(7))));
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn remove_reports_presence() {
        let mut roster = ConferenceRoster::default();
        roster.add("alice", None);
        assert!(roster.remove("alice"));
        assert!(!roster.remove("alice"));
        assert!(roster.is_empty());
    }
}
