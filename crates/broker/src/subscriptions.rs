//! The subscription routing table: `topic -> (session -> ref-count)`.

use std::collections::{HashMap, HashSet};

use regex::Regex;

use crate::SessionId;

/// A ref-counted session bucket preserving insertion order, so fan-out over a
/// topic is deterministic. Buckets are small; linear scans are fine.
#[derive(Debug, Default)]
pub(crate) struct CountedBucket {
    entries: Vec<(SessionId, u32)>,
}

impl CountedBucket {
    pub(crate) fn increment(&mut self, session: SessionId) {
        match self.entries.iter_mut().find(|(id, _)| *id == session) {
            Some((_, count)) => *count += 1,
            None => self.entries.push((session, 1)),
        }
    }

    /// Decrement the session's count, dropping the entry at zero. Returns
    /// false when the session was not present.
    pub(crate) fn decrement(&mut self, session: SessionId) -> bool {
        let Some(index) = self.entries.iter().position(|(id, _)| *id == session) else {
            return false;
        };
        self.entries[index].1 -= 1;
        if self.entries[index].1 == 0 {
            self.entries.remove(index);
        }
        true
    }

    /// Drop the session outright, whatever its count.
    pub(crate) fn remove(&mut self, session: SessionId) -> bool {
        let Some(index) = self.entries.iter().position(|(id, _)| *id == session) else {
            return false;
        };
        self.entries.remove(index);
        true
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn sessions(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionManager {
    subscriptions: HashMap<String, CountedBucket>,
    topics_by_session: HashMap<SessionId, HashSet<String>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one counted subscribe or unsubscribe. Returns true when the
    /// request changed state and listeners should be notified; a spurious
    /// unsubscribe is a no-op.
    pub fn on_subscribe(&mut self, session: SessionId, topic: &str, is_add: bool) -> bool {
        if is_add {
            self.subscriptions
                .entry(topic.to_string())
                .or_default()
                .increment(session);
            self.topics_by_session
                .entry(session)
                .or_default()
                .insert(topic.to_string());
            true
        } else {
            let Some(bucket) = self.subscriptions.get_mut(topic) else {
                return false;
            };
            if !bucket.decrement(session) {
                return false;
            }
            let fully_removed = !bucket.sessions().any(|id| id == session);
            let empty = bucket.is_empty();
            if empty {
                self.subscriptions.remove(topic);
            }
            if fully_removed {
                self.forget(session, topic);
            }
            true
        }
    }

    /// Remove every subscription the session holds. Returns the affected
    /// topics so unsubscribe notifications can be fanned out.
    pub fn on_disconnect(&mut self, session: SessionId) -> Vec<String> {
        let Some(topics) = self.topics_by_session.remove(&session) else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        for topic in topics {
            let empty = match self.subscriptions.get_mut(&topic) {
                Some(bucket) => {
                    if bucket.remove(session) {
                        removed.push(topic.clone());
                    }
                    bucket.is_empty()
                }
                None => false,
            };
            if empty {
                self.subscriptions.remove(&topic);
            }
        }
        removed.sort();
        removed
    }

    pub fn subscribers(&self, topic: &str) -> impl Iterator<Item = SessionId> + '_ {
        self.subscriptions
            .get(topic)
            .into_iter()
            .flat_map(|bucket| bucket.sessions())
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains_key(topic)
    }

    /// All `(topic, subscribers)` pairs whose topic matches the pattern, in
    /// deterministic topic order. Used to send a new listener its initial
    /// image.
    pub fn find_matches(&self, pattern: &Regex) -> Vec<(String, Vec<SessionId>)> {
        let mut matches: Vec<(String, Vec<SessionId>)> = self
            .subscriptions
            .iter()
            .filter(|(topic, _)| pattern.is_match(topic))
            .map(|(topic, bucket)| (topic.clone(), bucket.sessions().collect()))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        matches
    }

    fn forget(&mut self, session: SessionId, topic: &str) {
        if let Some(topics) = self.topics_by_session.get_mut(&session) {
            topics.remove(topic);
            if topics.is_empty() {
                self.topics_by_session.remove(&session);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn n_subscribes_need_n_unsubscribes() {
        let mut subs = SubscriptionManager::new();

        for _ in 0..3 {
            assert!(subs.on_subscribe(1, "quotes", true));
        }
        assert!(subs.on_subscribe(1, "quotes", false));
        assert!(subs.on_subscribe(1, "quotes", false));
        assert!(subs.is_subscribed("quotes"));

        assert!(subs.on_subscribe(1, "quotes", false));
        assert!(!subs.is_subscribed("quotes"));
    }

    #[test]
    fn spurious_unsubscribe_is_ignored() {
        let mut subs = SubscriptionManager::new();
        assert!(!subs.on_subscribe(1, "quotes", false));

        subs.on_subscribe(1, "quotes", true);
        assert!(!subs.on_subscribe(2, "quotes", false));
        assert!(subs.is_subscribed("quotes"));
    }

    #[test]
    fn fan_out_order_is_insertion_order() {
        let mut subs = SubscriptionManager::new();
        subs.on_subscribe(3, "t", true);
        subs.on_subscribe(1, "t", true);
        subs.on_subscribe(2, "t", true);
        subs.on_subscribe(3, "t", true); // re-subscribe keeps position

        assert_eq!(subs.subscribers("t").collect::<Vec<_>>(), vec![3, 1, 2]);
    }

    #[test]
    fn disconnect_removes_every_subscription() {
        let mut subs = SubscriptionManager::new();
        subs.on_subscribe(1, "a", true);
        subs.on_subscribe(1, "a", true);
        subs.on_subscribe(1, "b", true);
        subs.on_subscribe(2, "b", true);

        assert_eq!(subs.on_disconnect(1), vec!["a".to_string(), "b".to_string()]);
        assert!(!subs.is_subscribed("a"));
        assert_eq!(subs.subscribers("b").collect::<Vec<_>>(), vec![2]);

        // A second disconnect is a no-op.
        assert!(subs.on_disconnect(1).is_empty());
    }

    #[test]
    fn find_matches_filters_by_pattern() {
        let mut subs = SubscriptionManager::new();
        subs.on_subscribe(1, "eu.stocks.de", true);
        subs.on_subscribe(2, "eu.bonds.fr", true);
        subs.on_subscribe(3, "us.stocks.ny", true);

        let pattern = Regex::new(".*stocks.*").unwrap();
        let matches = subs.find_matches(&pattern);
        assert_eq!(
            matches,
            vec![
                ("eu.stocks.de".to_string(), vec![1]),
                ("us.stocks.ny".to_string(), vec![3]),
            ]
        );
    }
}
