//! The notification routing table: listeners register regex patterns and are
//! told when subscriptions to matching topics come and go.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use regex::Regex;

use crate::SessionId;
use crate::subscriptions::CountedBucket;

struct PatternListeners {
    regex: Regex,
    listeners: CountedBucket,
}

/// Outcome of a counted listen/unlisten call.
#[derive(Debug, PartialEq)]
pub enum ListenOutcome {
    /// A listener's first registration on this pattern; it should be sent the
    /// current image of matching subscriptions.
    Registered,
    /// A counted re-listen or a successful unlisten.
    Counted,
    /// A spurious unlisten; nothing changed.
    Ignored,
    /// The pattern failed to compile.
    InvalidPattern,
}

#[derive(Default)]
pub struct NotificationManager {
    // Keyed by the pattern source; the compiled regex is kept alongside so a
    // pattern is compiled once however many listeners share it.
    notifications: HashMap<String, PatternListeners>,
    patterns_by_session: HashMap<SessionId, HashSet<String>>,
}

impl NotificationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_listen(&mut self, session: SessionId, pattern: &str, is_add: bool) -> ListenOutcome {
        if is_add {
            let entry = match self.notifications.entry(pattern.to_string()) {
                Entry::Occupied(occupied) => occupied.into_mut(),
                Entry::Vacant(vacant) => {
                    let Ok(regex) = Regex::new(pattern) else {
                        return ListenOutcome::InvalidPattern;
                    };
                    vacant.insert(PatternListeners {
                        regex,
                        listeners: CountedBucket::default(),
                    })
                }
            };

            let newly_registered = !entry.listeners.sessions().any(|id| id == session);
            entry.listeners.increment(session);
            self.patterns_by_session
                .entry(session)
                .or_default()
                .insert(pattern.to_string());

            if newly_registered {
                ListenOutcome::Registered
            } else {
                ListenOutcome::Counted
            }
        } else {
            let Some(entry) = self.notifications.get_mut(pattern) else {
                return ListenOutcome::Ignored;
            };
            if !entry.listeners.decrement(session) {
                return ListenOutcome::Ignored;
            }
            let fully_removed = !entry.listeners.sessions().any(|id| id == session);
            let empty = entry.listeners.is_empty();
            if empty {
                self.notifications.remove(pattern);
            }
            if fully_removed {
                self.forget(session, pattern);
            }
            ListenOutcome::Counted
        }
    }

    /// The listeners to tell about a subscription change on `topic`, across
    /// every matching pattern. The subscriber itself is never notified of its
    /// own changes, and a listener under several matching patterns is told
    /// once per pattern, matching the per-pattern ref-count model.
    pub fn interested_listeners(&self, subscriber: SessionId, topic: &str) -> Vec<SessionId> {
        let mut interested = Vec::new();
        for entry in self.notifications.values() {
            if !entry.regex.is_match(topic) {
                continue;
            }
            for listener in entry.listeners.sessions() {
                if listener != subscriber {
                    interested.push(listener);
                }
            }
        }
        interested
    }

    pub fn pattern(&self, source: &str) -> Option<&Regex> {
        self.notifications.get(source).map(|entry| &entry.regex)
    }

    pub fn on_disconnect(&mut self, session: SessionId) {
        let Some(patterns) = self.patterns_by_session.remove(&session) else {
            return;
        };
        for pattern in patterns {
            let empty = match self.notifications.get_mut(&pattern) {
                Some(entry) => {
                    entry.listeners.remove(session);
                    entry.listeners.is_empty()
                }
                None => false,
            };
            if empty {
                self.notifications.remove(&pattern);
            }
        }
    }

    fn forget(&mut self, session: SessionId, pattern: &str) {
        if let Some(patterns) = self.patterns_by_session.get_mut(&session) {
            patterns.remove(pattern);
            if patterns.is_empty() {
                self.patterns_by_session.remove(&session);
            }
        }
    }
}
