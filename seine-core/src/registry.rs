//! Per-account channel → session attachment map.
//!
//! Mutated from the account's command path and from multiplexer-task
//! callbacks (login claims, disconnect detaches), so everything lives
//! under one mutex held only for the duration of the map mutation.
//! A channel name appears at most once and is attached to at most one
//! session; detaching always precedes re-attachment.

use std::collections::HashMap;

use parking_lot::Mutex;

/// One tracked channel.
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    /// Index of the session currently responsible, if any. A lookup
    /// key, not an owning reference.
    pub session: Option<usize>,
    /// True once the JOIN was accepted by the remote, not merely sent.
    pub joined: bool,
}

/// Channel assignment registry for one account.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the full channel set (from the external store),
    /// discarding all in-memory attachment state.
    pub fn load(&self, names: Vec<String>) {
        let mut map = self.channels.lock();
        map.clear();
        for name in names {
            let name = crate::irc::normalize_channel(&name);
            map.entry(name.clone()).or_insert(Channel {
                name,
                session: None,
                joined: false,
            });
        }
    }

    /// Register a channel attached to `session`. Returns false if the
    /// name was already present (no change is made).
    pub fn add_channel(&self, name: &str, session: Option<usize>) -> bool {
        let name = crate::irc::normalize_channel(name);
        let mut map = self.channels.lock();
        if map.contains_key(&name) {
            return false;
        }
        map.insert(
            name.clone(),
            Channel {
                name,
                session,
                joined: false,
            },
        );
        true
    }

    pub fn remove_channel(&self, name: &str) -> bool {
        self.channels
            .lock()
            .remove(&crate::irc::normalize_channel(name))
            .is_some()
    }

    /// Atomically remove and return one entry (used by leave).
    pub fn extract_channel(&self, name: &str) -> Option<Channel> {
        self.channels
            .lock()
            .remove(&crate::irc::normalize_channel(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels
            .lock()
            .contains_key(&crate::irc::normalize_channel(name))
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Claim currently-unattached channels for `session` until it
    /// holds its fair share, and return the newly claimed names. Fair
    /// share is `ceil(registry size / session count)`, counting
    /// channels the session already holds. The lock makes the whole
    /// claim atomic, so two sessions logging in concurrently can never
    /// double-assign a channel.
    pub fn attach_to_session(&self, session: usize, session_count: usize) -> Vec<String> {
        let mut map = self.channels.lock();
        let total = map.len();
        let count = session_count.max(1);
        let fair_share = total.div_ceil(count);
        let held = map
            .values()
            .filter(|ch| ch.session == Some(session))
            .count();
        let quota = fair_share.saturating_sub(held);

        let mut claimed = Vec::new();
        for ch in map.values_mut() {
            if claimed.len() >= quota {
                break;
            }
            if ch.session.is_none() {
                ch.session = Some(session);
                ch.joined = false;
                claimed.push(ch.name.clone());
            }
        }
        claimed
    }

    /// Clear attachment for every channel pointing at `session`. The
    /// freed channels stay registered and are claimed by the next
    /// session that logs in.
    pub fn detach_from_session(&self, session: usize) -> usize {
        let mut map = self.channels.lock();
        let mut freed = 0;
        for ch in map.values_mut() {
            if ch.session == Some(session) {
                ch.session = None;
                ch.joined = false;
                freed += 1;
            }
        }
        freed
    }

    /// Mark a channel's JOIN as accepted by the remote.
    pub fn mark_joined(&self, name: &str) {
        if let Some(ch) = self
            .channels
            .lock()
            .get_mut(&crate::irc::normalize_channel(name))
        {
            ch.joined = true;
        }
    }

    /// Record a server-initiated PART: the channel stays registered
    /// but is no longer joined or attached.
    pub fn mark_parted(&self, name: &str) {
        if let Some(ch) = self
            .channels
            .lock()
            .get_mut(&crate::irc::normalize_channel(name))
        {
            ch.joined = false;
            ch.session = None;
        }
    }

    /// Channels attached to `session` whose JOIN the remote has not
    /// confirmed yet (declined by the rate gate, lost on a stalled
    /// link, or still in flight).
    pub fn unjoined_for_session(&self, session: usize) -> Vec<String> {
        self.channels
            .lock()
            .values()
            .filter(|ch| ch.session == Some(session) && !ch.joined)
            .map(|ch| ch.name.clone())
            .collect()
    }

    /// Session currently attached to `name`, if any.
    pub fn session_for(&self, name: &str) -> Option<usize> {
        self.channels
            .lock()
            .get(&crate::irc::normalize_channel(name))
            .and_then(|ch| ch.session)
    }

    /// Channel names in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.channels.lock().keys().cloned().collect()
    }

    /// `(channel, attached session)` pairs for the stats sink.
    pub fn assignment_snapshot(&self) -> Vec<(String, Option<usize>)> {
        self.channels
            .lock()
            .values()
            .map(|ch| (ch.name.clone(), ch.session))
            .collect()
    }
}
