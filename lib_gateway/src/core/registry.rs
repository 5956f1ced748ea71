//! # Connection Registry
//!
//! In-memory bookkeeping for every live connection on this instance: which room
//! it is in, which logical session it belongs to, its optional identity label,
//! the public sub-topics it joined, and the send half used to reach it.
//!
//! The registry is a plain owned struct with no locking of its own. The `Hub`
//! keeps exactly one behind a `RwLock` and is the only code that mutates it, so
//! every method here can assume exclusive access.
//!
//! ## Counters
//!
//! - `room_counts[room]`: physical connections per room.
//! - `public_sessions[session]`: reference count of public connections sharing
//!   a session. The number of keys is the distinct-session online count.
//! - `topic_counts[topic]`: connections joined to a public sub-topic.
//!
//! Counters are removed when they reach zero, so a key present in any of the
//! maps always has a positive count.

use std::collections::{BTreeSet, HashMap};

use crate::core::envelope::{ConnectionId, ConnectionSender, Room};

struct ConnectionEntry {
    room: Room,
    session: String,
    identity: Option<String>,
    sender: ConnectionSender,
    topics: BTreeSet<String>,
}

/// Change of the public distinct-session count caused by one mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceDelta {
    /// Distinct sessions before the mutation.
    pub before: usize,
    /// Distinct sessions after the mutation.
    pub after: usize,
    /// The session whose last public connection went away, if any.
    pub departed: Option<String>,
}

impl PresenceDelta {
    fn unchanged(count: usize) -> Self {
        Self {
            before: count,
            after: count,
            departed: None,
        }
    }

    /// A new distinct session appeared.
    pub fn went_online(&self) -> bool {
        self.after > self.before
    }

    /// A distinct session disappeared.
    pub fn went_offline(&self) -> bool {
        self.after < self.before
    }
}

/// Result of a `register` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
    /// False when the call was an idempotent no-op.
    pub changed: bool,
    /// The connection was not in the public room before and is now.
    pub entered_public: bool,
    /// Distinct-session movement.
    pub presence: PresenceDelta,
    /// Sub-topics dropped because the connection left the public room.
    pub left_topics: Vec<String>,
    /// Identity label (or session) of the connection after the call.
    pub identity: String,
}

/// Everything known about a connection at the moment it was unregistered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// Room the connection was in.
    pub room: Room,
    /// Its effective session.
    pub session: String,
    /// Identity label, falling back to the session.
    pub identity: String,
    /// Sub-topics it was still joined to.
    pub topics: Vec<String>,
    /// Distinct-session movement.
    pub presence: PresenceDelta,
}

/// # Registry
///
/// See the module docs for the counter invariants.
#[derive(Default)]
pub struct Registry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    room_counts: HashMap<Room, usize>,
    public_sessions: HashMap<String, usize>,
    topic_counts: HashMap<String, usize>,
}

/// Explicit non-blank session, else the previously recorded one, else the
/// connection id itself.
fn resolve_session(explicit: Option<&str>, previous: Option<&str>, id: &ConnectionId) -> String {
    explicit
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or(previous)
        .unwrap_or(id.as_str())
        .to_string()
}

fn decrement(map: &mut HashMap<String, usize>, key: &str) -> bool {
    match map.get_mut(key) {
        Some(count) if *count > 1 => {
            *count -= 1;
            false
        }
        Some(_) => {
            map.remove(key);
            true
        }
        None => false,
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `id` as a member of `room` under the resolved session.
    ///
    /// Same room and same effective session is a no-op apart from refreshing
    /// the send half. Otherwise the previous room/session counters are released
    /// before the new state is recorded.
    pub fn register(
        &mut self,
        id: &ConnectionId,
        room: Room,
        session: Option<&str>,
        sender: ConnectionSender,
    ) -> Registration {
        let before = self.public_sessions.len();
        let previous = self.connections.get(id);
        let session = resolve_session(session, previous.map(|e| e.session.as_str()), id);

        if let Some(entry) = self.connections.get_mut(id) {
            if entry.room == room && entry.session == session {
                entry.sender = sender;
                return Registration {
                    changed: false,
                    entered_public: false,
                    presence: PresenceDelta::unchanged(before),
                    left_topics: Vec::new(),
                    identity: entry.identity.clone().unwrap_or_else(|| session.clone()),
                };
            }
        }

        let mut departed = None;
        let mut identity = None;
        let mut topics = BTreeSet::new();
        let mut left_topics = Vec::new();
        let was_public = match self.connections.remove(id) {
            Some(prev) => {
                departed = self.release(prev.room, &prev.session);
                identity = prev.identity;
                if room == Room::Public {
                    topics = prev.topics;
                } else {
                    for topic in prev.topics {
                        decrement(&mut self.topic_counts, &topic);
                        left_topics.push(topic);
                    }
                }
                prev.room == Room::Public
            }
            None => false,
        };

        self.acquire(room, &session);
        let after = self.public_sessions.len();
        let label = identity.clone().unwrap_or_else(|| session.clone());

        self.connections.insert(
            id.clone(),
            ConnectionEntry {
                room,
                session,
                identity,
                sender,
                topics,
            },
        );

        Registration {
            changed: true,
            entered_public: room == Room::Public && !was_public,
            presence: PresenceDelta {
                before,
                after,
                departed: if after < before { departed } else { None },
            },
            left_topics,
            identity: label,
        }
    }

    /// Re-binds a registered connection to another session without changing
    /// its room. Returns `None` for unknown connections or blank sessions.
    pub fn rebind_session(&mut self, id: &ConnectionId, session: &str) -> Option<Registration> {
        if session.trim().is_empty() {
            return None;
        }
        let (room, sender) = {
            let entry = self.connections.get(id)?;
            (entry.room, entry.sender.clone())
        };
        Some(self.register(id, room, Some(session), sender))
    }

    /// Removes every trace of `id`. Unknown connections yield `None`.
    pub fn unregister(&mut self, id: &ConnectionId) -> Option<Departure> {
        let before = self.public_sessions.len();
        let entry = self.connections.remove(id)?;
        let departed = self.release(entry.room, &entry.session);
        let mut topics = Vec::with_capacity(entry.topics.len());
        for topic in entry.topics {
            decrement(&mut self.topic_counts, &topic);
            topics.push(topic);
        }
        let after = self.public_sessions.len();

        Some(Departure {
            room: entry.room,
            identity: entry.identity.unwrap_or_else(|| entry.session.clone()),
            session: entry.session,
            topics,
            presence: PresenceDelta {
                before,
                after,
                departed: if after < before { departed } else { None },
            },
        })
    }

    /// Adds `id` to a public sub-topic. Returns `true` only on a new join.
    pub fn join(&mut self, id: &ConnectionId, topic: &str) -> bool {
        let Some(entry) = self.connections.get_mut(id) else {
            return false;
        };
        if entry.room != Room::Public || !entry.topics.insert(topic.to_string()) {
            return false;
        }
        *self.topic_counts.entry(topic.to_string()).or_insert(0) += 1;
        true
    }

    /// Removes `id` from a sub-topic. Returns the connection's identity label
    /// when it actually was a member.
    pub fn leave(&mut self, id: &ConnectionId, topic: &str) -> Option<String> {
        let entry = self.connections.get_mut(id)?;
        if !entry.topics.remove(topic) {
            return None;
        }
        decrement(&mut self.topic_counts, topic);
        Some(entry.identity.clone().unwrap_or_else(|| entry.session.clone()))
    }

    /// Sets the identity label. Returns `false` for unknown connections.
    pub fn set_identity(&mut self, id: &ConnectionId, identity: &str) -> bool {
        match self.connections.get_mut(id) {
            Some(entry) => {
                entry.identity = Some(identity.to_string());
                true
            }
            None => false,
        }
    }

    /// `None`: all live connections. `Public`: distinct sessions.
    /// `Admin`: raw connection count.
    pub fn client_count(&self, room: Option<Room>) -> usize {
        match room {
            None => self.connections.len(),
            Some(Room::Public) => self.public_sessions.len(),
            Some(room) => self.room_count(room),
        }
    }

    /// Physical connections in `room`.
    pub fn room_count(&self, room: Room) -> usize {
        self.room_counts.get(&room).copied().unwrap_or(0)
    }

    /// Connections joined to `topic`.
    pub fn topic_count(&self, topic: &str) -> usize {
        self.topic_counts.get(topic).copied().unwrap_or(0)
    }

    /// Whether `id` is currently registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Room of a registered connection.
    pub fn room_of(&self, id: &ConnectionId) -> Option<Room> {
        self.connections.get(id).map(|e| e.room)
    }

    /// Effective session of a registered connection.
    pub fn session_of(&self, id: &ConnectionId) -> Option<&str> {
        self.connections.get(id).map(|e| e.session.as_str())
    }

    /// Send half of a registered connection.
    pub fn sender_of(&self, id: &ConnectionId) -> Option<ConnectionSender> {
        self.connections.get(id).map(|e| e.sender.clone())
    }

    /// Send halves of every connection in `target` (`None` for all rooms).
    pub fn senders(&self, target: Option<Room>) -> Vec<ConnectionSender> {
        self.connections
            .values()
            .filter(|e| target.map_or(true, |room| e.room == room))
            .map(|e| e.sender.clone())
            .collect()
    }

    /// Send halves of every connection joined to `topic`.
    pub fn topic_senders(&self, topic: &str) -> Vec<ConnectionSender> {
        if !self.topic_counts.contains_key(topic) {
            return Vec::new();
        }
        self.connections
            .values()
            .filter(|e| e.topics.contains(topic))
            .map(|e| e.sender.clone())
            .collect()
    }

    fn acquire(&mut self, room: Room, session: &str) {
        *self.room_counts.entry(room).or_insert(0) += 1;
        if room == Room::Public {
            *self.public_sessions.entry(session.to_string()).or_insert(0) += 1;
        }
    }

    /// Returns the session when its last public connection was released.
    fn release(&mut self, room: Room, session: &str) -> Option<String> {
        if let Some(count) = self.room_counts.get_mut(&room) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.room_counts.remove(&room);
            }
        }
        if room == Room::Public && decrement(&mut self.public_sessions, session) {
            return Some(session.to_string());
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let mut rooms: HashMap<Room, usize> = HashMap::new();
        let mut sessions: HashMap<String, usize> = HashMap::new();
        let mut topics: HashMap<String, usize> = HashMap::new();
        for entry in self.connections.values() {
            *rooms.entry(entry.room).or_insert(0) += 1;
            if entry.room == Room::Public {
                *sessions.entry(entry.session.clone()).or_insert(0) += 1;
            }
            for topic in &entry.topics {
                *topics.entry(topic.clone()).or_insert(0) += 1;
            }
        }
        assert_eq!(rooms, self.room_counts);
        assert_eq!(sessions, self.public_sessions);
        assert_eq!(topics, self.topic_counts);
        assert!(self.public_sessions.len() <= self.room_count(Room::Public));
    }
}
