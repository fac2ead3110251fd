//! Room membership for the relay.
//!
//! Every session is assigned a room when it connects, but it only receives
//! room broadcasts once it has joined. Sessions belong to exactly one room.

use std::{collections::BTreeMap, fmt};

pub const DEFAULT_ROOM: &str = "DEFAULT";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(nanoid::nanoid!())
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
struct Membership {
    room: String,
    joined: bool,
}

/// Result of a join: the effective room and the room that was left, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub room: String,
    pub left: Option<String>,
}

#[derive(Debug)]
pub struct RoomRegistry {
    default_room: String,
    sessions: BTreeMap<SessionId, Membership>,
}

impl RoomRegistry {
    pub fn new(default_room: impl Into<String>) -> Self {
        Self {
            default_room: default_room.into(),
            sessions: BTreeMap::new(),
        }
    }

    /// Records a new session under the default room. Returns the assigned room.
    pub fn connect(&mut self, session: SessionId) -> &str {
        let membership = self.sessions.entry(session).or_insert_with(|| Membership {
            room: self.default_room.clone(),
            joined: false,
        });
        &membership.room
    }

    /// Joins the session to `room`, or to its assigned room when `room` is `None`.
    ///
    /// Moving to a different room leaves the previous one; `left` is only set
    /// when the session had actually joined it.
    pub fn join(&mut self, session: &SessionId, room: Option<&str>) -> Option<JoinOutcome> {
        let membership = self.sessions.get_mut(session)?;
        let target = room.unwrap_or(&membership.room).to_string();
        let left = (membership.joined && membership.room != target)
            .then(|| std::mem::replace(&mut membership.room, target.clone()));
        membership.room = target.clone();
        membership.joined = true;
        Some(JoinOutcome { room: target, left })
    }

    pub fn room_of(&self, session: &SessionId) -> Option<&str> {
        self.sessions.get(session).map(|membership| membership.room.as_str())
    }

    /// Joined members of `room` other than `except`.
    pub fn members_except(&self, room: &str, except: &SessionId) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|(id, membership)| {
                *id != except && membership.joined && membership.room == room
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Removes the session. Returns the room it had joined, if any.
    pub fn disconnect(&mut self, session: &SessionId) -> Option<String> {
        self.sessions
            .remove(session)
            .and_then(|membership| membership.joined.then_some(membership.room))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_ROOM)
    }
}
