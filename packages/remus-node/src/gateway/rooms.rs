//! Room fan-out.
//!
//! Sockets join typed multicast groups (`user:`, `guild:`, `channel:`,
//! `voice:`). Delivery goes through each socket's unbounded sender, so
//! fan-out never blocks a handler; a closed receiver just drops frames
//! until the disconnect hook runs.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::protocol::ServerEvent;

/// A gateway room. Not persisted; membership lives only in this index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomKey {
    User(String),
    Guild(String),
    Channel(String),
    Voice(String),
}

impl std::fmt::Display for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomKey::User(id) => write!(f, "user:{id}"),
            RoomKey::Guild(id) => write!(f, "guild:{id}"),
            RoomKey::Channel(id) => write!(f, "channel:{id}"),
            RoomKey::Voice(id) => write!(f, "voice:{id}"),
        }
    }
}

/// What the per-socket sender task receives.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(ServerEvent),
    /// Server-initiated disconnect (kick/ban). Any queued events are
    /// flushed first.
    Close,
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

#[derive(Clone)]
struct SocketHandle {
    user_id: String,
    tx: OutboundSender,
}

/// Concurrent index of sockets and the rooms they joined.
#[derive(Clone, Default)]
pub struct RoomIndex {
    sessions: Arc<DashMap<String, SocketHandle>>,
    rooms: Arc<DashMap<RoomKey, HashSet<String>>>,
    user_sessions: Arc<DashMap<String, HashSet<String>>>,
}

impl RoomIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: &str, user_id: &str, tx: OutboundSender) {
        self.sessions
            .insert(session_id.to_string(), SocketHandle { user_id: user_id.to_string(), tx });
        self.user_sessions
            .entry(user_id.to_string())
            .or_default()
            .insert(session_id.to_string());
        self.join(session_id, RoomKey::User(user_id.to_string()));
    }

    /// Deregister a socket from every index. The single cleanup hook for
    /// disconnects.
    pub fn unregister(&self, session_id: &str) {
        let handle = match self.sessions.remove(session_id) {
            Some((_, handle)) => handle,
            None => return,
        };
        self.rooms.retain(|_, members| {
            members.remove(session_id);
            !members.is_empty()
        });
        if let Some(mut sessions) = self.user_sessions.get_mut(&handle.user_id) {
            sessions.remove(session_id);
            if sessions.is_empty() {
                drop(sessions);
                self.user_sessions.remove(&handle.user_id);
            }
        }
    }

    pub fn join(&self, session_id: &str, key: RoomKey) {
        self.rooms.entry(key).or_default().insert(session_id.to_string());
    }

    pub fn leave(&self, session_id: &str, key: &RoomKey) {
        if let Some(mut members) = self.rooms.get_mut(key) {
            members.remove(session_id);
            if members.is_empty() {
                drop(members);
                self.rooms.remove(key);
            }
        }
    }

    pub fn sessions_of_user(&self, user_id: &str) -> Vec<String> {
        self.user_sessions
            .get(user_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn send_to_session(&self, session_id: &str, event: ServerEvent) -> bool {
        match self.sessions.get(session_id) {
            Some(handle) => handle.tx.send(Outbound::Event(event)).is_ok(),
            None => false,
        }
    }

    /// Deliver to every socket the user has open.
    pub fn send_to_user(&self, user_id: &str, event: ServerEvent) {
        for session_id in self.sessions_of_user(user_id) {
            self.send_to_session(&session_id, event.clone());
        }
    }

    pub fn broadcast(&self, key: &RoomKey, event: ServerEvent) {
        self.broadcast_except(key, None, event)
    }

    /// Broadcast to a room, optionally skipping one session (the sender).
    pub fn broadcast_except(&self, key: &RoomKey, except: Option<&str>, event: ServerEvent) {
        let members: Vec<String> = match self.rooms.get(key) {
            Some(members) => members.iter().cloned().collect(),
            None => return,
        };
        for session_id in members {
            if except.is_some_and(|e| e == session_id) {
                continue;
            }
            self.send_to_session(&session_id, event.clone());
        }
    }

    /// Flush a final event to all of a user's sockets, then close them.
    pub fn disconnect_user(&self, user_id: &str, event: Option<ServerEvent>) {
        for session_id in self.sessions_of_user(user_id) {
            if let Some(handle) = self.sessions.get(&session_id) {
                if let Some(event) = &event {
                    let _ = handle.tx.send(Outbound::Event(event.clone()));
                }
                let _ = handle.tx.send(Outbound::Close);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(index: &RoomIndex, session: &str, user: &str) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        index.register(session, user, tx);
        rx
    }

    fn expect_event(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> ServerEvent {
        match rx.try_recv().expect("expected a frame") {
            Outbound::Event(event) => event,
            Outbound::Close => panic!("expected event, got close"),
        }
    }

    #[test]
    fn test_register_joins_user_room() {
        let index = RoomIndex::new();
        let mut rx = connect(&index, "s1", "u1");

        index.send_to_user("u1", ServerEvent::Ack { seq: 1 });
        match expect_event(&mut rx) {
            ServerEvent::Ack { seq } => assert_eq!(seq, 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_broadcast_except_sender() {
        let index = RoomIndex::new();
        let mut rx1 = connect(&index, "s1", "u1");
        let mut rx2 = connect(&index, "s2", "u2");

        let key = RoomKey::Channel("c1".to_string());
        index.join("s1", key.clone());
        index.join("s2", key.clone());

        index.broadcast_except(
            &key,
            Some("s1"),
            ServerEvent::TypingStart { channel_id: "c1".into(), user_id: "u1".into() },
        );

        assert!(rx1.try_recv().is_err());
        match expect_event(&mut rx2) {
            ServerEvent::TypingStart { user_id, .. } => assert_eq!(user_id, "u1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unregister_leaves_every_room() {
        let index = RoomIndex::new();
        let _rx = connect(&index, "s1", "u1");
        index.join("s1", RoomKey::Channel("c1".to_string()));
        index.join("s1", RoomKey::Voice("vc".to_string()));

        index.unregister("s1");

        assert_eq!(index.connected_count(), 0);
        assert!(index.sessions_of_user("u1").is_empty());
        // Broadcasting to the old rooms delivers nowhere (and does not panic).
        index.broadcast(&RoomKey::Voice("vc".to_string()), ServerEvent::Ack { seq: 0 });
    }

    #[test]
    fn test_multiple_sessions_per_user() {
        let index = RoomIndex::new();
        let mut rx1 = connect(&index, "s1", "u1");
        let mut rx2 = connect(&index, "s2", "u1");

        index.send_to_user("u1", ServerEvent::Ack { seq: 9 });
        expect_event(&mut rx1);
        expect_event(&mut rx2);

        index.unregister("s1");
        assert_eq!(index.sessions_of_user("u1"), vec!["s2".to_string()]);
    }

    #[test]
    fn test_disconnect_user_sends_event_then_close() {
        let index = RoomIndex::new();
        let mut rx = connect(&index, "s1", "u1");

        index.disconnect_user(
            "u1",
            Some(ServerEvent::GuildKicked { guild_id: "g1".into(), reason: "banned".into() }),
        );

        match rx.try_recv().unwrap() {
            Outbound::Event(ServerEvent::GuildKicked { reason, .. }) => assert_eq!(reason, "banned"),
            other => panic!("unexpected {other:?}"),
        }
        match rx.try_recv().unwrap() {
            Outbound::Close => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
