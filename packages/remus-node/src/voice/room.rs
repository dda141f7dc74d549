//! Voice room state.
//!
//! A room exists per voice channel while it has at least one peer. All
//! maps here are transient, owned by the coordinator, and destroyed when
//! peers depart. Mutation happens under the map guards; adapter handles
//! are cloned out so nothing async runs while a guard is held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::views::ProducerInfo;

use super::media::{MediaConsumer, MediaProducer, MediaTransport};

/// One connected voice session for one socket.
pub struct Peer {
    pub session_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub transports: HashMap<String, Arc<dyn MediaTransport>>,
    pub producers: HashMap<String, Arc<dyn MediaProducer>>,
    pub consumers: HashMap<String, Arc<dyn MediaConsumer>>,
    pub speaking: bool,
}

impl Peer {
    fn new(session_id: &str, user_id: &str, channel_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            speaking: false,
        }
    }
}

pub struct ProducerEntry {
    pub producer: Arc<dyn MediaProducer>,
    pub peer_id: String,
    pub user_id: String,
}

#[derive(Default)]
pub struct Room {
    pub peers: HashMap<String, Peer>,
    pub producers: HashMap<String, ProducerEntry>,
}

/// Raw presence data before usernames are joined in.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub session_id: String,
    pub user_id: String,
    pub speaking: bool,
}

/// Everything a departing peer owned, for async teardown.
pub struct PeerCleanup {
    pub user_id: String,
    pub channel_id: String,
    pub transports: Vec<Arc<dyn MediaTransport>>,
    pub producers: Vec<(String, Arc<dyn MediaProducer>)>,
    pub consumers: Vec<Arc<dyn MediaConsumer>>,
}

/// How long a computed presence view may be served before recomputing.
pub const PRESENCE_CACHE_TTL: Duration = Duration::from_secs(5);

/// Concurrent index of voice rooms, keyed by channel id.
#[derive(Clone, Default)]
pub struct VoiceRooms {
    rooms: Arc<DashMap<String, Room>>,
    /// session id → channel id, for O(1) "which channel is this socket in".
    session_channels: Arc<DashMap<String, String>>,
    presence_cache: Arc<DashMap<String, (Instant, crate::views::PresenceView)>>,
}

impl VoiceRooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel_of(&self, session_id: &str) -> Option<String> {
        self.session_channels.get(session_id).map(|c| c.clone())
    }

    /// Create an empty peer in the channel's room.
    pub fn insert_peer(&self, channel_id: &str, session_id: &str, user_id: &str) {
        let mut room = self.rooms.entry(channel_id.to_string()).or_default();
        room.peers
            .insert(session_id.to_string(), Peer::new(session_id, user_id, channel_id));
        self.session_channels.insert(session_id.to_string(), channel_id.to_string());
        self.invalidate_presence(channel_id);
    }

    /// Remove a peer, collecting its media handles for teardown and the
    /// ids of its room-registered producers (for `producerClosed`
    /// broadcasts). An empty room is dropped.
    pub fn remove_peer(&self, session_id: &str) -> Option<(PeerCleanup, Vec<String>)> {
        let channel_id = self.session_channels.remove(session_id).map(|(_, c)| c)?;

        let mut result = None;
        if let Some(mut room) = self.rooms.get_mut(&channel_id) {
            if let Some(peer) = room.peers.remove(session_id) {
                let closed_producer_ids: Vec<String> = room
                    .producers
                    .iter()
                    .filter(|(_, entry)| entry.peer_id == session_id)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in &closed_producer_ids {
                    room.producers.remove(id);
                }
                result = Some((
                    PeerCleanup {
                        user_id: peer.user_id,
                        channel_id: channel_id.clone(),
                        transports: peer.transports.into_values().collect(),
                        producers: peer.producers.into_iter().collect(),
                        consumers: peer.consumers.into_values().collect(),
                    },
                    closed_producer_ids,
                ));
            }
            if room.peers.is_empty() {
                drop(room);
                self.rooms.remove(&channel_id);
            }
        }
        self.invalidate_presence(&channel_id);
        result
    }

    pub fn add_transport(&self, session_id: &str, transport: Arc<dyn MediaTransport>) -> bool {
        self.with_peer_mut(session_id, |peer| {
            peer.transports.insert(transport.id().to_string(), transport);
        })
    }

    pub fn get_transport(&self, session_id: &str, transport_id: &str) -> Option<Arc<dyn MediaTransport>> {
        let channel_id = self.channel_of(session_id)?;
        let room = self.rooms.get(&channel_id)?;
        room.peers.get(session_id)?.transports.get(transport_id).cloned()
    }

    /// Register a producer on both the peer and the room index.
    pub fn add_producer(&self, session_id: &str, producer: Arc<dyn MediaProducer>) -> bool {
        let Some(channel_id) = self.channel_of(session_id) else { return false };
        let Some(mut room) = self.rooms.get_mut(&channel_id) else { return false };
        let Some(peer) = room.peers.get_mut(session_id) else { return false };

        let user_id = peer.user_id.clone();
        peer.producers.insert(producer.id().to_string(), producer.clone());
        room.producers.insert(
            producer.id().to_string(),
            ProducerEntry { producer, peer_id: session_id.to_string(), user_id },
        );
        true
    }

    /// Deregister a producer. Only the owning peer may remove it.
    pub fn remove_producer(&self, session_id: &str, producer_id: &str) -> Option<Arc<dyn MediaProducer>> {
        let channel_id = self.channel_of(session_id)?;
        let mut room = self.rooms.get_mut(&channel_id)?;
        let owns = room.producers.get(producer_id).is_some_and(|e| e.peer_id == session_id);
        if !owns {
            return None;
        }
        room.producers.remove(producer_id);
        room.peers.get_mut(session_id)?.producers.remove(producer_id)
    }

    pub fn add_consumer(&self, session_id: &str, consumer: Arc<dyn MediaConsumer>) -> bool {
        self.with_peer_mut(session_id, |peer| {
            peer.consumers.insert(consumer.id().to_string(), consumer);
        })
    }

    pub fn get_consumer(&self, session_id: &str, consumer_id: &str) -> Option<Arc<dyn MediaConsumer>> {
        let channel_id = self.channel_of(session_id)?;
        let room = self.rooms.get(&channel_id)?;
        room.peers.get(session_id)?.consumers.get(consumer_id).cloned()
    }

    /// All producers in a channel except the given session's own.
    pub fn producers_excluding(&self, channel_id: &str, except_session: &str) -> Vec<ProducerInfo> {
        let Some(room) = self.rooms.get(channel_id) else { return Vec::new() };
        room.producers
            .iter()
            .filter(|(_, entry)| entry.peer_id != except_session)
            .map(|(id, entry)| ProducerInfo {
                producer_id: id.clone(),
                peer_id: entry.peer_id.clone(),
                user_id: entry.user_id.clone(),
                kind: entry.producer.kind().to_string(),
                app_data: entry.producer.app_data(),
            })
            .collect()
    }

    pub fn peer_snapshots(&self, channel_id: &str) -> Vec<PeerSnapshot> {
        let Some(room) = self.rooms.get(channel_id) else { return Vec::new() };
        let mut snapshots: Vec<PeerSnapshot> = room
            .peers
            .values()
            .map(|peer| PeerSnapshot {
                session_id: peer.session_id.clone(),
                user_id: peer.user_id.clone(),
                speaking: peer.speaking,
            })
            .collect();
        snapshots.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        snapshots
    }

    /// Flip the speaking flag; returns false when the session isn't a peer
    /// of that channel.
    pub fn set_speaking(&self, channel_id: &str, session_id: &str, speaking: bool) -> bool {
        let Some(mut room) = self.rooms.get_mut(channel_id) else { return false };
        match room.peers.get_mut(session_id) {
            Some(peer) => {
                peer.speaking = speaking;
                drop(room);
                self.invalidate_presence(channel_id);
                true
            }
            None => false,
        }
    }

    /// Channels that currently have peers.
    pub fn active_channels(&self) -> Vec<String> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Voice sessions of one user across every room.
    pub fn sessions_of_user(&self, user_id: &str) -> Vec<(String, String)> {
        let mut sessions = Vec::new();
        for room in self.rooms.iter() {
            for peer in room.peers.values() {
                if peer.user_id == user_id {
                    sessions.push((peer.session_id.clone(), peer.channel_id.clone()));
                }
            }
        }
        sessions
    }

    /// A user's audio (and screen-audio) producers across every room, for
    /// force-mute.
    pub fn audio_producers_of_user(
        &self,
        user_id: &str,
    ) -> Vec<(String, String, String, Arc<dyn MediaProducer>)> {
        let mut hits = Vec::new();
        for room in self.rooms.iter() {
            for (id, entry) in &room.producers {
                if entry.user_id != user_id {
                    continue;
                }
                let is_audio = entry.producer.kind() == "audio"
                    || entry.producer.app_data()["type"] == "screen-audio";
                if is_audio {
                    hits.push((
                        room.key().clone(),
                        id.clone(),
                        entry.peer_id.clone(),
                        entry.producer.clone(),
                    ));
                }
            }
        }
        hits
    }

    /// Deregister specific producers (force-mute path).
    pub fn remove_producers(&self, channel_id: &str, producer_ids: &[String]) {
        if let Some(mut room) = self.rooms.get_mut(channel_id) {
            for id in producer_ids {
                if let Some(entry) = room.producers.remove(id) {
                    if let Some(peer) = room.peers.get_mut(&entry.peer_id) {
                        peer.producers.remove(id);
                    }
                }
            }
        }
    }

    // ── Presence cache ───────────────────────────────────────────────────

    pub fn cached_presence(&self, channel_id: &str) -> Option<crate::views::PresenceView> {
        let entry = self.presence_cache.get(channel_id)?;
        let (computed_at, view) = entry.value();
        if computed_at.elapsed() < PRESENCE_CACHE_TTL {
            Some(view.clone())
        } else {
            None
        }
    }

    pub fn cache_presence(&self, channel_id: &str, view: crate::views::PresenceView) {
        self.presence_cache
            .insert(channel_id.to_string(), (Instant::now(), view));
    }

    fn invalidate_presence(&self, channel_id: &str) {
        self.presence_cache.remove(channel_id);
    }

    fn with_peer_mut(&self, session_id: &str, f: impl FnOnce(&mut Peer)) -> bool {
        let Some(channel_id) = self.channel_of(session_id) else { return false };
        let Some(mut room) = self.rooms.get_mut(&channel_id) else { return false };
        match room.peers.get_mut(session_id) {
            Some(peer) => {
                f(peer);
                true
            }
            None => false,
        }
    }
}
