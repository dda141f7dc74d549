//! Voice signaling coordinator.
//!
//! Maps each voice channel to a routing room, negotiates send/receive
//! transports per peer, and publishes producer/consumer lifecycle events.
//! Every hop is permission-gated; failures answer only the caller and
//! leave room invariants intact; a later `voice:leave` or disconnect
//! cleans up whatever state the peer reached.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use remus_core::{ChannelKind, Permission, Store};

use crate::error::{ApiError, ApiResult};
use crate::gateway::protocol::{MediaKind, ServerEvent};
use crate::gateway::rooms::{RoomIndex, RoomKey};
use crate::state::query_permissions;
use crate::views::{ParticipantInfo, PresenceUser, PresenceView};

use super::media::{MediaRouter, TransportOptions};
use super::room::{PeerCleanup, VoiceRooms};

pub struct VoiceCoordinator {
    router: Arc<dyn MediaRouter>,
    pub rooms: VoiceRooms,
    index: RoomIndex,
    store: Store,
    transport_options: TransportOptions,
}

impl VoiceCoordinator {
    pub fn new(
        router: Arc<dyn MediaRouter>,
        index: RoomIndex,
        store: Store,
        transport_options: TransportOptions,
    ) -> Self {
        Self { router, rooms: VoiceRooms::new(), index, store, transport_options }
    }

    // ── Join / leave ─────────────────────────────────────────────────────

    pub async fn join(&self, session_id: &str, user_id: &str, seq: u64, channel_id: &str) -> ApiResult<()> {
        let channel = self
            .store
            .get_channel(channel_id)?
            .ok_or_else(|| ApiError::NotFound("channel".into()))?;
        if channel.kind != ChannelKind::Voice {
            return Err(ApiError::BadRequest("not a voice channel".into()));
        }

        let perms = query_permissions(&self.store, user_id, Some(channel_id))?;
        if !perms.has(Permission::ViewChannels) || !perms.has(Permission::VoiceConnect) {
            return Err(ApiError::forbidden());
        }

        // Already in a voice channel (this one included): leave it first.
        if self.rooms.channel_of(session_id).is_some() {
            self.cleanup(session_id).await;
        }

        self.rooms.insert_peer(channel_id, session_id, user_id);
        self.index.join(session_id, RoomKey::Voice(channel_id.to_string()));

        let participants: Vec<ParticipantInfo> = self
            .rooms
            .peer_snapshots(channel_id)
            .into_iter()
            .filter(|p| p.session_id != session_id)
            .map(|p| {
                let username = self.username_of(&p.user_id);
                ParticipantInfo { session_id: p.session_id, user_id: p.user_id, username }
            })
            .collect();
        self.index.send_to_session(
            session_id,
            ServerEvent::VoiceParticipants {
                seq,
                channel_id: channel_id.to_string(),
                participants,
            },
        );

        let producers = self.rooms.producers_excluding(channel_id, session_id);
        self.index.send_to_session(
            session_id,
            ServerEvent::VoiceExistingProducers { channel_id: channel_id.to_string(), producers },
        );

        self.publish_presence(channel_id);
        tracing::debug!(session = session_id, user = user_id, channel = channel_id, "voice join");
        Ok(())
    }

    pub async fn leave(&self, session_id: &str, seq: u64) -> ApiResult<()> {
        self.cleanup(session_id).await;
        self.index.send_to_session(session_id, ServerEvent::Ack { seq });
        Ok(())
    }

    /// Tear down a departing peer: close its media, broadcast
    /// `producerClosed` for everything it was publishing, refresh
    /// presence. Runs on `voice:leave` and on socket disconnect.
    pub async fn cleanup(&self, session_id: &str) {
        let Some((cleanup, closed_producers)) = self.rooms.remove_peer(session_id) else {
            return;
        };
        let channel_id = cleanup.channel_id.clone();
        self.index.leave(session_id, &RoomKey::Voice(channel_id.clone()));

        for producer_id in &closed_producers {
            self.index.broadcast(
                &RoomKey::Voice(channel_id.clone()),
                ServerEvent::VoiceProducerClosed {
                    channel_id: channel_id.clone(),
                    producer_id: producer_id.clone(),
                    peer_id: session_id.to_string(),
                },
            );
        }

        close_peer_media(cleanup).await;
        self.publish_presence(&channel_id);
        tracing::debug!(session = session_id, channel = %channel_id, "voice peer cleaned up");
    }

    // ── Capabilities & transports ────────────────────────────────────────

    pub fn router_rtp_capabilities(&self, session_id: &str, seq: u64) {
        self.index.send_to_session(
            session_id,
            ServerEvent::VoiceRouterRtpCapabilities {
                seq,
                rtp_capabilities: self.router.rtp_capabilities(),
            },
        );
    }

    pub async fn create_transport(&self, session_id: &str, seq: u64, direction: &str) -> ApiResult<()> {
        if self.rooms.channel_of(session_id).is_none() {
            return Err(ApiError::BadRequest("join a voice channel first".into()));
        }

        let transport = self
            .router
            .create_webrtc_transport(self.transport_options.clone())
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let handshake = transport.handshake();
        if !self.rooms.add_transport(session_id, transport) {
            return Err(ApiError::BadRequest("voice session gone".into()));
        }

        self.index.send_to_session(
            session_id,
            ServerEvent::VoiceTransportCreated {
                seq,
                direction: direction.to_string(),
                id: handshake.id,
                ice_parameters: handshake.ice_parameters,
                ice_candidates: handshake.ice_candidates,
                dtls_parameters: handshake.dtls_parameters,
            },
        );
        Ok(())
    }

    pub async fn connect_transport(
        &self,
        session_id: &str,
        seq: u64,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> ApiResult<()> {
        let transport = self
            .rooms
            .get_transport(session_id, transport_id)
            .ok_or_else(|| ApiError::NotFound("transport".into()))?;
        transport
            .connect(dtls_parameters)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        self.index.send_to_session(session_id, ServerEvent::Ack { seq });
        Ok(())
    }

    // ── Producers ────────────────────────────────────────────────────────

    pub async fn produce(
        &self,
        session_id: &str,
        user_id: &str,
        seq: u64,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> ApiResult<()> {
        let channel_id = self
            .rooms
            .channel_of(session_id)
            .ok_or_else(|| ApiError::BadRequest("join a voice channel first".into()))?;

        let perms = query_permissions(&self.store, user_id, Some(&channel_id))?;
        let app_type = app_data["type"].as_str().unwrap_or("");
        let is_screen = kind == MediaKind::Video || app_type == "screen" || app_type == "screen-audio";

        if kind == MediaKind::Audio {
            if !perms.has(Permission::VoiceSpeak) {
                return Err(ApiError::forbidden());
            }
            let guild_id = self.store.node_guild_id()?;
            let muted = self
                .store
                .get_member(&guild_id, user_id)?
                .is_some_and(|m| m.voice_muted);
            if muted {
                return Err(ApiError::Forbidden("server muted".into()));
            }
        }
        if is_screen && !perms.has(Permission::Screenshare) {
            return Err(ApiError::forbidden());
        }

        let transport = self
            .rooms
            .get_transport(session_id, transport_id)
            .ok_or_else(|| ApiError::NotFound("transport".into()))?;

        let mut enriched = if app_data.is_object() { app_data } else { json!({}) };
        enriched["peerId"] = json!(session_id);
        enriched["userId"] = json!(user_id);

        let producer = transport
            .produce(kind.as_str(), rtp_parameters, enriched.clone())
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let producer_id = producer.id().to_string();
        if !self.rooms.add_producer(session_id, producer) {
            return Err(ApiError::BadRequest("voice session gone".into()));
        }

        self.index.broadcast_except(
            &RoomKey::Voice(channel_id.clone()),
            Some(session_id),
            ServerEvent::VoiceNewProducer {
                channel_id: channel_id.clone(),
                producer: crate::views::ProducerInfo {
                    producer_id: producer_id.clone(),
                    peer_id: session_id.to_string(),
                    user_id: user_id.to_string(),
                    kind: kind.as_str().to_string(),
                    app_data: enriched,
                },
            },
        );
        self.index
            .send_to_session(session_id, ServerEvent::VoiceProduced { seq, producer_id });
        Ok(())
    }

    pub async fn close_producer(&self, session_id: &str, seq: u64, producer_id: &str) -> ApiResult<()> {
        let channel_id = self
            .rooms
            .channel_of(session_id)
            .ok_or_else(|| ApiError::BadRequest("not in a voice channel".into()))?;
        let producer = self
            .rooms
            .remove_producer(session_id, producer_id)
            .ok_or_else(|| ApiError::NotFound("producer".into()))?;
        producer.close().await;

        self.index.broadcast(
            &RoomKey::Voice(channel_id.clone()),
            ServerEvent::VoiceProducerClosed {
                channel_id,
                producer_id: producer_id.to_string(),
                peer_id: session_id.to_string(),
            },
        );
        self.index.send_to_session(session_id, ServerEvent::Ack { seq });
        Ok(())
    }

    // ── Consumers ────────────────────────────────────────────────────────

    pub async fn consume(
        &self,
        session_id: &str,
        seq: u64,
        producer_id: &str,
        transport_id: &str,
        rtp_capabilities: Value,
    ) -> ApiResult<()> {
        let channel_id = self
            .rooms
            .channel_of(session_id)
            .ok_or_else(|| ApiError::BadRequest("join a voice channel first".into()))?;

        if !self.router.can_consume(producer_id, &rtp_capabilities).await {
            return Err(ApiError::BadRequest("cannot consume this producer".into()));
        }

        let transport = self
            .rooms
            .get_transport(session_id, transport_id)
            .ok_or_else(|| ApiError::NotFound("transport".into()))?;

        let consumer = transport
            .consume(producer_id, rtp_capabilities)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        let peer_id = self
            .rooms
            .producers_excluding(&channel_id, session_id)
            .into_iter()
            .find(|p| p.producer_id == producer_id)
            .map(|p| p.peer_id)
            .unwrap_or_default();

        let event = ServerEvent::VoiceConsumed {
            seq,
            id: consumer.id().to_string(),
            producer_id: producer_id.to_string(),
            kind: consumer.kind().to_string(),
            rtp_parameters: consumer.rtp_parameters(),
            app_data: json!({}),
            peer_id,
        };
        if !self.rooms.add_consumer(session_id, consumer) {
            return Err(ApiError::BadRequest("voice session gone".into()));
        }
        self.index.send_to_session(session_id, event);
        Ok(())
    }

    pub async fn resume_consumer(&self, session_id: &str, seq: u64, consumer_id: &str) -> ApiResult<()> {
        let consumer = self
            .rooms
            .get_consumer(session_id, consumer_id)
            .ok_or_else(|| ApiError::NotFound("consumer".into()))?;
        consumer
            .resume()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        self.index.send_to_session(session_id, ServerEvent::Ack { seq });
        Ok(())
    }

    // ── Speaking & presence ──────────────────────────────────────────────

    pub fn speaking(&self, session_id: &str, user_id: &str, channel_id: &str, speaking: bool) -> ApiResult<()> {
        let perms = query_permissions(&self.store, user_id, Some(channel_id))?;
        if !perms.has(Permission::VoiceSpeak) {
            return Err(ApiError::forbidden());
        }
        if !self.rooms.set_speaking(channel_id, session_id, speaking) {
            return Err(ApiError::BadRequest("not in this voice channel".into()));
        }

        let key = RoomKey::Voice(channel_id.to_string());
        self.index.broadcast(
            &key,
            ServerEvent::VoiceSpeaking {
                channel_id: channel_id.to_string(),
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                speaking,
            },
        );
        let speaking_ids: Vec<String> = self
            .rooms
            .peer_snapshots(channel_id)
            .into_iter()
            .filter(|p| p.speaking)
            .map(|p| p.session_id)
            .collect();
        self.index.broadcast(
            &key,
            ServerEvent::VoiceSpeakingAll {
                channel_id: channel_id.to_string(),
                speaking_user_ids: speaking_ids,
            },
        );
        self.publish_presence(channel_id);
        Ok(())
    }

    /// Presence for one channel, cached for a few seconds.
    pub fn presence(&self, channel_id: &str) -> PresenceView {
        if let Some(view) = self.rooms.cached_presence(channel_id) {
            return view;
        }
        let snapshots = self.rooms.peer_snapshots(channel_id);
        let view = PresenceView {
            user_ids: snapshots.iter().map(|p| p.session_id.clone()).collect(),
            users: snapshots
                .iter()
                .map(|p| PresenceUser {
                    session_id: p.session_id.clone(),
                    user_id: p.user_id.clone(),
                    username: self.username_of(&p.user_id),
                })
                .collect(),
            speaking_user_ids: snapshots
                .iter()
                .filter(|p| p.speaking)
                .map(|p| p.session_id.clone())
                .collect(),
        };
        self.rooms.cache_presence(channel_id, view.clone());
        view
    }

    /// Per-voice-channel presence for the whole guild (`voice:snapshot`).
    pub fn snapshot(&self, session_id: &str) {
        let Ok(guild_id) = self.store.node_guild_id() else { return };
        let mut channels = BTreeMap::new();
        for channel_id in self.rooms.active_channels() {
            channels.insert(channel_id.clone(), self.presence(&channel_id));
        }
        self.index
            .send_to_session(session_id, ServerEvent::VoicePresenceAll { guild_id, channels });
    }

    /// Publish presence to the voice room and the guild room.
    pub fn publish_presence(&self, channel_id: &str) {
        let presence = self.presence(channel_id);
        let event = ServerEvent::VoicePresence {
            channel_id: channel_id.to_string(),
            presence,
        };
        self.index.broadcast(&RoomKey::Voice(channel_id.to_string()), event.clone());
        if let Ok(guild_id) = self.store.node_guild_id() {
            self.index.broadcast(&RoomKey::Guild(guild_id), event);
        }
    }

    // ── Moderation hooks ─────────────────────────────────────────────────

    /// Close every audio (and screen-audio) producer the user has, across
    /// all sessions, and broadcast their closure.
    pub async fn force_mute_user(&self, user_id: &str) {
        let hits = self.rooms.audio_producers_of_user(user_id);
        for (channel_id, producer_id, peer_id, producer) in hits {
            self.rooms.remove_producers(&channel_id, std::slice::from_ref(&producer_id));
            producer.close().await;
            self.index.broadcast(
                &RoomKey::Voice(channel_id.clone()),
                ServerEvent::VoiceProducerClosed {
                    channel_id: channel_id.clone(),
                    producer_id,
                    peer_id,
                },
            );
            self.publish_presence(&channel_id);
        }
    }

    /// Ask all of a user's clients to re-join in another channel.
    pub fn move_user(&self, user_id: &str, channel_id: &str) {
        self.index.send_to_user(
            user_id,
            ServerEvent::VoiceMove { channel_id: channel_id.to_string() },
        );
    }

    fn username_of(&self, user_id: &str) -> Option<String> {
        self.store.get_profile(user_id).ok().flatten().map(|p| p.username)
    }
}

async fn close_peer_media(cleanup: PeerCleanup) {
    for (_, producer) in cleanup.producers {
        producer.close().await;
    }
    for consumer in cleanup.consumers {
        consumer.close().await;
    }
    for transport in cleanup.transports {
        transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::rooms::Outbound;
    use crate::voice::media::{media_codecs, MediaEngine, NullMediaEngine};
    use tokio::sync::mpsc;

    struct Fixture {
        coordinator: VoiceCoordinator,
        index: RoomIndex,
        store: Store,
        guild_id: String,
        voice_channel: String,
    }

    async fn fixture() -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let guild_id = store.node_guild_id().unwrap();
        let voice_channel = store
            .list_channels(&guild_id)
            .unwrap()
            .into_iter()
            .find(|c| c.kind == ChannelKind::Voice)
            .unwrap()
            .id;

        let worker = NullMediaEngine.create_worker().await.unwrap();
        let router = worker.create_router(media_codecs()).await.unwrap();
        let index = RoomIndex::new();
        let coordinator = VoiceCoordinator::new(
            router,
            index.clone(),
            store.clone(),
            TransportOptions {
                listen_ip: "127.0.0.1".into(),
                announced_ip: None,
                min_port: 40000,
                max_port: 40010,
                enable_udp: true,
                enable_tcp: true,
                prefer_udp: true,
            },
        );
        Fixture { coordinator, index, store, guild_id, voice_channel }
    }

    fn connect(fx: &Fixture, session: &str, user: &str) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        fx.index.register(session, user, tx);
        fx.store.upsert_profile(user, user, None).unwrap();
        fx.store.add_member(&fx.guild_id, user, None).unwrap();
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Event(event) = frame {
                events.push(event);
            }
        }
        events
    }

    #[tokio::test]
    async fn test_join_replies_with_participants_and_producers() {
        let fx = fixture().await;
        let mut rx1 = connect(&fx, "s1", "u1");
        let mut rx2 = connect(&fx, "s2", "u2");

        fx.coordinator.join("s1", "u1", 1, &fx.voice_channel).await.unwrap();
        drain(&mut rx1);

        fx.coordinator.join("s2", "u2", 1, &fx.voice_channel).await.unwrap();
        let events = drain(&mut rx2);

        let participants = events.iter().find_map(|e| match e {
            ServerEvent::VoiceParticipants { participants, .. } => Some(participants.clone()),
            _ => None,
        });
        let participants = participants.expect("participants reply");
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].session_id, "s1");

        // The first peer saw a presence update naming both sessions.
        let events = drain(&mut rx1);
        let presence = events.iter().rev().find_map(|e| match e {
            ServerEvent::VoicePresence { presence, .. } => Some(presence.clone()),
            _ => None,
        });
        assert_eq!(presence.expect("presence").user_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_join_requires_voice_connect() {
        let fx = fixture().await;
        let _rx = connect(&fx, "s1", "u1");

        // Deny VOICE_CONNECT via a channel override on @everyone.
        let mut channel = fx.store.get_channel(&fx.voice_channel).unwrap().unwrap();
        channel.overrides.set_role(
            &fx.guild_id,
            remus_core::Permissions::NONE,
            remus_core::Permissions::from_bits(Permission::VoiceConnect as u64),
        );
        fx.store
            .update_channel(&fx.voice_channel, None, None, Some(&channel.overrides))
            .unwrap();

        match fx.coordinator.join("s1", "u1", 1, &fx.voice_channel).await {
            Err(ApiError::Forbidden(_)) => {}
            other => panic!("expected Forbidden, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_text_channel_rejected() {
        let fx = fixture().await;
        let _rx = connect(&fx, "s1", "u1");
        let text = fx
            .store
            .list_channels(&fx.guild_id)
            .unwrap()
            .into_iter()
            .find(|c| c.kind == ChannelKind::Text)
            .unwrap();

        match fx.coordinator.join("s1", "u1", 1, &text.id).await {
            Err(ApiError::BadRequest(_)) => {}
            other => panic!("expected BadRequest, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_full_negotiation_and_disconnect_cleanup() {
        let fx = fixture().await;
        let mut rx1 = connect(&fx, "s1", "u1");
        let mut rx2 = connect(&fx, "s2", "u2");

        fx.coordinator.join("s1", "u1", 1, &fx.voice_channel).await.unwrap();
        fx.coordinator.create_transport("s1", 2, "send").await.unwrap();
        let events = drain(&mut rx1);
        let transport_id = events
            .iter()
            .find_map(|e| match e {
                ServerEvent::VoiceTransportCreated { id, .. } => Some(id.clone()),
                _ => None,
            })
            .expect("transport created");

        fx.coordinator
            .connect_transport("s1", 3, &transport_id, json!({}))
            .await
            .unwrap();
        fx.coordinator
            .produce("s1", "u1", 4, &transport_id, MediaKind::Audio, json!({}), json!({"type": "mic"}))
            .await
            .unwrap();
        let events = drain(&mut rx1);
        let producer_id = events
            .iter()
            .find_map(|e| match e {
                ServerEvent::VoiceProduced { producer_id, .. } => Some(producer_id.clone()),
                _ => None,
            })
            .expect("produced");

        // Second peer joins, sees the existing producer, consumes it.
        fx.coordinator.join("s2", "u2", 1, &fx.voice_channel).await.unwrap();
        let events = drain(&mut rx2);
        let existing = events
            .iter()
            .find_map(|e| match e {
                ServerEvent::VoiceExistingProducers { producers, .. } => Some(producers.clone()),
                _ => None,
            })
            .expect("existing producers");
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0].producer_id, producer_id);
        // appData was enriched with the producing peer's identity.
        assert_eq!(existing[0].app_data["peerId"], "s1");
        assert_eq!(existing[0].app_data["userId"], "u1");

        fx.coordinator.create_transport("s2", 2, "recv").await.unwrap();
        let events = drain(&mut rx2);
        let recv_transport = events
            .iter()
            .find_map(|e| match e {
                ServerEvent::VoiceTransportCreated { id, .. } => Some(id.clone()),
                _ => None,
            })
            .unwrap();
        fx.coordinator
            .consume("s2", 5, &producer_id, &recv_transport, json!({}))
            .await
            .unwrap();
        let events = drain(&mut rx2);
        let consumer_id = events
            .iter()
            .find_map(|e| match e {
                ServerEvent::VoiceConsumed { id, peer_id, .. } => {
                    assert_eq!(peer_id, "s1");
                    Some(id.clone())
                }
                _ => None,
            })
            .expect("consumed");
        fx.coordinator.resume_consumer("s2", 6, &consumer_id).await.unwrap();

        // s1 disconnects; s2 gets producerClosed and a presence update
        // that no longer lists s1.
        fx.coordinator.cleanup("s1").await;
        let events = drain(&mut rx2);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::VoiceProducerClosed { producer_id: p, peer_id, .. }
                if p == &producer_id && peer_id == "s1"
        )));
        let presence = events
            .iter()
            .rev()
            .find_map(|e| match e {
                ServerEvent::VoicePresence { presence, .. } => Some(presence.clone()),
                _ => None,
            })
            .expect("presence after departure");
        assert!(!presence.user_ids.contains(&"s1".to_string()));
    }

    #[tokio::test]
    async fn test_audio_produce_blocked_when_server_muted() {
        let fx = fixture().await;
        let mut rx = connect(&fx, "s1", "u1");
        fx.store
            .update_member_voice(&fx.guild_id, "u1", Some(true), None)
            .unwrap();

        fx.coordinator.join("s1", "u1", 1, &fx.voice_channel).await.unwrap();
        fx.coordinator.create_transport("s1", 2, "send").await.unwrap();
        let transport_id = drain(&mut rx)
            .iter()
            .find_map(|e| match e {
                ServerEvent::VoiceTransportCreated { id, .. } => Some(id.clone()),
                _ => None,
            })
            .unwrap();

        match fx
            .coordinator
            .produce("s1", "u1", 3, &transport_id, MediaKind::Audio, json!({}), json!({}))
            .await
        {
            Err(ApiError::Forbidden(_)) => {}
            other => panic!("expected Forbidden, got {other:?}"),
        }

        // Video (screenshare) is still allowed while muted.
        fx.coordinator
            .produce("s1", "u1", 4, &transport_id, MediaKind::Video, json!({}), json!({"type": "screen"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_switching_channels_leaves_previous_room() {
        let fx = fixture().await;
        let _rx = connect(&fx, "s1", "u1");
        let second = fx
            .store
            .create_channel(&fx.guild_id, "Stage", ChannelKind::Voice, None, None)
            .unwrap();

        fx.coordinator.join("s1", "u1", 1, &fx.voice_channel).await.unwrap();
        fx.coordinator.join("s1", "u1", 2, &second.id).await.unwrap();

        assert_eq!(fx.coordinator.rooms.channel_of("s1").as_deref(), Some(second.id.as_str()));
        assert!(fx.coordinator.rooms.peer_snapshots(&fx.voice_channel).is_empty());
    }

    #[tokio::test]
    async fn test_force_mute_closes_audio_everywhere() {
        let fx = fixture().await;
        let mut rx1 = connect(&fx, "s1", "u1");
        let mut rx2 = connect(&fx, "s2", "u2");

        fx.coordinator.join("s1", "u1", 1, &fx.voice_channel).await.unwrap();
        fx.coordinator.join("s2", "u2", 1, &fx.voice_channel).await.unwrap();
        fx.coordinator.create_transport("s1", 2, "send").await.unwrap();
        let transport_id = drain(&mut rx1)
            .iter()
            .find_map(|e| match e {
                ServerEvent::VoiceTransportCreated { id, .. } => Some(id.clone()),
                _ => None,
            })
            .unwrap();
        fx.coordinator
            .produce("s1", "u1", 3, &transport_id, MediaKind::Audio, json!({}), json!({"type": "mic"}))
            .await
            .unwrap();
        drain(&mut rx2);

        fx.coordinator.force_mute_user("u1").await;

        let events = drain(&mut rx2);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::VoiceProducerClosed { peer_id, .. } if peer_id == "s1")));
        assert!(fx.coordinator.rooms.audio_producers_of_user("u1").is_empty());
    }

    #[tokio::test]
    async fn test_speaking_updates_presence() {
        let fx = fixture().await;
        let mut rx = connect(&fx, "s1", "u1");

        fx.coordinator.join("s1", "u1", 1, &fx.voice_channel).await.unwrap();
        drain(&mut rx);
        fx.coordinator.speaking("s1", "u1", &fx.voice_channel, true).unwrap();

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::VoiceSpeaking { speaking: true, session_id, .. } if session_id == "s1"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::VoiceSpeakingAll { speaking_user_ids, .. }
                if speaking_user_ids.contains(&"s1".to_string())
        )));
    }

    #[tokio::test]
    async fn test_move_user_targets_their_sockets() {
        let fx = fixture().await;
        let mut rx = connect(&fx, "s1", "u1");

        fx.coordinator.move_user("u1", "vc-target");
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::VoiceMove { channel_id } if channel_id == "vc-target")));
    }
}
