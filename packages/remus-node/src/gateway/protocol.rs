//! Gateway wire protocol.
//!
//! JSON text frames carrying tagged unions. Voice requests include a
//! client-chosen `seq`; their typed replies (and `error` events) echo it.
//! Broadcast events never carry errors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::auth::AuthUser;
use crate::views::{
    MemberView, MessageView, ParticipantInfo, PresenceView, ProducerInfo,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

// ── Client → Node ────────────────────────────────────────────────────────

/// Messages sent from a client to the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Must be the first frame on the socket.
    #[serde(rename = "auth")]
    Auth { token: String },

    #[serde(rename = "guild:joinRoom")]
    GuildJoinRoom {
        #[serde(rename = "guildId")]
        guild_id: String,
    },

    #[serde(rename = "channel:join")]
    ChannelJoin {
        #[serde(rename = "channelId")]
        channel_id: String,
    },

    #[serde(rename = "typing:start")]
    TypingStart {
        #[serde(rename = "channelId")]
        channel_id: String,
    },

    #[serde(rename = "typing:stop")]
    TypingStop {
        #[serde(rename = "channelId")]
        channel_id: String,
    },

    #[serde(rename = "message:send")]
    MessageSend {
        #[serde(rename = "channelId")]
        channel_id: String,
        #[serde(default)]
        content: String,
        /// Upload ids; dereferenced and ownership-filtered server-side.
        #[serde(default)]
        attachments: Vec<String>,
        #[serde(default, rename = "replyToId")]
        reply_to_id: Option<String>,
    },

    #[serde(rename = "voice:snapshot")]
    VoiceSnapshot {
        #[serde(rename = "guildId")]
        guild_id: String,
    },

    #[serde(rename = "voice:join")]
    VoiceJoin {
        #[serde(default)]
        seq: u64,
        #[serde(rename = "channelId")]
        channel_id: String,
    },

    #[serde(rename = "voice:getRouterRtpCapabilities")]
    VoiceGetRouterRtpCapabilities {
        #[serde(default)]
        seq: u64,
    },

    #[serde(rename = "voice:createSendTransport")]
    VoiceCreateSendTransport {
        #[serde(default)]
        seq: u64,
    },

    #[serde(rename = "voice:createRecvTransport")]
    VoiceCreateRecvTransport {
        #[serde(default)]
        seq: u64,
    },

    #[serde(rename = "voice:connectTransport")]
    VoiceConnectTransport {
        #[serde(default)]
        seq: u64,
        #[serde(rename = "transportId")]
        transport_id: String,
        #[serde(rename = "dtlsParameters")]
        dtls_parameters: serde_json::Value,
    },

    #[serde(rename = "voice:produce")]
    VoiceProduce {
        #[serde(default)]
        seq: u64,
        #[serde(rename = "transportId")]
        transport_id: String,
        kind: MediaKind,
        #[serde(rename = "rtpParameters")]
        rtp_parameters: serde_json::Value,
        #[serde(default, rename = "appData")]
        app_data: serde_json::Value,
    },

    #[serde(rename = "voice:consume")]
    VoiceConsume {
        #[serde(default)]
        seq: u64,
        #[serde(rename = "producerId")]
        producer_id: String,
        #[serde(rename = "transportId")]
        transport_id: String,
        #[serde(rename = "rtpCapabilities")]
        rtp_capabilities: serde_json::Value,
    },

    #[serde(rename = "voice:resumeConsumer")]
    VoiceResumeConsumer {
        #[serde(default)]
        seq: u64,
        #[serde(rename = "consumerId")]
        consumer_id: String,
    },

    #[serde(rename = "voice:closeProducer")]
    VoiceCloseProducer {
        #[serde(default)]
        seq: u64,
        #[serde(rename = "producerId")]
        producer_id: String,
    },

    #[serde(rename = "voice:speaking")]
    VoiceSpeaking {
        #[serde(rename = "channelId")]
        channel_id: String,
        speaking: bool,
    },

    #[serde(rename = "voice:leave")]
    VoiceLeave {
        #[serde(default)]
        seq: u64,
    },
}

// ── Node → Client ────────────────────────────────────────────────────────

/// Messages sent from the node to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Handshake succeeded.
    #[serde(rename = "ready")]
    Ready { user: AuthUser },

    /// Request failure or protocol error. `seq` is present when the
    /// failure answers a specific request.
    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        error: String,
    },

    /// Success ack for requests with no payload.
    #[serde(rename = "ack")]
    Ack { seq: u64 },

    #[serde(rename = "message:new")]
    MessageNew { message: MessageView },

    #[serde(rename = "message:delete")]
    MessageDelete {
        #[serde(rename = "channelId")]
        channel_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
    },

    #[serde(rename = "typing:start")]
    TypingStart {
        #[serde(rename = "channelId")]
        channel_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },

    #[serde(rename = "typing:stop")]
    TypingStop {
        #[serde(rename = "channelId")]
        channel_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },

    #[serde(rename = "channel:new")]
    ChannelNew { channel: remus_core::ChannelRecord },

    #[serde(rename = "channel:update")]
    ChannelUpdate { channel: remus_core::ChannelRecord },

    #[serde(rename = "channel:delete")]
    ChannelDelete {
        #[serde(rename = "channelId")]
        channel_id: String,
    },

    #[serde(rename = "guild:memberJoined")]
    GuildMemberJoined {
        #[serde(rename = "guildId")]
        guild_id: String,
        member: MemberView,
    },

    #[serde(rename = "guild:memberLeft")]
    GuildMemberLeft {
        #[serde(rename = "guildId")]
        guild_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },

    /// Sent to the affected user's sockets right before a server-initiated
    /// disconnect.
    #[serde(rename = "guild:kicked")]
    GuildKicked {
        #[serde(rename = "guildId")]
        guild_id: String,
        reason: String,
    },

    #[serde(rename = "member:update")]
    MemberUpdate {
        #[serde(rename = "guildId")]
        guild_id: String,
        member: MemberView,
    },

    #[serde(rename = "auth:banned")]
    AuthBanned {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "voice:presence")]
    VoicePresence {
        #[serde(rename = "channelId")]
        channel_id: String,
        presence: PresenceView,
    },

    #[serde(rename = "voice:presenceAll")]
    VoicePresenceAll {
        #[serde(rename = "guildId")]
        guild_id: String,
        channels: BTreeMap<String, PresenceView>,
    },

    #[serde(rename = "voice:speaking")]
    VoiceSpeaking {
        #[serde(rename = "channelId")]
        channel_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        speaking: bool,
    },

    #[serde(rename = "voice:speakingAll")]
    VoiceSpeakingAll {
        #[serde(rename = "channelId")]
        channel_id: String,
        #[serde(rename = "speakingUserIds")]
        speaking_user_ids: Vec<String>,
    },

    #[serde(rename = "voice:newProducer")]
    VoiceNewProducer {
        #[serde(rename = "channelId")]
        channel_id: String,
        #[serde(flatten)]
        producer: ProducerInfo,
    },

    #[serde(rename = "voice:existingProducers")]
    VoiceExistingProducers {
        #[serde(rename = "channelId")]
        channel_id: String,
        producers: Vec<ProducerInfo>,
    },

    #[serde(rename = "voice:producerClosed")]
    VoiceProducerClosed {
        #[serde(rename = "channelId")]
        channel_id: String,
        #[serde(rename = "producerId")]
        producer_id: String,
        #[serde(rename = "peerId")]
        peer_id: String,
    },

    /// Reply to `voice:join`: the current participant list, excluding
    /// the joiner.
    #[serde(rename = "voice:participants")]
    VoiceParticipants {
        seq: u64,
        #[serde(rename = "channelId")]
        channel_id: String,
        participants: Vec<ParticipantInfo>,
    },

    /// Instructs the client to re-issue `voice:join` for a new channel.
    #[serde(rename = "voice:move")]
    VoiceMove {
        #[serde(rename = "channelId")]
        channel_id: String,
    },

    #[serde(rename = "voice:routerRtpCapabilities")]
    VoiceRouterRtpCapabilities {
        seq: u64,
        #[serde(rename = "rtpCapabilities")]
        rtp_capabilities: serde_json::Value,
    },

    #[serde(rename = "voice:transportCreated")]
    VoiceTransportCreated {
        seq: u64,
        direction: String,
        id: String,
        #[serde(rename = "iceParameters")]
        ice_parameters: serde_json::Value,
        #[serde(rename = "iceCandidates")]
        ice_candidates: serde_json::Value,
        #[serde(rename = "dtlsParameters")]
        dtls_parameters: serde_json::Value,
    },

    #[serde(rename = "voice:produced")]
    VoiceProduced {
        seq: u64,
        #[serde(rename = "producerId")]
        producer_id: String,
    },

    #[serde(rename = "voice:consumed")]
    VoiceConsumed {
        seq: u64,
        id: String,
        #[serde(rename = "producerId")]
        producer_id: String,
        kind: String,
        #[serde(rename = "rtpParameters")]
        rtp_parameters: serde_json::Value,
        #[serde(rename = "appData")]
        app_data: serde_json::Value,
        #[serde(rename = "peerId")]
        peer_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_event_parses() {
        let parsed: ClientEvent =
            serde_json::from_str(r#"{"type":"auth","token":"tok_abc"}"#).unwrap();
        match parsed {
            ClientEvent::Auth { token } => assert_eq!(token, "tok_abc"),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_message_send_defaults() {
        let parsed: ClientEvent =
            serde_json::from_str(r#"{"type":"message:send","channelId":"c1"}"#).unwrap();
        match parsed {
            ClientEvent::MessageSend { channel_id, content, attachments, reply_to_id } => {
                assert_eq!(channel_id, "c1");
                assert!(content.is_empty());
                assert!(attachments.is_empty());
                assert!(reply_to_id.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_voice_join_event() {
        let parsed: ClientEvent =
            serde_json::from_str(r#"{"type":"voice:join","seq":7,"channelId":"vc"}"#).unwrap();
        match parsed {
            ClientEvent::VoiceJoin { seq, channel_id } => {
                assert_eq!(seq, 7);
                assert_eq!(channel_id, "vc");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_voice_produce_camel_case_fields() {
        let raw = r#"{
            "type": "voice:produce",
            "seq": 3,
            "transportId": "t1",
            "kind": "audio",
            "rtpParameters": {"codecs": []},
            "appData": {"type": "mic"}
        }"#;
        let parsed: ClientEvent = serde_json::from_str(raw).unwrap();
        match parsed {
            ClientEvent::VoiceProduce { transport_id, kind, app_data, .. } => {
                assert_eq!(transport_id, "t1");
                assert_eq!(kind, MediaKind::Audio);
                assert_eq!(app_data["type"], "mic");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_server_event_tags() {
        let event = ServerEvent::MessageDelete {
            channel_id: "c1".into(),
            message_id: "m1".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"message:delete\""));
        assert!(json.contains("\"channelId\":\"c1\""));

        let event = ServerEvent::GuildKicked { guild_id: "g1".into(), reason: "banned".into() };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"guild:kicked\""));
    }

    #[test]
    fn test_error_event_skips_absent_seq() {
        let event = ServerEvent::Error { seq: None, error: "nope".into() };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("seq"));

        let event = ServerEvent::Error { seq: Some(4), error: "nope".into() };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"seq\":4"));
    }

    #[test]
    fn test_producer_info_flattens_into_new_producer() {
        let event = ServerEvent::VoiceNewProducer {
            channel_id: "vc".into(),
            producer: ProducerInfo {
                producer_id: "p1".into(),
                peer_id: "s1".into(),
                user_id: "u1".into(),
                kind: "audio".into(),
                app_data: serde_json::json!({"type": "mic"}),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "voice:newProducer");
        assert_eq!(json["producerId"], "p1");
        assert_eq!(json["peerId"], "s1");
    }

    #[test]
    fn test_client_event_round_trip() {
        let events = vec![
            ClientEvent::Auth { token: "t".into() },
            ClientEvent::GuildJoinRoom { guild_id: "g1".into() },
            ClientEvent::ChannelJoin { channel_id: "c1".into() },
            ClientEvent::TypingStart { channel_id: "c1".into() },
            ClientEvent::TypingStop { channel_id: "c1".into() },
            ClientEvent::MessageSend {
                channel_id: "c1".into(),
                content: "hello".into(),
                attachments: vec!["up1".into()],
                reply_to_id: Some("m0".into()),
            },
            ClientEvent::VoiceSnapshot { guild_id: "g1".into() },
            ClientEvent::VoiceJoin { seq: 1, channel_id: "vc".into() },
            ClientEvent::VoiceGetRouterRtpCapabilities { seq: 2 },
            ClientEvent::VoiceCreateSendTransport { seq: 3 },
            ClientEvent::VoiceCreateRecvTransport { seq: 4 },
            ClientEvent::VoiceConnectTransport {
                seq: 5,
                transport_id: "t1".into(),
                dtls_parameters: serde_json::json!({}),
            },
            ClientEvent::VoiceConsume {
                seq: 6,
                producer_id: "p1".into(),
                transport_id: "t2".into(),
                rtp_capabilities: serde_json::json!({}),
            },
            ClientEvent::VoiceResumeConsumer { seq: 7, consumer_id: "con1".into() },
            ClientEvent::VoiceCloseProducer { seq: 8, producer_id: "p1".into() },
            ClientEvent::VoiceSpeaking { channel_id: "vc".into(), speaking: true },
            ClientEvent::VoiceLeave { seq: 9 },
        ];
        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let parsed: ClientEvent = serde_json::from_str(&json).unwrap();
            let json2 = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, json2, "round-trip failed for {json}");
        }
    }
}
