//! WebSocket connection handling.
//!
//! Each connection runs three phases: an auth-first handshake (first
//! frame must be `auth`, 10 s deadline), a spawned sender task draining
//! the socket's outbound channel, and the FIFO dispatch loop. A single
//! cleanup hook tears down voice state and room membership on any exit.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use remus_core::Permission;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::rate_limit::Limit;
use crate::state::AppState;

use super::protocol::{ClientEvent, ServerEvent};
use super::rooms::{Outbound, RoomKey};

/// How long a fresh connection gets to authenticate.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // ── Handshake ────────────────────────────────────────────────────────

    let token = tokio::time::timeout(HANDSHAKE_DEADLINE, async {
        loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(ClientEvent::Auth { token }) => return Some(token),
                    Ok(_) => {
                        send_direct(
                            &mut ws_sender,
                            &ServerEvent::Error { seq: None, error: "authenticate first".into() },
                        )
                        .await;
                    }
                    Err(e) => {
                        send_direct(
                            &mut ws_sender,
                            &ServerEvent::Error { seq: None, error: format!("invalid frame: {e}") },
                        )
                        .await;
                    }
                },
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(_)) => return None,
                _ => {}
            }
        }
    })
    .await
    .ok()
    .flatten();

    let Some(token) = token else { return };

    let user = match state.resolver.resolve(&token).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            send_direct(
                &mut ws_sender,
                &ServerEvent::Error { seq: None, error: "unauthorized".into() },
            )
            .await;
            return;
        }
        Err(ApiError::AuthorityUnavailable) => {
            send_direct(
                &mut ws_sender,
                &ServerEvent::Error {
                    seq: None,
                    error: "authentication service unavailable".into(),
                },
            )
            .await;
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "handshake verify failed");
            return;
        }
    };

    if state.store.is_banned(&user.id).unwrap_or(false) {
        send_direct(&mut ws_sender, &ServerEvent::AuthBanned { reason: None }).await;
        let _ = ws_sender.send(Message::Close(None)).await;
        return;
    }

    if let Err(e) = state
        .store
        .upsert_profile(&user.id, &user.username, user.email.as_deref())
    {
        tracing::error!(user = %user.id, error = %e, "profile touch failed");
    }

    // ── Register & sender task ───────────────────────────────────────────

    let session_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    state.rooms.register(&session_id, &user.id, tx);

    match state.store.guilds_for_user(&user.id) {
        Ok(guild_ids) => {
            for guild_id in guild_ids {
                state.rooms.join(&session_id, RoomKey::Guild(guild_id));
            }
        }
        Err(e) => tracing::error!(user = %user.id, error = %e, "guild room join failed"),
    }

    state
        .rooms
        .send_to_session(&session_id, ServerEvent::Ready { user: user.clone() });
    tracing::info!(session = %session_id, user = %user.id, "socket connected");

    let sender_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Outbound::Event(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "event serialization failed"),
                },
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // ── Dispatch loop (FIFO per socket) ──────────────────────────────────

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => handle_event(&state, &session_id, &user, event).await,
                Err(e) => {
                    state.rooms.send_to_session(
                        &session_id,
                        ServerEvent::Error { seq: None, error: format!("invalid frame: {e}") },
                    );
                }
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!(session = %session_id, error = %e, "socket error");
                break;
            }
            _ => {}
        }
    }

    // ── Cleanup ──────────────────────────────────────────────────────────

    state.voice.cleanup(&session_id).await;
    state.rooms.unregister(&session_id);
    sender_task.abort();
    tracing::info!(session = %session_id, user = %user.id, "socket disconnected");
}

async fn send_direct(sender: &mut SplitSink<WebSocket, Message>, event: &ServerEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        let _ = sender.send(Message::Text(json)).await;
    }
}

/// Dispatch one parsed client event.
pub async fn handle_event(state: &AppState, session_id: &str, user: &AuthUser, event: ClientEvent) {
    match event {
        ClientEvent::Auth { .. } => {
            state.rooms.send_to_session(
                session_id,
                ServerEvent::Error { seq: None, error: "already authenticated".into() },
            );
        }

        ClientEvent::GuildJoinRoom { guild_id } => {
            let is_member = state
                .store
                .get_member(&guild_id, &user.id)
                .ok()
                .flatten()
                .is_some();
            if is_member {
                state.rooms.join(session_id, RoomKey::Guild(guild_id));
            }
        }

        ClientEvent::ChannelJoin { channel_id } => {
            match state.permissions(&user.id, Some(&channel_id)) {
                Ok(perms) if perms.has(Permission::ViewChannels) => {
                    state.rooms.join(session_id, RoomKey::Channel(channel_id));
                }
                _ => {}
            }
        }

        ClientEvent::TypingStart { channel_id } => {
            typing(state, session_id, user, &channel_id, true);
        }

        ClientEvent::TypingStop { channel_id } => {
            typing(state, session_id, user, &channel_id, false);
        }

        ClientEvent::MessageSend { channel_id, content, attachments, reply_to_id } => {
            if let Err(e) =
                message_send(state, user, &channel_id, &content, &attachments, reply_to_id).await
            {
                state
                    .rooms
                    .send_to_session(session_id, ServerEvent::Error { seq: None, error: e.to_string() });
            }
        }

        ClientEvent::VoiceSnapshot { guild_id: _ } => {
            state.voice.snapshot(session_id);
        }

        ClientEvent::VoiceJoin { seq, channel_id } => {
            if !state.rate.check("voice:join", &user.id, Limit::VOICE_JOIN) {
                state.rooms.send_to_session(
                    session_id,
                    ServerEvent::Error { seq: Some(seq), error: "rate limit exceeded".into() },
                );
                return;
            }
            reply_on_error(state, session_id, seq, state.voice.join(session_id, &user.id, seq, &channel_id).await);
        }

        ClientEvent::VoiceGetRouterRtpCapabilities { seq } => {
            state.voice.router_rtp_capabilities(session_id, seq);
        }

        ClientEvent::VoiceCreateSendTransport { seq } => {
            reply_on_error(state, session_id, seq, state.voice.create_transport(session_id, seq, "send").await);
        }

        ClientEvent::VoiceCreateRecvTransport { seq } => {
            reply_on_error(state, session_id, seq, state.voice.create_transport(session_id, seq, "recv").await);
        }

        ClientEvent::VoiceConnectTransport { seq, transport_id, dtls_parameters } => {
            reply_on_error(
                state,
                session_id,
                seq,
                state
                    .voice
                    .connect_transport(session_id, seq, &transport_id, dtls_parameters)
                    .await,
            );
        }

        ClientEvent::VoiceProduce { seq, transport_id, kind, rtp_parameters, app_data } => {
            reply_on_error(
                state,
                session_id,
                seq,
                state
                    .voice
                    .produce(session_id, &user.id, seq, &transport_id, kind, rtp_parameters, app_data)
                    .await,
            );
        }

        ClientEvent::VoiceConsume { seq, producer_id, transport_id, rtp_capabilities } => {
            reply_on_error(
                state,
                session_id,
                seq,
                state
                    .voice
                    .consume(session_id, seq, &producer_id, &transport_id, rtp_capabilities)
                    .await,
            );
        }

        ClientEvent::VoiceResumeConsumer { seq, consumer_id } => {
            reply_on_error(
                state,
                session_id,
                seq,
                state.voice.resume_consumer(session_id, seq, &consumer_id).await,
            );
        }

        ClientEvent::VoiceCloseProducer { seq, producer_id } => {
            reply_on_error(
                state,
                session_id,
                seq,
                state.voice.close_producer(session_id, seq, &producer_id).await,
            );
        }

        ClientEvent::VoiceSpeaking { channel_id, speaking } => {
            if let Err(e) = state.voice.speaking(session_id, &user.id, &channel_id, speaking) {
                tracing::debug!(session = session_id, error = %e, "speaking update rejected");
            }
        }

        ClientEvent::VoiceLeave { seq } => {
            let _ = state.voice.leave(session_id, seq).await;
        }
    }
}

fn reply_on_error(state: &AppState, session_id: &str, seq: u64, result: crate::error::ApiResult<()>) {
    if let Err(e) = result {
        state.rooms.send_to_session(
            session_id,
            ServerEvent::Error { seq: Some(seq), error: e.to_string() },
        );
    }
}

/// Typing indicators need channel access and send rights; fan out to the
/// channel room, excluding the typist.
fn typing(state: &AppState, session_id: &str, user: &AuthUser, channel_id: &str, start: bool) {
    let allowed = state
        .permissions(&user.id, Some(channel_id))
        .map(|p| p.has(Permission::ViewChannels) && p.has(Permission::SendMessages))
        .unwrap_or(false);
    if !allowed {
        return;
    }
    let event = if start {
        ServerEvent::TypingStart { channel_id: channel_id.to_string(), user_id: user.id.clone() }
    } else {
        ServerEvent::TypingStop { channel_id: channel_id.to_string(), user_id: user.id.clone() }
    };
    state
        .rooms
        .broadcast_except(&RoomKey::Channel(channel_id.to_string()), Some(session_id), event);
}

/// Socket-side message send: the same checks as the REST POST, then a
/// `message:new` broadcast to the channel room.
async fn message_send(
    state: &AppState,
    user: &AuthUser,
    channel_id: &str,
    content: &str,
    attachment_ids: &[String],
    reply_to_id: Option<String>,
) -> crate::error::ApiResult<()> {
    let perms = state.permissions(&user.id, Some(channel_id))?;
    if !perms.has(Permission::ViewChannels) || !perms.has(Permission::SendMessages) {
        return Err(ApiError::forbidden());
    }
    if !attachment_ids.is_empty() && !perms.has(Permission::AttachFiles) {
        return Err(ApiError::forbidden());
    }

    // Dereference attachments; only uploads owned by this (channel, author)
    // survive.
    let uploads = state
        .store
        .resolve_attachments(channel_id, &user.id, attachment_ids)?;
    let attachments: Vec<_> = uploads.iter().map(|u| u.attachment_ref()).collect();

    if content.trim().is_empty() && attachments.is_empty() {
        return Err(ApiError::BadRequest("message needs content or attachments".into()));
    }

    let message = state.store.create_message(
        channel_id,
        &user.id,
        content,
        attachments,
        reply_to_id.as_deref(),
    )?;

    let view = state.message_view(message);
    state.rooms.broadcast(
        &RoomKey::Channel(channel_id.to_string()),
        ServerEvent::MessageNew { message: view },
    );
    Ok(())
}
