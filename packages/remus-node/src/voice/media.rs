//! Media worker adapter.
//!
//! The node never touches RTP itself; an external media worker does the
//! routing. These traits are the entire surface the node is allowed to
//! drive: worker → router → transports → producers/consumers. Adapter
//! types stay behind this boundary; gateway handlers only ever see the
//! JSON parameter blobs they relay between client and worker.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MediaError {
    /// The worker refused the operation (bad parameters, closed entity).
    #[error("media worker rejected the request: {0}")]
    #[allow(dead_code)]
    Rejected(String),
    #[error("unknown media entity: {0}")]
    Unknown(String),
}

/// Codec set offered by the router: Opus audio and VP8 video.
pub fn media_codecs() -> Value {
    json!([
        {
            "kind": "audio",
            "mimeType": "audio/opus",
            "clockRate": 48000,
            "channels": 2
        },
        {
            "kind": "video",
            "mimeType": "video/VP8",
            "clockRate": 90000
        }
    ])
}

/// Options for creating a WebRTC transport.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub min_port: u16,
    pub max_port: u16,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

/// ICE/DTLS bundle handed back to the client after transport creation.
#[derive(Debug, Clone)]
pub struct TransportHandshake {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self) -> Result<Arc<dyn MediaWorker>, MediaError>;
}

#[async_trait]
pub trait MediaWorker: Send + Sync {
    async fn create_router(&self, media_codecs: Value) -> Result<Arc<dyn MediaRouter>, MediaError>;

    /// Resolves if and when the worker process dies. The node treats that
    /// as fatal and exits.
    async fn wait_died(&self);
}

#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn rtp_capabilities(&self) -> Value;

    async fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: TransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, MediaError>;
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> &str;

    fn handshake(&self) -> TransportHandshake;

    async fn connect(&self, dtls_parameters: Value) -> Result<(), MediaError>;

    async fn produce(
        &self,
        kind: &str,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<Arc<dyn MediaProducer>, MediaError>;

    /// Consumers start paused; the client resumes once its pipeline is
    /// wired up.
    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> Result<Arc<dyn MediaConsumer>, MediaError>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> &str;
    fn app_data(&self) -> Value;
    async fn close(&self);
}

#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn kind(&self) -> &str;
    fn rtp_parameters(&self) -> Value;
    async fn resume(&self) -> Result<(), MediaError>;
    async fn close(&self);
}

// ── Null engine ──────────────────────────────────────────────────────────

/// In-process stand-in for the external media worker. Signaling flows end
/// to end (ids, handshakes, producer/consumer registration) while the
/// actual RTP routing is a no-op. Used in tests and when no worker binary
/// is wired up.
#[derive(Default)]
pub struct NullMediaEngine;

#[async_trait]
impl MediaEngine for NullMediaEngine {
    async fn create_worker(&self) -> Result<Arc<dyn MediaWorker>, MediaError> {
        Ok(Arc::new(NullWorker))
    }
}

struct NullWorker;

#[async_trait]
impl MediaWorker for NullWorker {
    async fn create_router(&self, media_codecs: Value) -> Result<Arc<dyn MediaRouter>, MediaError> {
        Ok(Arc::new(NullRouter {
            capabilities: json!({ "codecs": media_codecs, "headerExtensions": [] }),
            producers: Arc::new(Mutex::new(HashMap::new())),
        }))
    }

    async fn wait_died(&self) {
        futures::future::pending::<()>().await;
    }
}

struct NullRouter {
    capabilities: Value,
    /// producer id → (kind, rtp parameters), shared with transports so
    /// `can_consume` and `consume` can see producers from any transport.
    producers: Arc<Mutex<HashMap<String, (String, Value)>>>,
}

#[async_trait]
impl MediaRouter for NullRouter {
    fn rtp_capabilities(&self) -> Value {
        self.capabilities.clone()
    }

    async fn can_consume(&self, producer_id: &str, _rtp_capabilities: &Value) -> bool {
        self.producers.lock().contains_key(producer_id)
    }

    async fn create_webrtc_transport(
        &self,
        options: TransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, MediaError> {
        let id = Uuid::new_v4().to_string();
        let candidate_ip = options.announced_ip.clone().unwrap_or_else(|| options.listen_ip.clone());
        Ok(Arc::new(NullTransport {
            id: id.clone(),
            handshake: TransportHandshake {
                id,
                ice_parameters: json!({
                    "usernameFragment": Uuid::new_v4().simple().to_string(),
                    "password": Uuid::new_v4().simple().to_string(),
                    "iceLite": true
                }),
                ice_candidates: json!([{
                    "foundation": "udpcandidate",
                    "ip": candidate_ip,
                    "port": options.min_port,
                    "protocol": if options.prefer_udp { "udp" } else { "tcp" },
                    "type": "host"
                }]),
                dtls_parameters: json!({ "role": "auto", "fingerprints": [] }),
            },
            connected: Mutex::new(false),
            producers: self.producers.clone(),
        }))
    }
}

struct NullTransport {
    id: String,
    handshake: TransportHandshake,
    connected: Mutex<bool>,
    producers: Arc<Mutex<HashMap<String, (String, Value)>>>,
}

#[async_trait]
impl MediaTransport for NullTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn handshake(&self) -> TransportHandshake {
        self.handshake.clone()
    }

    async fn connect(&self, _dtls_parameters: Value) -> Result<(), MediaError> {
        *self.connected.lock() = true;
        Ok(())
    }

    async fn produce(
        &self,
        kind: &str,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<Arc<dyn MediaProducer>, MediaError> {
        let id = Uuid::new_v4().to_string();
        self.producers.lock().insert(id.clone(), (kind.to_string(), rtp_parameters));
        Ok(Arc::new(NullProducer {
            id,
            kind: kind.to_string(),
            app_data,
            registry: self.producers.clone(),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        _rtp_capabilities: Value,
    ) -> Result<Arc<dyn MediaConsumer>, MediaError> {
        let (kind, rtp_parameters) = self
            .producers
            .lock()
            .get(producer_id)
            .cloned()
            .ok_or_else(|| MediaError::Unknown(format!("producer {producer_id}")))?;
        Ok(Arc::new(NullConsumer {
            id: Uuid::new_v4().to_string(),
            producer_id: producer_id.to_string(),
            kind,
            rtp_parameters,
            paused: Mutex::new(true),
        }))
    }

    async fn close(&self) {
        *self.connected.lock() = false;
    }
}

struct NullProducer {
    id: String,
    kind: String,
    app_data: Value,
    registry: Arc<Mutex<HashMap<String, (String, Value)>>>,
}

#[async_trait]
impl MediaProducer for NullProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn app_data(&self) -> Value {
        self.app_data.clone()
    }

    async fn close(&self) {
        self.registry.lock().remove(&self.id);
    }
}

struct NullConsumer {
    id: String,
    producer_id: String,
    kind: String,
    rtp_parameters: Value,
    paused: Mutex<bool>,
}

#[async_trait]
impl MediaConsumer for NullConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    async fn resume(&self) -> Result<(), MediaError> {
        *self.paused.lock() = false;
        Ok(())
    }

    async fn close(&self) {}
}
