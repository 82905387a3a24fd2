//! Shared fixtures for delivery integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use realtime_delivery::api::{Conversation, MessageQuery, MessagingApi, VoiceUploadUrl};
use realtime_delivery::auth::StaticAuth;
use realtime_delivery::models::Message;
use realtime_delivery::security::OpenRelationships;
use realtime_delivery::websocket::{
    ConnectionHandlers, MemorySocket, MemoryTransport, ReceiptStatus,
};
use realtime_delivery::{DeliveryConfig, DeliveryError, DeliveryResult, MessagingService};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const USER: &str = "u1";
pub const PEER: &str = "u2";

pub fn config() -> DeliveryConfig {
    let mut config = DeliveryConfig::default();
    config.connection.url = "ws://memory/ws".to_string();
    config.connection.reconnect_base_delay = Duration::from_secs(1);
    config.connection.reconnect_max_delay = Duration::from_secs(4);
    config.connection.max_reconnect_attempts = 3;
    config
}

/// Everything the handlers saw, in order
#[derive(Clone, Default)]
pub struct Recorder {
    pub events: Arc<Mutex<Vec<String>>>,
    pub errors: Arc<Mutex<Vec<DeliveryError>>>,
}

impl Recorder {
    pub fn handlers(&self) -> ConnectionHandlers {
        let (m, t, d, r, s) = (
            self.events.clone(),
            self.events.clone(),
            self.events.clone(),
            self.events.clone(),
            self.events.clone(),
        );
        let errors = self.errors.clone();
        ConnectionHandlers::new()
            .on_message(move |msg| m.lock().push(format!("message:{}", msg.id)))
            .on_typing(move |f| t.lock().push(format!("typing:{}", f.is_typing)))
            .on_delivery_receipt(move |f| d.lock().push(format!("delivered:{}", f.message_id)))
            .on_read_receipt(move |f| r.lock().push(format!("read:{}", f.message_id)))
            .on_connection_change(move |state| s.lock().push(format!("state:{state:?}")))
            .on_error(move |e| errors.lock().push(e.clone()))
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn states(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with("state:"))
            .collect()
    }

    pub fn errors(&self) -> Vec<DeliveryError> {
        self.errors.lock().clone()
    }
}

pub struct Harness {
    pub service: MessagingService,
    pub transport: MemoryTransport,
    pub sockets: mpsc::UnboundedReceiver<MemorySocket>,
    pub recorder: Recorder,
}

impl Harness {
    pub fn new(config: DeliveryConfig) -> Self {
        Self::with_rest(config, None)
    }

    pub fn with_rest(config: DeliveryConfig, rest: Option<Arc<dyn MessagingApi>>) -> Self {
        let (transport, sockets) = MemoryTransport::new();
        let service = MessagingService::new(
            &config,
            USER,
            Arc::new(transport.clone()),
            Arc::new(StaticAuth::new(USER, "token-1")),
            Arc::new(OpenRelationships),
            rest,
        );
        Self {
            service,
            transport,
            sockets,
            recorder: Recorder::default(),
        }
    }

    pub async fn start(&self) -> bool {
        self.service.start(self.recorder.handlers()).await
    }

    /// Next accepted socket with its `auth` handshake already consumed
    pub async fn accept(&mut self) -> MemorySocket {
        let mut socket = self.sockets.recv().await.expect("transport dropped");
        let auth = parse(&socket.next_text().await.expect("no auth frame"));
        assert_eq!(auth["type"], "auth");
        socket
    }
}

pub fn parse(text: &str) -> serde_json::Value {
    serde_json::from_str(text).expect("client wrote invalid json")
}

/// Let spawned tasks run without moving the clock
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// REST backend that accepts or rejects every send
#[derive(Default)]
pub struct FakeApi {
    pub reject: AtomicBool,
    pub sends: AtomicU32,
}

fn unsupported<T>() -> DeliveryResult<T> {
    Err(DeliveryError::Unknown("not used by these tests".to_string()))
}

#[async_trait]
impl MessagingApi for FakeApi {
    async fn get_messages(&self, _: &str, _: MessageQuery) -> DeliveryResult<Vec<Message>> {
        Ok(Vec::new())
    }

    async fn send_message(&self, message: &Message) -> DeliveryResult<Message> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(DeliveryError::Validation("rejected by backend".to_string()));
        }
        Ok(message.clone())
    }

    async fn mark_conversation_as_read(&self, _: &str) -> DeliveryResult<()> {
        unsupported()
    }

    async fn generate_voice_upload_url(&self, _: &str, _: &str, _: u64) -> DeliveryResult<VoiceUploadUrl> {
        unsupported()
    }

    async fn get_voice_message_url(&self, _: &str) -> DeliveryResult<String> {
        unsupported()
    }

    async fn send_typing_indicator(&self, _: &str, _: bool) -> DeliveryResult<()> {
        unsupported()
    }

    async fn send_delivery_receipt(&self, _: &str, _: &str, _: ReceiptStatus) -> DeliveryResult<()> {
        unsupported()
    }

    async fn get_conversations(&self) -> DeliveryResult<Vec<Conversation>> {
        unsupported()
    }

    async fn create_conversation(&self, _: &str) -> DeliveryResult<Conversation> {
        unsupported()
    }

    async fn delete_conversation(&self, _: &str) -> DeliveryResult<()> {
        unsupported()
    }
}
