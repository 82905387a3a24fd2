//! Socket lifecycle: connect, heartbeat, reconnect with backoff, outbound
//! queue and batching.
//!
//! State transitions:
//! - Disconnected → Connecting: `initialize` or `reconnect`
//! - Connecting → Connected: socket opened within `connect_timeout`
//! - Connected → Reconnecting: socket closed with any code other than 1000
//! - Reconnecting → Connecting: backoff delay elapsed
//! - Reconnecting → Disconnected: `max_reconnect_attempts` consecutive failures
//! - any → Disconnected: normal close (1000) or `disconnect`
//!
//! All mutable state sits behind one mutex that is never held across an
//! await; handlers run after it is released.

use crate::auth::{AuthProvider, AuthSession};
use crate::cache::MessageCache;
use crate::config::{BatchConfig, ConnectionConfig};
use crate::error::{DeliveryError, DeliveryResult};
use crate::models::now_millis;
use crate::security::SecurityValidator;
use crate::websocket::dispatcher::{DispatchOutcome, MessageDispatcher};
use crate::websocket::frames::{AuthFrame, BatchFrame, Frame};
use crate::websocket::handlers::ConnectionHandlers;
use crate::websocket::scheduler::TaskScope;
use crate::websocket::transport::{
    SocketChannels, SocketCommand, SocketEvent, Transport, CLOSE_ABNORMAL, CLOSE_NORMAL,
};
use parking_lot::Mutex;
use rand::Rng;
use resilience::{with_timeout, TimeoutError};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Where an accepted frame went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the open socket
    Sent,
    /// Held in the pending batch
    Batched,
    /// Held until the next successful connect
    Queued,
}

/// Backoff before reconnect `attempt` (1-based), without jitter
pub fn backoff_delay(config: &ConnectionConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    config
        .reconnect_base_delay
        .saturating_mul(1u32 << exponent)
        .min(config.reconnect_max_delay)
}

/// Backoff plus up to `jitter_ratio` of it at random, capped at the max delay
pub fn reconnect_delay(config: &ConnectionConfig, attempt: u32) -> Duration {
    let delay = backoff_delay(config, attempt);
    let jitter_cap = u64::try_from(delay.mul_f64(config.jitter_ratio).as_millis()).unwrap_or(0);
    let jitter = if jitter_cap == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::rng().random_range(0..=jitter_cap))
    };
    (delay + jitter).min(config.reconnect_max_delay)
}

fn socket_url(base: &str, user_id: &str, token: Option<&str>) -> DeliveryResult<Url> {
    let mut url =
        Url::parse(base).map_err(|e| DeliveryError::Config(format!("invalid websocket url: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("userId", user_id);
        if let Some(token) = token {
            query.append_pair("token", token);
        }
    }
    Ok(url)
}

enum Notice {
    State(ConnectionState),
    Error(DeliveryError),
}

fn fire(handlers: Option<ConnectionHandlers>, notices: Vec<Notice>) {
    let Some(handlers) = handlers else {
        return;
    };
    for notice in notices {
        match notice {
            Notice::State(state) => handlers.connection_change(state),
            Notice::Error(e) => handlers.error(&e),
        }
    }
}

struct Lifecycle {
    user_id: String,
    scope: TaskScope,
    dispatcher: MessageDispatcher,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    /// Bumped by every `initialize`/`disconnect`; stale connect attempts compare against it
    generation: u64,
    /// Bumped per socket; events from an older socket are ignored
    epoch: u64,
    lifecycle: Option<Lifecycle>,
    socket: Option<mpsc::UnboundedSender<SocketCommand>>,
    session: Option<TaskScope>,
    retry: Option<TaskScope>,
    reconnect_attempts: u32,
    queue: VecDeque<Frame>,
    batch: Vec<Frame>,
    batch_epoch: u64,
    last_pong_at: Option<Instant>,
}

impl Inner {
    fn transition(&mut self, next: ConnectionState, notices: &mut Vec<Notice>) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, "connection state changed");
            self.state = next;
            notices.push(Notice::State(next));
        }
    }

    fn handlers(&self) -> Option<ConnectionHandlers> {
        self.lifecycle
            .as_ref()
            .map(|l| l.dispatcher.handlers().clone())
    }

    fn enqueue(&mut self, frame: Frame, max_len: usize) {
        self.queue.push_back(frame);
        self.trim_queue(max_len);
    }

    /// Drop the oldest frames beyond `max_len`
    fn trim_queue(&mut self, max_len: usize) {
        let excess = self.queue.len().saturating_sub(max_len);
        if excess == 0 {
            return;
        }
        let kinds: Vec<&'static str> = self.queue.drain(..excess).map(|f| f.kind()).collect();
        warn!(dropped = excess, kinds = ?kinds, max_len, "outbound queue full, dropping oldest frames");
    }

    /// False when there is no live socket to take the frame
    fn write(&self, frame: &Frame) -> bool {
        let Some(socket) = &self.socket else {
            return false;
        };
        match frame.to_json() {
            Ok(text) => socket.send(SocketCommand::Text(text)).is_ok(),
            Err(e) => {
                warn!(kind = frame.kind(), error = %e, "dropping unencodable frame");
                true
            }
        }
    }

    /// Send the pending batch; a single frame goes out as-is
    fn flush_batch(&mut self, max_queue_len: usize) -> usize {
        if self.batch.is_empty() {
            return 0;
        }
        self.batch_epoch += 1;
        let mut frames = std::mem::take(&mut self.batch);
        let count = frames.len();
        let outgoing = match frames.pop() {
            Some(single) if frames.is_empty() => single,
            Some(last) => {
                frames.push(last);
                Frame::Batch(BatchFrame { messages: frames })
            }
            None => return 0,
        };

        if !self.write(&outgoing) {
            match outgoing {
                Frame::Batch(batch) => {
                    for frame in batch.messages {
                        self.enqueue(frame, max_queue_len);
                    }
                }
                single => self.enqueue(single, max_queue_len),
            }
        }
        debug!(count, "flushed batch");
        count
    }
}

struct Shared {
    config: ConnectionConfig,
    batching: BatchConfig,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthProvider>,
    cache: Arc<MessageCache>,
    validator: Option<Arc<SecurityValidator>>,
    inner: Mutex<Inner>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(lifecycle) = self.inner.get_mut().lifecycle.take() {
            lifecycle.scope.cancel();
        }
    }
}

impl Shared {
    async fn open_socket(
        &self,
        user_id: &str,
    ) -> DeliveryResult<(SocketChannels, Option<AuthSession>)> {
        let session = self.auth.current_session().await;
        let url = socket_url(
            &self.config.url,
            user_id,
            session.as_ref().map(|s| s.token.as_str()),
        )?;
        debug!(host = ?url.host_str(), user_id = %user_id, "opening socket");

        let channels = with_timeout(self.config.connect_timeout, self.transport.connect(&url))
            .await
            .map_err(|e| match e {
                TimeoutError::Elapsed(after) => DeliveryError::ConnectionTimeout(after),
                TimeoutError::Inner(e) => e,
            })?;
        Ok((channels, session))
    }

    /// Adopt a freshly opened socket, unless the lifecycle moved on meanwhile
    fn install(
        self: &Arc<Self>,
        generation: u64,
        channels: SocketChannels,
        session: Option<AuthSession>,
    ) -> bool {
        let SocketChannels { commands, events } = channels;
        let mut notices = Vec::new();
        let handlers;
        {
            let mut inner = self.inner.lock();
            let current = inner
                .lifecycle
                .as_ref()
                .map(|l| (l.scope.child(), l.user_id.clone()));
            let Some((session_scope, user_id)) = current.filter(|_| inner.generation == generation)
            else {
                debug!("discarding socket from a superseded connect");
                let _ = commands.send(SocketCommand::Close {
                    code: CLOSE_NORMAL,
                    reason: "superseded".to_string(),
                });
                return false;
            };

            inner.epoch += 1;
            let epoch = inner.epoch;
            inner.socket = Some(commands);
            inner.session = Some(session_scope.clone());
            inner.reconnect_attempts = 0;
            inner.last_pong_at = None;

            if let Some(session) = session {
                inner.write(&Frame::Auth(AuthFrame {
                    token: session.token,
                    user_id,
                    ts: now_millis(),
                }));
            }

            let queued: Vec<Frame> = inner.queue.drain(..).collect();
            let flushed = queued.len();
            for frame in queued {
                if !inner.write(&frame) {
                    inner.queue.push_back(frame);
                }
            }
            if flushed > 0 {
                info!(flushed, "flushed queued frames");
            }

            inner.transition(ConnectionState::Connected, &mut notices);
            handlers = inner.handlers();

            session_scope.spawn(read_loop(Arc::downgrade(self), epoch, events));
            let weak = Arc::downgrade(self);
            session_scope.spawn_interval(self.config.heartbeat_interval, move || {
                let weak = weak.clone();
                async move {
                    if let Some(shared) = weak.upgrade() {
                        if shared.write_now(epoch, &Frame::Ping) {
                            debug!("heartbeat ping sent");
                        }
                    }
                }
            });
        }
        fire(handlers, notices);
        true
    }

    /// Connect for `initialize` and explicit `reconnect`; failures are not retried
    async fn connect_now(self: &Arc<Self>, generation: u64, user_id: &str) -> bool {
        match self.open_socket(user_id).await {
            Ok((channels, session)) => self.install(generation, channels, session),
            Err(e) => {
                let mut notices = Vec::new();
                let handlers = {
                    let mut inner = self.inner.lock();
                    if inner.generation != generation {
                        return false;
                    }
                    error!(error = %e, code = %e.code(), "connection failed");
                    inner.transition(ConnectionState::Disconnected, &mut notices);
                    notices.push(Notice::Error(e));
                    inner.handlers()
                };
                fire(handlers, notices);
                false
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner, notices: &mut Vec<Notice>) {
        let max_attempts = self.config.max_reconnect_attempts;
        if inner.reconnect_attempts >= max_attempts {
            error!(max_attempts, "reconnect attempts exhausted");
            inner.transition(ConnectionState::Disconnected, notices);
            notices.push(Notice::Error(DeliveryError::ReconnectExhausted(max_attempts)));
            return;
        }

        inner.reconnect_attempts += 1;
        let attempt = inner.reconnect_attempts;
        let delay = reconnect_delay(&self.config, attempt);
        info!(attempt, max_attempts, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

        let generation = inner.generation;
        let weak = Arc::downgrade(self);
        if let Some(retry) = &inner.retry {
            retry.spawn_after(delay, async move {
                if let Some(shared) = weak.upgrade() {
                    shared.reconnect_attempt(generation).await;
                }
            });
        }
    }

    async fn reconnect_attempt(self: &Arc<Self>, generation: u64) {
        let mut notices = Vec::new();
        let (user_id, handlers) = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != ConnectionState::Reconnecting {
                return;
            }
            let Some(user_id) = inner.lifecycle.as_ref().map(|l| l.user_id.clone()) else {
                return;
            };
            inner.transition(ConnectionState::Connecting, &mut notices);
            (user_id, inner.handlers())
        };
        fire(handlers, notices);

        match self.open_socket(&user_id).await {
            Ok((channels, session)) => {
                self.install(generation, channels, session);
            }
            Err(e) => {
                let mut notices = Vec::new();
                let handlers = {
                    let mut inner = self.inner.lock();
                    if inner.generation != generation {
                        return;
                    }
                    warn!(
                        attempt = inner.reconnect_attempts,
                        error = %e,
                        "reconnect attempt failed"
                    );
                    inner.transition(ConnectionState::Reconnecting, &mut notices);
                    self.schedule_reconnect(&mut inner, &mut notices);
                    inner.handlers()
                };
                fire(handlers, notices);
            }
        }
    }

    fn handle_close(self: &Arc<Self>, epoch: u64, code: u16, reason: &str) {
        let mut notices = Vec::new();
        let handlers = {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch || inner.lifecycle.is_none() {
                return;
            }
            inner.epoch += 1;
            inner.socket = None;
            if let Some(session) = inner.session.take() {
                session.cancel();
            }

            // Unsent batch frames go ahead of anything queued later
            inner.batch_epoch += 1;
            let pending = std::mem::take(&mut inner.batch);
            for frame in pending.into_iter().rev() {
                inner.queue.push_front(frame);
            }
            inner.trim_queue(self.config.max_queue_len);

            if code == CLOSE_NORMAL {
                info!(reason = %reason, "socket closed normally");
                inner.transition(ConnectionState::Disconnected, &mut notices);
            } else {
                warn!(code, reason = %reason, "socket closed abnormally");
                inner.transition(ConnectionState::Reconnecting, &mut notices);
                self.schedule_reconnect(&mut inner, &mut notices);
            }
            inner.handlers()
        };
        fire(handlers, notices);
    }

    fn handle_text(&self, epoch: u64, text: &str) {
        let dispatcher = {
            let inner = self.inner.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.lifecycle.as_ref().map(|l| l.dispatcher.clone())
        };
        let Some(dispatcher) = dispatcher else {
            return;
        };

        let outcome = dispatcher.dispatch_text(text);
        for leaf in outcome.leaves() {
            match leaf {
                DispatchOutcome::Ping => {
                    self.write_now(epoch, &Frame::Pong);
                }
                DispatchOutcome::Pong => {
                    self.inner.lock().last_pong_at = Some(Instant::now());
                }
                _ => {}
            }
        }
    }

    fn write_now(&self, epoch: u64, frame: &Frame) -> bool {
        let inner = self.inner.lock();
        inner.epoch == epoch && inner.write(frame)
    }

    fn flush_batch_if(&self, batch_epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.batch_epoch == batch_epoch && inner.state == ConnectionState::Connected {
            inner.flush_batch(self.config.max_queue_len);
        }
    }

    fn submit(self: &Arc<Self>, frame: Frame) -> DeliveryResult<SendOutcome> {
        let mut inner = self.inner.lock();
        if inner.lifecycle.is_none() {
            return Err(DeliveryError::NotConnected);
        }

        if inner.state != ConnectionState::Connected {
            debug!(kind = frame.kind(), state = ?inner.state, "queueing frame until connected");
            inner.enqueue(frame, self.config.max_queue_len);
            return Ok(SendOutcome::Queued);
        }

        if self.batching.enabled && frame.is_batchable() {
            inner.batch.push(frame);
            if inner.batch.len() >= self.batching.batch_size {
                inner.flush_batch(self.config.max_queue_len);
                return Ok(SendOutcome::Sent);
            }
            if inner.batch.len() == 1 {
                let batch_epoch = inner.batch_epoch;
                let weak = Arc::downgrade(self);
                if let Some(session) = &inner.session {
                    session.spawn_after(self.batching.batch_timeout, async move {
                        if let Some(shared) = weak.upgrade() {
                            shared.flush_batch_if(batch_epoch);
                        }
                    });
                }
            }
            return Ok(SendOutcome::Batched);
        }

        if inner.write(&frame) {
            Ok(SendOutcome::Sent)
        } else {
            // Socket is going away; its close event will follow
            inner.enqueue(frame, self.config.max_queue_len);
            Ok(SendOutcome::Queued)
        }
    }
}

async fn read_loop(
    weak: Weak<Shared>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        match event {
            SocketEvent::Text(text) => shared.handle_text(epoch, &text),
            SocketEvent::Error(e) => warn!(error = %e, "socket error"),
            SocketEvent::Closed { code, reason } => {
                shared.handle_close(epoch, code, &reason);
                return;
            }
        }
    }
    if let Some(shared) = weak.upgrade() {
        shared.handle_close(epoch, CLOSE_ABNORMAL, "event stream ended");
    }
}

/// Owner of one socket lifecycle. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        batching: BatchConfig,
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthProvider>,
        cache: Arc<MessageCache>,
        validator: Option<Arc<SecurityValidator>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                batching,
                transport,
                auth,
                cache,
                validator,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    /// Open the socket for `user_id`. Returns false on failure after
    /// reporting it through `on_error`; the caller decides whether to
    /// `reconnect`.
    pub async fn initialize(&self, user_id: &str, handlers: ConnectionHandlers) -> bool {
        if self.is_initialized() {
            warn!("initialize on an active connection, restarting lifecycle");
            self.disconnect();
        }

        let mut notices = Vec::new();
        let (generation, handlers) = {
            let mut inner = self.shared.inner.lock();
            inner.generation += 1;
            let scope = TaskScope::new();
            inner.retry = Some(scope.child());
            inner.lifecycle = Some(Lifecycle {
                user_id: user_id.to_string(),
                scope,
                dispatcher: MessageDispatcher::new(user_id, self.shared.cache.clone(), handlers),
            });
            inner.reconnect_attempts = 0;
            inner.queue.clear();
            inner.batch.clear();
            inner.transition(ConnectionState::Connecting, &mut notices);
            (inner.generation, inner.handlers())
        };
        fire(handlers, notices);

        self.shared.connect_now(generation, user_id).await
    }

    /// Caller-initiated reconnect, typically after attempts were exhausted.
    /// Resets the attempt counter and cancels any scheduled retry.
    pub async fn reconnect(&self) -> bool {
        let mut notices = Vec::new();
        let (generation, user_id, handlers) = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                ConnectionState::Connected => return true,
                ConnectionState::Connecting => return false,
                ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
            }
            let Some((retry, user_id)) = inner
                .lifecycle
                .as_ref()
                .map(|l| (l.scope.child(), l.user_id.clone()))
            else {
                return false;
            };
            if let Some(previous) = inner.retry.replace(retry) {
                previous.cancel();
            }
            inner.reconnect_attempts = 0;
            inner.transition(ConnectionState::Connecting, &mut notices);
            (inner.generation, user_id, inner.handlers())
        };
        fire(handlers, notices);

        info!(user_id = %user_id, "manual reconnect");
        self.shared.connect_now(generation, &user_id).await
    }

    /// Message frames pass the security validator first; other frames go
    /// straight to the socket, batch or queue.
    pub async fn send(&self, frame: Frame) -> DeliveryResult<SendOutcome> {
        if !self.is_initialized() {
            return Err(DeliveryError::NotConnected);
        }
        if let (Frame::Message(message), Some(validator)) = (&frame, &self.shared.validator) {
            let message = message.clone().into_message();
            validator.validate(&(&message).into()).await.into_result()?;
        }
        self.shared.submit(frame)
    }

    /// Re-authenticate the open socket with the current token
    pub async fn refresh_auth(&self) -> DeliveryResult<()> {
        if !self.is_connected() {
            return Err(DeliveryError::NotConnected);
        }
        let session = self
            .shared
            .auth
            .current_session()
            .await
            .ok_or(DeliveryError::Unauthorized)?;
        let frame = Frame::AuthRefresh(AuthFrame {
            token: session.token,
            user_id: session.user_id,
            ts: now_millis(),
        });

        let inner = self.shared.inner.lock();
        if inner.state == ConnectionState::Connected && inner.write(&frame) {
            debug!("auth refreshed");
            Ok(())
        } else {
            Err(DeliveryError::NotConnected)
        }
    }

    /// Terminal: cancels every timer, closes with 1000, discards queued and
    /// batched frames and drops the handlers after reporting the final state.
    pub fn disconnect(&self) {
        let (handlers, previous) = {
            let mut inner = self.shared.inner.lock();
            let Some(lifecycle) = inner.lifecycle.take() else {
                return;
            };
            lifecycle.scope.cancel();
            inner.generation += 1;
            inner.epoch += 1;
            inner.batch_epoch += 1;
            if let Some(socket) = inner.socket.take() {
                let _ = socket.send(SocketCommand::Close {
                    code: CLOSE_NORMAL,
                    reason: "client disconnect".to_string(),
                });
            }
            inner.session = None;
            inner.retry = None;
            let discarded = inner.queue.len() + inner.batch.len();
            inner.queue.clear();
            inner.batch.clear();
            inner.reconnect_attempts = 0;
            let previous = std::mem::take(&mut inner.state);
            info!(discarded, "disconnected");
            (lifecycle.dispatcher.handlers().clone(), previous)
        };
        if previous != ConnectionState::Disconnected {
            handlers.connection_change(ConnectionState::Disconnected);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Between `initialize` and `disconnect`
    pub fn is_initialized(&self) -> bool {
        self.shared.inner.lock().lifecycle.is_some()
    }

    pub fn queued_len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    pub fn pending_batch_len(&self) -> usize {
        self.shared.inner.lock().batch.len()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.inner.lock().reconnect_attempts
    }

    pub fn last_pong_at(&self) -> Option<Instant> {
        self.shared.inner.lock().last_pong_at
    }

    pub fn user_id(&self) -> Option<String> {
        self.shared
            .inner
            .lock()
            .lifecycle
            .as_ref()
            .map(|l| l.user_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuth;
    use crate::config::CacheConfig;
    use crate::websocket::frames::TypingFrame;
    use crate::websocket::transport::{ConnectStep, MemorySocket, MemoryTransport};

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            url: "ws://memory/ws".into(),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(5),
            max_reconnect_attempts: 3,
            jitter_ratio: 0.1,
            max_queue_len: 3,
        }
    }

    fn manager(transport: &MemoryTransport, auth: StaticAuth) -> ConnectionManager {
        ConnectionManager::new(
            config(),
            BatchConfig::default(),
            Arc::new(transport.clone()),
            Arc::new(auth),
            Arc::new(MessageCache::new(CacheConfig::default())),
            None,
        )
    }

    fn typing(is_typing: bool) -> Frame {
        Frame::Typing(TypingFrame {
            conversation_id: "c1".into(),
            user_id: "u1".into(),
            is_typing,
            timestamp: 1,
        })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn errors_into(sink: Arc<Mutex<Vec<DeliveryError>>>) -> ConnectionHandlers {
        ConnectionHandlers::new().on_error(move |e| sink.lock().push(e.clone()))
    }

    async fn open(
        transport: &MemoryTransport,
        sockets: &mut mpsc::UnboundedReceiver<MemorySocket>,
    ) -> (ConnectionManager, MemorySocket) {
        let manager = manager(transport, StaticAuth::new("u1", "secret"));
        assert!(manager.initialize("u1", ConnectionHandlers::new()).await);
        let mut socket = sockets.recv().await.unwrap();
        // auth handshake
        socket.next_text().await.unwrap();
        (manager, socket)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = config();
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 4), Duration::from_secs(5));
        assert_eq!(backoff_delay(&config, 40), Duration::from_secs(5));

        for attempt in 1..=3 {
            let base = backoff_delay(&config, attempt);
            for _ in 0..50 {
                let delay = reconnect_delay(&config, attempt);
                assert!(delay >= base);
                assert!(delay <= base.mul_f64(1.1));
            }
        }
        assert_eq!(reconnect_delay(&config, 5), Duration::from_secs(5));
    }

    #[test]
    fn test_socket_url_carries_identity() {
        let url = socket_url("wss://chat.example.com/ws?v=2", "u 1", Some("t0k")).unwrap();
        assert_eq!(url.as_str(), "wss://chat.example.com/ws?v=2&userId=u+1&token=t0k");
        let url = socket_url("ws://h/ws", "u1", None).unwrap();
        assert_eq!(url.query(), Some("userId=u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_sends_auth_handshake() {
        let (transport, mut sockets) = MemoryTransport::new();
        let manager = manager(&transport, StaticAuth::new("u1", "secret"));
        assert!(manager.initialize("u1", ConnectionHandlers::new()).await);
        assert_eq!(manager.state(), ConnectionState::Connected);

        let mut socket = sockets.recv().await.unwrap();
        assert_eq!(socket.url.query(), Some("userId=u1&token=secret"));
        let auth: serde_json::Value =
            serde_json::from_str(&socket.next_text().await.unwrap()).unwrap();
        assert_eq!(auth["type"], "auth");
        assert_eq!(auth["token"], "secret");
        assert_eq!(auth["userId"], "u1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_failure_is_not_retried() {
        let (transport, _sockets) = MemoryTransport::new();
        transport.script(ConnectStep::Refuse("connection refused".into()));
        let manager = manager(&transport, StaticAuth::signed_out());
        let errors = Arc::new(Mutex::new(Vec::new()));

        assert!(!manager.initialize("u1", errors_into(errors.clone())).await);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            *errors.lock(),
            vec![DeliveryError::Network("connection refused".into())]
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (transport, _sockets) = MemoryTransport::new();
        transport.script(ConnectStep::Hang);
        let manager = manager(&transport, StaticAuth::signed_out());
        let errors = Arc::new(Mutex::new(Vec::new()));

        assert!(!manager.initialize("u1", errors_into(errors.clone())).await);
        assert_eq!(
            *errors.lock(),
            vec![DeliveryError::ConnectionTimeout(Duration::from_secs(10))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_and_pong_reply() {
        let (transport, mut sockets) = MemoryTransport::new();
        let (manager, mut socket) = open(&transport, &mut sockets).await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(socket.next_text().await.as_deref(), Some(r#"{"type":"ping"}"#));

        socket.push_frame(&Frame::Ping);
        assert_eq!(socket.next_text().await.as_deref(), Some(r#"{"type":"pong"}"#));

        assert!(manager.last_pong_at().is_none());
        socket.push_frame(&Frame::Pong);
        settle().await;
        assert!(manager.last_pong_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_terminal() {
        let (transport, mut sockets) = MemoryTransport::new();
        let (manager, mut socket) = open(&transport, &mut sockets).await;

        manager.disconnect();
        assert_eq!(
            socket.next_command().await,
            Some(SocketCommand::Close {
                code: CLOSE_NORMAL,
                reason: "client disconnect".into()
            })
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            manager.send(typing(true)).await,
            Err(DeliveryError::NotConnected)
        );

        // A late abnormal close from the old socket changes nothing
        socket.close(CLOSE_ABNORMAL, "gone");
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.connect_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_close_does_not_reconnect() {
        let (transport, mut sockets) = MemoryTransport::new();
        let (manager, socket) = open(&transport, &mut sockets).await;

        socket.close(CLOSE_NORMAL, "server shutdown");
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_is_bounded() {
        let (transport, _sockets) = MemoryTransport::new();
        transport.script(ConnectStep::Refuse("offline".into()));
        let manager = manager(&transport, StaticAuth::signed_out());
        assert!(!manager.initialize("u1", ConnectionHandlers::new()).await);

        for i in 0..5 {
            let outcome = manager
                .send(Frame::Typing(TypingFrame {
                    conversation_id: format!("c{i}"),
                    user_id: "u1".into(),
                    is_typing: true,
                    timestamp: i,
                }))
                .await;
            assert_eq!(outcome, Ok(SendOutcome::Queued));
        }
        assert_eq!(manager.queued_len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_batch_overflow_keeps_newest() {
        let (transport, mut sockets) = MemoryTransport::new();
        let manager = ConnectionManager::new(
            config(),
            BatchConfig {
                enabled: true,
                batch_size: 10,
                batch_timeout: Duration::from_secs(60),
            },
            Arc::new(transport.clone()),
            Arc::new(StaticAuth::new("u1", "secret")),
            Arc::new(MessageCache::new(CacheConfig::default())),
            None,
        );
        assert!(manager.initialize("u1", ConnectionHandlers::new()).await);
        let socket = sockets.recv().await.unwrap();

        for i in 0..5 {
            let outcome = manager
                .send(Frame::Typing(TypingFrame {
                    conversation_id: format!("c{i}"),
                    user_id: "u1".into(),
                    is_typing: true,
                    timestamp: i,
                }))
                .await;
            assert_eq!(outcome, Ok(SendOutcome::Batched));
        }

        socket.close(CLOSE_ABNORMAL, "gone");
        settle().await;
        assert_eq!(manager.pending_batch_len(), 0);
        assert_eq!(manager.queued_len(), 3);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let mut socket = sockets.recv().await.unwrap();
        socket.next_text().await.unwrap();
        let mut flushed = Vec::new();
        for _ in 0..3 {
            let frame: serde_json::Value =
                serde_json::from_str(&socket.next_text().await.unwrap()).unwrap();
            flushed.push(frame["conversationId"].as_str().unwrap().to_string());
        }
        assert_eq!(flushed, vec!["c2", "c3", "c4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_flushes_queue() {
        let (transport, mut sockets) = MemoryTransport::new();
        transport.script(ConnectStep::Refuse("offline".into()));
        let manager = manager(&transport, StaticAuth::signed_out());
        assert!(!manager.initialize("u1", ConnectionHandlers::new()).await);

        manager.send(typing(true)).await.unwrap();
        assert!(manager.reconnect().await);
        assert_eq!(manager.queued_len(), 0);

        let mut socket = sockets.recv().await.unwrap();
        let flushed: serde_json::Value =
            serde_json::from_str(&socket.next_text().await.unwrap()).unwrap();
        assert_eq!(flushed["type"], "typing");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_auth() {
        let (transport, mut sockets) = MemoryTransport::new();
        let (manager, mut socket) = open(&transport, &mut sockets).await;

        manager.refresh_auth().await.unwrap();
        let frame: serde_json::Value =
            serde_json::from_str(&socket.next_text().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "auth_refresh");
        assert_eq!(frame["token"], "secret");

        manager.disconnect();
        assert_eq!(manager.refresh_auth().await, Err(DeliveryError::NotConnected));
    }
}
