use crate::cache::MessageCache;
use crate::error::DeliveryError;
use crate::models::{MessagePatch, MessageStatus};
use crate::websocket::frames::{parse_frame, Frame, MessageFrame, ParsedFrame};
use crate::websocket::handlers::ConnectionHandlers;
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A message from a peer, or from this user on another device
    Message { message_id: String },
    /// The server echoed or acknowledged one of our sends
    Acknowledged { message_id: String, applied: bool },
    Typing,
    Receipt { message_id: String, applied: bool },
    /// Needs a `pong` reply
    Ping,
    Pong,
    Batch(Vec<DispatchOutcome>),
    /// Server-initiated auth frame; nothing to update locally
    Auth,
    Unrecognized { kind: String },
    Malformed,
}

impl DispatchOutcome {
    /// Flattened view over batch contents
    pub fn leaves(&self) -> Vec<&DispatchOutcome> {
        match self {
            DispatchOutcome::Batch(inner) => inner.iter().flat_map(|o| o.leaves()).collect(),
            other => vec![other],
        }
    }
}

/// Routes inbound frames into the cache and the registered handlers
#[derive(Clone)]
pub struct MessageDispatcher {
    user_id: Arc<str>,
    cache: Arc<MessageCache>,
    handlers: ConnectionHandlers,
}

impl MessageDispatcher {
    pub fn new(user_id: impl Into<String>, cache: Arc<MessageCache>, handlers: ConnectionHandlers) -> Self {
        let user_id: String = user_id.into();
        Self {
            user_id: Arc::from(user_id),
            cache,
            handlers,
        }
    }

    pub fn handlers(&self) -> &ConnectionHandlers {
        &self.handlers
    }

    /// Parse and route one text frame. Malformed input is reported through
    /// `on_error` and never fails the connection.
    pub fn dispatch_text(&self, text: &str) -> DispatchOutcome {
        match parse_frame(text) {
            Ok(ParsedFrame::Known(frame)) => self.dispatch(frame),
            Ok(ParsedFrame::Unrecognized { kind }) => {
                debug!(kind = %kind, "ignoring unrecognized frame type");
                DispatchOutcome::Unrecognized { kind }
            }
            Err(e) => {
                warn!(error = %e, len = text.len(), "dropping malformed frame");
                self.handlers.error(&DeliveryError::from(e));
                DispatchOutcome::Malformed
            }
        }
    }

    pub fn dispatch(&self, frame: Frame) -> DispatchOutcome {
        match frame {
            Frame::Message(frame) => self.on_message(frame),
            Frame::Typing(frame) => {
                self.handlers.typing(&frame);
                DispatchOutcome::Typing
            }
            Frame::DeliveryReceipt(frame) => {
                let applied = self.cache.advance_status(
                    &frame.conversation_id,
                    &frame.message_id,
                    frame.status.into(),
                );
                self.handlers.delivery_receipt(&frame);
                DispatchOutcome::Receipt {
                    message_id: frame.message_id,
                    applied,
                }
            }
            Frame::ReadReceipt(frame) => {
                let applied = self.cache.advance_status(
                    &frame.conversation_id,
                    &frame.message_id,
                    MessageStatus::Read,
                );
                self.handlers.read_receipt(&frame);
                DispatchOutcome::Receipt {
                    message_id: frame.message_id,
                    applied,
                }
            }
            Frame::Ping => DispatchOutcome::Ping,
            Frame::Pong => DispatchOutcome::Pong,
            Frame::Batch(batch) => DispatchOutcome::Batch(
                batch.messages.into_iter().map(|f| self.dispatch(f)).collect(),
            ),
            Frame::Auth(_) | Frame::AuthRefresh(_) => {
                debug!("server sent auth frame");
                DispatchOutcome::Auth
            }
        }
    }

    fn on_message(&self, frame: MessageFrame) -> DispatchOutcome {
        let own = frame.from_user_id == *self.user_id;
        if own && self.cache.contains_message(&frame.conversation_id, &frame.id) {
            let status = frame.status.unwrap_or(MessageStatus::Sent);
            let applied = self
                .cache
                .advance_status(&frame.conversation_id, &frame.id, status);
            debug!(message_id = %frame.id, status = ?status, "send acknowledged");
            return DispatchOutcome::Acknowledged {
                message_id: frame.id,
                applied,
            };
        }

        let mut message = frame.into_message();
        if own {
            // Sent from another session of this user
            MessagePatch::status(MessageStatus::Sent).apply(&mut message);
        }
        self.cache
            .add_messages(&message.conversation_id, vec![message.clone()]);
        self.handlers.message(&message);
        DispatchOutcome::Message {
            message_id: message.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::models::{Message, MessageDraft};
    use parking_lot::Mutex;
    use serde_json::json;

    fn setup() -> (MessageDispatcher, Arc<MessageCache>, Arc<Mutex<Vec<String>>>) {
        let cache = Arc::new(MessageCache::new(CacheConfig::default()));
        let events = Arc::new(Mutex::new(Vec::new()));

        let (m, t, r, e) = (events.clone(), events.clone(), events.clone(), events.clone());
        let handlers = ConnectionHandlers::new()
            .on_message(move |msg| m.lock().push(format!("message:{}", msg.id)))
            .on_typing(move |f| t.lock().push(format!("typing:{}", f.is_typing)))
            .on_read_receipt(move |f| r.lock().push(format!("read:{}", f.message_id)))
            .on_error(move |err| e.lock().push(format!("error:{}", err.code())));

        (MessageDispatcher::new("me", cache.clone(), handlers), cache, events)
    }

    fn pending(cache: &MessageCache) -> Message {
        let message = MessageDraft::text("c1", "peer", "Hello world!").into_message("me");
        cache.add_messages("c1", vec![message.clone()]);
        message
    }

    #[test]
    fn test_inbound_message_is_cached_and_delivered() {
        let (dispatcher, cache, events) = setup();
        let raw = json!({
            "type": "message", "id": "m9", "conversationId": "c1",
            "fromUserId": "peer", "toUserId": "me", "content": "yo", "timestamp": 5
        });

        let outcome = dispatcher.dispatch_text(&raw.to_string());
        assert_eq!(outcome, DispatchOutcome::Message { message_id: "m9".into() });
        assert_eq!(cache.get_message("c1", "m9").unwrap().status, MessageStatus::Delivered);
        assert_eq!(*events.lock(), vec!["message:m9"]);
    }

    #[test]
    fn test_echo_acknowledges_pending_send() {
        let (dispatcher, cache, events) = setup();
        let message = pending(&cache);

        let echo = Frame::Message(MessageFrame::from(&message));
        let outcome = dispatcher.dispatch(echo);
        assert_eq!(
            outcome,
            DispatchOutcome::Acknowledged { message_id: message.id.clone(), applied: true }
        );
        assert_eq!(cache.get_message("c1", &message.id).unwrap().status, MessageStatus::Sent);
        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_receipts_advance_status() {
        let (dispatcher, cache, events) = setup();
        let message = pending(&cache);

        let read = json!({
            "type": "read_receipt", "messageId": message.id, "conversationId": "c1",
            "userId": "peer", "timestamp": 10
        });
        let late_delivery = json!({
            "type": "delivery_receipt", "messageId": message.id, "conversationId": "c1",
            "userId": "peer", "status": "delivered", "timestamp": 9
        });

        dispatcher.dispatch_text(&read.to_string());
        let outcome = dispatcher.dispatch_text(&late_delivery.to_string());

        assert_eq!(
            outcome,
            DispatchOutcome::Receipt { message_id: message.id.clone(), applied: false }
        );
        assert_eq!(cache.get_message("c1", &message.id).unwrap().status, MessageStatus::Read);
        assert_eq!(*events.lock(), vec![format!("read:{}", message.id)]);
    }

    #[test]
    fn test_batch_preserves_order() {
        let (dispatcher, _cache, events) = setup();
        let raw = json!({
            "type": "batch",
            "messages": [
                {"type": "typing", "conversationId": "c1", "userId": "peer", "isTyping": true, "timestamp": 1},
                {"type": "message", "id": "m1", "conversationId": "c1", "fromUserId": "peer",
                 "toUserId": "me", "text": "first", "timestamp": 2},
                {"type": "ping"},
                {"type": "typing", "conversationId": "c1", "userId": "peer", "isTyping": false, "timestamp": 3}
            ]
        });

        let outcome = dispatcher.dispatch_text(&raw.to_string());
        assert_eq!(outcome.leaves().len(), 4);
        assert_eq!(outcome.leaves()[2], &DispatchOutcome::Ping);
        assert_eq!(
            *events.lock(),
            vec!["typing:true", "message:m1", "typing:false"]
        );
    }

    #[test]
    fn test_malformed_reports_error() {
        let (dispatcher, _cache, events) = setup();
        assert_eq!(dispatcher.dispatch_text("{{{"), DispatchOutcome::Malformed);
        assert_eq!(*events.lock(), vec!["error:VALIDATION_ERROR"]);
    }

    #[test]
    fn test_unrecognized_is_not_an_error() {
        let (dispatcher, _cache, events) = setup();
        let outcome = dispatcher.dispatch_text(r#"{"type":"presence"}"#);
        assert_eq!(outcome, DispatchOutcome::Unrecognized { kind: "presence".into() });
        assert!(events.lock().is_empty());
    }
}
