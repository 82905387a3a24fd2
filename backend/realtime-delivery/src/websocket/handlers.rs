use crate::error::DeliveryError;
use crate::models::Message;
use crate::websocket::connection::ConnectionState;
use crate::websocket::frames::{DeliveryReceiptFrame, ReadReceiptFrame, TypingFrame};
use std::fmt;
use std::sync::Arc;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Fixed set of callback slots registered with a connection.
///
/// Unset slots are skipped. Callbacks run on the connection's reader task,
/// never while internal locks are held, so they may call back into the
/// manager.
#[derive(Clone, Default)]
pub struct ConnectionHandlers {
    pub on_message: Option<Callback<Message>>,
    pub on_typing: Option<Callback<TypingFrame>>,
    pub on_delivery_receipt: Option<Callback<DeliveryReceiptFrame>>,
    pub on_read_receipt: Option<Callback<ReadReceiptFrame>>,
    pub on_connection_change: Option<Callback<ConnectionState>>,
    pub on_error: Option<Callback<DeliveryError>>,
}

impl ConnectionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(mut self, f: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_typing(mut self, f: impl Fn(&TypingFrame) + Send + Sync + 'static) -> Self {
        self.on_typing = Some(Arc::new(f));
        self
    }

    pub fn on_delivery_receipt(
        mut self,
        f: impl Fn(&DeliveryReceiptFrame) + Send + Sync + 'static,
    ) -> Self {
        self.on_delivery_receipt = Some(Arc::new(f));
        self
    }

    pub fn on_read_receipt(mut self, f: impl Fn(&ReadReceiptFrame) + Send + Sync + 'static) -> Self {
        self.on_read_receipt = Some(Arc::new(f));
        self
    }

    pub fn on_connection_change(
        mut self,
        f: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> Self {
        self.on_connection_change = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&DeliveryError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub(crate) fn message(&self, message: &Message) {
        if let Some(f) = &self.on_message {
            f(message);
        }
    }

    pub(crate) fn typing(&self, frame: &TypingFrame) {
        if let Some(f) = &self.on_typing {
            f(frame);
        }
    }

    pub(crate) fn delivery_receipt(&self, frame: &DeliveryReceiptFrame) {
        if let Some(f) = &self.on_delivery_receipt {
            f(frame);
        }
    }

    pub(crate) fn read_receipt(&self, frame: &ReadReceiptFrame) {
        if let Some(f) = &self.on_read_receipt {
            f(frame);
        }
    }

    pub(crate) fn connection_change(&self, state: ConnectionState) {
        if let Some(f) = &self.on_connection_change {
            f(&state);
        }
    }

    pub(crate) fn error(&self, error: &DeliveryError) {
        if let Some(f) = &self.on_error {
            f(error);
        }
    }
}

impl fmt::Debug for ConnectionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandlers")
            .field("on_message", &self.on_message.is_some())
            .field("on_typing", &self.on_typing.is_some())
            .field("on_delivery_receipt", &self.on_delivery_receipt.is_some())
            .field("on_read_receipt", &self.on_read_receipt.is_some())
            .field("on_connection_change", &self.on_connection_change.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_unset_slots_are_skipped() {
        let handlers = ConnectionHandlers::new();
        handlers.error(&DeliveryError::NotConnected);
        handlers.connection_change(ConnectionState::Connected);
    }

    #[test]
    fn test_builder_registers_callbacks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handlers = ConnectionHandlers::new()
            .on_connection_change(move |state| sink.lock().push(*state));

        handlers.connection_change(ConnectionState::Connecting);
        handlers.connection_change(ConnectionState::Connected);
        assert_eq!(
            *seen.lock(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert!(format!("{handlers:?}").contains("on_connection_change: true"));
    }
}
