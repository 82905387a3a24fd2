pub mod message;

pub use message::{
    now_millis, Attachment, Message, MessageDraft, MessagePatch, MessageStatus, MessageType,
    OutboundMessage,
};
