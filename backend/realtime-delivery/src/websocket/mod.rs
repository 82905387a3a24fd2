//! Realtime socket: wire frames, transports, the connection state machine
//! and inbound routing.

pub mod connection;
pub mod dispatcher;
pub mod frames;
pub mod handlers;
pub mod pool;
pub mod scheduler;
pub mod transport;

pub use connection::{
    backoff_delay, reconnect_delay, ConnectionManager, ConnectionState, SendOutcome,
};
pub use dispatcher::{DispatchOutcome, MessageDispatcher};
pub use frames::{
    parse_frame, AuthFrame, BatchFrame, DeliveryReceiptFrame, Frame, FrameError, MessageFrame,
    ParsedFrame, ReadReceiptFrame, ReceiptStatus, TypingFrame,
};
pub use handlers::ConnectionHandlers;
pub use pool::ConnectionPool;
pub use scheduler::TaskScope;
pub use transport::{
    ConnectStep, MemorySocket, MemoryTransport, SocketChannels, SocketCommand, SocketEvent,
    Transport, WsTransport, CLOSE_ABNORMAL, CLOSE_NORMAL, CLOSE_NO_STATUS,
};
