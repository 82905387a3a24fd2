//! Realtime delivery layer: socket lifecycle with reconnect and batching,
//! a per-conversation message cache, outbound rate limiting and security
//! checks, and a REST fallback guarded by retries and circuit breakers.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod security;
pub mod service;
pub mod websocket;

pub use config::DeliveryConfig;
pub use error::{DeliveryError, DeliveryResult, ErrorCode};
pub use service::MessagingService;
