//! Connects one user to a live delivery endpoint and logs everything that
//! arrives. Optionally sends a text message once connected.
//!
//! Environment (besides the `DELIVERY_*` settings):
//! - `DELIVERY_PROBE_USER_ID`, `DELIVERY_PROBE_TOKEN`: identity to connect as
//! - `DELIVERY_PROBE_SEND_TO`, `DELIVERY_PROBE_CONVERSATION_ID`: send "ping from probe"
//! - `DELIVERY_PROBE_JSON_LOGS=1`: JSON log lines

use anyhow::{Context, Result};
use realtime_delivery::api::{HttpMessagingApi, MessagingApi};
use realtime_delivery::auth::StaticAuth;
use realtime_delivery::logging;
use realtime_delivery::models::MessageDraft;
use realtime_delivery::security::OpenRelationships;
use realtime_delivery::websocket::{ConnectionHandlers, WsTransport};
use realtime_delivery::{DeliveryConfig, MessagingService};
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    if env::var("DELIVERY_PROBE_JSON_LOGS").is_ok_and(|v| v == "1") {
        logging::init_json_tracing();
    } else {
        logging::init_tracing();
    }

    let config = DeliveryConfig::from_env().context("invalid delivery configuration")?;
    let user_id = env::var("DELIVERY_PROBE_USER_ID").context("DELIVERY_PROBE_USER_ID is not set")?;
    let token = env::var("DELIVERY_PROBE_TOKEN").context("DELIVERY_PROBE_TOKEN is not set")?;
    let auth = Arc::new(StaticAuth::new(user_id.clone(), token));

    let rest = match config.api.base_url {
        Some(_) => Some(Arc::new(
            HttpMessagingApi::new(&config.api, auth.clone()).context("failed to build REST client")?,
        ) as Arc<dyn MessagingApi>),
        None => None,
    };

    let service = MessagingService::new(
        &config,
        user_id,
        Arc::new(WsTransport),
        auth,
        Arc::new(OpenRelationships),
        rest,
    );

    let handlers = ConnectionHandlers::new()
        .on_message(|m| info!(message_id = %m.id, from = %m.from_user_id, content = %m.content, "message"))
        .on_typing(|t| info!(conversation_id = %t.conversation_id, user_id = %t.user_id, is_typing = t.is_typing, "typing"))
        .on_delivery_receipt(|r| info!(message_id = %r.message_id, status = ?r.status, "delivery receipt"))
        .on_read_receipt(|r| info!(message_id = %r.message_id, "read receipt"))
        .on_connection_change(|state| info!(state = ?state, "connection state"))
        .on_error(|e| warn!(code = %e.code(), error = %e, "delivery error"));

    if !service.start(handlers).await {
        error!("initial connection failed");
    }

    if let (Ok(to), Ok(conversation_id)) = (
        env::var("DELIVERY_PROBE_SEND_TO"),
        env::var("DELIVERY_PROBE_CONVERSATION_ID"),
    ) {
        match service
            .send_message(MessageDraft::text(conversation_id, to, "ping from probe"))
            .await
        {
            Ok(message) => info!(message_id = %message.id, status = ?message.status, "probe message sent"),
            Err(e) => warn!(code = %e.code(), error = %e, "probe message rejected"),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    let stats = service.cache_stats();
    info!(
        conversations = stats.total_conversations,
        messages = stats.total_messages,
        "shutting down"
    );
    service.stop();
    Ok(())
}
