use crate::error::DeliveryResult;
use crate::websocket::connection::{ConnectionManager, ConnectionState, SendOutcome};
use crate::websocket::frames::Frame;
use crate::websocket::handlers::ConnectionHandlers;
use futures_util::future::join_all;
use tracing::{debug, info};

/// Primary connection plus warm backups.
///
/// Each manager keeps its own state. The primary owns the handlers and its
/// send result is authoritative; control frames are mirrored to connected
/// backups, message frames never are.
pub struct ConnectionPool {
    primary: ConnectionManager,
    backups: Vec<ConnectionManager>,
}

impl ConnectionPool {
    pub fn new(primary: ConnectionManager, backups: Vec<ConnectionManager>) -> Self {
        Self { primary, backups }
    }

    pub fn primary(&self) -> &ConnectionManager {
        &self.primary
    }

    pub fn backups(&self) -> &[ConnectionManager] {
        &self.backups
    }

    /// Connect every member; the result is the primary's
    pub async fn initialize(&self, user_id: &str, handlers: ConnectionHandlers) -> bool {
        let backups = join_all(
            self.backups
                .iter()
                .map(|backup| backup.initialize(user_id, ConnectionHandlers::new())),
        );
        let (primary, backups) = tokio::join!(self.primary.initialize(user_id, handlers), backups);

        let connected = backups.iter().filter(|ok| **ok).count();
        info!(
            primary,
            backups_connected = connected,
            backups_total = self.backups.len(),
            "connection pool initialized"
        );
        primary
    }

    pub async fn send(&self, frame: Frame) -> DeliveryResult<SendOutcome> {
        if frame.is_message() {
            return self.primary.send(frame).await;
        }

        let outcome = self.primary.send(frame.clone()).await?;
        for (index, backup) in self.backups.iter().enumerate() {
            if !backup.is_connected() {
                continue;
            }
            if let Err(e) = backup.send(frame.clone()).await {
                debug!(backup = index, kind = frame.kind(), error = %e, "mirror send failed");
            }
        }
        Ok(outcome)
    }

    pub fn disconnect(&self) {
        self.primary.disconnect();
        for backup in &self.backups {
            backup.disconnect();
        }
    }

    /// Primary first, then backups in order
    pub fn states(&self) -> Vec<ConnectionState> {
        std::iter::once(&self.primary)
            .chain(&self.backups)
            .map(ConnectionManager::state)
            .collect()
    }
}
