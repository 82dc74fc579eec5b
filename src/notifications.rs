use crate::types::Notification;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Live delivery handle for one connected client.
///
/// The transport layer (the WebSocket session) owns the receiving half and
/// forwards notifications onto the wire. A failed send means the receiver is
/// gone, so the connection is presumed dead.
pub type ClientHandle = mpsc::UnboundedSender<Notification>;

/// Per-client notification delivery and history.
///
/// Every notification is appended to the client's history, whether or not the
/// client is currently connected; live delivery is best-effort on top of that.
/// Delivery failures are logged and swallowed, never surfaced to the caller.
#[derive(Default)]
pub struct NotificationHub {
    connections: Mutex<HashMap<String, ClientHandle>>,
    history: Mutex<HashMap<String, Vec<Notification>>>,
    id_seq: AtomicU64,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the live handle for a client, replacing any previous one.
    pub fn connect(&self, client_id: &str, handle: ClientHandle) {
        self.connections
            .lock()
            .insert(client_id.to_string(), handle);
        self.history
            .lock()
            .entry(client_id.to_string())
            .or_default();
        debug!("Client {} connected", client_id);
    }

    /// Drop the live handle for a client. History is retained.
    pub fn disconnect(&self, client_id: &str) {
        self.connections.lock().remove(client_id);
        debug!("Client {} disconnected", client_id);
    }

    pub fn connected_clients(&self) -> Vec<String> {
        self.connections.lock().keys().cloned().collect()
    }

    /// Store a notification for a client and attempt live delivery.
    pub fn send(&self, client_id: &str, kind: &str, message: &str, data: Option<Value>) {
        let notification = self.build_notification(kind, message, data);

        self.history
            .lock()
            .entry(client_id.to_string())
            .or_default()
            .push(notification.clone());

        let mut connections = self.connections.lock();
        if let Some(handle) = connections.get(client_id) {
            if handle.send(notification).is_err() {
                // Receiver gone: the transport died without an explicit
                // disconnect. The notification stays in history.
                warn!("Dropping dead connection for client {}", client_id);
                connections.remove(client_id);
            }
        }
    }

    /// Send to every currently connected client.
    pub fn broadcast(&self, kind: &str, message: &str, data: Option<Value>) {
        for client_id in self.connected_clients() {
            self.send(&client_id, kind, message, data.clone());
        }
    }

    /// Notification history for a client, in insertion order.
    pub fn list(&self, client_id: &str, unread_only: bool) -> Vec<Notification> {
        let history = self.history.lock();
        match history.get(client_id) {
            Some(notifications) => notifications
                .iter()
                .filter(|n| !unread_only || !n.read)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Mark one notification as read. No-op if the id is unknown.
    pub fn mark_read(&self, client_id: &str, notification_id: &str) {
        if let Some(notifications) = self.history.lock().get_mut(client_id) {
            if let Some(notification) = notifications
                .iter_mut()
                .find(|n| n.id == notification_id)
            {
                notification.read = true;
            }
        }
    }

    /// Drop notifications older than `max_age_days`, per client.
    pub fn cleanup(&self, max_age_days: i64) {
        let cutoff = Utc::now() - Duration::days(max_age_days);
        for notifications in self.history.lock().values_mut() {
            notifications.retain(|n| n.created_at >= cutoff);
        }
    }

    fn build_notification(&self, kind: &str, message: &str, data: Option<Value>) -> Notification {
        let seq = self.id_seq.fetch_add(1, Ordering::Relaxed);
        Notification {
            id: format!("notif_{}_{}", Utc::now().format("%Y%m%d_%H%M%S_%f"), seq),
            kind: kind.to_string(),
            message: message.to_string(),
            created_at: Utc::now(),
            data,
            read: false,
        }
    }
}
