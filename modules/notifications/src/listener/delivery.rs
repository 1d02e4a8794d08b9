//! Best-effort live delivery
//!
//! Persisted WEBSOCKET notifications are pushed to recipients that hold a
//! live connection. A failed push never fails the broker message: the row is
//! already durable and the client pulls it on reconnect.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

use crate::models::{Audience, Notification};

/// Frame sent over a live connection
#[derive(Debug, Clone, PartialEq)]
pub struct LivePush {
    pub notification_id: i64,
    pub destination: Option<String>,
    pub title: String,
    pub body: String,
    pub metadata: BTreeMap<String, String>,
}

impl From<&Notification> for LivePush {
    fn from(n: &Notification) -> Self {
        Self {
            notification_id: n.id,
            destination: n.metadata.get("destination").cloned(),
            title: n.title.clone(),
            body: n.body.clone(),
            metadata: n.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("recipient {0} is not connected")]
    NotConnected(i64),

    #[error("connection of recipient {0} closed")]
    Closed(i64),
}

/// Who is online right now, and how to reach them
#[async_trait]
pub trait LiveConnectionRegistry: Send + Sync {
    async fn is_connected(&self, audience: Audience, recipient_id: i64) -> bool;

    async fn push(
        &self,
        audience: Audience,
        recipient_id: i64,
        frame: LivePush,
    ) -> Result<(), PushError>;
}

/// In-process registry; each connection is an unbounded channel
#[derive(Default)]
pub struct InMemoryConnections {
    connections: Mutex<HashMap<(Audience, i64), mpsc::UnboundedSender<LivePush>>>,
}

impl InMemoryConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; replaces any previous one for the recipient
    pub fn connect(&self, audience: Audience, recipient_id: i64) -> mpsc::UnboundedReceiver<LivePush> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((audience, recipient_id), sender);
        receiver
    }

    pub fn disconnect(&self, audience: Audience, recipient_id: i64) {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(audience, recipient_id));
    }
}

#[async_trait]
impl LiveConnectionRegistry for InMemoryConnections {
    async fn is_connected(&self, audience: Audience, recipient_id: i64) -> bool {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(audience, recipient_id))
            .is_some_and(|sender| !sender.is_closed())
    }

    async fn push(
        &self,
        audience: Audience,
        recipient_id: i64,
        frame: LivePush,
    ) -> Result<(), PushError> {
        let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = connections
            .get(&(audience, recipient_id))
            .ok_or(PushError::NotConnected(recipient_id))?;

        if sender.send(frame).is_err() {
            connections.remove(&(audience, recipient_id));
            return Err(PushError::Closed(recipient_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: i64) -> LivePush {
        LivePush {
            notification_id: id,
            destination: None,
            title: "t".to_string(),
            body: "b".to_string(),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_push_to_connected_recipient() {
        let registry = InMemoryConnections::new();
        let mut rx = registry.connect(Audience::Restaurant, 11);

        assert!(registry.is_connected(Audience::Restaurant, 11).await);
        assert!(!registry.is_connected(Audience::Customer, 11).await);

        registry.push(Audience::Restaurant, 11, frame(1)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().notification_id, 1);
    }

    #[tokio::test]
    async fn test_closed_connection_is_dropped() {
        let registry = InMemoryConnections::new();
        drop(registry.connect(Audience::Agency, 4));

        assert!(!registry.is_connected(Audience::Agency, 4).await);
        assert_eq!(
            registry.push(Audience::Agency, 4, frame(1)).await,
            Err(PushError::Closed(4))
        );
        assert_eq!(
            registry.push(Audience::Agency, 4, frame(2)).await,
            Err(PushError::NotConnected(4))
        );
    }
}
