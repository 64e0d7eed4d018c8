//! Connected WebSocket peers.
//!
//! Every connection is registered on upgrade with role `ui`; a connection
//! that sends the runner's `Worker` handshake is switched to role `worker`
//! and bound to exactly one execution. Removing a client never touches the
//! execution registry; callers decide what a disconnect means.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::protocol::Outbound;

/// What kind of peer sits behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Ui,
    Worker,
}

/// One connected peer.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub role: ClientRole,
    /// Outgoing frames for this connection's writer task.
    pub tx: mpsc::Sender<Outbound>,
    /// Execution this client is associated with, if any.
    pub execution_id: Option<String>,
    pub connected_at: Instant,
}

/// Cloneable handle to the shared client table.
#[derive(Clone, Default)]
pub struct ClientTable {
    clients: Arc<RwLock<HashMap<String, ClientInfo>>>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection as a UI client and return its id.
    pub async fn register(&self, tx: mpsc::Sender<Outbound>) -> String {
        let id = Uuid::new_v4().to_string();
        let mut clients = self.clients.write().await;
        clients.insert(
            id.clone(),
            ClientInfo {
                role: ClientRole::Ui,
                tx,
                execution_id: None,
                connected_at: Instant::now(),
            },
        );
        debug!("Client {id} registered, total: {}", clients.len());
        id
    }

    pub async fn get(&self, id: &str) -> Option<ClientInfo> {
        self.clients.read().await.get(id).cloned()
    }

    pub async fn role(&self, id: &str) -> Option<ClientRole> {
        self.clients.read().await.get(id).map(|c| c.role)
    }

    pub async fn execution_of(&self, id: &str) -> Option<String> {
        self.clients
            .read()
            .await
            .get(id)
            .and_then(|c| c.execution_id.clone())
    }

    /// Set a client's role and execution binding together.
    pub async fn bind(&self, id: &str, role: ClientRole, execution_id: Option<&str>) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get_mut(id) {
            Some(client) => {
                client.role = role;
                client.execution_id = execution_id.map(ToString::to_string);
                true
            }
            None => false,
        }
    }

    /// Queue a frame for a client. Returns `false` if the client is gone or
    /// its connection has closed.
    ///
    /// The sender is cloned out of the table so no lock is held while waiting
    /// for channel capacity.
    pub async fn send(&self, id: &str, msg: impl Into<Outbound>) -> bool {
        let tx = self.clients.read().await.get(id).map(|c| c.tx.clone());
        match tx {
            Some(tx) => tx.send(msg.into()).await.is_ok(),
            None => false,
        }
    }

    pub async fn remove(&self, id: &str) -> Option<ClientInfo> {
        let mut clients = self.clients.write().await;
        let removed = clients.remove(id);
        if let Some(client) = &removed {
            debug!(
                "Client {id} removed after {}s, remaining: {}",
                client.connected_at.elapsed().as_secs(),
                clients.len()
            );
        }
        removed
    }

    /// `(ui, worker)` connection counts.
    pub async fn counts(&self) -> (usize, usize) {
        let clients = self.clients.read().await;
        let workers = clients
            .values()
            .filter(|c| c.role == ClientRole::Worker)
            .count();
        (clients.len() - workers, workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerMessage;

    #[tokio::test]
    async fn test_register_bind_remove() {
        let table = ClientTable::new();
        let (tx, _rx) = mpsc::channel(4);
        let id = table.register(tx).await;
        assert_eq!(table.role(&id).await, Some(ClientRole::Ui));
        assert_eq!(table.counts().await, (1, 0));

        assert!(table.bind(&id, ClientRole::Worker, Some("exec-1")).await);
        assert_eq!(table.execution_of(&id).await.as_deref(), Some("exec-1"));
        assert_eq!(table.counts().await, (0, 1));

        assert!(table.remove(&id).await.is_some());
        assert!(table.get(&id).await.is_none());
        assert!(!table.bind(&id, ClientRole::Ui, None).await);
    }

    #[tokio::test]
    async fn test_send_reaches_connection() {
        let table = ClientTable::new();
        let (tx, mut rx) = mpsc::channel(4);
        let id = table.register(tx).await;

        assert!(
            table
                .send(&id, ServerMessage::Registered { client_id: id.clone() })
                .await
        );
        let Some(Outbound::Ui(ServerMessage::Registered { client_id })) = rx.recv().await else {
            panic!("expected a registered frame");
        };
        assert_eq!(client_id, id);

        drop(rx);
        assert!(
            !table
                .send(&id, ServerMessage::Registered { client_id: id.clone() })
                .await
        );
        assert!(
            !table
                .send("missing", ServerMessage::Registered { client_id: id.clone() })
                .await
        );
    }
}
