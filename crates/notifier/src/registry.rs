//! Connection registry. Resolves recipients to live connections and emits push frames.
//!
//! The handle table lives behind a `RwLock`; connects and disconnects take the
//! write half, emits only read. Identity lookups (user → connection, team
//! member → connection) go through the `ConnectionStore`, which remains the
//! authoritative record across processes.
//!
//! A lookup resolves one connection id. Delivery then goes to every live
//! handle this process holds for the same user, so a user connected from
//! several devices hears about the event on all of them. When the store row
//! is missing or points at a connection that is gone, the local user index
//! is used instead. Closing one device hands the store row to a remaining one.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use beacon_common::types::{ConnectionHandle, SocketEvent};

use crate::store::ConnectionStore;

/// A push event as delivered to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    pub event: SocketEvent,
    pub data: serde_json::Value,
}

struct LiveConnection {
    handle: ConnectionHandle,
    sender: mpsc::UnboundedSender<PushFrame>,
}

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, LiveConnection>>,
    store: Arc<dyn ConnectionStore>,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn ConnectionStore>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Register a new live connection for `user_id`.
    ///
    /// Returns the handle and the receiving end of its push stream. The
    /// connection is usable locally even if recording it in the store fails.
    pub async fn register(
        &self,
        user_id: Uuid,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<PushFrame>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            connection_id: Uuid::new_v4().to_string(),
            user_id,
            established_at: Utc::now(),
        };

        self.connections.write().await.insert(
            handle.connection_id.clone(),
            LiveConnection {
                handle: handle.clone(),
                sender,
            },
        );

        if let Err(e) = self.store.attach(user_id, &handle.connection_id).await {
            tracing::warn!(
                error = %e,
                user_id = %user_id,
                connection_id = %handle.connection_id,
                "Failed to record connection in store"
            );
        }

        tracing::debug!(user_id = %user_id, connection_id = %handle.connection_id, "Connection registered");
        (handle, receiver)
    }

    /// Drop a connection. Returns `false` if it was not registered.
    pub async fn unregister(&self, connection_id: &str) -> bool {
        let (live, successor) = {
            let mut connections = self.connections.write().await;
            let Some(live) = connections.remove(connection_id) else {
                return false;
            };
            let successor = connections
                .values()
                .filter(|c| c.handle.user_id == live.handle.user_id)
                .max_by_key(|c| c.handle.established_at)
                .map(|c| c.handle.connection_id.clone());
            (live, successor)
        };

        let result = match &successor {
            Some(next) => self.store.hand_over(connection_id, next).await,
            None => self.store.detach(connection_id).await,
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, connection_id = %connection_id, "Failed to update connection in store");
        }

        tracing::debug!(
            user_id = %live.handle.user_id,
            connection_id = %connection_id,
            successor = ?successor,
            "Connection unregistered"
        );
        true
    }

    /// Deliver to one connection. No-op (returns `false`) unless it is live here.
    pub async fn emit(
        &self,
        event: SocketEvent,
        connection_id: &str,
        payload: serde_json::Value,
    ) -> bool {
        if connection_id.is_empty() {
            return false;
        }

        let delivered = {
            let connections = self.connections.read().await;
            match connections.get(connection_id) {
                Some(live) => live.sender.send(PushFrame { event, data: payload }).is_ok(),
                None => return false,
            }
        };

        if !delivered {
            self.prune(connection_id).await;
        }
        delivered
    }

    /// Deliver to a user's connections, unless the user is the actor.
    ///
    /// Returns the number of handles the frame reached. A missing, stale or
    /// failed store lookup falls back to the user's local handles.
    pub async fn emit_by_user_id(
        &self,
        target_user_id: Uuid,
        acting_user_id: Option<Uuid>,
        event: SocketEvent,
        payload: serde_json::Value,
    ) -> usize {
        if acting_user_id == Some(target_user_id) {
            return 0;
        }

        let resolved = match self.store.connection_for_user(target_user_id).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::debug!(error = %e, user_id = %target_user_id, "Connection lookup failed");
                None
            }
        };

        if let Some(connection_id) = resolved {
            let delivered = self
                .deliver_to_owner(&connection_id, event, payload.clone())
                .await;
            if delivered > 0 {
                return delivered;
            }
        }

        self.emit_to_user(target_user_id, event, payload).await
    }

    /// Deliver to the user behind a team member, unless that user is the actor.
    pub async fn emit_by_team_member_id(
        &self,
        team_member_id: Uuid,
        acting_user_id: Option<Uuid>,
        event: SocketEvent,
        payload: serde_json::Value,
    ) -> usize {
        match self
            .store
            .connection_for_team_member(team_member_id, acting_user_id)
            .await
        {
            Ok(Some(connection_id)) => self.deliver_to_owner(&connection_id, event, payload).await,
            Ok(None) => 0,
            Err(e) => {
                tracing::debug!(error = %e, team_member_id = %team_member_id, "Connection lookup failed");
                0
            }
        }
    }

    /// Deliver to every live handle of the user who owns `connection_id`.
    /// Returns 0 when that connection is not live here.
    pub async fn emit_to_owner(
        &self,
        event: SocketEvent,
        connection_id: &str,
        payload: serde_json::Value,
    ) -> usize {
        if connection_id.is_empty() {
            return 0;
        }
        self.deliver_to_owner(connection_id, event, payload).await
    }

    /// Deliver to every live handle this process holds for `user_id`.
    pub async fn emit_to_user(
        &self,
        user_id: Uuid,
        event: SocketEvent,
        payload: serde_json::Value,
    ) -> usize {
        let mut stale = Vec::new();
        let mut delivered = 0;

        {
            let connections = self.connections.read().await;
            for (id, live) in connections.iter().filter(|(_, c)| c.handle.user_id == user_id) {
                let frame = PushFrame {
                    event,
                    data: payload.clone(),
                };
                if live.sender.send(frame).is_ok() {
                    delivered += 1;
                } else {
                    stale.push(id.clone());
                }
            }
        }

        for id in stale {
            self.prune(&id).await;
        }
        delivered
    }

    /// Number of live connections in this process.
    pub async fn live_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Live handles held for `user_id`.
    pub async fn handles_for(&self, user_id: Uuid) -> Vec<ConnectionHandle> {
        self.connections
            .read()
            .await
            .values()
            .filter(|live| live.handle.user_id == user_id)
            .map(|live| live.handle.clone())
            .collect()
    }

    async fn deliver_to_owner(
        &self,
        connection_id: &str,
        event: SocketEvent,
        payload: serde_json::Value,
    ) -> usize {
        let owner = {
            let connections = self.connections.read().await;
            connections.get(connection_id).map(|c| c.handle.user_id)
        };

        match owner {
            Some(owner) => self.emit_to_user(owner, event, payload).await,
            None => 0,
        }
    }

    /// Remove a handle whose receiver is gone.
    async fn prune(&self, connection_id: &str) {
        if self.connections.write().await.remove(connection_id).is_some() {
            tracing::debug!(connection_id = %connection_id, "Pruned closed connection");
        }
    }
}
