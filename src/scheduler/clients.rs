use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{GridError, Result};
use crate::scheduler::job::ClientId;

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub description: String,
    pub registered_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

impl ClientInfo {
    pub fn new(client_id: ClientId, description: String) -> Self {
        let now = Utc::now();
        Self {
            client_id,
            description,
            registered_at: now,
            last_access: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_access = Utc::now();
    }
}

/// Registered clients. Ids start at 0 and are never reused.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, ClientInfo>,
    next_id: ClientId,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, description: impl Into<String>) -> ClientId {
        let client_id = self.next_id;
        self.next_id += 1;
        let description = description.into();
        tracing::info!(client_id, description = %description, "Client registered");
        self.clients
            .insert(client_id, ClientInfo::new(client_id, description));
        client_id
    }

    /// Refresh a client's last access time. Fails for ids never handed out.
    pub fn touch(&mut self, client_id: ClientId) -> Result<()> {
        self.clients
            .get_mut(&client_id)
            .map(ClientInfo::touch)
            .ok_or(GridError::UnknownClient(client_id))
    }

    pub fn get(&self, client_id: ClientId) -> Option<&ClientInfo> {
        self.clients.get(&client_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
