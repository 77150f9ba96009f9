//! Thread-safe index of live connections, by connection id and by bound user.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::connection::Connection;
use crate::error::GatewayError;

#[derive(Default)]
struct Inner {
    connections: HashMap<String, Arc<dyn Connection>>,
    users: HashMap<String, String>,
}

/// A connection taken out of the registry.
pub struct Removed {
    pub connection: Arc<dyn Connection>,
    /// The user whose index entry pointed at this connection, if any. A user
    /// that has since moved to another connection is not reported.
    pub user: Option<String>,
}

/// Live connections of one gateway, capped at `max_connections`.
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_connections,
        }
    }

    /// Insert a connection. Fails if the registry is at capacity.
    pub fn insert(&self, connection: Arc<dyn Connection>) -> Result<(), GatewayError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.connections.len() >= self.max_connections {
            return Err(GatewayError::LimitReached(self.max_connections));
        }
        inner
            .connections
            .insert(connection.id().to_string(), connection);
        Ok(())
    }

    /// Remove a connection and its user index entry.
    pub fn remove(&self, id: &str) -> Option<Removed> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let connection = inner.connections.remove(id)?;
        let mut user = None;
        inner.users.retain(|name, conn| {
            let owned = conn == id;
            if owned {
                user = Some(name.clone());
            }
            !owned
        });
        Some(Removed { connection, user })
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Connection>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .get(id)
            .cloned()
    }

    /// Index connection `id` under `user_id`.
    ///
    /// Returns the id of the connection previously indexed under the user, if
    /// it was a different one. Unknown connections are not indexed.
    pub fn bind_user(&self, user_id: &str, id: &str) -> Option<String> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !inner.connections.contains_key(id) {
            return None;
        }
        inner
            .users
            .insert(user_id.to_string(), id.to_string())
            .filter(|previous| previous != id)
    }

    /// Whether `user_id` is indexed to connection `id`.
    pub fn is_bound(&self, user_id: &str, id: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .users
            .get(user_id)
            .is_some_and(|conn| conn == id)
    }

    /// Connection bound to `user_id`.
    pub fn by_user(&self, user_id: &str) -> Option<Arc<dyn Connection>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let id = inner.users.get(user_id)?;
        inner.connections.get(id).cloned()
    }

    /// Every live connection.
    pub fn all(&self) -> Vec<Arc<dyn Connection>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
