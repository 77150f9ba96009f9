//! Gateway-side authoritative session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::Value;
use switchyard_transport::{HandlerError, Scope, SessionData, SessionHandle};

use crate::error::SessionError;

/// Key/value data shared by every connection on one gateway.
pub type SharedData = RwLock<HashMap<String, Value>>;

/// Per-connection state owned by the gateway.
///
/// Backends never touch it directly; their changes arrive as session sync
/// envelopes and are merged with [`Session::apply`].
pub struct Session {
    connection_id: String,
    user_id: RwLock<String>,
    single: Mutex<HashMap<String, Value>>,
    shared: Arc<SharedData>,
}

impl Session {
    pub fn new(connection_id: impl Into<String>, shared: Arc<SharedData>) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_id: RwLock::new(String::new()),
            single: Mutex::new(HashMap::new()),
            shared,
        }
    }

    /// The gateway-wide shared map.
    pub fn shared(&self) -> &Arc<SharedData> {
        &self.shared
    }

    /// Whether a user id has been bound.
    pub fn is_bound(&self) -> bool {
        !self
            .user_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Bind the session to `user_id`.
    ///
    /// Returns `Ok(true)` if the binding is new and `Ok(false)` if the session
    /// was already bound to the same user.
    pub fn bind_user(&self, user_id: &str) -> Result<bool, SessionError> {
        if user_id.is_empty() {
            return Err(SessionError::EmptyUserId);
        }
        let mut current = self.user_id.write().unwrap_or_else(PoisonError::into_inner);
        if current.is_empty() {
            *current = user_id.to_string();
            Ok(true)
        } else if *current == user_id {
            Ok(false)
        } else {
            Err(SessionError::AlreadyBound {
                current: current.clone(),
                requested: user_id.to_string(),
            })
        }
    }

    /// Copy of the connection data and the shared data.
    pub fn snapshot(&self) -> SessionData {
        let single = self
            .single
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let shared = self
            .shared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        SessionData { single, shared }
    }

    /// Merge changes sent by a backend. Later writes replace earlier ones.
    pub fn apply(&self, changes: &SessionData) {
        if !changes.single.is_empty() {
            let mut single = self.single.lock().unwrap_or_else(PoisonError::into_inner);
            for (key, value) in &changes.single {
                single.insert(key.clone(), value.clone());
            }
        }
        if !changes.shared.is_empty() {
            let mut shared = self.shared.write().unwrap_or_else(PoisonError::into_inner);
            for (key, value) in &changes.shared {
                shared.insert(key.clone(), value.clone());
            }
        }
    }

    /// Drop the connection data and the binding. Shared data is untouched.
    pub fn clear(&self) {
        self.single
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.user_id
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl SessionHandle for Session {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn user_id(&self) -> String {
        self.user_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn get(&self, key: &str) -> Option<Value> {
        let single = self
            .single
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        single.or_else(|| {
            self.shared
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .cloned()
        })
    }

    fn put(&self, key: &str, value: Value, scope: Scope) -> Result<(), HandlerError> {
        match scope {
            Scope::Connection => {
                self.single
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.to_string(), value);
            }
            Scope::Shared => {
                self.shared
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.to_string(), value);
            }
        }
        Ok(())
    }

    fn bind(&self, user_id: &str) -> Result<(), HandlerError> {
        self.bind_user(user_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pair() -> (Session, Session) {
        let shared = Arc::new(SharedData::default());
        (
            Session::new("c1", Arc::clone(&shared)),
            Session::new("c2", shared),
        )
    }

    #[test]
    fn test_connection_scope_is_private() {
        let (a, b) = pair();
        a.put("room", json!(1), Scope::Connection).unwrap();
        assert_eq!(a.get("room"), Some(json!(1)));
        assert_eq!(b.get("room"), None);
    }

    #[test]
    fn test_shared_scope_visible_everywhere() {
        let (a, b) = pair();
        a.put("motd", json!("hi"), Scope::Shared).unwrap();
        assert_eq!(b.get("motd"), Some(json!("hi")));
    }

    #[test]
    fn test_connection_value_shadows_shared() {
        let (a, _b) = pair();
        a.put("k", json!("shared"), Scope::Shared).unwrap();
        a.put("k", json!("mine"), Scope::Connection).unwrap();
        assert_eq!(a.get("k"), Some(json!("mine")));
    }

    #[test]
    fn test_apply_merges_in_order() {
        let (a, b) = pair();
        a.put("keep", json!(true), Scope::Connection).unwrap();

        let mut first = SessionData::default();
        first.single.insert("room".into(), json!(1));
        let mut second = SessionData::default();
        second.single.insert("room".into(), json!(2));
        second.shared.insert("online".into(), json!(10));

        a.apply(&first);
        a.apply(&second);
        assert_eq!(a.get("room"), Some(json!(2)));
        assert_eq!(a.get("keep"), Some(json!(true)));
        assert_eq!(b.get("online"), Some(json!(10)));
    }

    #[test]
    fn test_bind_once() {
        let (a, _b) = pair();
        assert_eq!(a.bind_user("u1"), Ok(true));
        assert_eq!(a.bind_user("u1"), Ok(false));
        assert_eq!(
            a.bind_user("u2"),
            Err(SessionError::AlreadyBound {
                current: "u1".into(),
                requested: "u2".into()
            })
        );
        assert_eq!(a.bind_user(""), Err(SessionError::EmptyUserId));
        assert!(matches!(a.bind("u2"), Err(HandlerError::Session(_))));
    }

    #[test]
    fn test_snapshot_and_clear() {
        let (a, _b) = pair();
        a.put("room", json!(3), Scope::Connection).unwrap();
        a.put("motd", json!("x"), Scope::Shared).unwrap();
        a.bind_user("u1").unwrap();

        let snap = a.snapshot();
        assert_eq!(snap.single["room"], json!(3));
        assert_eq!(snap.shared["motd"], json!("x"));

        a.clear();
        assert_eq!(a.get("room"), None);
        assert_eq!(a.user_id(), "");
        assert_eq!(a.get("motd"), Some(json!("x")));
    }
}
