//! The session surface handlers see.

use serde_json::Value;

use crate::error::HandlerError;

/// Where a session value is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    /// Private to the connection.
    #[default]
    Connection,
    /// Shared by every connection on the owning gateway.
    Shared,
}

/// Session operations available to a handler, whether the handler runs on
/// the gateway that owns the connection or on a backend.
pub trait SessionHandle: Send + Sync {
    /// Id of the client connection.
    fn connection_id(&self) -> &str;

    /// Bound user id, empty if unbound.
    fn user_id(&self) -> String;

    /// Look a key up in the connection scope, falling back to the shared scope.
    fn get(&self, key: &str) -> Option<Value>;

    /// Store a value.
    fn put(&self, key: &str, value: Value, scope: Scope) -> Result<(), HandlerError>;

    /// Bind the connection to `user_id`. A connection can be bound once;
    /// binding the same id again is a no-op.
    fn bind(&self, user_id: &str) -> Result<(), HandlerError>;

    /// Hand the current message to `destination`, optionally on a different
    /// route. The handler's own return value is then discarded.
    fn forward(&self, route: Option<&str>, destination: &str) -> Result<(), HandlerError> {
        let _ = (route, destination);
        Err(HandlerError::Unsupported("forward"))
    }

    /// Push `payload` on `route` to `users` on whichever gateways hold them.
    /// Returns the number of gateways reached.
    fn push(&self, users: &[String], route: &str, payload: &[u8]) -> Result<usize, HandlerError> {
        let _ = (users, route, payload);
        Err(HandlerError::Unsupported("push"))
    }
}

/// Check a bind request against the current binding.
///
/// Returns `Ok(true)` when the binding must be stored, `Ok(false)` when it is
/// already in place.
pub fn check_bind(current: &str, requested: &str) -> Result<bool, HandlerError> {
    if requested.is_empty() {
        return Err(HandlerError::Session("empty user id".into()));
    }
    match current {
        "" => Ok(true),
        same if same == requested => Ok(false),
        other => Err(HandlerError::Session(format!(
            "already bound to {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_bind() {
        assert_eq!(check_bind("", "u1"), Ok(true));
        assert_eq!(check_bind("u1", "u1"), Ok(false));
        assert!(check_bind("u1", "u2").is_err());
        assert!(check_bind("", "").is_err());
    }
}
