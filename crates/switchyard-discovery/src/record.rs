//! Service records and their key layout in the coordination store.
//!
//! A record lives under `/{name}/{address}` or, when versioned,
//! `/{name}/{version}/{address}`. The value is the JSON-serialized record.

use serde::{Deserialize, Serialize};

use crate::error::DiscoveryError;

/// A live process instance of a logical service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Logical service name, e.g. `"game"`.
    pub name: String,
    /// Address peers use to reach the instance (its bus identity).
    pub address: String,
    /// Load-balancing weight.
    #[serde(default)]
    pub weight: u32,
    /// Optional version segment.
    #[serde(default)]
    pub version: String,
    /// Lease time-to-live in seconds.
    #[serde(default)]
    pub ttl: u64,
}

impl ServiceRecord {
    /// Key this record is stored under.
    pub fn key(&self) -> String {
        let version = (!self.version.is_empty()).then_some(self.version.as_str());
        format!("{}{}", service_prefix(&self.name, version), self.address)
    }

    /// JSON value stored under [`Self::key`].
    pub fn to_value(&self) -> Result<String, DiscoveryError> {
        serde_json::to_string(self).map_err(DiscoveryError::Serialize)
    }

    /// Parse a stored value.
    pub fn from_value(key: &str, value: &str) -> Result<Self, DiscoveryError> {
        serde_json::from_str(value).map_err(|source| DiscoveryError::MalformedRecord {
            key: key.to_string(),
            source,
        })
    }
}

/// Key prefix covering every instance of `name` (optionally of one version).
///
/// Always ends in `/`, so `game` does not also match `gamehall`.
pub fn service_prefix(name: &str, version: Option<&str>) -> String {
    match version {
        Some(v) if !v.is_empty() => format!("/{name}/{v}/"),
        _ => format!("/{name}/"),
    }
}

/// The address segment of a record key (its last path segment).
pub fn address_from_key(key: &str) -> Option<&str> {
    key.rsplit('/').next().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: &str) -> ServiceRecord {
        ServiceRecord {
            name: "game".into(),
            address: "game-1".into(),
            weight: 10,
            version: version.into(),
            ttl: 5,
        }
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(record("").key(), "/game/game-1");
        assert_eq!(record("v2").key(), "/game/v2/game-1");
    }

    #[test]
    fn test_prefix_is_slash_terminated() {
        assert_eq!(service_prefix("game", None), "/game/");
        assert_eq!(service_prefix("game", Some("v2")), "/game/v2/");
        assert!(!"/gamehall/x".starts_with(&service_prefix("game", None)));
    }

    #[test]
    fn test_value_roundtrip() {
        let rec = record("v2");
        let value = rec.to_value().unwrap();
        assert_eq!(ServiceRecord::from_value(&rec.key(), &value).unwrap(), rec);
    }

    #[test]
    fn test_malformed_value() {
        let err = ServiceRecord::from_value("/game/x", "not json").unwrap_err();
        assert!(matches!(err, DiscoveryError::MalformedRecord { .. }));
    }

    #[test]
    fn test_address_from_key() {
        assert_eq!(address_from_key("/game/v2/game-1"), Some("game-1"));
        assert_eq!(address_from_key("/game/10.0.0.1:9000"), Some("10.0.0.1:9000"));
        assert_eq!(address_from_key("/game/"), None);
    }
}
