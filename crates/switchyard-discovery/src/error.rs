//! Discovery error types.

use std::time::Duration;

use crate::store::LeaseId;

/// Errors raised by registration and resolution.
///
/// At startup these are fatal; at runtime the background loops retry instead
/// of surfacing them.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The coordination store could not be reached.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// A bounded store request did not finish in time.
    #[error("store request timed out after {0:?}")]
    Timeout(Duration),

    /// The store refused to grant a lease.
    #[error("lease grant failed: {0}")]
    GrantFailed(String),

    /// The lease does not exist (expired or revoked).
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    /// A stored value could not be parsed as a service record.
    #[error("malformed service record under {key}: {source}")]
    MalformedRecord {
        /// Key holding the value.
        key: String,
        /// Parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// A service record could not be serialized.
    #[error("failed to serialize service record: {0}")]
    Serialize(#[source] serde_json::Error),

    /// A resolution target did not have the form `scheme:///service[/version]`.
    #[error("invalid resolver target {0:?}")]
    InvalidTarget(String),
}
