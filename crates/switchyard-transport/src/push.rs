//! Fan-out of server pushes to users connected on other gateways.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use switchyard_protocol::Message;

use crate::client::TransportClient;
use crate::envelope::Envelope;

/// Maps a user id to the identity of the gateway holding its connection.
pub trait UserLocator: Send + Sync {
    /// Gateway owning `user_id`, if the user is connected anywhere.
    fn locate(&self, user_id: &str) -> Option<String>;

    /// Record that `user_id` is connected on `process`.
    fn bind(&self, user_id: &str, process: &str);

    /// Forget `user_id`, but only if it is still recorded on `process`.
    fn unbind(&self, user_id: &str, process: &str);
}

/// In-process [`UserLocator`].
#[derive(Default)]
pub struct MemoryUserLocator {
    users: RwLock<HashMap<String, String>>,
}

impl MemoryUserLocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserLocator for MemoryUserLocator {
    fn locate(&self, user_id: &str) -> Option<String> {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }

    fn bind(&self, user_id: &str, process: &str) {
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), process.to_string());
    }

    fn unbind(&self, user_id: &str, process: &str) {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        if users.get(user_id).is_some_and(|p| p == process) {
            users.remove(user_id);
        }
    }
}

/// Groups push targets by owning gateway and sends one envelope per gateway.
pub struct PushFanout {
    transport: Arc<TransportClient>,
    locator: Arc<dyn UserLocator>,
}

impl PushFanout {
    pub fn new(transport: Arc<TransportClient>, locator: Arc<dyn UserLocator>) -> Self {
        Self { transport, locator }
    }

    /// Push `payload` on `route` to `users`.
    ///
    /// `origin` is the envelope being handled, if any; its connection and
    /// user are copied onto the outgoing envelopes for tracing. Users that are
    /// not connected are skipped. A failed send is logged and the remaining
    /// gateways are still attempted. Returns the number of envelopes sent.
    pub fn push(
        &self,
        origin: Option<&Envelope>,
        users: &[String],
        payload: &[u8],
        route: &str,
    ) -> usize {
        let mut seen = HashSet::new();
        let mut by_process: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for user in users {
            if !seen.insert(user.as_str()) {
                continue;
            }
            match self.locator.locate(user) {
                Some(process) => by_process.entry(process).or_default().push(user.clone()),
                None => tracing::debug!(user = %user, route, "push target not connected"),
            }
        }

        let mut sent = 0;
        for (process, users) in by_process {
            let mut envelope = Envelope::message(
                self.transport.identity(),
                &process,
                Message::push(route, payload.to_vec()),
            );
            if let Some(origin) = origin {
                envelope.connection_id = origin.connection_id.clone();
                envelope.user_id = origin.user_id.clone();
            }
            envelope.users = users;
            match self.transport.send_envelope(&envelope) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!(to = %process, route, "push failed: {e}"),
            }
        }
        sent
    }
}
