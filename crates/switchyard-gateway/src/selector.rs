//! Picks a backend instance for a service type.
//!
//! Each service type the gateway forwards to has a resolver whose state is
//! observed through a `watch` channel; the selector reads the latest address
//! list on every call, so it follows registrations and expiries without
//! further bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use rand::Rng;
use switchyard_discovery::ResolverState;
use tokio::sync::watch;

/// How an instance is chosen among the known addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectPolicy {
    #[default]
    RoundRobin,
    Random,
}

struct Target {
    state: watch::Receiver<ResolverState>,
    next: AtomicUsize,
}

/// Per-service-type instance selection over resolver state.
pub struct InstanceSelector {
    policy: SelectPolicy,
    targets: RwLock<HashMap<String, Target>>,
}

impl InstanceSelector {
    pub fn new(policy: SelectPolicy) -> Self {
        Self {
            policy,
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Track `service` through `state`, replacing any earlier receiver.
    pub fn add_service(&self, service: impl Into<String>, state: watch::Receiver<ResolverState>) {
        let service = service.into();
        tracing::debug!(service = %service, "tracking service instances");
        self.targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                service,
                Target {
                    state,
                    next: AtomicUsize::new(0),
                },
            );
    }

    /// Stop tracking `service`.
    pub fn remove_service(&self, service: &str) {
        self.targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service);
    }

    /// Addresses currently known for `service`.
    pub fn instances(&self, service: &str) -> Vec<String> {
        let targets = self.targets.read().unwrap_or_else(PoisonError::into_inner);
        targets
            .get(service)
            .map(|t| {
                t.state
                    .borrow()
                    .addresses
                    .iter()
                    .map(|a| a.address.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Choose an instance of `service`, or `None` if none is known.
    pub fn select(&self, service: &str) -> Option<String> {
        let targets = self.targets.read().unwrap_or_else(PoisonError::into_inner);
        let target = targets.get(service)?;
        let state = target.state.borrow();
        let addresses = &state.addresses;
        if addresses.is_empty() {
            return None;
        }
        let index = match self.policy {
            SelectPolicy::RoundRobin => target.next.fetch_add(1, Ordering::Relaxed) % addresses.len(),
            SelectPolicy::Random => rand::rng().random_range(0..addresses.len()),
        };
        Some(addresses[index].address.clone())
    }
}
