//! Bidirectional route ⇄ code dictionary used for route compression.
//!
//! The dictionary is declared by the server, registered once at startup and
//! announced to clients in the handshake response. Lookups dominate, so both
//! directions live behind one read/write lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use crate::error::DictionaryError;

#[derive(Default)]
struct Maps {
    codes: HashMap<String, u16>,
    routes: HashMap<u16, String>,
}

/// Shared route compression dictionary.
#[derive(Default)]
pub struct RouteDictionary {
    inner: RwLock<Maps>,
}

impl RouteDictionary {
    /// Create an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single `route → code` pair.
    ///
    /// Fails without touching the existing mapping if either the route or
    /// the code is already registered.
    pub fn register(&self, route: &str, code: u16) -> Result<(), DictionaryError> {
        let mut maps = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if maps.codes.contains_key(route) {
            return Err(DictionaryError::DuplicateRoute(route.to_string()));
        }
        if maps.routes.contains_key(&code) {
            return Err(DictionaryError::DuplicateCode(code));
        }
        maps.codes.insert(route.to_string(), code);
        maps.routes.insert(code, route.to_string());
        Ok(())
    }

    /// Register a whole table. Either every entry is added or none is.
    pub fn register_all<'a, I>(&self, table: I) -> Result<(), DictionaryError>
    where
        I: IntoIterator<Item = (&'a str, u16)>,
    {
        let table: Vec<(&str, u16)> = table.into_iter().collect();
        let mut maps = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let mut seen_routes = HashMap::with_capacity(table.len());
        let mut seen_codes = HashMap::with_capacity(table.len());
        for &(route, code) in &table {
            if maps.codes.contains_key(route) || seen_routes.insert(route, code).is_some() {
                return Err(DictionaryError::DuplicateRoute(route.to_string()));
            }
            if maps.routes.contains_key(&code) || seen_codes.insert(code, route).is_some() {
                return Err(DictionaryError::DuplicateCode(code));
            }
        }

        for (route, code) in table {
            maps.codes.insert(route.to_string(), code);
            maps.routes.insert(code, route.to_string());
        }
        Ok(())
    }

    /// Code for a route, if registered.
    pub fn code(&self, route: &str) -> Option<u16> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .codes
            .get(route)
            .copied()
    }

    /// Route for a code, if registered.
    pub fn route(&self, code: u16) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .routes
            .get(&code)
            .cloned()
    }

    /// Ordered copy of the table, as announced in the handshake.
    pub fn snapshot(&self) -> BTreeMap<String, u16> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .codes
            .iter()
            .map(|(route, code)| (route.clone(), *code))
            .collect()
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .codes
            .len()
    }

    /// Whether no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
