//! Keyed manual invalidation.
//!
//! A [`Signals`] registry maps an arbitrary key to a volatile token.
//! `trigger` flips the registered token stale and removes the registration in
//! one critical section, so a waiter subscribing after a trigger observes a
//! fresh token and only re-observes future triggers.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use super::token::{ExpiringToken, Token};

/// Registry of manually triggered invalidation tokens.
pub struct Signals<K: Eq + Hash> {
    entries: Mutex<HashMap<K, Arc<ExpiringToken>>>,
}

impl<K: Eq + Hash> Signals<K> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Token that stays current until `trigger` is called for `key`.
    /// Repeated calls between triggers return the same token.
    pub fn when(&self, key: K) -> Token {
        let mut entries = self.entries.lock();
        entries.entry(key).or_insert_with(ExpiringToken::new).clone()
    }

    /// Expire the token registered for `key`, if any, and drop the
    /// registration. Expire-then-remove happens under one lock so no waiter
    /// can subscribe between the two steps and miss this trigger.
    pub fn trigger(&self, key: &K) {
        let mut entries = self.entries.lock();
        if let Some(token) = entries.remove(key) {
            token.expire();
        }
    }
}

impl<K: Eq + Hash> Default for Signals<K> {
    fn default() -> Self {
        Self::new()
    }
}
