//! Volatile tokens: the primitive invalidation unit.
//!
//! A token answers one question: is the value computed alongside it still
//! valid? Tokens are shared as `Arc<dyn VolatileToken>` and attached to cache
//! entries; an entry is current exactly while all of its tokens are.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Reports whether a previously computed value is still valid.
pub trait VolatileToken: Send + Sync {
    fn is_current(&self) -> bool;
}

/// Shared token handle.
pub type Token = Arc<dyn VolatileToken>;

/// A token that never invalidates. Used for values with no volatile inputs.
#[derive(Debug, Default)]
pub struct AlwaysCurrent;

impl VolatileToken for AlwaysCurrent {
    fn is_current(&self) -> bool {
        true
    }
}

/// A token that is stale from birth. Degrades a cache entry to always-miss.
#[derive(Debug, Default)]
pub struct NeverCurrent;

impl VolatileToken for NeverCurrent {
    fn is_current(&self) -> bool {
        false
    }
}

/// A token flipped stale exactly once by its source (a signal trigger or a
/// path-change event). Once expired it never becomes current again.
#[derive(Debug)]
pub struct ExpiringToken {
    expired: AtomicBool,
}

impl ExpiringToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            expired: AtomicBool::new(false),
        })
    }

    pub fn expire(&self) {
        self.expired.store(true, Ordering::Release);
    }
}

impl VolatileToken for ExpiringToken {
    fn is_current(&self) -> bool {
        !self.expired.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_tokens() {
        assert!(AlwaysCurrent.is_current());
        assert!(!NeverCurrent.is_current());
    }

    #[test]
    fn test_expiring_token_flips_once() {
        let token = ExpiringToken::new();
        assert!(token.is_current());
        token.expire();
        assert!(!token.is_current());
        token.expire();
        assert!(!token.is_current());
    }
}
