//! Memoized-value store invalidated by volatile tokens.
//!
//! A [`Cache`] maps an equatable key to a value plus the tokens observed
//! while producing it; the value is served as long as every token is still
//! current. Token bubbling is explicit: `get_within` forwards an entry's
//! tokens (fresh or cached) into the caller's [`TokenSink`] after the
//! producer returns, so a parent entry's validity is a function of everything
//! it transitively read.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;

use super::token::Token;

/// Receives the tokens a cache lookup depends on.
pub trait TokenSink {
    fn monitor(&mut self, token: Token);
}

/// A sink that discards tokens; used at the top of a lookup chain.
#[derive(Debug, Default)]
pub struct NullSink;

impl TokenSink for NullSink {
    fn monitor(&mut self, _token: Token) {}
}

/// Collects the tokens observed while producing one cache entry.
///
/// The producer registers dependencies through [`AcquireContext::monitor`];
/// nested cache lookups chain by taking the context as their sink. Tokens are
/// de-duplicated by identity.
#[derive(Default)]
pub struct AcquireContext {
    tokens: Vec<Token>,
}

impl AcquireContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn into_tokens(self) -> Vec<Token> {
        self.tokens
    }
}

impl TokenSink for AcquireContext {
    fn monitor(&mut self, token: Token) {
        if !self.tokens.iter().any(|t| Arc::ptr_eq(t, &token)) {
            self.tokens.push(token);
        }
    }
}

struct CacheEntry<V> {
    value: V,
    tokens: Vec<Token>,
}

impl<V> CacheEntry<V> {
    fn is_current(&self) -> bool {
        self.tokens.iter().all(|t| t.is_current())
    }
}

/// Concurrent memoized store keyed by `K`.
///
/// Stale entries are never proactively evicted, only lazily replaced on the
/// next lookup. Concurrent lookups for the same stale key may both invoke
/// their producer; the last writer wins.
pub struct Cache<K: Eq + Hash, V: Clone> {
    entries: DashMap<K, CacheEntry<V>>,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Lookup without token propagation to a parent.
    pub fn get<F>(&self, key: K, acquire: F) -> V
    where
        F: FnOnce(&mut AcquireContext) -> V,
    {
        self.get_within(&mut NullSink, key, acquire)
    }

    /// Lookup forwarding the entry's tokens into `sink`.
    pub fn get_within<F>(&self, sink: &mut dyn TokenSink, key: K, acquire: F) -> V
    where
        F: FnOnce(&mut AcquireContext) -> V,
    {
        enum Never {}
        let result: Result<V, Never> =
            self.try_get_within(sink, key, |ctx| Ok(acquire(ctx)));
        match result {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Fallible lookup: a producer error is propagated and never cached.
    pub fn try_get_within<F, E>(
        &self,
        sink: &mut dyn TokenSink,
        key: K,
        acquire: F,
    ) -> Result<V, E>
    where
        F: FnOnce(&mut AcquireContext) -> Result<V, E>,
    {
        // The shard guard must be dropped before the producer runs: nested
        // lookups on this cache would deadlock on the same shard otherwise.
        let cached = {
            match self.entries.get(&key) {
                Some(entry) if entry.is_current() => {
                    Some((entry.value.clone(), entry.tokens.clone()))
                }
                _ => None,
            }
        };
        if let Some((value, tokens)) = cached {
            for token in tokens {
                sink.monitor(token);
            }
            return Ok(value);
        }

        let mut ctx = AcquireContext::new();
        let value = acquire(&mut ctx)?;
        let tokens = ctx.into_tokens();
        for token in &tokens {
            sink.monitor(token.clone());
        }
        self.entries.insert(
            key,
            CacheEntry {
                value: value.clone(),
                tokens,
            },
        );
        Ok(value)
    }

    /// Whether the entry for `key` exists and all its tokens are current.
    pub fn is_current(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .map(|entry| entry.is_current())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> Default for Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::signals::Signals;
    use crate::caching::token::AlwaysCurrent;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_acquire_at_most_once_while_current() {
        let cache: Cache<&str, usize> = Cache::new();
        let calls = AtomicUsize::new(0);

        let acquire = |ctx: &mut AcquireContext| {
            calls.fetch_add(1, Ordering::SeqCst);
            ctx.monitor(Arc::new(AlwaysCurrent));
            42
        };

        assert_eq!(cache.get("k", acquire), 42);
        assert_eq!(cache.get("k", acquire), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_token_forces_reacquire() {
        let cache: Cache<&str, usize> = Cache::new();
        let signals = Signals::new();
        let calls = AtomicUsize::new(0);

        let value = cache.get("k", |ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            ctx.monitor(signals.when("change"));
            1
        });
        assert_eq!(value, 1);
        assert!(cache.is_current(&"k"));

        signals.trigger(&"change");
        assert!(!cache.is_current(&"k"));

        let value = cache.get("k", |ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            ctx.monitor(signals.when("change"));
            2
        });
        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_current(&"k"));
    }

    #[test]
    fn test_token_bubbling_to_parent_entry() {
        let outer: Cache<&str, usize> = Cache::new();
        let inner: Cache<&str, usize> = Cache::new();
        let signals = Signals::new();

        outer.get("parent", |ctx| {
            inner.get_within(ctx, "child", |child_ctx| {
                child_ctx.monitor(signals.when("inner-change"));
                10
            })
        });
        assert!(outer.is_current(&"parent"));

        // Invalidating the child's dependency invalidates the parent too.
        signals.trigger(&"inner-change");
        assert!(!outer.is_current(&"parent"));
    }

    #[test]
    fn test_cached_hit_still_forwards_tokens() {
        let inner: Cache<&str, usize> = Cache::new();
        let signals = Signals::new();

        // Populate the inner entry.
        inner.get("child", |ctx| {
            ctx.monitor(signals.when("s"));
            1
        });

        // A later parent reading the warm entry must still inherit its tokens.
        let mut parent = AcquireContext::new();
        inner.get_within(&mut parent, "child", |_| unreachable!());
        assert_eq!(parent.tokens().len(), 1);
    }

    #[test]
    fn test_error_is_not_cached() {
        let cache: Cache<&str, usize> = Cache::new();
        let result: Result<usize, &str> =
            cache.try_get_within(&mut NullSink, "k", |_| Err("boom"));
        assert!(result.is_err());
        assert!(cache.is_empty());

        let result: Result<usize, &str> =
            cache.try_get_within(&mut NullSink, "k", |_| Ok(3));
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_tokens_deduplicated_by_identity() {
        let token: Token = Arc::new(AlwaysCurrent);
        let mut ctx = AcquireContext::new();
        ctx.monitor(token.clone());
        ctx.monitor(token);
        assert_eq!(ctx.tokens().len(), 1);
    }
}
