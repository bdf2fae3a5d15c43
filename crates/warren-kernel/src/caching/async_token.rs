//! Background work gated by a volatile token.
//!
//! [`AsyncTokenProvider::token_for`] queues a unit of work on its own OS
//! thread and immediately returns a token. The token reports current while
//! the work is still running; once it finishes, the token is current only if
//! the work did not panic and every token it collected is itself current.
//! There is no completion callback; readers re-check cheaply.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use scopeguard::defer;

use super::cache::{AcquireContext, TokenSink};
use super::token::{NeverCurrent, Token, VolatileToken};

struct AsyncTokenState {
    done: AtomicBool,
    failed: AtomicBool,
    tokens: Mutex<Vec<Token>>,
}

struct AsyncToken(Arc<AsyncTokenState>);

impl VolatileToken for AsyncToken {
    fn is_current(&self) -> bool {
        if self.0.failed.load(Ordering::Acquire) {
            return false;
        }
        if !self.0.done.load(Ordering::Acquire) {
            // Provisionally valid while the work is still running.
            return true;
        }
        self.0.tokens.lock().iter().all(|t| t.is_current())
    }
}

/// Spawns fire-and-forget background work whose validity is observable
/// through the returned token.
#[derive(Debug, Default)]
pub struct AsyncTokenProvider;

impl AsyncTokenProvider {
    pub fn new() -> Self {
        Self
    }

    /// Run `work` in the background and return its gate token.
    ///
    /// A panic inside `work` is caught and makes the token permanently
    /// stale and is never rethrown on a reader's thread.
    pub fn token_for<F>(&self, work: F) -> Token
    where
        F: FnOnce(&mut dyn TokenSink) + Send + 'static,
    {
        let state = Arc::new(AsyncTokenState {
            done: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            tokens: Mutex::new(Vec::new()),
        });

        let worker_state = state.clone();
        let spawned = std::thread::Builder::new()
            .name("warren-async-token".into())
            .spawn(move || {
                // The done flag must flip even if the work panics.
                defer! {
                    worker_state.done.store(true, Ordering::Release);
                }
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    let mut ctx = AcquireContext::new();
                    work(&mut ctx);
                    ctx.into_tokens()
                }));
                match outcome {
                    Ok(tokens) => *worker_state.tokens.lock() = tokens,
                    Err(_) => {
                        tracing::warn!("background cache producer panicked; token is now stale");
                        worker_state.failed.store(true, Ordering::Release);
                    }
                }
            });

        match spawned {
            Ok(_) => Arc::new(AsyncToken(state)),
            Err(err) => {
                tracing::warn!(error = %err, "failed to spawn background token worker");
                Arc::new(NeverCurrent)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::signals::Signals;
    use std::sync::mpsc;
    use std::time::Duration;

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn test_current_while_running_then_follows_collected_tokens() {
        let provider = AsyncTokenProvider::new();
        let signals: Arc<Signals<&str>> = Arc::new(Signals::new());
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        let worker_signals = signals.clone();
        let token = provider.token_for(move |sink| {
            sink.monitor(worker_signals.when("dep"));
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });

        started_rx.recv().unwrap();
        assert!(token.is_current(), "token must be current while running");

        release_tx.send(()).unwrap();
        signals.trigger(&"dep");
        // Once the work completes, the stale collected token wins.
        assert!(wait_until(Duration::from_secs(5), || !token.is_current()));
    }

    #[test]
    fn test_panic_makes_token_permanently_stale() {
        let provider = AsyncTokenProvider::new();
        let token = provider.token_for(|_| panic!("producer failed"));
        assert!(wait_until(Duration::from_secs(5), || !token.is_current()));
        assert!(!token.is_current());
    }

    #[test]
    fn test_work_with_no_tokens_stays_current_after_completion() {
        let provider = AsyncTokenProvider::new();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let token = provider.token_for(move |_| {
            done_tx.send(()).unwrap();
        });
        done_rx.recv().unwrap();
        assert!(wait_until(Duration::from_secs(5), || token.is_current()));
    }
}
