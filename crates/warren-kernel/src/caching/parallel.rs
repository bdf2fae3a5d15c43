//! Order-preserving parallel fan-out with token re-propagation.

use std::panic;

use super::cache::{AcquireContext, TokenSink};

/// Environment variable that forces sequential execution when set to a
/// truthy value.
pub const DISABLE_PARALLEL_ENV: &str = "WARREN_DISABLE_PARALLEL";

/// Fans independent per-item work across OS threads while keeping the cache
/// token contract intact: every token a worker collects is forwarded to the
/// ambient sink only after all workers have finished.
pub struct ParallelCacheContext {
    parallel: bool,
}

impl ParallelCacheContext {
    /// Parallelism enabled unless `WARREN_DISABLE_PARALLEL` is set.
    pub fn new() -> Self {
        let disabled = std::env::var(DISABLE_PARALLEL_ENV)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self {
            parallel: !disabled,
        }
    }

    pub fn with_parallelism(parallel: bool) -> Self {
        Self { parallel }
    }

    /// Apply `work` to every item, returning results in input order.
    ///
    /// Each worker gets a private [`AcquireContext`]; collected tokens are
    /// forwarded to `sink` after the join point. A worker panic is resumed on
    /// the caller's thread once all other workers have completed.
    pub fn run_in_parallel<T, R, F>(
        &self,
        sink: &mut dyn TokenSink,
        items: Vec<T>,
        work: F,
    ) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T, &mut AcquireContext) -> R + Sync,
    {
        if !self.parallel || items.len() <= 1 {
            return Self::run_sequential(sink, items, work);
        }

        let mut outcomes: Vec<(R, Vec<super::token::Token>)> =
            Vec::with_capacity(items.len());
        std::thread::scope(|scope| {
            let handles: Vec<_> = items
                .into_iter()
                .map(|item| {
                    let work = &work;
                    scope.spawn(move || {
                        let mut ctx = AcquireContext::new();
                        let result = work(item, &mut ctx);
                        (result, ctx.into_tokens())
                    })
                })
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(payload) => panic::resume_unwind(payload),
                }
            }
        });

        let mut results = Vec::with_capacity(outcomes.len());
        for (result, tokens) in outcomes {
            for token in tokens {
                sink.monitor(token);
            }
            results.push(result);
        }
        results
    }

    fn run_sequential<T, R, F>(sink: &mut dyn TokenSink, items: Vec<T>, work: F) -> Vec<R>
    where
        F: Fn(T, &mut AcquireContext) -> R,
    {
        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            let mut ctx = AcquireContext::new();
            let result = work(item, &mut ctx);
            outcomes.push((result, ctx.into_tokens()));
        }
        let mut results = Vec::with_capacity(outcomes.len());
        for (result, tokens) in outcomes {
            for token in tokens {
                sink.monitor(token);
            }
            results.push(result);
        }
        results
    }
}

impl Default for ParallelCacheContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::signals::Signals;

    #[test]
    fn test_preserves_input_order() {
        let ctx = ParallelCacheContext::with_parallelism(true);
        let mut sink = AcquireContext::new();
        let results = ctx.run_in_parallel(&mut sink, vec![1, 2, 3, 4, 5], |n, _| n * 10);
        assert_eq!(results, vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn test_worker_tokens_reach_the_ambient_sink() {
        let ctx = ParallelCacheContext::with_parallelism(true);
        let signals = Signals::new();
        let mut sink = AcquireContext::new();

        ctx.run_in_parallel(&mut sink, vec!["a", "b", "c"], |key, worker_ctx| {
            worker_ctx.monitor(signals.when(key));
            key.len()
        });
        assert_eq!(sink.tokens().len(), 3);
    }

    #[test]
    fn test_sequential_matches_parallel_behavior() {
        let signals = Signals::new();
        for parallel in [false, true] {
            let ctx = ParallelCacheContext::with_parallelism(parallel);
            let mut sink = AcquireContext::new();
            let results = ctx.run_in_parallel(&mut sink, vec![1u32, 2, 3], |n, worker_ctx| {
                worker_ctx.monitor(signals.when(n));
                n + 1
            });
            assert_eq!(results, vec![2, 3, 4]);
            assert_eq!(sink.tokens().len(), 3);
        }
    }

    #[test]
    #[should_panic(expected = "worker failed")]
    fn test_worker_panic_propagates_to_caller() {
        let ctx = ParallelCacheContext::with_parallelism(true);
        let mut sink = AcquireContext::new();
        ctx.run_in_parallel(&mut sink, vec![1, 2], |n, _| {
            if n == 2 {
                panic!("worker failed");
            }
            n
        });
    }
}
