//! The generic cache / volatile-token framework.
//!
//! Everything the shell runtime memoizes (extension catalogs, capability
//! sets, composed blueprints) goes through this module. A cached value is
//! valid exactly while every [`VolatileToken`] observed during its production
//! is still current; staleness is detected lazily on the next lookup, never
//! by eviction.

pub mod async_token;
pub mod cache;
pub mod holder;
pub mod parallel;
pub mod signals;
pub mod token;

pub use async_token::AsyncTokenProvider;
pub use cache::{AcquireContext, Cache, NullSink, TokenSink};
pub use holder::{CacheHolder, CacheManager};
pub use parallel::ParallelCacheContext;
pub use signals::Signals;
pub use token::{AlwaysCurrent, ExpiringToken, NeverCurrent, Token, VolatileToken};
