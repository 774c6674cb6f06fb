//! Rate limiting module
//!
//! Sliding-window request throttling with two interchangeable backends:
//!
//! - **Local**: an in-memory `{count, window_start}` map per key, swept
//!   periodically. Per-process only.
//! - **Shared**: a Redis sorted-set sliding log, updated by one atomic Lua
//!   script so several server processes share one count.
//!
//! The [`RateLimiter`] starts on the shared store when one is configured and
//! reachable, drops to the local backend on any store error (admitting the
//! failing request), and reconnects in the background.
//!
//! # Example
//!
//! ```rust,no_run
//! use notes_ratelimit::rate_limit::{LimiterSettings, Policy, RateLimiter};
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = RateLimiter::local_only(LimiterSettings::default());
//!
//!     let decision = limiter.check("203.0.113.9", &Policy::strict()).await;
//!     assert!(decision.admitted);
//!
//!     limiter.close().await;
//! }
//! ```

pub mod clock;
pub mod local;
pub mod lua_scripts;
pub mod middleware;
pub mod redis;
pub mod service;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use middleware::{add_rate_limit_headers, rate_limit_middleware, RateLimitMiddleware};
pub use redis::{BackendError, RedisStore, SharedStore};
pub use service::{LimiterSettings, RateLimiter, RateLimiterBuilder};
pub use types::{client_key, BackendState, Decision, Policy, PolicyConfig};
