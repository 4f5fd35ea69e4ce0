//! vigil-state — embedded history store for Vigil.
//!
//! Backed by [redb](https://docs.rs/redb). Holds the archive of health check
//! results and the set of registered services so registrations survive a
//! restart. The in-memory metrics in `vigil-metrics` remain authoritative for
//! breaker decisions; this store only serves historical queries.
//!
//! # Architecture
//!
//! Values are JSON-serialized into redb's `&[u8]` value columns. Check
//! results use the composite key `{service}:{timestamp_ms:020}:{seq:06}` so
//! that a range scan over `{service}:` .. `{service};` returns one service's
//! history in chronological order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
