//! Shared storage for guards, locks and the event ledger.
//!
//! Every guarantee the pipeline makes holds only across the instances that
//! share these stores:
//! - [`SharedStore`]: TTL-bounded key space with atomic insert-if-absent and
//!   compare-and-delete, backing the replay guard, idempotency guard and
//!   scope lock
//! - [`LedgerStore`]: the event ledger with an atomic conditional insert on
//!   `(provider, event_id)` and compare-and-set status transitions
//!
//! The in-memory backends only protect a single process. Enable the `redis`
//! feature for a backend shared across instances.

mod trait_def;
mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use trait_def::{LedgerInsert, LedgerQuery, LedgerStore, SharedStore, StatusChange};
pub use memory::{MemoryLedgerStore, MemorySharedStore};

#[cfg(feature = "redis")]
pub use self::redis::{RedisLedgerStore, RedisSharedStore};
