//! Reconciliation loop primitives.
//!
//! This library provides the machinery for level-triggered controllers:
//! change notifications are reduced to object keys, keys are queued, and a
//! fixed pool of workers re-derives the required actions for each key from
//! current authoritative state. Key concepts:
//!
//! - **Key**: `namespace/name` (or `name` for cluster-scoped objects).
//! - **Work queue**: deduplicates pending keys and never hands the same key
//!   to two workers at once.
//! - **Backoff**: failed keys are re-queued after a capped exponential delay
//!   that resets once the key syncs successfully.
//!
//! # Invariants
//!
//! - A key is pending at most once, regardless of how many times it is added
//! - A key is processed by at most one worker at a time
//! - Every processed key ends in exactly one of `forget` or `add_rate_limited`

pub mod backoff;
pub mod key;
pub mod queue;
pub mod worker;

pub use backoff::{BackoffPolicy, RateLimiter};
pub use key::{split_key, KeyError, ObjectKey};
pub use queue::{Enqueuer, WorkQueue};
pub use worker::{run_workers, wait_for_shutdown, Reconcile, WorkerPoolConfig};
