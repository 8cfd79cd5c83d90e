//! Cache ledger: per-request staleness and identity bookkeeping.
//!
//! This module tracks, for every (resource key, params fingerprint) pair:
//! - When the server was last asked (the "miss" timestamp)
//! - Which objects that request produced, in order
//!
//! Entries are loaded once at startup and flushed after each write, so
//! stale snapshots survive restarts. Objects themselves live in the
//! repository; clearing the ledger never deletes them.

mod clock;
mod fingerprint;
mod ledger;
mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use fingerprint::{Fingerprint, Params};
pub use ledger::{CacheLedger, LedgerEntry};
pub use storage::{LedgerStore, NoopLedgerStore, SqliteLedgerStore};
