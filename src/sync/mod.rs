//! Sync engine: fetch coalescing, two-phase delivery and hooks.

mod delivery;
mod engine;
mod hooks;

pub use delivery::{Delivery, Snapshot, Subscriber, SubscriberHandle, Subscription};
pub use engine::{Engine, EngineBuilder, FetchMode};
pub use hooks::{BearerAuth, DefaultHooks, SyncHooks};
