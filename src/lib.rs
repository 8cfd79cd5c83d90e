//! Declarative sync of remote JSON resources into a local object store.
//!
//! Resources are registered by key, fetched through an [`Engine`], mapped
//! into a [`repository::ObjectRepository`] and cached per request in a
//! [`cache::CacheLedger`].

pub mod cache;
pub mod config;
pub mod error;
pub mod mapping;
pub mod registry;
pub mod repository;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod testing;

pub use cache::Params;
pub use error::{SyncError, SyncResult};
pub use registry::{ResourceDescriptor, ResourceRegistry};
pub use sync::{Delivery, Engine, FetchMode, Snapshot, Subscription, SyncHooks};
