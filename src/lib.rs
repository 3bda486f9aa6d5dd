//! Client-side sync and cache engine for groups, invitations and
//! subscription entitlements.
//!
//! [`sync::Session`] is the entry point: it owns an [`sync::EntityStore`]
//! and a [`sync::SubscriptionSnapshotCache`] for one user, both backed by
//! caller-supplied [`sync::GroupBackend`] / [`sync::SubscriptionBackend`]
//! implementations and a [`cache::CacheStorage`] for the persisted copy.

pub mod cache;
pub mod config;
pub mod error;
pub mod sync;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{SyncError, SyncResult};
