//! Domain stores for groups, invitations and subscriptions, built on the
//! generic pieces in [`crate::cache`].

pub mod backend;
mod diff;
pub mod policy;
mod session;
mod store;
mod subscription;
pub mod types;

pub use backend::{GroupBackend, SubscriptionBackend};
pub use diff::{has_changed, Entity};
pub use policy::{RefreshPlan, SyncPolicy};
pub use session::Session;
pub use store::{persist_key, EntityStore, PersistedLists, RefreshOutcome, StoreState};
pub use subscription::{SubscriptionAction, SubscriptionSnapshotCache, SubscriptionView};
