//! Calls the sync engine makes to the remote backend.
//!
//! How these reach the server is up to the implementor; the engine only
//! sees typed results.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SyncResult;

use super::types::{
  CreateGroup, Group, GroupInvitation, InvitationResponse, RespondOutcome, SubscriptionInfo,
};

#[async_trait]
pub trait GroupBackend: Send + Sync + 'static {
  async fn fetch_groups_for_user(&self, user_id: &str) -> SyncResult<Vec<Group>>;

  async fn fetch_pending_invitations(&self, user_id: &str) -> SyncResult<Vec<GroupInvitation>>;

  async fn create_group(&self, data: &CreateGroup) -> SyncResult<Group>;

  async fn delete_group(&self, group_id: &str) -> SyncResult<()>;

  async fn respond_invitation(
    &self,
    invitation_id: &str,
    response: InvitationResponse,
  ) -> SyncResult<RespondOutcome>;
}

#[async_trait]
pub trait SubscriptionBackend: Send + Sync + 'static {
  async fn fetch_subscription_info(&self, user_id: &str) -> SyncResult<SubscriptionInfo>;

  async fn activate_trial(&self, user_id: &str) -> SyncResult<()>;

  async fn upgrade_to_pro(&self, user_id: &str, expires_at: DateTime<Utc>) -> SyncResult<()>;
}

/// Bound a backend call by `limit`.
pub(crate) async fn bounded<T>(
  limit: std::time::Duration,
  call: impl std::future::Future<Output = SyncResult<T>>,
) -> SyncResult<T> {
  tokio::time::timeout(limit, call)
    .await
    .unwrap_or(Err(crate::error::SyncError::Timeout(limit)))
}
