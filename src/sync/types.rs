//! Entities exchanged with the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{SyncError, SyncResult};

/// Usage percentage at which a user is considered close to a limit.
pub const APPROACHING_LIMIT_PERCENT: f64 = 80.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupCategory {
  Family,
  Friends,
  Work,
  Community,
  Hobby,
  Travel,
  #[default]
  Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
  Admin,
  Moderator,
  Member,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupMember {
  pub user_id: String,
  pub role: MemberRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
  pub id: String,
  pub name: String,
  pub description: Option<String>,
  #[serde(default)]
  pub category: GroupCategory,
  #[serde(default)]
  pub is_public: bool,
  pub creator_id: String,
  pub member_count: u32,
  pub member_limit: Option<u32>,
  pub item_count: u32,
  #[serde(default)]
  pub members: Vec<GroupMember>,
}

/// Payload for creating a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateGroup {
  pub name: String,
  pub description: Option<String>,
  #[serde(default)]
  pub category: GroupCategory,
  #[serde(default)]
  pub is_public: bool,
  pub member_limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
  Pending,
  Accepted,
  Declined,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInvitation {
  pub id: String,
  pub group_id: String,
  pub inviter_id: String,
  pub invitee_id: String,
  pub status: InvitationStatus,
}

/// The two terminal answers to an invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationResponse {
  Accept,
  Decline,
}

impl InvitationResponse {
  pub fn status(self) -> InvitationStatus {
    match self {
      Self::Accept => InvitationStatus::Accepted,
      Self::Decline => InvitationStatus::Declined,
    }
  }
}

/// Backend answer to an invitation response. An accepted invitation is
/// expected to carry the joined group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RespondOutcome {
  pub group: Option<Group>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
  #[default]
  Free,
  Trial,
  Pro,
  Expired,
}

/// Entitlement snapshot. Always replaced whole, never merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
  pub status: SubscriptionStatus,
  pub groups_used: u32,
  pub groups_limit: u32,
  pub items_used: u32,
  pub items_limit: u32,
  pub can_create_group: bool,
  pub can_create_item: bool,
  pub can_use_ai: bool,
  pub expires_at: Option<DateTime<Utc>>,
}

impl SubscriptionInfo {
  /// What a user without any snapshot is assumed to have.
  pub fn free_defaults() -> Self {
    Self {
      status: SubscriptionStatus::Free,
      groups_used: 0,
      groups_limit: 1,
      items_used: 0,
      items_limit: 10,
      can_create_group: false,
      can_create_item: false,
      can_use_ai: false,
      expires_at: None,
    }
  }

  pub fn is_free(&self) -> bool {
    self.status == SubscriptionStatus::Free
  }

  pub fn is_trial(&self) -> bool {
    self.status == SubscriptionStatus::Trial
  }

  pub fn is_pro(&self) -> bool {
    self.status == SubscriptionStatus::Pro
  }

  pub fn is_expired(&self) -> bool {
    self.status == SubscriptionStatus::Expired
  }

  pub fn groups_percentage(&self) -> f64 {
    percentage(self.groups_used, self.groups_limit)
  }

  pub fn items_percentage(&self) -> f64 {
    percentage(self.items_used, self.items_limit)
  }

  /// Usage details when either limit is at or past
  /// [`APPROACHING_LIMIT_PERCENT`].
  pub fn approaching_limits(&self) -> Option<LimitUsage> {
    let groups = Usage::new(self.groups_used, self.groups_limit);
    let items = Usage::new(self.items_used, self.items_limit);
    (groups.percentage >= APPROACHING_LIMIT_PERCENT || items.percentage >= APPROACHING_LIMIT_PERCENT)
      .then_some(LimitUsage { groups, items })
  }
}

fn percentage(used: u32, limit: u32) -> f64 {
  if limit == 0 {
    0.0
  } else {
    f64::from(used) / f64::from(limit) * 100.0
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
  pub current: u32,
  pub max: u32,
  pub percentage: f64,
}

impl Usage {
  fn new(current: u32, max: u32) -> Self {
    Self {
      current,
      max,
      percentage: percentage(current, max),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitUsage {
  pub groups: Usage,
  pub items: Usage,
}

// ============================================================================
// Validation
// ============================================================================

/// Shape checks applied to everything the backend hands back.
pub trait Validate {
  fn validate(&self) -> SyncResult<()>;
}

impl<T: Validate> Validate for [T] {
  fn validate(&self) -> SyncResult<()> {
    self.iter().try_for_each(Validate::validate)
  }
}

fn require(entity: &'static str, field: &str, value: &str) -> SyncResult<()> {
  if value.trim().is_empty() {
    return Err(SyncError::validation(entity, format!("empty {}", field)));
  }
  Ok(())
}

impl Validate for Group {
  fn validate(&self) -> SyncResult<()> {
    require("group", "id", &self.id)?;
    require("group", "name", &self.name)?;
    require("group", "creator_id", &self.creator_id)?;
    let mut seen = HashSet::new();
    for member in &self.members {
      require("group", "member user_id", &member.user_id)?;
      if !seen.insert(member.user_id.as_str()) {
        return Err(SyncError::validation(
          "group",
          format!("{}: duplicate member {}", self.id, member.user_id),
        ));
      }
    }
    Ok(())
  }
}

impl Validate for CreateGroup {
  fn validate(&self) -> SyncResult<()> {
    require("group", "name", &self.name)?;
    if self.member_limit == Some(0) {
      return Err(SyncError::validation("group", "member limit must be positive"));
    }
    Ok(())
  }
}

impl Validate for GroupInvitation {
  fn validate(&self) -> SyncResult<()> {
    require("invitation", "id", &self.id)?;
    require("invitation", "group_id", &self.group_id)?;
    require("invitation", "invitee_id", &self.invitee_id)
  }
}

impl Validate for SubscriptionInfo {
  fn validate(&self) -> SyncResult<()> {
    if self.can_create_group && self.groups_limit > 0 && self.groups_used >= self.groups_limit {
      return Err(SyncError::validation(
        "subscription",
        format!(
          "can_create_group set with {}/{} groups used",
          self.groups_used, self.groups_limit
        ),
      ));
    }
    if self.can_create_item && self.items_limit > 0 && self.items_used >= self.items_limit {
      return Err(SyncError::validation(
        "subscription",
        format!(
          "can_create_item set with {}/{} items used",
          self.items_used, self.items_limit
        ),
      ));
    }
    Ok(())
  }
}
