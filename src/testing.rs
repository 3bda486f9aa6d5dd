//! Scripted backend and fixtures shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::error::{SyncError, SyncResult};
use crate::sync::backend::{GroupBackend, SubscriptionBackend};
use crate::sync::types::{
  CreateGroup, Group, GroupCategory, GroupInvitation, GroupMember, InvitationResponse,
  InvitationStatus, MemberRole, RespondOutcome, SubscriptionInfo, SubscriptionStatus,
};

pub fn group(id: &str, name: &str) -> Group {
  Group {
    id: id.to_string(),
    name: name.to_string(),
    description: None,
    category: GroupCategory::Other,
    is_public: false,
    creator_id: "u1".to_string(),
    member_count: 1,
    member_limit: None,
    item_count: 0,
    members: vec![GroupMember {
      user_id: "u1".to_string(),
      role: MemberRole::Admin,
    }],
  }
}

pub fn invitation(id: &str, group_id: &str) -> GroupInvitation {
  GroupInvitation {
    id: id.to_string(),
    group_id: group_id.to_string(),
    inviter_id: "u2".to_string(),
    invitee_id: "u1".to_string(),
    status: InvitationStatus::Pending,
  }
}

pub fn subscription(status: SubscriptionStatus) -> SubscriptionInfo {
  SubscriptionInfo {
    status,
    ..SubscriptionInfo::free_defaults()
  }
}

/// In-memory stand-in for the server. Fetches snapshot server state when
/// they start, then optionally wait on a gate before answering.
#[derive(Default)]
pub struct FakeBackend {
  pub groups: Mutex<Vec<Group>>,
  pub invitations: Mutex<Vec<GroupInvitation>>,
  pub subscription: Mutex<Option<SubscriptionInfo>>,

  pub group_fetches: AtomicUsize,
  pub invitation_fetches: AtomicUsize,
  pub subscription_fetches: AtomicUsize,
  pub mutations: AtomicUsize,

  pub fail_fetches: AtomicBool,
  pub fail_mutations: AtomicBool,
  /// Accept succeeds but the response carries no group
  pub omit_accepted_group: AtomicBool,

  group_gate: Mutex<Option<Arc<Notify>>>,
  subscription_gate: Mutex<Option<Arc<Notify>>>,
  next_id: AtomicUsize,
}

impl FakeBackend {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn with_data(groups: Vec<Group>, invitations: Vec<GroupInvitation>) -> Arc<Self> {
    let backend = Self::default();
    *backend.groups.lock().unwrap() = groups;
    *backend.invitations.lock().unwrap() = invitations;
    *backend.subscription.lock().unwrap() = Some(subscription(SubscriptionStatus::Free));
    Arc::new(backend)
  }

  /// Make group fetches wait until the returned gate is notified (once per
  /// fetch).
  pub fn hold_group_fetches(&self) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    *self.group_gate.lock().unwrap() = Some(gate.clone());
    gate
  }

  pub fn hold_subscription_fetches(&self) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    *self.subscription_gate.lock().unwrap() = Some(gate.clone());
    gate
  }

  pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
  }

  fn fetch_error(&self) -> SyncResult<()> {
    if self.fail_fetches.load(Ordering::SeqCst) {
      return Err(SyncError::network("backend unavailable"));
    }
    Ok(())
  }

  fn mutation_error(&self) -> SyncResult<()> {
    self.mutations.fetch_add(1, Ordering::SeqCst);
    if self.fail_mutations.load(Ordering::SeqCst) {
      return Err(SyncError::network("backend rejected the request"));
    }
    Ok(())
  }

  async fn pass_gate(gate: &Mutex<Option<Arc<Notify>>>) {
    let gate = gate.lock().unwrap().clone();
    if let Some(gate) = gate {
      gate.notified().await;
    }
  }
}

#[async_trait]
impl GroupBackend for FakeBackend {
  async fn fetch_groups_for_user(&self, _user_id: &str) -> SyncResult<Vec<Group>> {
    self.group_fetches.fetch_add(1, Ordering::SeqCst);
    let snapshot = self.groups.lock().unwrap().clone();
    Self::pass_gate(&self.group_gate).await;
    self.fetch_error()?;
    Ok(snapshot)
  }

  async fn fetch_pending_invitations(&self, _user_id: &str) -> SyncResult<Vec<GroupInvitation>> {
    self.invitation_fetches.fetch_add(1, Ordering::SeqCst);
    let snapshot = self.invitations.lock().unwrap().clone();
    self.fetch_error()?;
    Ok(snapshot)
  }

  async fn create_group(&self, data: &CreateGroup) -> SyncResult<Group> {
    self.mutation_error()?;
    let id = format!("new-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
    let created = Group {
      description: data.description.clone(),
      category: data.category,
      is_public: data.is_public,
      member_limit: data.member_limit,
      ..group(&id, &data.name)
    };
    self.groups.lock().unwrap().insert(0, created.clone());
    Ok(created)
  }

  async fn delete_group(&self, group_id: &str) -> SyncResult<()> {
    self.mutation_error()?;
    self.groups.lock().unwrap().retain(|g| g.id != group_id);
    Ok(())
  }

  async fn respond_invitation(
    &self,
    invitation_id: &str,
    response: InvitationResponse,
  ) -> SyncResult<RespondOutcome> {
    self.mutation_error()?;
    let answered = {
      let mut invitations = self.invitations.lock().unwrap();
      let position = invitations
        .iter()
        .position(|i| i.id == invitation_id)
        .ok_or_else(|| SyncError::network("invitation not found"))?;
      invitations.remove(position)
    };

    if response != InvitationResponse::Accept {
      return Ok(RespondOutcome::default());
    }

    let joined = Group {
      member_count: 2,
      ..group(&answered.group_id, &format!("Group {}", answered.group_id))
    };
    self.groups.lock().unwrap().insert(0, joined.clone());
    if self.omit_accepted_group.load(Ordering::SeqCst) {
      return Ok(RespondOutcome::default());
    }
    Ok(RespondOutcome {
      group: Some(joined),
    })
  }
}

#[async_trait]
impl SubscriptionBackend for FakeBackend {
  async fn fetch_subscription_info(&self, _user_id: &str) -> SyncResult<SubscriptionInfo> {
    self.subscription_fetches.fetch_add(1, Ordering::SeqCst);
    let snapshot = self.subscription.lock().unwrap().clone();
    Self::pass_gate(&self.subscription_gate).await;
    self.fetch_error()?;
    snapshot.ok_or_else(|| SyncError::network("no subscription row"))
  }

  async fn activate_trial(&self, _user_id: &str) -> SyncResult<()> {
    self.mutation_error()?;
    let mut current = self.subscription.lock().unwrap();
    *current = Some(SubscriptionInfo {
      status: SubscriptionStatus::Trial,
      groups_limit: 5,
      items_limit: 100,
      can_create_group: true,
      can_create_item: true,
      can_use_ai: true,
      ..current.clone().unwrap_or_else(SubscriptionInfo::free_defaults)
    });
    Ok(())
  }

  async fn upgrade_to_pro(&self, _user_id: &str, expires_at: DateTime<Utc>) -> SyncResult<()> {
    self.mutation_error()?;
    let mut current = self.subscription.lock().unwrap();
    *current = Some(SubscriptionInfo {
      status: SubscriptionStatus::Pro,
      groups_limit: 50,
      items_limit: 1000,
      can_create_group: true,
      can_create_item: true,
      can_use_ai: true,
      expires_at: Some(expires_at),
      ..current.clone().unwrap_or_else(SubscriptionInfo::free_defaults)
    });
    Ok(())
  }
}
