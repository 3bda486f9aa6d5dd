//! Structural change detection and the optimistic mutation journal.

use std::collections::{HashMap, HashSet, VecDeque};

use super::types::{Group, GroupInvitation};

/// Entities with a stable identity and a notion of "same content".
pub trait Entity: Clone {
  fn id(&self) -> &str;

  /// Field-by-field comparison of the data the UI shows. Object identity
  /// and field order from the backend do not matter.
  fn same_fields(&self, other: &Self) -> bool;
}

impl Entity for Group {
  fn id(&self) -> &str {
    &self.id
  }

  fn same_fields(&self, other: &Self) -> bool {
    self.name == other.name
      && self.description == other.description
      && self.category == other.category
      && self.is_public == other.is_public
      && self.creator_id == other.creator_id
      && self.member_count == other.member_count
      && self.member_limit == other.member_limit
      && self.item_count == other.item_count
      && self.members.len() == other.members.len()
      && {
        let roster: HashSet<_> = self.members.iter().collect();
        other.members.iter().all(|m| roster.contains(m))
      }
  }
}

impl Entity for GroupInvitation {
  fn id(&self) -> &str {
    &self.id
  }

  fn same_fields(&self, other: &Self) -> bool {
    self.group_id == other.group_id
      && self.status == other.status
      && self.inviter_id == other.inviter_id
      && self.invitee_id == other.invitee_id
  }
}

/// Whether `fetched` differs from `current` in anything but order or object
/// identity. O(n).
pub fn has_changed<T: Entity>(current: &[T], fetched: &[T]) -> bool {
  if current.len() != fetched.len() {
    return true;
  }
  let current_by_id: HashMap<&str, &T> = current.iter().map(|e| (e.id(), e)).collect();
  let fetched_by_id: HashMap<&str, &T> = fetched.iter().map(|e| (e.id(), e)).collect();
  if current_by_id.len() != fetched_by_id.len() {
    return true;
  }
  fetched_by_id.iter().any(|(id, fetched)| {
    current_by_id
      .get(id)
      .map_or(true, |current| !current.same_fields(fetched))
  })
}

/// A local change applied ahead of the next fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation<T> {
  /// Add to the front of the list (creation, accepted invitation)
  Prepend(T),
  /// Remove by id (deletion, answered invitation)
  Remove(String),
}

impl<T: Entity> Mutation<T> {
  pub fn apply(&self, list: &mut Vec<T>) {
    match self {
      Self::Prepend(entity) => {
        if !list.iter().any(|e| e.id() == entity.id()) {
          list.insert(0, entity.clone());
        }
      }
      Self::Remove(id) => list.retain(|e| e.id() != id),
    }
  }
}

/// Ordered record of optimistic mutations on one list.
///
/// A fetch notes [`Journal::mark`] when it starts. When its result is
/// committed, the mutations recorded after that mark are replayed on top of
/// it, since the backend may not have seen them yet. Mutations at or before
/// the mark are already reflected in the fetched data and are pruned.
#[derive(Debug)]
pub struct Journal<T> {
  seq: u64,
  entries: VecDeque<(u64, Mutation<T>)>,
}

impl<T> Default for Journal<T> {
  fn default() -> Self {
    Self {
      seq: 0,
      entries: VecDeque::new(),
    }
  }
}

impl<T: Entity> Journal<T> {
  /// Sequence number of the latest recorded mutation.
  pub fn mark(&self) -> u64 {
    self.seq
  }

  /// Record `mutation` and apply it to `list`.
  pub fn record(&mut self, mutation: Mutation<T>, list: &mut Vec<T>) {
    mutation.apply(list);
    self.seq += 1;
    self.entries.push_back((self.seq, mutation));
  }

  /// Replay mutations recorded after `since` onto a fetched list.
  pub fn replay(&self, since: u64, mut fetched: Vec<T>) -> Vec<T> {
    for (_, mutation) in self.entries.iter().filter(|(seq, _)| *seq > since) {
      mutation.apply(&mut fetched);
    }
    fetched
  }

  /// Forget mutations a fetch started at `upto` has already observed.
  pub fn prune(&mut self, upto: u64) {
    while self.entries.front().is_some_and(|(seq, _)| *seq <= upto) {
      self.entries.pop_front();
    }
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  #[cfg(test)]
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{group, invitation};

  #[test]
  fn test_same_content_new_identity_is_unchanged() {
    let current = vec![group("g1", "Books"), group("g2", "Hiking")];
    let fetched = vec![group("g2", "Hiking"), group("g1", "Books")];
    assert!(!has_changed(&current, &fetched));
  }

  #[test]
  fn test_scalar_field_change_detected() {
    let current = vec![group("g1", "Books")];
    let mut renamed = group("g1", "Novels");
    assert!(has_changed(&current, &[renamed.clone()]));

    renamed.name = "Books".into();
    renamed.item_count += 1;
    assert!(has_changed(&current, &[renamed]));
  }

  #[test]
  fn test_membership_change_detected() {
    let current = vec![group("g1", "Books")];
    let mut fetched = group("g1", "Books");
    fetched.members[0].role = crate::sync::types::MemberRole::Member;
    assert!(has_changed(&current, &[fetched]));
  }

  #[test]
  fn test_length_and_id_changes_detected() {
    let current = vec![group("g1", "Books")];
    assert!(has_changed(&current, &[]));
    assert!(has_changed(&current, &[group("g9", "Books")]));
    assert!(has_changed(
      &[group("g1", "A"), group("g1", "A")],
      &[group("g1", "A"), group("g2", "A")]
    ));
  }

  #[test]
  fn test_invitation_status_change_detected() {
    let current = vec![invitation("i1", "g1")];
    let mut fetched = invitation("i1", "g1");
    assert!(!has_changed(&current, &[fetched.clone()]));
    fetched.status = crate::sync::types::InvitationStatus::Declined;
    assert!(has_changed(&current, &[fetched]));
  }

  #[test]
  fn test_replay_only_applies_newer_mutations() {
    let mut journal = Journal::default();
    let mut state = vec![group("g1", "Books")];

    let before_create = journal.mark();
    journal.record(Mutation::Prepend(group("g2", "New")), &mut state);
    let after_create = journal.mark();
    journal.record(Mutation::Remove("g1".into()), &mut state);

    let ids = |list: &[Group]| list.iter().map(|g| g.id.clone()).collect::<Vec<_>>();
    assert_eq!(ids(&state), vec!["g2"]);

    // Fetch that started before both mutations sees neither.
    let rebased = journal.replay(before_create, vec![group("g1", "Books")]);
    assert_eq!(ids(&rebased), vec!["g2"]);

    // Fetch that started after the create already contains g2.
    let rebased = journal.replay(after_create, vec![group("g2", "New"), group("g1", "Books")]);
    assert_eq!(ids(&rebased), vec!["g2"]);
  }

  #[test]
  fn test_prune_drops_observed_mutations() {
    let mut journal = Journal::default();
    let mut state = Vec::new();
    journal.record(Mutation::Prepend(group("g1", "A")), &mut state);
    journal.record(Mutation::Prepend(group("g2", "B")), &mut state);
    assert_eq!(journal.len(), 2);

    journal.prune(1);
    assert_eq!(journal.len(), 1);
    journal.prune(journal.mark());
    assert!(journal.is_empty());
  }

  #[test]
  fn test_prepend_is_idempotent() {
    let mut list = vec![group("g1", "A")];
    Mutation::Prepend(group("g1", "A")).apply(&mut list);
    assert_eq!(list.len(), 1);
  }
}
