//! Group state and transitions.
//!
//! Pure in-memory state persisted to one JSON file after every mutation.
//! Operator permissions gate each transition; the invariants maintained on
//! every write: exactly one owner per (non-shell) group, the owner is never
//! banned or muted, banned members fail all write checks.

use std::collections::BTreeMap;

use tracing::{debug, info};

use pulse_store::atomic::{self, FileMode};
use pulse_store::paths::DataDir;
use pulse_types::group::{Group, GroupSettings, Member, Role};

use crate::{GroupError, Result};

/// Minimum group name length.
const MIN_NAME_LEN: usize = 2;

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct GroupsFile {
    groups: BTreeMap<String, Group>,
}

/// All groups the agent participates in.
#[derive(Debug)]
pub struct GroupManager {
    groups: BTreeMap<String, Group>,
    data: DataDir,
}

impl GroupManager {
    /// Load persisted groups, or start empty.
    pub fn load(data: DataDir) -> Result<Self> {
        let file: GroupsFile = atomic::read_json(&data.groups_file())?.unwrap_or_default();
        Ok(Self {
            groups: file.groups,
            data,
        })
    }

    fn persist(&self) -> Result<()> {
        let file = GroupsFile {
            groups: self.groups.clone(),
        };
        atomic::write_json(&self.data.groups_file(), &file, FileMode::Shared)?;
        Ok(())
    }

    /// Create a group owned by `owner`. Returns the new group; the caller
    /// installs the topic subscription.
    pub fn create_group(&mut self, name: &str, owner: &str, now_ms: i64) -> Result<Group> {
        if name.trim().len() < MIN_NAME_LEN {
            return Err(GroupError::InvalidName(name.to_string()));
        }

        let id = loop {
            let candidate = hex::encode(rand::random::<[u8; 4]>());
            if !self.groups.contains_key(&candidate) {
                break candidate;
            }
        };

        let mut members = BTreeMap::new();
        members.insert(
            owner.to_string(),
            Member::new(owner.to_string(), Role::Owner, now_ms),
        );
        let group = Group {
            id: id.clone(),
            name: name.trim().to_string(),
            topic: Group::default_topic(&id),
            owner: Some(owner.to_string()),
            members,
            created_at: now_ms,
            settings: GroupSettings::default(),
        };

        self.groups.insert(id.clone(), group.clone());
        self.persist()?;
        info!(group = %id, name = %group.name, "group created");
        Ok(group)
    }

    /// Add (or refresh) a member. Unknown groups become shell groups with
    /// no owner, as happens when joining from an invite.
    pub fn join_group(
        &mut self,
        id: &str,
        topic: &str,
        pubkey: &str,
        name: Option<&str>,
        now_ms: i64,
    ) -> Result<Group> {
        let group = self.groups.entry(id.to_string()).or_insert_with(|| Group {
            id: id.to_string(),
            name: name.unwrap_or(id).to_string(),
            topic: if topic.is_empty() {
                Group::default_topic(id)
            } else {
                topic.to_string()
            },
            owner: None,
            members: BTreeMap::new(),
            created_at: now_ms,
            settings: GroupSettings::default(),
        });

        if let Some(member) = group.members.get(pubkey) {
            if member.is_banned {
                return Err(GroupError::Banned(pubkey.to_string()));
            }
        }

        group
            .members
            .entry(pubkey.to_string())
            .and_modify(|m| m.last_seen = now_ms)
            .or_insert_with(|| Member::new(pubkey.to_string(), Role::Member, now_ms));

        let group = group.clone();
        self.persist()?;
        debug!(group = id, member = pubkey, "member joined");
        Ok(group)
    }

    /// Remove a member. The owner must transfer first unless alone; the
    /// last member leaving deletes the group. Returns true when the group
    /// was deleted.
    pub fn leave_group(&mut self, id: &str, pubkey: &str) -> Result<bool> {
        let group = self
            .groups
            .get_mut(id)
            .ok_or_else(|| GroupError::NotFound(id.to_string()))?;
        if !group.members.contains_key(pubkey) {
            return Err(GroupError::MemberNotFound(pubkey.to_string()));
        }

        let is_owner = group.owner.as_deref() == Some(pubkey);
        if is_owner && group.members.len() > 1 {
            return Err(GroupError::NotOwner(
                "transfer ownership before leaving".to_string(),
            ));
        }

        group.members.remove(pubkey);
        let deleted = group.members.is_empty();
        if deleted {
            self.groups.remove(id);
            info!(group = id, "last member left; group deleted");
        }
        self.persist()?;
        Ok(deleted)
    }

    /// Remove a member by admin action.
    pub fn kick_member(&mut self, id: &str, operator: &str, target: &str) -> Result<()> {
        let group = self.require_moderation(id, operator, target)?;
        group
            .members
            .remove(target)
            .ok_or_else(|| GroupError::MemberNotFound(target.to_string()))?;
        self.persist()?;
        debug!(group = id, target, "member kicked");
        Ok(())
    }

    /// Ban a member. Creates a stub record for future enforcement when the
    /// target is not yet a member.
    pub fn ban_member(
        &mut self,
        id: &str,
        operator: &str,
        target: &str,
        now_ms: i64,
    ) -> Result<()> {
        let group = self.require_moderation(id, operator, target)?;
        group
            .members
            .entry(target.to_string())
            .or_insert_with(|| Member::new(target.to_string(), Role::Member, now_ms))
            .is_banned = true;
        self.persist()?;
        debug!(group = id, target, "member banned");
        Ok(())
    }

    /// Lift a ban.
    pub fn unban_member(&mut self, id: &str, operator: &str, target: &str) -> Result<()> {
        let group = self.require_moderation(id, operator, target)?;
        group
            .members
            .get_mut(target)
            .ok_or_else(|| GroupError::MemberNotFound(target.to_string()))?
            .is_banned = false;
        self.persist()?;
        Ok(())
    }

    /// Mute a member; `duration_ms = 0` means indefinite.
    pub fn mute_member(
        &mut self,
        id: &str,
        operator: &str,
        target: &str,
        duration_ms: i64,
        now_ms: i64,
    ) -> Result<()> {
        let group = self.require_moderation(id, operator, target)?;
        let member = group
            .members
            .get_mut(target)
            .ok_or_else(|| GroupError::MemberNotFound(target.to_string()))?;
        member.is_muted = true;
        member.muted_until = if duration_ms > 0 {
            now_ms + duration_ms
        } else {
            0
        };
        self.persist()?;
        debug!(group = id, target, duration_ms, "member muted");
        Ok(())
    }

    /// Clear a mute.
    pub fn unmute_member(&mut self, id: &str, operator: &str, target: &str) -> Result<()> {
        let group = self.require_moderation(id, operator, target)?;
        let member = group
            .members
            .get_mut(target)
            .ok_or_else(|| GroupError::MemberNotFound(target.to_string()))?;
        member.is_muted = false;
        member.muted_until = 0;
        self.persist()?;
        Ok(())
    }

    /// Grant or revoke admin. Owner only.
    pub fn set_admin(&mut self, id: &str, operator: &str, target: &str, admin: bool) -> Result<()> {
        let group = self
            .groups
            .get_mut(id)
            .ok_or_else(|| GroupError::NotFound(id.to_string()))?;
        if group.owner.as_deref() != Some(operator) {
            return Err(GroupError::NotOwner("only the owner grants roles".to_string()));
        }
        if target == operator {
            return Err(GroupError::TargetIsOwner);
        }
        let member = group
            .members
            .get_mut(target)
            .ok_or_else(|| GroupError::MemberNotFound(target.to_string()))?;
        member.role = if admin { Role::Admin } else { Role::Member };
        self.persist()?;
        Ok(())
    }

    /// Transfer ownership. The old owner becomes an admin; the new owner's
    /// mute state is cleared to keep the owner-never-muted invariant.
    pub fn transfer_ownership(&mut self, id: &str, operator: &str, target: &str) -> Result<()> {
        let group = self
            .groups
            .get_mut(id)
            .ok_or_else(|| GroupError::NotFound(id.to_string()))?;
        if group.owner.as_deref() != Some(operator) {
            return Err(GroupError::NotOwner(
                "only the owner transfers ownership".to_string(),
            ));
        }
        {
            let member = group
                .members
                .get(target)
                .ok_or_else(|| GroupError::MemberNotFound(target.to_string()))?;
            if member.is_banned {
                return Err(GroupError::Banned(target.to_string()));
            }
        }

        if let Some(old) = group.members.get_mut(operator) {
            old.role = Role::Admin;
        }
        if let Some(new) = group.members.get_mut(target) {
            new.role = Role::Owner;
            new.is_muted = false;
            new.muted_until = 0;
        }
        group.owner = Some(target.to_string());
        self.persist()?;
        info!(group = id, from = operator, to = target, "ownership transferred");
        Ok(())
    }

    /// The send-permission check: member exists, is not banned, is not
    /// under an active mute. An expired mute is cleared here.
    pub fn can_send_message(&mut self, id: &str, pubkey: &str, now_ms: i64) -> Result<()> {
        let group = self
            .groups
            .get_mut(id)
            .ok_or_else(|| GroupError::NotFound(id.to_string()))?;
        let member = group
            .members
            .get_mut(pubkey)
            .ok_or_else(|| GroupError::MemberNotFound(pubkey.to_string()))?;

        if member.is_banned {
            return Err(GroupError::Banned(pubkey.to_string()));
        }
        if member.is_muted {
            if member.mute_active(now_ms) {
                return Err(GroupError::Muted(pubkey.to_string()));
            }
            member.is_muted = false;
            member.muted_until = 0;
            self.persist()?;
        }
        Ok(())
    }

    /// Refresh a member's `last_seen`.
    pub fn record_seen(&mut self, id: &str, pubkey: &str, now_ms: i64) {
        if let Some(member) = self
            .groups
            .get_mut(id)
            .and_then(|g| g.members.get_mut(pubkey))
        {
            member.last_seen = now_ms;
        }
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.get(id)
    }

    /// Find the group subscribed to `topic`.
    pub fn group_by_topic(&self, topic: &str) -> Option<&Group> {
        self.groups.values().find(|g| g.topic == topic)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Admin-or-owner gate for moderation ops targeting a non-owner.
    fn require_moderation(
        &mut self,
        id: &str,
        operator: &str,
        target: &str,
    ) -> Result<&mut Group> {
        let group = self
            .groups
            .get_mut(id)
            .ok_or_else(|| GroupError::NotFound(id.to_string()))?;
        let op_role = group
            .members
            .get(operator)
            .map(|m| m.role)
            .ok_or_else(|| GroupError::MemberNotFound(operator.to_string()))?;
        if !op_role.is_admin_or_owner() {
            return Err(GroupError::NotAdmin);
        }
        if group.owner.as_deref() == Some(target) {
            return Err(GroupError::TargetIsOwner);
        }
        Ok(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (GroupManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());
        (GroupManager::load(data).expect("load"), dir)
    }

    const ALICE: &str = "a1";
    const BOB: &str = "b2";
    const CAROL: &str = "c3";

    #[test]
    fn test_create_sets_single_owner() {
        let (mut gm, _dir) = manager();
        let group = gm.create_group("demo", ALICE, 1000).expect("create");
        assert_eq!(group.owner.as_deref(), Some(ALICE));
        assert_eq!(group.owner_count(), 1);
        assert_eq!(group.topic, format!("group-{}", group.id));
    }

    #[test]
    fn test_short_name_rejected() {
        let (mut gm, _dir) = manager();
        assert!(matches!(
            gm.create_group("x", ALICE, 1000),
            Err(GroupError::InvalidName(_))
        ));
    }

    #[test]
    fn test_join_unknown_creates_shell() {
        let (mut gm, _dir) = manager();
        let group = gm
            .join_group("g9", "group-g9", BOB, None, 1000)
            .expect("join");
        assert_eq!(group.owner, None);
        assert!(group.members.contains_key(BOB));
    }

    #[test]
    fn test_owner_cannot_leave_with_members() {
        let (mut gm, _dir) = manager();
        let group = gm.create_group("demo", ALICE, 1000).expect("create");
        gm.join_group(&group.id, &group.topic, BOB, None, 1001)
            .expect("join");
        assert!(matches!(
            gm.leave_group(&group.id, ALICE),
            Err(GroupError::NotOwner(_))
        ));
    }

    #[test]
    fn test_last_member_leaving_deletes() {
        let (mut gm, _dir) = manager();
        let group = gm.create_group("demo", ALICE, 1000).expect("create");
        assert!(gm.leave_group(&group.id, ALICE).expect("leave"));
        assert!(gm.group(&group.id).is_none());
    }

    #[test]
    fn test_moderation_requires_admin() {
        let (mut gm, _dir) = manager();
        let group = gm.create_group("demo", ALICE, 1000).expect("create");
        gm.join_group(&group.id, &group.topic, BOB, None, 1001).expect("join");
        gm.join_group(&group.id, &group.topic, CAROL, None, 1002).expect("join");

        assert!(matches!(
            gm.kick_member(&group.id, BOB, CAROL),
            Err(GroupError::NotAdmin)
        ));
        gm.set_admin(&group.id, ALICE, BOB, true).expect("promote");
        gm.kick_member(&group.id, BOB, CAROL).expect("kick");
        assert!(gm.group(&group.id).expect("group").member(CAROL).is_none());
    }

    #[test]
    fn test_owner_untouchable() {
        let (mut gm, _dir) = manager();
        let group = gm.create_group("demo", ALICE, 1000).expect("create");
        gm.join_group(&group.id, &group.topic, BOB, None, 1001).expect("join");
        gm.set_admin(&group.id, ALICE, BOB, true).expect("promote");

        assert!(matches!(
            gm.kick_member(&group.id, BOB, ALICE),
            Err(GroupError::TargetIsOwner)
        ));
        assert!(matches!(
            gm.ban_member(&group.id, BOB, ALICE, 1002),
            Err(GroupError::TargetIsOwner)
        ));
        assert!(matches!(
            gm.mute_member(&group.id, BOB, ALICE, 0, 1002),
            Err(GroupError::TargetIsOwner)
        ));
    }

    #[test]
    fn test_ban_creates_stub_and_blocks_join() {
        let (mut gm, _dir) = manager();
        let group = gm.create_group("demo", ALICE, 1000).expect("create");
        gm.ban_member(&group.id, ALICE, BOB, 1001).expect("ban");

        assert!(matches!(
            gm.join_group(&group.id, &group.topic, BOB, None, 1002),
            Err(GroupError::Banned(_))
        ));
        assert!(matches!(
            gm.can_send_message(&group.id, BOB, 1003),
            Err(GroupError::Banned(_))
        ));

        gm.unban_member(&group.id, ALICE, BOB).expect("unban");
        gm.join_group(&group.id, &group.topic, BOB, None, 1004).expect("rejoin");
    }

    #[test]
    fn test_mute_expiry_clears_on_check() {
        let (mut gm, _dir) = manager();
        let group = gm.create_group("demo", ALICE, 1000).expect("create");
        gm.join_group(&group.id, &group.topic, BOB, None, 1001).expect("join");

        gm.mute_member(&group.id, ALICE, BOB, 500, 1000).expect("mute");
        assert!(matches!(
            gm.can_send_message(&group.id, BOB, 1400),
            Err(GroupError::Muted(_))
        ));
        // Past expiry: check clears the flag
        gm.can_send_message(&group.id, BOB, 1600).expect("cleared");
        assert!(!gm.group(&group.id).expect("group").member(BOB).expect("member").is_muted);
    }

    #[test]
    fn test_indefinite_mute_needs_unmute() {
        let (mut gm, _dir) = manager();
        let group = gm.create_group("demo", ALICE, 1000).expect("create");
        gm.join_group(&group.id, &group.topic, BOB, None, 1001).expect("join");

        gm.mute_member(&group.id, ALICE, BOB, 0, 1000).expect("mute");
        assert!(gm.can_send_message(&group.id, BOB, i64::MAX - 1).is_err());
        gm.unmute_member(&group.id, ALICE, BOB).expect("unmute");
        gm.can_send_message(&group.id, BOB, 2000).expect("can send");
    }

    #[test]
    fn test_transfer_ownership() {
        let (mut gm, _dir) = manager();
        let group = gm.create_group("demo", ALICE, 1000).expect("create");
        gm.join_group(&group.id, &group.topic, BOB, None, 1001).expect("join");

        assert!(matches!(
            gm.transfer_ownership(&group.id, BOB, BOB),
            Err(GroupError::NotOwner(_))
        ));

        gm.transfer_ownership(&group.id, ALICE, BOB).expect("transfer");
        let group = gm.group(&group.id).expect("group");
        assert_eq!(group.owner.as_deref(), Some(BOB));
        assert_eq!(group.member(BOB).expect("bob").role, Role::Owner);
        assert_eq!(group.member(ALICE).expect("alice").role, Role::Admin);
        assert_eq!(group.owner_count(), 1);
    }

    #[test]
    fn test_owner_invariant_over_op_sequences() {
        let (mut gm, _dir) = manager();
        let group = gm.create_group("demo", ALICE, 1000).expect("create");
        let id = group.id.clone();
        gm.join_group(&id, &group.topic, BOB, None, 1001).expect("join");
        gm.join_group(&id, &group.topic, CAROL, None, 1002).expect("join");

        gm.set_admin(&id, ALICE, BOB, true).expect("promote");
        gm.transfer_ownership(&id, ALICE, BOB).expect("transfer");
        gm.mute_member(&id, BOB, CAROL, 0, 1003).expect("mute");
        gm.transfer_ownership(&id, BOB, CAROL).expect("transfer back");

        let group = gm.group(&id).expect("group");
        assert_eq!(group.owner_count(), 1);
        let owner = group.member(CAROL).expect("owner");
        assert!(!owner.is_banned && !owner.is_muted);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());
        let id = {
            let mut gm = GroupManager::load(data.clone()).expect("load");
            let group = gm.create_group("demo", ALICE, 1000).expect("create");
            gm.join_group(&group.id, &group.topic, BOB, None, 1001).expect("join");
            gm.mute_member(&group.id, ALICE, BOB, 0, 1002).expect("mute");
            group.id
        };

        let mut gm = GroupManager::load(data).expect("reload");
        assert_eq!(gm.len(), 1);
        assert!(gm.can_send_message(&id, BOB, 2000).is_err());
        assert!(gm.group_by_topic(&format!("group-{id}")).is_some());
    }
}
