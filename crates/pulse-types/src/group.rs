//! Group, member, and role structures.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::PubkeyHex;

/// Member role within a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Admin,
    Owner,
}

impl Role {
    /// Admins and the owner pass moderation checks.
    pub fn is_admin_or_owner(self) -> bool {
        matches!(self, Role::Admin | Role::Owner)
    }
}

/// One group member.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub pubkey: PubkeyHex,
    pub role: Role,
    /// Join time, ms.
    pub joined_at: i64,
    /// Last observed activity, ms.
    pub last_seen: i64,
    pub is_muted: bool,
    /// Mute expiry, ms; 0 = indefinite.
    pub muted_until: i64,
    pub is_banned: bool,
}

impl Member {
    /// A fresh member record with the given role.
    pub fn new(pubkey: impl Into<PubkeyHex>, role: Role, now_ms: i64) -> Self {
        Self {
            pubkey: pubkey.into(),
            role,
            joined_at: now_ms,
            last_seen: now_ms,
            is_muted: false,
            muted_until: 0,
            is_banned: false,
        }
    }

    /// Whether the mute is in force at `now_ms`.
    pub fn mute_active(&self, now_ms: i64) -> bool {
        self.is_muted && (self.muted_until == 0 || self.muted_until > now_ms)
    }
}

/// Per-group policy switches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSettings {
    pub is_public: bool,
    pub allow_invite: bool,
    pub history_visible: bool,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            is_public: false,
            allow_invite: true,
            history_visible: true,
        }
    }
}

/// A group the agent knows about.
///
/// Invariant: exactly one member holds [`Role::Owner`], except for shell
/// groups created from an invite, where `owner` is `None` until the true
/// owner is observed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    /// Opaque short identifier.
    pub id: String,
    pub name: String,
    /// Subscription topic; defaults to `group-<id>`.
    pub topic: String,
    /// Owner pubkey; `None` for invited groups of unknown origin.
    pub owner: Option<PubkeyHex>,
    pub members: BTreeMap<PubkeyHex, Member>,
    /// Creation time, ms.
    pub created_at: i64,
    #[serde(default)]
    pub settings: GroupSettings,
}

impl Group {
    /// The conventional topic for a group id.
    pub fn default_topic(id: &str) -> String {
        format!("group-{id}")
    }

    /// Look up a member.
    pub fn member(&self, pubkey: &str) -> Option<&Member> {
        self.members.get(pubkey)
    }

    /// Count of members holding [`Role::Owner`].
    pub fn owner_count(&self) -> usize {
        self.members
            .values()
            .filter(|m| m.role == Role::Owner)
            .count()
    }
}
