//! Caller identity, permissions and profile groups

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// User id. Negative values are the "all users" / "current user" sentinels
/// and are never valid targets.
pub type UserId = i32;

/// Uid of a calling process
pub type Uid = u32;

/// Number of uids reserved for each user
pub const PER_USER_RANGE: Uid = 100_000;

/// The user a uid runs as
pub fn user_id_of(uid: Uid) -> UserId {
    (uid / PER_USER_RANGE) as UserId
}

/// Permissions checked by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    /// Full control: read aggregated data, refresh, manage listeners
    ManageSafetyCenter,
    /// Read-only enablement status
    ReadSafetyCenterStatus,
    /// Push and read source reports
    SendSafetyCenterUpdate,
    /// Act on behalf of another user
    InteractAcrossUsersFull,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ManageSafetyCenter => "MANAGE_SAFETY_CENTER",
            Permission::ReadSafetyCenterStatus => "READ_SAFETY_CENTER_STATUS",
            Permission::SendSafetyCenterUpdate => "SEND_SAFETY_CENTER_UPDATE",
            Permission::InteractAcrossUsersFull => "INTERACT_ACROSS_USERS_FULL",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "MANAGE_SAFETY_CENTER" => Ok(Permission::ManageSafetyCenter),
            "READ_SAFETY_CENTER_STATUS" => Ok(Permission::ReadSafetyCenterStatus),
            "SEND_SAFETY_CENTER_UPDATE" => Ok(Permission::SendSafetyCenterUpdate),
            "INTERACT_ACROSS_USERS_FULL" => Ok(Permission::InteractAcrossUsersFull),
            other => Err(format!("unknown permission: {}", other)),
        }
    }
}

/// Identity of the principal invoking a single call
///
/// Built per call by the transport and dropped when the call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    /// Uid of the calling process
    pub uid: Uid,
    /// Package the caller claims to be; checked against `uid` before use
    pub package_name: Option<String>,
    /// User the call acts on
    pub user_id: UserId,
}

impl CallerContext {
    /// Caller acting on an explicit target user
    pub fn new(uid: Uid, user_id: UserId) -> Self {
        Self {
            uid,
            package_name: None,
            user_id,
        }
    }

    /// Caller acting on its own user
    pub fn for_own_user(uid: Uid) -> Self {
        Self::new(uid, user_id_of(uid))
    }

    pub fn with_package(mut self, package_name: impl Into<String>) -> Self {
        self.package_name = Some(package_name.into());
        self
    }

    /// User the calling process runs as
    pub fn calling_user_id(&self) -> UserId {
        user_id_of(self.uid)
    }
}

/// A primary user plus its managed profiles, sharing one aggregated view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileGroup {
    parent: UserId,
    profiles: Vec<UserId>,
}

impl ProfileGroup {
    /// Build a group; the parent is never listed among its own profiles
    pub fn new(parent: UserId, profiles: impl IntoIterator<Item = UserId>) -> Self {
        let mut profiles: Vec<UserId> = profiles.into_iter().filter(|p| *p != parent).collect();
        profiles.sort_unstable();
        profiles.dedup();
        Self { parent, profiles }
    }

    /// A group with no managed profiles
    pub fn single(user_id: UserId) -> Self {
        Self::new(user_id, [])
    }

    pub fn parent(&self) -> UserId {
        self.parent
    }

    pub fn profiles(&self) -> &[UserId] {
        &self.profiles
    }

    /// Every user id in the group, parent first
    pub fn user_ids(&self) -> Vec<UserId> {
        std::iter::once(self.parent).chain(self.profiles.iter().copied()).collect()
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.parent == user_id || self.profiles.contains(&user_id)
    }
}
