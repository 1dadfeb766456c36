//! Identity facts the gates depend on
//!
//! Each concern is its own trait so tests can swap any one of them.
//! [`StaticPolicy`] answers all four from the `policy` config section.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{Permission, ProfileGroup, Uid, UserId};

/// Answers whether a uid holds a permission
pub trait PermissionChecker: Send + Sync {
    fn has_permission(&self, uid: Uid, permission: Permission) -> bool;
}

/// Answers whether a package belongs to a uid
pub trait AppIdentity: Send + Sync {
    fn package_belongs_to(&self, uid: Uid, package_name: &str) -> bool;
}

/// Answers whether a user currently exists
pub trait UserDirectory: Send + Sync {
    fn user_exists(&self, user_id: UserId) -> bool;
}

/// Maps a user to the profile group sharing its view
pub trait GroupResolver: Send + Sync {
    fn resolve(&self, user_id: UserId) -> ProfileGroup;
}

/// A user known to the policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub id: UserId,
    /// Parent user when this user is a managed profile
    #[serde(default, rename = "profile-parent")]
    pub profile_parent: Option<UserId>,
}

/// Permissions and packages held by one uid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidGrant {
    pub uid: Uid,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub packages: Vec<String>,
}

/// The `policy` config section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub users: Vec<UserEntry>,
    pub grants: Vec<UidGrant>,
}

#[derive(Debug, Default)]
struct Grant {
    permissions: HashSet<Permission>,
    packages: HashSet<String>,
}

/// Table-driven identity policy
#[derive(Debug, Default)]
pub struct StaticPolicy {
    users: HashMap<UserId, Option<UserId>>,
    grants: HashMap<Uid, Grant>,
}

impl StaticPolicy {
    pub fn new(config: &PolicyConfig) -> Self {
        debug!(
            users = config.users.len(),
            grants = config.grants.len(),
            "StaticPolicy::new: called"
        );
        let mut policy = Self::default();
        for user in &config.users {
            policy.users.insert(user.id, user.profile_parent);
        }
        for grant in &config.grants {
            let entry = policy.grants.entry(grant.uid).or_default();
            entry.permissions.extend(grant.permissions.iter().copied());
            entry.packages.extend(grant.packages.iter().cloned());
        }
        policy
    }

    /// Add a full user
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.users.insert(user_id, None);
        self
    }

    /// Add a managed profile of `parent`
    pub fn with_profile(mut self, user_id: UserId, parent: UserId) -> Self {
        self.users.insert(user_id, Some(parent));
        self
    }

    pub fn grant(mut self, uid: Uid, permissions: &[Permission]) -> Self {
        self.grants
            .entry(uid)
            .or_default()
            .permissions
            .extend(permissions.iter().copied());
        self
    }

    pub fn with_package(mut self, uid: Uid, package_name: &str) -> Self {
        self.grants
            .entry(uid)
            .or_default()
            .packages
            .insert(package_name.to_string());
        self
    }

    /// Remove a user, as happens while a user is being deleted
    pub fn remove_user(&mut self, user_id: UserId) {
        self.users.remove(&user_id);
    }
}

impl PermissionChecker for StaticPolicy {
    fn has_permission(&self, uid: Uid, permission: Permission) -> bool {
        self.grants
            .get(&uid)
            .is_some_and(|g| g.permissions.contains(&permission))
    }
}

impl AppIdentity for StaticPolicy {
    fn package_belongs_to(&self, uid: Uid, package_name: &str) -> bool {
        self.grants.get(&uid).is_some_and(|g| g.packages.contains(package_name))
    }
}

impl UserDirectory for StaticPolicy {
    fn user_exists(&self, user_id: UserId) -> bool {
        self.users.contains_key(&user_id)
    }
}

impl GroupResolver for StaticPolicy {
    fn resolve(&self, user_id: UserId) -> ProfileGroup {
        let parent = match self.users.get(&user_id) {
            Some(Some(parent)) => *parent,
            _ => user_id,
        };
        let profiles = self
            .users
            .iter()
            .filter(|(_, p)| **p == Some(parent))
            .map(|(id, _)| *id);
        ProfileGroup::new(parent, profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> StaticPolicy {
        StaticPolicy::default()
            .with_user(0)
            .with_profile(10, 0)
            .with_profile(11, 0)
            .with_user(20)
            .grant(10_050, &[Permission::SendSafetyCenterUpdate])
            .with_package(10_050, "com.example.source")
    }

    #[test]
    fn test_permissions_and_packages() {
        let p = policy();
        assert!(p.has_permission(10_050, Permission::SendSafetyCenterUpdate));
        assert!(!p.has_permission(10_050, Permission::ManageSafetyCenter));
        assert!(!p.has_permission(99, Permission::SendSafetyCenterUpdate));
        assert!(p.package_belongs_to(10_050, "com.example.source"));
        assert!(!p.package_belongs_to(10_051, "com.example.source"));
    }

    #[test]
    fn test_resolve_groups() {
        let p = policy();
        assert_eq!(p.resolve(0), ProfileGroup::new(0, [10, 11]));
        assert_eq!(p.resolve(11), ProfileGroup::new(0, [10, 11]));
        assert_eq!(p.resolve(20), ProfileGroup::single(20));
        assert_eq!(p.resolve(99), ProfileGroup::single(99));
    }

    #[test]
    fn test_from_config() {
        let yaml = r#"
users:
  - id: 0
  - id: 10
    profile-parent: 0
grants:
  - uid: 1000
    permissions: [MANAGE_SAFETY_CENTER, INTERACT_ACROSS_USERS_FULL]
"#;
        let config: PolicyConfig = serde_yaml::from_str(yaml).unwrap();
        let mut p = StaticPolicy::new(&config);
        assert!(p.user_exists(10));
        assert!(p.has_permission(1000, Permission::InteractAcrossUsersFull));
        p.remove_user(10);
        assert!(!p.user_exists(10));
        assert_eq!(p.resolve(0), ProfileGroup::single(0));
    }
}
