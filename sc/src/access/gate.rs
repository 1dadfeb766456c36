//! AccessGate - per-call permission, package and cross-user checks

use std::sync::Arc;

use tracing::{debug, warn};

use super::policy::{AppIdentity, PermissionChecker, UserDirectory};
use crate::domain::{CallerContext, Permission, Uid};
use crate::error::{ServiceError, ServiceResult};

/// Outcome of a cross-user check that did not reject the call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCheck {
    /// Target user exists; proceed
    Present,
    /// Target user does not exist; the call degrades to a no-op
    Absent,
}

/// Stateless authorizer for incoming calls
pub struct AccessGate {
    /// Uid of the service itself; it holds every permission on its own calls
    service_uid: Uid,
    permissions: Arc<dyn PermissionChecker>,
    apps: Arc<dyn AppIdentity>,
    users: Arc<dyn UserDirectory>,
}

impl AccessGate {
    pub fn new(
        service_uid: Uid,
        permissions: Arc<dyn PermissionChecker>,
        apps: Arc<dyn AppIdentity>,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            service_uid,
            permissions,
            apps,
            users,
        }
    }

    fn granted(&self, caller: &CallerContext, permission: Permission, allow_self: bool) -> bool {
        (allow_self && caller.uid == self.service_uid) || self.permissions.has_permission(caller.uid, permission)
    }

    /// Require `permission` from the caller or the service itself
    pub fn authorize(&self, operation: &str, permission: Permission, caller: &CallerContext) -> ServiceResult<()> {
        self.authorize_any(operation, &[permission], caller)
    }

    /// Require `permission` from the calling process; the service's own uid gets no pass
    pub fn authorize_calling(
        &self,
        operation: &str,
        permission: Permission,
        caller: &CallerContext,
    ) -> ServiceResult<()> {
        if self.granted(caller, permission, false) {
            return Ok(());
        }
        warn!(%operation, uid = caller.uid, %permission, "Permission denied");
        Err(ServiceError::denied(operation, &[permission]))
    }

    /// Grant if any one of `permissions` is held; deny listing all of them otherwise
    pub fn authorize_any(
        &self,
        operation: &str,
        permissions: &[Permission],
        caller: &CallerContext,
    ) -> ServiceResult<()> {
        debug!(%operation, uid = caller.uid, ?permissions, "authorize_any: called");
        if permissions.is_empty() {
            return Err(ServiceError::invalid("Must check at least one permission"));
        }
        if permissions.iter().any(|p| self.granted(caller, *p, true)) {
            return Ok(());
        }
        warn!(%operation, uid = caller.uid, ?permissions, "Permission denied");
        Err(ServiceError::denied(operation, permissions))
    }

    /// Require a declared package that belongs to the calling uid
    pub fn check_package<'a>(&self, operation: &str, caller: &'a CallerContext) -> ServiceResult<&'a str> {
        let package = caller
            .package_name
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ServiceError::invalid(format!("{}: package_name is required", operation)))?;
        if !self.apps.package_belongs_to(caller.uid, package) {
            warn!(%operation, uid = caller.uid, %package, "Package does not belong to caller");
            return Err(ServiceError::PackageMismatch {
                package: package.to_string(),
                uid: caller.uid,
            });
        }
        Ok(package)
    }

    /// Check the caller may act on its target user, and that the user exists
    ///
    /// Acting on another user requires `INTERACT_ACROSS_USERS_FULL`. A target
    /// that does not exist is not an error: it yields [`UserCheck::Absent`].
    pub fn check_cross_user(&self, operation: &str, caller: &CallerContext) -> ServiceResult<UserCheck> {
        let target = caller.user_id;
        debug!(%operation, uid = caller.uid, target, "check_cross_user: called");
        if target < 0 {
            return Err(ServiceError::invalid(format!(
                "{}: user id {} does not name a single user",
                operation, target
            )));
        }
        if target != caller.calling_user_id() {
            self.authorize(operation, Permission::InteractAcrossUsersFull, caller)?;
        }
        if !self.users.user_exists(target) {
            warn!(
                %operation,
                user_id = target,
                "Called with a user id that does not correspond to an existing user"
            );
            return Ok(UserCheck::Absent);
        }
        Ok(UserCheck::Present)
    }
}
