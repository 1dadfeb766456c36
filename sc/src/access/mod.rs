//! Call admission
//!
//! [`AccessGate`] decides whether a caller may make a call and act on the
//! target user; [`EnabledGate`] decides whether the service accepts calls at
//! all. Identity facts come from the injected traits in [`policy`].

mod enabled;
mod gate;
pub mod policy;

pub use enabled::{ConfigLoadedFlag, ENABLED_PROPERTY, EnabledGate, FlagSource, PRIVACY_NAMESPACE, PropertyFlag, StaticFlag};
pub use gate::{AccessGate, UserCheck};
pub use policy::{AppIdentity, GroupResolver, PermissionChecker, PolicyConfig, StaticPolicy, UidGrant, UserDirectory, UserEntry};
