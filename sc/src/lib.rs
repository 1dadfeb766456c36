//! Safety Center - coordination service for device safety status
//!
//! Untrusted sources push status reports, privileged observers read an
//! aggregated view and subscribe to changes, and managers trigger refreshes.
//! The service authorizes every call, keeps users and profile groups apart,
//! and notifies listeners without ever blocking state changes on them.
//!
//! # Core Concepts
//!
//! - **Gate first**: permission, package and cross-user checks run before any state is touched
//! - **Degrade, don't fail**: absent users and a disabled service yield empty results, not errors
//! - **Two locks**: a fast lock for in-memory state, a slow lock for refresh orchestration
//! - **Best-effort fan-out**: listeners are notified outside any lock; dead ones are skipped
//!
//! # Modules
//!
//! - [`domain`] - Identities, reports, views and the source catalog
//! - [`access`] - Permission, cross-user and enablement gates
//! - [`listeners`] - Listener handles, registry and delivery
//! - [`service`] - The coordination core, tracker and refresher
//! - [`events`] - Event bus for refresh and issue-action broadcasts
//! - [`ipc`] - Unix socket transport
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod access;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod events;
pub mod ipc;
pub mod listeners;
pub mod service;

pub use config::Config;
pub use error::{ServiceError, ServiceResult};
pub use service::CoordinationCore;
