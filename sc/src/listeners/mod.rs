//! Change listeners
//!
//! Observers subscribe a [`ListenerHandle`] under one user id. When the
//! aggregated view of a profile group changes, the core snapshots the
//! group's listeners under the fast lock and [`deliver`]s outside it.
//!
//! Delivery is best-effort: a failed handle is logged and skipped, never
//! evicted, and never stops fan-out to the rest.

mod handle;
mod registry;

pub use handle::{DataChangedListener, ListenerError, ListenerHandle, ListenerId, ListenerUpdate};
pub use registry::{DeliveryReport, ListenerRegistry, ListenerSet, deliver, deliver_to};
