//! The coordination service
//!
//! [`CoordinationCore`] dispatches every call through the gates and the two
//! lock domains. The [`Tracker`] and [`Refresher`] it drives are traits so
//! the data model and the refresh mechanics can be swapped.

mod coordinator;
mod refresh;
mod tracker;

pub use coordinator::{CoordinationCore, CoreComponents};
pub use refresh::{BroadcastRefresher, RefreshTicket, Refresher};
pub use tracker::{InMemoryTracker, Tracker, issue_key};
