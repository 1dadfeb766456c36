//! Event bus for refresh broadcasts
//!
//! The refresher and the core publish [`ScEvent`]s on a tokio broadcast
//! channel. Sources (and the daemon's log) subscribe to learn when they are
//! asked to refresh or to run an issue action.
//!
//! ```text
//!   CoordinationCore ──refresh──► BroadcastRefresher ──emit──┐
//!   CoordinationCore ──execute_issue_action──emit────────────┤
//!                                                            ▼
//!                                                       EventBus
//!                                                   ┌───────┴───────┐
//!                                                   ▼               ▼
//!                                              sources        event logger
//! ```

mod bus;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, SourceFeed, spawn_event_logger};
pub use types::ScEvent;
