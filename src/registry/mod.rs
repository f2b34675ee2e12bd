//! Listener registry for live update delivery.
//!
//! This module maps user identities to any number of attached listeners
//! (one per connected device):
//! - Attach never fails, for any identity
//! - Detach is idempotent and closes the listener's queue exactly once
//! - Delivery never blocks: a full queue drops the update for that listener
//!   and bumps its dropped counter
//!
//! # Example
//!
//! ```ignore
//! let registry = ListenerRegistry::new();
//! let subscription = registry.attach("alice");
//!
//! registry.deliver_to(&"alice".into(), &update);
//!
//! for update in subscription.stream() {
//!     println!("{} for alice", update.kind());
//! }
//! ```

mod manager;
mod types;

pub use manager::{ListenerRegistry, DEFAULT_QUEUE_CAPACITY};
pub use types::{DeliveryReport, ListenerStats, RegistryTotals, Subscription};
