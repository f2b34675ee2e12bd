//! # Notification Hub
//!
//! Real-time fan-out of chat updates to connected subscribers.
//!
//! ## Core Concepts
//!
//! - **Updates**: Immutable chat events, each with an audience of users
//! - **Sources**: Producers of updates (event-log partitions, in-process channels)
//! - **Registry**: Live listener queues per user, one per connected device
//! - **Engine**: Merges all sources and multicasts each update to its audience
//!
//! Delivery is best-effort: a listener whose queue is full misses the update,
//! and nothing is kept for listeners that are not attached.
//!
//! ## Example
//!
//! ```ignore
//! use notification_hub::{
//!     CancellationToken, EngineConfig, FanoutEngine, LogSource, LogSourceConfig, MemoryLog,
//! };
//! use std::sync::Arc;
//!
//! let log = Arc::new(MemoryLog::new());
//! log.create_topic("chat.updates", 4)?;
//!
//! let engine = Arc::new(
//!     FanoutEngine::new(EngineConfig::default())?
//!         .with_source(LogSource::new(log.clone(), LogSourceConfig::topic("chat.updates"))),
//! );
//!
//! let cancel = CancellationToken::new();
//! let runner = {
//!     let (engine, cancel) = (engine.clone(), cancel.clone());
//!     std::thread::spawn(move || engine.run(&cancel))
//! };
//!
//! // One per accepted connection
//! let subscription = engine.listen("alice");
//! for update in subscription.stream() {
//!     println!("alice got {}", update.kind());
//! }
//! ```

pub mod cancel;
pub mod codec;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod registry;
pub mod source;
pub mod types;

// Re-exports
pub use cancel::CancellationToken;
pub use codec::{decode_update, encode_update};
pub use delivery::{
    serve_listener, IdentityResolver, Notification, NotificationAttachment, NotificationSink,
    RequestContext, StaticTokenResolver, AUTH_HEADER,
};
pub use engine::{EngineConfig, EngineState, EngineStats, FanoutEngine};
pub use error::{DecodeError, NotifyError, Result};
pub use registry::{
    DeliveryReport, ListenerRegistry, ListenerStats, RegistryTotals, Subscription,
    DEFAULT_QUEUE_CAPACITY,
};
pub use source::{
    send_or_cancel, ChannelSource, LogMessage, LogSource, LogSourceConfig, MemoryLog,
    PartitionConsumer, PartitionedLog, ReplaySource, SourceStats, StartOffset, UpdateSource,
};
pub use types::*;
