//! Partitioned, offset-addressed event log.
//!
//! [`PartitionedLog`] is the narrow view of a message broker the hub needs:
//! list a topic's partitions and tail one partition from a start offset.
//! [`MemoryLog`] is the in-process implementation used for local setups and
//! tests. By default it retains every message, so consumers can start
//! anywhere; [`MemoryLog::with_retention`] bounds each partition instead.

use crate::error::{NotifyError, Result};
use crate::types::Timestamp;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Where a new partition consumer begins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOffset {
    /// First retained message.
    Oldest,
    /// Only messages published after the consumer was opened.
    #[default]
    Newest,
    /// A specific offset (may equal the high watermark).
    At(u64),
}

/// One message read from a partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub timestamp: Timestamp,
}

/// Live reader of one partition.
///
/// The stream ends when the log is closed.
pub struct PartitionConsumer {
    topic: String,
    partition: u32,
    messages: Receiver<LogMessage>,
}

impl PartitionConsumer {
    pub fn new(topic: impl Into<String>, partition: u32, messages: Receiver<LogMessage>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn messages(&self) -> &Receiver<LogMessage> {
        &self.messages
    }
}

/// Broker-side operations the hub relies on.
pub trait PartitionedLog: Send + Sync {
    /// Partition ids of `topic`.
    fn partitions(&self, topic: &str) -> Result<Vec<u32>>;

    /// Open a consumer for one partition.
    fn consume_partition(
        &self,
        topic: &str,
        partition: u32,
        start: StartOffset,
    ) -> Result<PartitionConsumer>;
}

impl<L: PartitionedLog + ?Sized> PartitionedLog for Arc<L> {
    fn partitions(&self, topic: &str) -> Result<Vec<u32>> {
        (**self).partitions(topic)
    }

    fn consume_partition(
        &self,
        topic: &str,
        partition: u32,
        start: StartOffset,
    ) -> Result<PartitionConsumer> {
        (**self).consume_partition(topic, partition, start)
    }
}

#[derive(Default)]
struct Partition {
    /// Offset of `messages[0]`.
    first_offset: u64,
    messages: VecDeque<LogMessage>,
    /// Live consumers. Pruned when their receiver is gone.
    tails: Vec<Sender<LogMessage>>,
}

/// In-memory [`PartitionedLog`].
pub struct MemoryLog {
    topics: RwLock<HashMap<String, Arc<Vec<Mutex<Partition>>>>>,
    /// Messages kept per partition. `None` keeps everything.
    retention: Option<usize>,
    closed: AtomicBool,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            retention: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Keep at most `max_messages` (at least one) per partition; older
    /// messages are discarded and their offsets become unreachable.
    pub fn with_retention(max_messages: usize) -> Self {
        Self {
            retention: Some(max_messages.max(1)),
            ..Self::new()
        }
    }

    /// Create a topic with `partitions` partitions (at least one).
    pub fn create_topic(&self, topic: impl Into<String>, partitions: u32) -> Result<()> {
        self.check_open()?;
        let topic = topic.into();
        let mut topics = self.topics.write();
        if topics.contains_key(&topic) {
            return Err(NotifyError::TopicExists(topic));
        }
        let parts = (0..partitions.max(1))
            .map(|_| Mutex::new(Partition::default()))
            .collect();
        debug!(topic = %topic, partitions = partitions.max(1), "topic created");
        topics.insert(topic, Arc::new(parts));
        Ok(())
    }

    /// Append a message to one partition. Returns its offset.
    pub fn publish(
        &self,
        topic: &str,
        partition: u32,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
    ) -> Result<u64> {
        self.check_open()?;
        let parts = self.topic(topic)?;
        let slot = parts
            .get(partition as usize)
            .ok_or_else(|| NotifyError::PartitionNotFound {
                topic: topic.to_string(),
                partition,
            })?;

        let mut part = slot.lock();
        let offset = part.first_offset + part.messages.len() as u64;
        let message = LogMessage {
            topic: topic.to_string(),
            partition,
            offset,
            key,
            value,
            timestamp: Timestamp::now(),
        };
        // Unbounded senders: never blocks under the partition lock.
        part.tails.retain(|tail| tail.send(message.clone()).is_ok());
        part.messages.push_back(message);
        if let Some(limit) = self.retention {
            while part.messages.len() > limit {
                part.messages.pop_front();
                part.first_offset += 1;
            }
        }
        Ok(offset)
    }

    /// Append a message, choosing the partition from the key hash.
    pub fn publish_keyed(&self, topic: &str, key: &[u8], value: Vec<u8>) -> Result<(u32, u64)> {
        let count = self.topic(topic)?.len() as u64;
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let partition = (hasher.finish() % count) as u32;
        let offset = self.publish(topic, partition, Some(key.to_vec()), value)?;
        Ok((partition, offset))
    }

    /// Offset the next message of a partition will get.
    pub fn high_watermark(&self, topic: &str, partition: u32) -> Result<u64> {
        let parts = self.topic(topic)?;
        parts
            .get(partition as usize)
            .map(|p| {
                let part = p.lock();
                part.first_offset + part.messages.len() as u64
            })
            .ok_or_else(|| NotifyError::PartitionNotFound {
                topic: topic.to_string(),
                partition,
            })
    }

    /// End every consumer stream and reject further use.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for parts in self.topics.read().values() {
            for part in parts.iter() {
                part.lock().tails.clear();
            }
        }
        debug!("memory log closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(NotifyError::LogClosed)
        } else {
            Ok(())
        }
    }

    fn topic(&self, topic: &str) -> Result<Arc<Vec<Mutex<Partition>>>> {
        self.topics
            .read()
            .get(topic)
            .cloned()
            .ok_or_else(|| NotifyError::TopicNotFound(topic.to_string()))
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionedLog for MemoryLog {
    fn partitions(&self, topic: &str) -> Result<Vec<u32>> {
        let count = self.topic(topic)?.len() as u32;
        Ok((0..count).collect())
    }

    fn consume_partition(
        &self,
        topic: &str,
        partition: u32,
        start: StartOffset,
    ) -> Result<PartitionConsumer> {
        self.check_open()?;
        let parts = self.topic(topic)?;
        let slot = parts
            .get(partition as usize)
            .ok_or_else(|| NotifyError::PartitionNotFound {
                topic: topic.to_string(),
                partition,
            })?;

        let (tx, rx) = unbounded();
        let mut part = slot.lock();
        // Re-checked under the lock so `close` cannot miss this consumer.
        self.check_open()?;
        let first = part.first_offset;
        let end = first + part.messages.len() as u64;
        let from = match start {
            StartOffset::Oldest => first,
            StartOffset::Newest => end,
            StartOffset::At(offset) if (first..=end).contains(&offset) => offset,
            StartOffset::At(offset) => {
                return Err(NotifyError::OffsetOutOfRange {
                    topic: topic.to_string(),
                    partition,
                    offset,
                })
            }
        };

        // Replay and register under one lock so nothing is missed or repeated.
        for message in part.messages.iter().skip((from - first) as usize) {
            let _ = tx.send(message.clone());
        }
        part.tails.push(tx);

        Ok(PartitionConsumer::new(topic, partition, rx))
    }
}
