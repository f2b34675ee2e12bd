//! Update source reading one topic of a [`PartitionedLog`].

use super::event_log::{LogMessage, PartitionConsumer, PartitionedLog, StartOffset};
use super::{send_or_cancel, UpdateSource};
use crate::cancel::CancellationToken;
use crate::codec::decode_update;
use crate::error::{NotifyError, Result};
use crate::types::Update;
use crossbeam_channel::{select, Sender};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Log source configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LogSourceConfig {
    /// Topic to consume.
    pub topic: String,

    /// Where each partition consumer starts.
    /// Default: newest (live only)
    pub start_offset: StartOffset,
}

impl Default for LogSourceConfig {
    fn default() -> Self {
        Self {
            topic: "chat.updates".to_string(),
            start_offset: StartOffset::Newest,
        }
    }
}

impl LogSourceConfig {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }
}

/// Counters for one log source, across all its partitions.
#[derive(Debug, Default)]
pub struct SourceStats {
    consumed: AtomicU64,
    decoded: AtomicU64,
    decode_failures: AtomicU64,
}

impl SourceStats {
    /// Messages read from the log.
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Messages that decoded into an update.
    pub fn decoded(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    /// Messages skipped because they did not decode.
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }
}

/// Consumes every partition of one topic, one worker thread per partition.
///
/// Workers decode each message and push it to the engine. Messages that do
/// not decode are logged, counted and skipped. `run` returns only after all
/// workers have stopped.
pub struct LogSource<L> {
    name: String,
    log: L,
    config: LogSourceConfig,
    stats: Arc<SourceStats>,
}

impl<L: PartitionedLog> LogSource<L> {
    pub fn new(log: L, config: LogSourceConfig) -> Self {
        Self {
            name: format!("log:{}", config.topic),
            log,
            config,
            stats: Arc::new(SourceStats::default()),
        }
    }

    pub fn config(&self) -> &LogSourceConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<SourceStats> {
        Arc::clone(&self.stats)
    }

    fn open_consumers(&self) -> Result<Vec<PartitionConsumer>> {
        let topic = &self.config.topic;
        let partitions = self.log.partitions(topic)?;
        partitions
            .into_iter()
            .map(|p| {
                self.log
                    .consume_partition(topic, p, self.config.start_offset)
            })
            .collect()
    }

    /// Drain one partition until cancellation or the partition closes.
    fn consume(
        &self,
        consumer: PartitionConsumer,
        cancel: &CancellationToken,
        out: &Sender<Update>,
    ) {
        let partition = consumer.partition();
        debug!(source = %self.name, partition, "partition worker started");

        loop {
            let message = select! {
                recv(cancel.receiver()) -> _ => break,
                recv(consumer.messages()) -> msg => match msg {
                    Ok(message) => message,
                    Err(_) => {
                        debug!(source = %self.name, partition, "partition closed");
                        break;
                    }
                },
            };

            let Some(update) = self.decode(&message) else {
                continue;
            };
            if !send_or_cancel(out, update, cancel) {
                break;
            }
        }

        debug!(source = %self.name, partition, "partition worker stopped");
    }

    fn decode(&self, message: &LogMessage) -> Option<Update> {
        self.stats.consumed.fetch_add(1, Ordering::Relaxed);
        match decode_update(&message.value) {
            Ok(update) => {
                self.stats.decoded.fetch_add(1, Ordering::Relaxed);
                Some(update)
            }
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    source = %self.name,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "skipping undecodable message"
                );
                None
            }
        }
    }
}

impl<L: PartitionedLog> UpdateSource for LogSource<L> {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, cancel: &CancellationToken, out: &Sender<Update>) -> Result<()> {
        let consumers = self.open_consumers().map_err(|e| {
            NotifyError::source_failure(&self.name, format!("cannot open partitions: {e}"))
        })?;
        info!(source = %self.name, partitions = consumers.len(), "consuming topic");

        thread::scope(|s| {
            for consumer in consumers {
                s.spawn(move || self.consume(consumer, cancel, out));
            }
        });

        if cancel.is_cancelled() {
            Err(NotifyError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_update;
    use crate::source::MemoryLog;
    use crate::types::{MessageSent, Timestamp, UpdateMeta};
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    fn message(text: &str) -> Update {
        Update::MessageSent(MessageSent {
            meta: UpdateMeta::new(Timestamp::from_unix_secs(1_681_588_800), ["alice"]),
            message_id: "m1".into(),
            from_user: "bob".into(),
            chat_id: "c1".into(),
            text: text.into(),
            reply_to: None,
            attachments: vec![],
        })
    }

    #[test]
    fn test_consumes_and_decodes() {
        let log = Arc::new(MemoryLog::new());
        log.create_topic("chat.updates", 1).unwrap();
        let bytes = encode_update(&message("Hello, world!")).unwrap();
        log.publish("chat.updates", 0, Some(b"c1".to_vec()), bytes).unwrap();

        let source = LogSource::new(
            Arc::clone(&log),
            LogSourceConfig {
                topic: "chat.updates".into(),
                start_offset: StartOffset::Oldest,
            },
        );
        let (tx, rx) = unbounded();
        let cancel = CancellationToken::new();

        thread::scope(|s| {
            let worker = s.spawn(|| source.run(&cancel, &tx));
            let update = rx.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(update, message("Hello, world!"));
            cancel.cancel();
            assert!(worker.join().unwrap().unwrap_err().is_cancellation());
        });
    }

    #[test]
    fn test_skips_undecodable_messages() {
        let log = Arc::new(MemoryLog::new());
        log.create_topic("chat.updates", 2).unwrap();
        log.publish("chat.updates", 0, None, b"\xc1garbage".to_vec())
            .unwrap();
        let bytes = encode_update(&message("after garbage")).unwrap();
        log.publish("chat.updates", 0, None, bytes).unwrap();

        let source = LogSource::new(
            Arc::clone(&log),
            LogSourceConfig {
                topic: "chat.updates".into(),
                start_offset: StartOffset::Oldest,
            },
        );
        let stats = source.stats();
        let (tx, rx) = unbounded();

        thread::scope(|s| {
            s.spawn(|| source.run(&CancellationToken::new(), &tx));
            let update = rx.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(update, message("after garbage"));
            // Closing the log ends every partition worker.
            log.close();
        });

        assert_eq!(stats.consumed(), 2);
        assert_eq!(stats.decoded(), 1);
        assert_eq!(stats.decode_failures(), 1);
    }

    #[test]
    fn test_missing_topic_fails() {
        let source = LogSource::new(MemoryLog::new(), LogSourceConfig::topic("missing"));
        let (tx, _rx) = unbounded();
        let result = source.run(&CancellationToken::new(), &tx);
        assert!(matches!(result, Err(NotifyError::Source { .. })));
    }

    #[test]
    fn test_returns_when_log_closes() {
        let log = Arc::new(MemoryLog::new());
        log.create_topic("chat.updates", 3).unwrap();
        let source = LogSource::new(Arc::clone(&log), LogSourceConfig::default());
        let (tx, rx) = unbounded();
        let bytes = encode_update(&message("ping")).unwrap();

        thread::scope(|s| {
            let worker = s.spawn(|| source.run(&CancellationToken::new(), &tx));
            // Consumers start at the newest offset: publish until one is live.
            loop {
                log.publish("chat.updates", 0, None, bytes.clone()).unwrap();
                if rx.recv_timeout(Duration::from_millis(10)).is_ok() {
                    break;
                }
            }
            log.close();
            assert!(worker.join().unwrap().is_ok());
        });
    }
}
