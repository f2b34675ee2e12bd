//! Fan-out engine tying sources, dispatch and the listener registry together.

use crate::cancel::CancellationToken;
use crate::error::{NotifyError, Result};
use crate::registry::{DeliveryReport, ListenerRegistry, Subscription, DEFAULT_QUEUE_CAPACITY};
use crate::source::UpdateSource;
use crate::types::{Update, UserId};
use crossbeam_channel::{bounded, never, select, unbounded, Receiver};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// Engine configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Updates buffered per listener before new ones are dropped for it.
    /// Larger values absorb bursts at the cost of memory per connection.
    /// Default: 16
    pub queue_capacity: usize,

    /// Updates buffered between the sources and the dispatch loop.
    /// Default: 16
    pub merge_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            merge_capacity: 16,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(NotifyError::InvalidConfig(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.merge_capacity == 0 {
            return Err(NotifyError::InvalidConfig(
                "merge_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of one engine. Only moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, `run` not called yet.
    Idle,
    /// `run` is active.
    Running,
    /// Cancellation observed, waiting for sources to return.
    Draining,
    /// `run` returned. Terminal.
    Stopped,
}

/// Point-in-time engine counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineStats {
    pub state: EngineState,
    /// Updates routed by the dispatch path.
    pub dispatched: u64,
    /// Updates of unknown kind that were not routed.
    pub skipped_unknown: u64,
    pub listeners: usize,
    pub users: usize,
    /// Queue deliveries across all listeners.
    pub delivered: u64,
    /// Updates dropped on full listener queues.
    pub dropped: u64,
}

type SourceOutcome = (usize, thread::Result<Result<()>>);

/// Routes updates from the configured sources to every listener in each
/// update's audience.
///
/// Share it behind an `Arc`: one thread calls [`run`](Self::run) while
/// connection handlers call [`listen`](Self::listen).
pub struct FanoutEngine {
    config: EngineConfig,
    registry: Arc<ListenerRegistry>,
    sources: Vec<Box<dyn UpdateSource>>,
    state: Mutex<EngineState>,
    dispatched: AtomicU64,
    skipped_unknown: AtomicU64,
}

impl FanoutEngine {
    /// Create an engine with no sources.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry: ListenerRegistry::with_queue_capacity(config.queue_capacity),
            config,
            sources: Vec::new(),
            state: Mutex::new(EngineState::Idle),
            dispatched: AtomicU64::new(0),
            skipped_unknown: AtomicU64::new(0),
        })
    }

    /// Add a source. Sources only take effect before `run`.
    pub fn with_source(mut self, source: impl UpdateSource + 'static) -> Self {
        self.add_source(Box::new(source));
        self
    }

    pub fn add_source(&mut self, source: Box<dyn UpdateSource>) {
        debug!(source = source.name(), "source added");
        self.sources.push(source);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Attach a listener for `user_id`.
    pub fn listen(&self, user_id: impl Into<UserId>) -> Subscription {
        self.registry.attach(user_id)
    }

    /// Detach every listener, ending their streams. Not done by `run`:
    /// cancelling the engine leaves subscribers attached.
    pub fn close_listeners(&self) -> usize {
        self.registry.close_all()
    }

    pub fn stats(&self) -> EngineStats {
        let totals = self.registry.totals();
        EngineStats {
            state: self.state(),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            skipped_unknown: self.skipped_unknown.load(Ordering::Relaxed),
            listeners: totals.listeners,
            users: totals.users,
            delivered: totals.delivered,
            dropped: totals.dropped,
        }
    }

    /// Route one update to every listener of every audience member.
    ///
    /// Each audience member gets at most one copy per listener, even if
    /// listed twice. Unknown kinds are logged and skipped.
    pub fn dispatch(&self, update: Update) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        if update.is_unknown() {
            self.skipped_unknown.fetch_add(1, Ordering::Relaxed);
            warn!(kind = update.kind(), "skipping update of unknown kind");
            return report;
        }

        let update = Arc::new(update);
        let mut seen = HashSet::with_capacity(update.audience().len());
        for user_id in update.audience() {
            if seen.insert(user_id) {
                report.merge(self.registry.deliver_to(user_id, &update));
            }
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        debug!(
            kind = update.kind(),
            audience = update.audience().len(),
            delivered = report.delivered,
            dropped = report.dropped,
            "update dispatched"
        );
        report
    }

    /// Run every source and the dispatch loop until all sources return.
    ///
    /// Cancelling `cancel` asks the sources to stop; updates already in the
    /// merged channel are still dispatched. Returns `Ok(())` on a clean stop
    /// or cancellation, otherwise the first source failure. A failing source
    /// does not stop the others.
    ///
    /// Valid once per engine; later calls return `NotifyError::AlreadyRunning`.
    pub fn run(&self, cancel: &CancellationToken) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != EngineState::Idle {
                return Err(NotifyError::AlreadyRunning);
            }
            *state = EngineState::Running;
        }
        info!(sources = self.sources.len(), "fan-out engine running");

        let (merged_tx, merged_rx) = bounded::<Update>(self.config.merge_capacity);
        let (done_tx, done_rx) = unbounded::<SourceOutcome>();

        let outcome = thread::scope(|s| {
            let dispatcher = s.spawn(move || self.dispatch_loop(merged_rx));

            for (index, source) in self.sources.iter().enumerate() {
                let out = merged_tx.clone();
                let done = done_tx.clone();
                s.spawn(move || {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| source.run(cancel, &out)));
                    // Release the merged sender before reporting, so the channel
                    // closes once the last source has returned.
                    drop(out);
                    let _ = done.send((index, result));
                });
            }
            drop(merged_tx);
            drop(done_tx);

            let first_error = self.await_sources(&done_rx, cancel);
            match dispatcher.join() {
                Ok(()) => first_error,
                Err(_) => Some(first_error.unwrap_or(NotifyError::DispatchPanicked)),
            }
        });

        *self.state.lock() = EngineState::Stopped;
        match outcome {
            None => {
                info!("fan-out engine stopped");
                Ok(())
            }
            Some(e) => {
                error!(error = %e, "fan-out engine stopped with error");
                Err(e)
            }
        }
    }

    /// Collect every source outcome. Returns the first failure.
    fn await_sources(
        &self,
        done: &Receiver<SourceOutcome>,
        cancel: &CancellationToken,
    ) -> Option<NotifyError> {
        let idle: Receiver<()> = never();
        let mut remaining = self.sources.len();
        let mut draining = false;
        let mut first_error = None;

        while remaining > 0 {
            // Cancellation stays ready once fired; stop polling it after that.
            let cancelled = if draining { &idle } else { cancel.receiver() };
            select! {
                recv(cancelled) -> _ => {
                    draining = true;
                    *self.state.lock() = EngineState::Draining;
                    info!(remaining, "cancellation observed, draining sources");
                }
                recv(done) -> msg => {
                    let Ok((index, result)) = msg else { break };
                    remaining -= 1;
                    let name = self.sources[index].name();
                    match result {
                        Ok(Ok(())) => debug!(source = name, "source finished"),
                        Ok(Err(e)) if e.is_cancellation() => {
                            debug!(source = name, "source cancelled")
                        }
                        Ok(Err(e)) => {
                            error!(source = name, error = %e, "source failed");
                            first_error.get_or_insert(e);
                        }
                        Err(_) => {
                            error!(source = name, "source panicked");
                            first_error.get_or_insert(NotifyError::SourcePanicked(name.to_string()));
                        }
                    }
                }
            }
        }
        first_error
    }

    /// Drain the merged channel until every source has released it.
    fn dispatch_loop(&self, merged: Receiver<Update>) {
        debug!("dispatch loop started");
        for update in merged.iter() {
            self.dispatch(update);
        }
        debug!("merged stream closed, dispatch loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{send_or_cancel, ChannelSource, ReplaySource};
    use crate::types::{ChatCreated, Timestamp, UpdateMeta};
    use crossbeam_channel::Sender;
    use proptest::prelude::*;
    use std::time::Duration;

    fn chat_created(chat_id: &str, audience: &[&str]) -> Update {
        Update::ChatCreated(ChatCreated {
            meta: UpdateMeta::new(Timestamp(1), audience.iter().copied()),
            chat_id: chat_id.to_string(),
            is_direct: false,
            members: vec![],
        })
    }

    struct FailingSource;

    impl UpdateSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        fn run(&self, _cancel: &CancellationToken, _out: &Sender<Update>) -> Result<()> {
            Err(NotifyError::source_failure("failing", "broker unreachable"))
        }
    }

    struct PanickingSource;

    impl UpdateSource for PanickingSource {
        fn name(&self) -> &str {
            "panicking"
        }

        fn run(&self, _cancel: &CancellationToken, _out: &Sender<Update>) -> Result<()> {
            panic!("decoder bug")
        }
    }

    /// Sends one update, then waits for cancellation.
    struct OneThenWait(Update);

    impl UpdateSource for OneThenWait {
        fn name(&self) -> &str {
            "one-then-wait"
        }

        fn run(&self, cancel: &CancellationToken, out: &Sender<Update>) -> Result<()> {
            send_or_cancel(out, self.0.clone(), cancel);
            cancel.wait();
            Err(NotifyError::Cancelled)
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(EngineConfig::default().validate().is_ok());
        let bad = EngineConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            FanoutEngine::new(bad),
            Err(NotifyError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"queue_capacity": 64}"#).unwrap();
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.merge_capacity, 16);
    }

    #[test]
    fn test_dispatch_routes_by_audience() {
        let engine = FanoutEngine::new(EngineConfig::default()).unwrap();
        let alice = engine.listen("alice");
        let carol = engine.listen("carol");

        let report = engine.dispatch(chat_created("c1", &["alice", "bob"]));
        assert_eq!(report.delivered, 1);

        assert!(alice.try_recv().is_ok());
        assert!(carol.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_dedups_audience() {
        let engine = FanoutEngine::new(EngineConfig::default()).unwrap();
        let alice = engine.listen("alice");

        engine.dispatch(chat_created("c1", &["alice", "alice"]));
        assert!(alice.try_recv().is_ok());
        assert!(alice.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_skips_unknown() {
        let engine = FanoutEngine::new(EngineConfig::default()).unwrap();
        let alice = engine.listen("alice");

        let report = engine.dispatch(Update::Unknown {
            meta: UpdateMeta::new(Timestamp(1), ["alice"]),
            kind: "chat_archived".into(),
        });
        assert_eq!(report, DeliveryReport::default());
        assert!(alice.try_recv().is_err());
        assert_eq!(engine.stats().skipped_unknown, 1);
    }

    #[test]
    fn test_run_without_sources_returns() {
        let engine = FanoutEngine::new(EngineConfig::default()).unwrap();
        assert!(engine.run(&CancellationToken::new()).is_ok());
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn test_second_run_rejected() {
        let engine = FanoutEngine::new(EngineConfig::default()).unwrap();
        engine.run(&CancellationToken::new()).unwrap();
        assert!(matches!(
            engine.run(&CancellationToken::new()),
            Err(NotifyError::AlreadyRunning)
        ));
    }

    #[test]
    fn test_failing_source_reported_after_others_finish() {
        let engine = FanoutEngine::new(EngineConfig::default())
            .unwrap()
            .with_source(FailingSource)
            .with_source(ReplaySource::new("replay", vec![chat_created("c1", &["alice"])]));
        let alice = engine.listen("alice");

        let result = engine.run(&CancellationToken::new());
        assert!(matches!(result, Err(NotifyError::Source { .. })));
        // The healthy source still delivered.
        assert!(alice.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_panicking_source_is_contained() {
        let engine = FanoutEngine::new(EngineConfig::default())
            .unwrap()
            .with_source(PanickingSource);
        let result = engine.run(&CancellationToken::new());
        assert!(matches!(result, Err(NotifyError::SourcePanicked(name)) if name == "panicking"));
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn test_cancel_stops_run_and_keeps_listeners() {
        let engine = FanoutEngine::new(EngineConfig::default())
            .unwrap()
            .with_source(OneThenWait(chat_created("c1", &["alice"])));
        let alice = engine.listen("alice");
        let cancel = CancellationToken::new();

        thread::scope(|s| {
            let run = s.spawn(|| engine.run(&cancel));
            assert!(alice.recv_timeout(Duration::from_secs(1)).is_ok());
            assert_eq!(engine.state(), EngineState::Running);
            cancel.cancel();
            assert!(run.join().unwrap().is_ok());
        });

        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(!alice.is_detached());
        assert_eq!(engine.stats().listeners, 1);
    }

    #[test]
    fn test_channel_source_through_engine() {
        let (producer, receiver) = unbounded();
        let engine = FanoutEngine::new(EngineConfig::default())
            .unwrap()
            .with_source(ChannelSource::new("inproc", receiver));
        let alice = engine.listen("alice");

        thread::scope(|s| {
            let run = s.spawn(|| engine.run(&CancellationToken::new()));
            for i in 0..5 {
                producer.send(chat_created(&i.to_string(), &["alice"])).unwrap();
            }
            drop(producer);
            assert!(run.join().unwrap().is_ok());
        });

        assert_eq!(alice.stream().take(5).count(), 5);
        assert_eq!(engine.stats().dispatched, 5);
    }

    proptest! {
        #[test]
        fn prop_each_member_listener_gets_exactly_one_copy(
            listeners in prop::collection::vec(0u8..6, 0..16),
            audience in prop::collection::vec(0u8..6, 0..10),
        ) {
            let engine = FanoutEngine::new(EngineConfig::default()).unwrap();
            let subs: Vec<(u8, Subscription)> = listeners
                .iter()
                .map(|&u| (u, engine.listen(format!("u{u}"))))
                .collect();

            let names: Vec<String> = audience.iter().map(|u| format!("u{u}")).collect();
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            engine.dispatch(chat_created("c1", &names));

            for (user, sub) in &subs {
                let expected = usize::from(audience.contains(user));
                prop_assert_eq!(sub.receiver().try_iter().count(), expected);
            }
        }
    }
}
