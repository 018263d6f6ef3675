//! Typed dispatch loop over a reliable queue.
//!
//! The dispatcher pops envelopes, routes them to the [`Assistant`]
//! registered for their type tag, and runs handlers on independently
//! spawned tasks gated by a semaphore of `max_concurrency` permits. A job
//! failure or panic is converted to an error value and surfaced on the
//! error channel; it never terminates the loop. Only the shutdown signal
//! does, and it is observed at the top of each cycle, so in-flight jobs
//! run to completion.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::assistant::{Assistant, JobData};
use crate::envelope;
use crate::error::QueueError;
use crate::queue::{PopOptions, ReliableQueue};

/// Configuration for a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of handlers running at one time.
    pub max_concurrency: usize,
    /// How long each pop cycle waits for an element.
    pub pop_timeout: Duration,
    /// Capacity of the error channel.
    pub error_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            pop_timeout: Duration::from_secs(1),
            error_capacity: 32,
        }
    }
}

impl DispatcherConfig {
    /// Creates a configuration with the given concurrency bound.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            ..Default::default()
        }
    }

    /// Sets the per-cycle pop wait.
    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    /// Sets the error channel capacity.
    pub fn with_error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity;
        self
    }
}

/// Pops envelopes from a [`ReliableQueue`] and routes them to registered
/// assistants under a concurrency bound.
pub struct Dispatcher {
    queue: Arc<ReliableQueue>,
    config: DispatcherConfig,
    /// Type tag to handler. Written at registration time, read every cycle.
    assistants: RwLock<HashMap<String, Arc<dyn Assistant>>>,
    /// Concurrency token pool; one permit per running handler.
    permits: Arc<Semaphore>,
    /// Error channel sender, set lazily by [`Dispatcher::errors`].
    error_tx: Mutex<Option<mpsc::Sender<QueueError>>>,
}

impl Dispatcher {
    /// Creates a dispatcher over `queue`.
    pub fn new(queue: Arc<ReliableQueue>, config: DispatcherConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            queue,
            config,
            assistants: RwLock::new(HashMap::new()),
            permits,
            error_tx: Mutex::new(None),
        }
    }

    /// Registers `assistant` under the type tag its data reports.
    ///
    /// Upsert semantics: registering a second assistant for the same tag
    /// replaces the first.
    pub fn register_assistant(&self, assistant: Arc<dyn Assistant>) {
        let tag = assistant.new_data().name().to_string();
        self.assistants
            .write()
            .expect("registry lock poisoned")
            .insert(tag, assistant);
    }

    /// Marshals `data`, wraps it in an envelope, and pushes it onto the
    /// queue under the data's type tag.
    pub async fn push(&self, data: &dyn JobData) -> Result<(), QueueError> {
        let raw = data
            .marshal()
            .map_err(|e| QueueError::Marshal(e.to_string()))?;
        let wire = envelope::encode(data.name(), &raw)?;
        self.queue.push(&wire).await
    }

    /// Returns the receiving end of a fresh error channel.
    ///
    /// Each call replaces the channel: reports from this point on go to
    /// the newest receiver, and one from an earlier call stops receiving.
    /// Call this once, before `run`.
    ///
    /// The channel carries per-job handler errors as well as per-cycle pop
    /// errors, including the expected [`QueueError::Empty`] idle signal;
    /// consumers must filter with
    /// [`is_empty_signal`](QueueError::is_empty_signal). Delivery is
    /// best-effort: when the channel is full, new reports are dropped
    /// rather than blocking the loop.
    pub fn errors(&self) -> mpsc::Receiver<QueueError> {
        let (tx, rx) = mpsc::channel(self.config.error_capacity);
        *self.error_tx.lock().expect("error channel lock poisoned") = Some(tx);
        rx
    }

    /// Runs the dispatch loop until `shutdown` fires.
    ///
    /// The queue must have been [`init`](ReliableQueue::init)ed first.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            queue = %self.queue.key(),
            max_concurrency = self.config.max_concurrency,
            "Dispatcher started"
        );

        let pop_opts = PopOptions::default().with_wait_timeout(self.config.pop_timeout);

        loop {
            // Shutdown is only observed between cycles; jobs that already
            // hold a permit are never preempted.
            match shutdown.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(queue = %self.queue.key(), "Dispatcher received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let wire = match self.queue.pop(&pop_opts).await {
                Ok(wire) => wire,
                Err(e) if e.is_empty_signal() => {
                    debug!(queue = %self.queue.key(), "No jobs available");
                    self.report(e);
                    continue;
                }
                Err(e) => {
                    error!(queue = %self.queue.key(), error = %e, "Failed to pop job");
                    self.report(e);
                    continue;
                }
            };

            let (tag, payload) = match envelope::decode(&wire) {
                Ok((tag, payload)) => (tag.to_string(), payload.to_vec()),
                Err(e) => {
                    warn!(queue = %self.queue.key(), error = %e, "Dropping malformed envelope");
                    self.report(e);
                    continue;
                }
            };

            // Backpressure point: waits here when max_concurrency handlers
            // are already running.
            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                break;
            };

            let dispatcher = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = dispatcher.handle_job(&tag, &payload).await {
                    dispatcher.report(e);
                }
            });
        }

        info!(queue = %self.queue.key(), "Dispatcher stopped");
    }

    /// Looks up, decodes, and runs one job. Panics in the handler are
    /// caught and converted to [`QueueError::HandlerPanic`].
    async fn handle_job(&self, tag: &str, payload: &[u8]) -> Result<(), QueueError> {
        let assistant = {
            let registry = self.assistants.read().expect("registry lock poisoned");
            registry.get(tag).cloned()
        };

        let Some(assistant) = assistant else {
            warn!(tag = %tag, "No assistant registered; dropping job");
            return Err(QueueError::UnknownTag(tag.to_string()));
        };

        let work = async {
            let mut data = assistant.new_data();
            data.unmarshal(payload).map_err(|e| QueueError::Decode {
                tag: tag.to_string(),
                message: e.to_string(),
            })?;
            assistant
                .on_decoded(data)
                .await
                .map_err(|e| QueueError::Handler(e.to_string()))
        };

        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(QueueError::HandlerPanic(panic_message(&panic))),
        }
    }

    /// Best-effort delivery onto the error channel, if one was requested.
    fn report(&self, err: QueueError) {
        let tx = self.error_tx.lock().expect("error channel lock poisoned");
        if let Some(tx) = tx.as_ref() {
            if tx.try_send(err).is_err() {
                debug!("Error channel full; report dropped");
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::store::{ListStore, MemoryStore};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Note {
        tag: String,
        text: String,
    }

    impl Note {
        fn new(tag: &str, text: &str) -> Self {
            Self {
                tag: tag.to_string(),
                text: text.to_string(),
            }
        }
    }

    impl JobData for Note {
        fn name(&self) -> &str {
            &self.tag
        }

        fn marshal(&self) -> anyhow::Result<Vec<u8>> {
            Ok(serde_json::to_vec(&self.text)?)
        }

        fn unmarshal(&mut self, raw: &[u8]) -> anyhow::Result<()> {
            self.text = serde_json::from_slice(raw)?;
            Ok(())
        }
    }

    /// Records every payload it handles; can be told to fail or panic.
    struct RecordingAssistant {
        tag: String,
        seen: Mutex<Vec<String>>,
        mode: Mode,
    }

    enum Mode {
        Succeed,
        Fail,
        Panic,
    }

    impl RecordingAssistant {
        fn new(tag: &str, mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                tag: tag.to_string(),
                seen: Mutex::new(Vec::new()),
                mode,
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Assistant for RecordingAssistant {
        fn new_data(&self) -> Box<dyn JobData> {
            Box::new(Note::new(&self.tag, ""))
        }

        async fn on_decoded(&self, data: Box<dyn JobData>) -> anyhow::Result<()> {
            let note = data.name().to_string();
            let text = {
                // Round-trip through marshal to read the concrete payload
                // back out of the trait object.
                let raw = data.marshal()?;
                serde_json::from_slice::<String>(&raw)?
            };
            self.seen.lock().unwrap().push(format!("{note}:{text}"));
            match self.mode {
                Mode::Succeed => Ok(()),
                Mode::Fail => Err(anyhow::anyhow!("handler rejected {text}")),
                Mode::Panic => panic!("handler blew up on {text}"),
            }
        }
    }

    /// Blocks in the handler until the gate opens, tracking peak overlap.
    struct GatedAssistant {
        gate: Arc<Semaphore>,
        active: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }

    impl GatedAssistant {
        fn new(gate: Arc<Semaphore>) -> Arc<Self> {
            Arc::new(Self {
                gate,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                done: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Assistant for GatedAssistant {
        fn new_data(&self) -> Box<dyn JobData> {
            Box::new(Note::new("gated", ""))
        }

        async fn on_decoded(&self, _data: Box<dyn JobData>) -> anyhow::Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let _release = self.gate.acquire().await?;

            self.active.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fixture(key: &str, config: DispatcherConfig) -> (Arc<MemoryStore>, Arc<Dispatcher>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(ReliableQueue::new(
            key,
            Arc::clone(&store) as Arc<dyn ListStore>,
        ));
        (store, Arc::new(Dispatcher::new(queue, config)))
    }

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig::default().with_pop_timeout(Duration::from_millis(20))
    }

    async fn run_for(dispatcher: &Arc<Dispatcher>, duration: Duration) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(Arc::clone(dispatcher).run(shutdown_rx));
        tokio::time::sleep(duration).await;
        let _ = shutdown_tx.send(());
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("dispatcher should stop after shutdown")
            .expect("dispatcher task should not panic");
    }

    #[test]
    fn test_config_defaults_and_builder() {
        let config = DispatcherConfig::default();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.pop_timeout, Duration::from_secs(1));
        assert_eq!(config.error_capacity, 32);

        let config = DispatcherConfig::new(8)
            .with_pop_timeout(Duration::from_millis(250))
            .with_error_capacity(64);
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.pop_timeout, Duration::from_millis(250));
        assert_eq!(config.error_capacity, 64);
    }

    #[tokio::test]
    async fn test_routes_to_matching_assistant_only() {
        let (_store, dispatcher) = fixture("route", fast_config());
        let a = RecordingAssistant::new("A", Mode::Succeed);
        let b = RecordingAssistant::new("B", Mode::Succeed);
        dispatcher.register_assistant(a.clone());
        dispatcher.register_assistant(b.clone());

        dispatcher.push(&Note::new("B", "for-b")).await.unwrap();
        run_for(&dispatcher, Duration::from_millis(200)).await;

        assert!(a.seen().is_empty(), "A must not be invoked");
        assert_eq!(b.seen(), vec!["B:for-b"], "B invoked exactly once");
    }

    #[tokio::test]
    async fn test_registration_is_upsert() {
        let (_store, dispatcher) = fixture("upsert", fast_config());
        let first = RecordingAssistant::new("A", Mode::Succeed);
        let second = RecordingAssistant::new("A", Mode::Succeed);
        dispatcher.register_assistant(first.clone());
        dispatcher.register_assistant(second.clone());

        dispatcher.push(&Note::new("A", "x")).await.unwrap();
        run_for(&dispatcher, Duration::from_millis(200)).await;

        assert!(first.seen().is_empty());
        assert_eq!(second.seen(), vec!["A:x"]);
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        let config = fast_config().with_pop_timeout(Duration::from_millis(10));
        let config = DispatcherConfig {
            max_concurrency: 2,
            ..config
        };
        let (_store, dispatcher) = fixture("bounded", config);

        let gate = Arc::new(Semaphore::new(0));
        let gated = GatedAssistant::new(Arc::clone(&gate));
        dispatcher.register_assistant(gated.clone());

        for i in 0..5 {
            dispatcher
                .push(&Note::new("gated", &format!("job-{i}")))
                .await
                .unwrap();
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(Arc::clone(&dispatcher).run(shutdown_rx));

        // Let the loop saturate while every handler is blocked on the gate.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            gated.active.load(Ordering::SeqCst),
            2,
            "no more than max_concurrency handlers may run at once"
        );

        gate.add_permits(5);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(gated.done.load(Ordering::SeqCst), 5, "all jobs finish once released");
        assert!(gated.peak.load(Ordering::SeqCst) <= 2);

        let _ = shutdown_tx.send(());
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("dispatcher should stop")
            .expect("dispatcher task should not panic");
    }

    #[tokio::test]
    async fn test_panic_isolation() {
        let (_store, dispatcher) = fixture("panics", fast_config());
        let panicking = RecordingAssistant::new("A", Mode::Panic);
        let healthy = RecordingAssistant::new("B", Mode::Succeed);
        dispatcher.register_assistant(panicking.clone());
        dispatcher.register_assistant(healthy.clone());
        let mut errors = dispatcher.errors();

        dispatcher.push(&Note::new("A", "boom")).await.unwrap();
        dispatcher.push(&Note::new("B", "fine")).await.unwrap();
        run_for(&dispatcher, Duration::from_millis(300)).await;

        assert_eq!(healthy.seen(), vec!["B:fine"], "loop survives the panic");

        let mut saw_panic = false;
        while let Ok(err) = errors.try_recv() {
            if matches!(err, QueueError::HandlerPanic(_)) {
                saw_panic = true;
            }
        }
        assert!(saw_panic, "panic must surface on the error channel");
    }

    #[tokio::test]
    async fn test_handler_error_surfaces_on_channel() {
        let (_store, dispatcher) = fixture("failures", fast_config());
        let failing = RecordingAssistant::new("A", Mode::Fail);
        dispatcher.register_assistant(failing.clone());
        let mut errors = dispatcher.errors();

        dispatcher.push(&Note::new("A", "nope")).await.unwrap();
        run_for(&dispatcher, Duration::from_millis(200)).await;

        let mut saw_handler_error = false;
        while let Ok(err) = errors.try_recv() {
            if let QueueError::Handler(message) = &err {
                assert!(message.contains("nope"));
                saw_handler_error = true;
            }
        }
        assert!(saw_handler_error);
    }

    #[tokio::test]
    async fn test_unknown_tag_is_reported() {
        let (_store, dispatcher) = fixture("unknown", fast_config());
        let mut errors = dispatcher.errors();

        dispatcher.push(&Note::new("ghost", "x")).await.unwrap();
        run_for(&dispatcher, Duration::from_millis(200)).await;

        let mut saw_unknown = false;
        while let Ok(err) = errors.try_recv() {
            if let QueueError::UnknownTag(tag) = &err {
                assert_eq!(tag, "ghost");
                saw_unknown = true;
            }
        }
        assert!(saw_unknown);
    }

    #[tokio::test]
    async fn test_errors_call_redirects_reports_to_newest_receiver() {
        let (_store, dispatcher) = fixture("rebind", fast_config());

        let mut stale = dispatcher.errors();
        let mut current = dispatcher.errors();

        dispatcher.report(QueueError::Empty);

        assert!(
            current.try_recv().is_ok(),
            "reports must reach the most recently returned receiver"
        );
        assert!(
            stale.try_recv().is_err(),
            "a receiver from an earlier call stops receiving"
        );
    }

    #[tokio::test]
    async fn test_idle_cycles_report_empty_signal() {
        let (_store, dispatcher) = fixture("idle", fast_config());
        let mut errors = dispatcher.errors();

        run_for(&dispatcher, Duration::from_millis(100)).await;

        let err = errors.try_recv().expect("idle cycle should be reported");
        assert!(err.is_empty_signal());
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_reported_and_skipped() {
        let (store, dispatcher) = fixture("malformed", fast_config());
        let healthy = RecordingAssistant::new("A", Mode::Succeed);
        dispatcher.register_assistant(healthy.clone());
        let mut errors = dispatcher.errors();

        // Raw value with no separator, pushed behind the dispatcher's back.
        store.push_head("malformed", "garbage").await.unwrap();
        dispatcher.push(&Note::new("A", "ok")).await.unwrap();
        run_for(&dispatcher, Duration::from_millis(300)).await;

        assert_eq!(healthy.seen(), vec!["A:ok"]);
        let mut saw_envelope_error = false;
        while let Ok(err) = errors.try_recv() {
            if matches!(err, QueueError::Envelope(_)) {
                saw_envelope_error = true;
            }
        }
        assert!(saw_envelope_error);
    }
}
