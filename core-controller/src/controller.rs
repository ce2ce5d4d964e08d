//! # Controller
//!
//! Wires a [`Reflector`], a [`Store`], a [`RateLimitingQueue`] and a pool of
//! workers around one [`SyncHandler`].
//!
//! ## Startup
//!
//! 1. `Idle -> Syncing`: the reflector is spawned.
//! 2. Wait for the cache-sync barrier. Each wait is bounded by
//!    `cache_sync_timeout`; on timeout it is logged and retried. Workers never
//!    start against an unsynced cache.
//! 3. `Syncing -> Running`: `workers` tasks start draining the queue.
//!
//! If the stop token fires while syncing, the controller goes straight to
//! `Stopped` without starting a worker.
//!
//! ## Shutdown
//!
//! `Running -> Draining`: the queue is shut down, in-flight keys finish,
//! workers exit, the reflector is stopped. Then `Draining -> Stopped`.
//!
//! ## Retry policy
//!
//! - success: the key's failure history is forgotten
//! - failure with deliveries left: re-added through the rate limiter
//! - failure on the last delivery: forgotten and reported once to the
//!   [`ErrorSink`]
//!
//! A panicking handler counts as a failed delivery.

use bridge_traits::{ListWatcher, Resource};
use core_runtime::config::ControllerConfig;
use core_runtime::events::{ControllerEvent, EventBus, LifecycleEvent, WorkerEvent};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::barrier::CacheSyncBarrier;
use crate::error::{ControllerError, Result, SyncError};
use crate::handler::{ErrorSink, SyncHandler, TracingErrorSink};
use crate::key::ObjectKey;
use crate::queue::{controller_rate_limiter, RateLimitingQueue};
use crate::reflector::Reflector;
use crate::state::{ControllerState, StateCell};
use crate::store::{Indexers, Store};

pub struct Controller<T: Resource> {
    config: ControllerConfig,
    source: Arc<dyn ListWatcher<T>>,
    handler: Arc<dyn SyncHandler<T>>,
    error_sink: Arc<dyn ErrorSink>,
    store: Arc<Store<T>>,
    queue: Arc<RateLimitingQueue>,
    barrier: Arc<CacheSyncBarrier>,
    state: StateCell,
    events: EventBus,
}

impl<T: Resource> Controller<T> {
    /// Create a controller. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` fails validation.
    pub fn new(
        config: ControllerConfig,
        source: Arc<dyn ListWatcher<T>>,
        handler: Arc<dyn SyncHandler<T>>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = RateLimitingQueue::new(Arc::new(controller_rate_limiter(
            &config.rate_limiter,
        )));

        Ok(Self {
            error_sink: Arc::new(TracingErrorSink::new(config.name.clone())),
            events: EventBus::new(config.event_buffer_size),
            config,
            source,
            handler,
            store: Arc::new(Store::new()),
            queue: Arc::new(queue),
            barrier: Arc::new(CacheSyncBarrier::new()),
            state: StateCell::new(),
        })
    }

    /// Replace the store with one maintaining `indexers`
    pub fn with_indexers(mut self, indexers: Indexers<T>) -> Self {
        self.store = Arc::new(Store::with_indexers(indexers));
        self
    }

    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    /// Publish events on a shared bus instead of the controller's own
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store<T>> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<RateLimitingQueue> {
        &self.queue
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> ControllerState {
        self.state.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    pub fn has_synced(&self) -> bool {
        self.barrier.has_synced()
    }

    /// Run until `cancel` fires
    ///
    /// A controller runs once; calling `run` again returns
    /// [`ControllerError::AlreadyRunning`].
    #[instrument(skip_all, fields(controller = %self.config.name))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.transition(ControllerState::Syncing)
            .map_err(|_| ControllerError::AlreadyRunning(self.config.name.clone()))?;

        let reflector_cancel = cancel.child_token();
        let reflector = Reflector::new(
            self.config.name.clone(),
            Arc::clone(&self.source),
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            Arc::clone(&self.barrier),
        )
        .with_backoff(self.config.reflector_backoff.clone())
        .with_resync_period(self.config.resync_period())
        .with_event_bus(self.events.clone());

        let reflector_handle = {
            let token = reflector_cancel.clone();
            tokio::spawn(async move { reflector.run(token).await })
        };

        if !self.wait_for_cache_sync(&cancel).await || cancel.is_cancelled() {
            info!("Stopped before the cache synced, no workers started");
            self.queue.shut_down();
            reflector_cancel.cancel();
            if let Err(e) = reflector_handle.await {
                error!("Reflector task failed: {}", e);
            }
            self.transition(ControllerState::Stopped)?;
            return Ok(());
        }

        self.transition(ControllerState::Running)?;
        self.events
            .emit(ControllerEvent::Lifecycle(LifecycleEvent::CacheSynced {
                controller: self.config.name.clone(),
                items: self.store.len(),
            }))
            .ok();

        let worker = Arc::new(Worker {
            controller: self.config.name.clone(),
            max_retries: self.config.max_retries,
            handler: Arc::clone(&self.handler),
            error_sink: Arc::clone(&self.error_sink),
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            events: self.events.clone(),
        });

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers {
            let worker = Arc::clone(&worker);
            workers.spawn(async move { worker.run(id).await });
        }
        info!(workers = self.config.workers, "Controller running");

        cancel.cancelled().await;

        self.transition(ControllerState::Draining)?;
        self.queue.shut_down();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }

        reflector_cancel.cancel();
        if let Err(e) = reflector_handle.await {
            error!("Reflector task failed: {}", e);
        }

        self.transition(ControllerState::Stopped)?;
        Ok(())
    }

    /// Returns `false` if `cancel` fired before the cache synced
    async fn wait_for_cache_sync(&self, cancel: &CancellationToken) -> bool {
        let budget = self.config.cache_sync_timeout();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                waited = tokio::time::timeout(budget, self.barrier.wait()) => match waited {
                    Ok(()) => return true,
                    Err(_) => {
                        warn!(
                            waited_ms = budget.as_millis() as u64,
                            "Timed out waiting for cache sync, still waiting"
                        );
                        self.events
                            .emit(ControllerEvent::Lifecycle(LifecycleEvent::CacheSyncTimedOut {
                                controller: self.config.name.clone(),
                                waited_ms: budget.as_millis() as u64,
                            }))
                            .ok();
                    }
                },
            }
        }
    }

    fn transition(&self, to: ControllerState) -> Result<ControllerState> {
        let from = self.state.transition(to)?;
        info!(from = %from, to = %to, "Controller state changed");
        self.events
            .emit(ControllerEvent::Lifecycle(LifecycleEvent::StateChanged {
                controller: self.config.name.clone(),
                from: from.to_string(),
                to: to.to_string(),
            }))
            .ok();
        Ok(from)
    }
}

impl<T: Resource> std::fmt::Debug for Controller<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.config.name)
            .field("state", &self.state.current())
            .field("store", &self.store)
            .field("queue", &self.queue)
            .finish()
    }
}

/// Shared by every worker task of one controller
struct Worker<T: Resource> {
    controller: String,
    max_retries: u32,
    handler: Arc<dyn SyncHandler<T>>,
    error_sink: Arc<dyn ErrorSink>,
    store: Arc<Store<T>>,
    queue: Arc<RateLimitingQueue>,
    events: EventBus,
}

impl<T: Resource> Worker<T> {
    async fn run(&self, id: usize) {
        debug!(controller = %self.controller, worker = id, "Worker started");
        while let Some(key) = self.queue.get().await {
            self.process(id, key).await;
        }
        debug!(controller = %self.controller, worker = id, "Worker exiting");
    }

    #[instrument(skip(self), fields(controller = %self.controller))]
    async fn process(&self, worker: usize, key: ObjectKey) {
        let attempt = self.queue.num_requeues(&key) + 1;

        let result = match AssertUnwindSafe(self.handler.sync(&key, &self.store))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload);
                error!(key = %key, panic = %message, "Sync handler panicked");
                self.emit(WorkerEvent::Panicked {
                    controller: self.controller.clone(),
                    key: key.to_string(),
                    message: message.clone(),
                });
                Err(SyncError::Panicked(message))
            }
        };

        match result {
            Ok(()) => {
                self.queue.forget(&key);
                debug!(key = %key, attempt, "Synced");
                self.emit(WorkerEvent::Synced {
                    controller: self.controller.clone(),
                    key: key.to_string(),
                    attempt,
                });
            }
            Err(err) if attempt < self.max_retries => {
                let delay = self.queue.add_rate_limited(key.clone());
                warn!(
                    key = %key,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "Sync failed, requeueing"
                );
                self.emit(WorkerEvent::Requeued {
                    controller: self.controller.clone(),
                    key: key.to_string(),
                    attempt,
                    message: err.to_string(),
                });
            }
            Err(err) => {
                self.queue.forget(&key);
                self.error_sink.report(&key, &err).await;
                self.emit(WorkerEvent::Dropped {
                    controller: self.controller.clone(),
                    key: key.to_string(),
                    attempts: attempt,
                    message: err.to_string(),
                });
            }
        }

        self.queue.done(&key);
    }

    fn emit(&self, event: WorkerEvent) {
        self.events.emit(ControllerEvent::Worker(event)).ok();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "unknown panic payload".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MockErrorSink;
    use async_trait::async_trait;
    use bridge_traits::{ListResult, ObjectMeta, WatchStream};
    use futures::StreamExt;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Lists a fixed set once, then keeps an empty watch open
    struct StaticSource {
        items: Vec<ObjectMeta>,
        list_delay: Duration,
    }

    #[async_trait]
    impl ListWatcher<ObjectMeta> for StaticSource {
        async fn list(&self) -> bridge_traits::error::Result<ListResult<ObjectMeta>> {
            tokio::time::sleep(self.list_delay).await;
            Ok(ListResult::new(self.items.clone()))
        }

        async fn watch(
            &self,
            _resource_version: Option<String>,
        ) -> bridge_traits::error::Result<WatchStream<ObjectMeta>> {
            Ok(futures::stream::pending().boxed())
        }
    }

    fn source(names: &[&str], list_delay: Duration) -> Arc<dyn ListWatcher<ObjectMeta>> {
        Arc::new(StaticSource {
            items: names
                .iter()
                .map(|n| ObjectMeta::namespaced("default", *n))
                .collect(),
            list_delay,
        })
    }

    /// Fails keys listed in `failing` a configurable number of times
    #[derive(Default)]
    struct ScriptedHandler {
        calls: Mutex<Vec<String>>,
        failures: Mutex<std::collections::HashMap<String, u32>>,
        panic_on: Option<String>,
    }

    impl ScriptedHandler {
        fn failing(key: &str, times: u32) -> Self {
            let handler = Self::default();
            handler.failures.lock().insert(key.to_string(), times);
            handler
        }

        fn calls_for(&self, key: &str) -> usize {
            self.calls.lock().iter().filter(|k| *k == key).count()
        }
    }

    #[async_trait]
    impl SyncHandler<ObjectMeta> for ScriptedHandler {
        async fn sync(
            &self,
            key: &ObjectKey,
            _store: &Store<ObjectMeta>,
        ) -> std::result::Result<(), SyncError> {
            self.calls.lock().push(key.to_string());
            if self.panic_on.as_deref() == Some(key.as_str()) {
                panic!("handler blew up on {}", key);
            }
            let mut failures = self.failures.lock();
            match failures.get_mut(key.as_str()) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    Err(SyncError::failed("scripted failure"))
                }
                _ => Ok(()),
            }
        }
    }

    fn config(max_retries: u32) -> ControllerConfig {
        ControllerConfig::builder()
            .name("test")
            .max_retries(max_retries)
            .item_backoff(Duration::from_millis(10), Duration::from_secs(1))
            .build()
            .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let mut config = config(5);
        config.workers = 0;
        let result = Controller::new(
            config,
            source(&[], Duration::ZERO),
            Arc::new(ScriptedHandler::default()),
        );
        assert!(matches!(result, Err(ControllerError::Runtime(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_forgets_and_emits_synced() {
        let handler = Arc::new(ScriptedHandler::default());
        let controller = Arc::new(
            Controller::new(config(5), source(&["a"], Duration::ZERO), handler.clone()).unwrap(),
        );
        let mut synced = controller
            .events()
            .stream()
            .filter(|e| matches!(e, ControllerEvent::Worker(WorkerEvent::Synced { .. })));

        let cancel = CancellationToken::new();
        let run = {
            let controller = Arc::clone(&controller);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await })
        };

        let event = synced.recv().await.unwrap();
        assert_eq!(event.controller(), "test");
        assert_eq!(handler.calls_for("default/a"), 1);
        assert_eq!(controller.queue().num_requeues(&ObjectKey::from("default/a")), 0);

        cancel.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(controller.state(), ControllerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_key_reported_once_to_sink() {
        let handler = Arc::new(ScriptedHandler::failing("default/b", u32::MAX));
        let mut sink = MockErrorSink::new();
        sink.expect_report()
            .withf(|key, err| key.as_str() == "default/b" && matches!(err, SyncError::Failed(_)))
            .times(1)
            .return_const(());

        let controller = Arc::new(
            Controller::new(config(3), source(&["b"], Duration::ZERO), handler.clone())
                .unwrap()
                .with_error_sink(Arc::new(sink)),
        );

        let cancel = CancellationToken::new();
        let run = {
            let controller = Arc::clone(&controller);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await })
        };

        settle().await;
        assert_eq!(handler.calls_for("default/b"), 3);
        assert!(controller.queue().stats().is_idle());

        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_a_failed_delivery() {
        let handler = Arc::new(ScriptedHandler {
            panic_on: Some("default/p".to_string()),
            ..Default::default()
        });
        let controller = Arc::new(
            Controller::new(config(2), source(&["p", "q"], Duration::ZERO), handler.clone())
                .unwrap(),
        );
        let mut panics = controller
            .events()
            .stream()
            .filter(|e| matches!(e, ControllerEvent::Worker(WorkerEvent::Panicked { .. })));
        let mut dropped = controller
            .events()
            .stream()
            .filter(|e| matches!(e, ControllerEvent::Worker(WorkerEvent::Dropped { .. })));

        let cancel = CancellationToken::new();
        let run = {
            let controller = Arc::clone(&controller);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await })
        };

        settle().await;
        assert_eq!(handler.calls_for("default/p"), 2);
        assert_eq!(handler.calls_for("default/q"), 1);
        assert!(panics.try_recv().is_some());
        match dropped.try_recv() {
            Some(Ok(ControllerEvent::Worker(WorkerEvent::Dropped { key, attempts, message, .. }))) => {
                assert_eq!(key, "default/p");
                assert_eq!(attempts, 2);
                assert!(message.contains("handler blew up"));
            }
            other => panic!("expected a dropped event, got {:?}", other),
        }

        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_sync_starts_no_workers() {
        let handler = Arc::new(ScriptedHandler::default());
        let controller = Arc::new(
            Controller::new(
                config(5),
                source(&["a"], Duration::from_secs(3600)),
                handler.clone(),
            )
            .unwrap(),
        );
        let mut states = controller.subscribe_state();

        let cancel = CancellationToken::new();
        let run = {
            let controller = Arc::clone(&controller);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await })
        };

        states
            .wait_for(|s| *s == ControllerState::Syncing)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(controller.state(), ControllerState::Stopped);
        assert!(!controller.has_synced());
        assert!(handler.calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_sync_timeout_is_retried() {
        let handler = Arc::new(ScriptedHandler::default());
        let config = ControllerConfig::builder()
            .name("slow")
            .cache_sync_timeout(Duration::from_secs(1))
            .build()
            .unwrap();
        let controller = Arc::new(
            Controller::new(config, source(&["a"], Duration::from_millis(2500)), handler.clone())
                .unwrap(),
        );
        let mut timeouts = controller.events().stream().filter(|e| {
            matches!(
                e,
                ControllerEvent::Lifecycle(LifecycleEvent::CacheSyncTimedOut { .. })
            )
        });

        let cancel = CancellationToken::new();
        let run = {
            let controller = Arc::clone(&controller);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await })
        };

        settle().await;
        assert_eq!(controller.state(), ControllerState::Running);
        assert_eq!(handler.calls_for("default/a"), 1);

        let mut timed_out = 0;
        while let Some(Ok(_)) = timeouts.try_recv() {
            timed_out += 1;
        }
        assert_eq!(timed_out, 2);

        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_twice_is_rejected() {
        let controller = Arc::new(
            Controller::new(
                config(5),
                source(&[], Duration::ZERO),
                Arc::new(ScriptedHandler::default()),
            )
            .unwrap(),
        );
        let cancel = CancellationToken::new();
        let run = {
            let controller = Arc::clone(&controller);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await })
        };

        let mut states = controller.subscribe_state();
        states
            .wait_for(|s| *s == ControllerState::Running)
            .await
            .unwrap();

        let second = controller.run(CancellationToken::new()).await;
        assert!(matches!(second, Err(ControllerError::AlreadyRunning(name)) if name == "test"));

        cancel.cancel();
        run.await.unwrap().unwrap();

        let after_stop = controller.run(CancellationToken::new()).await;
        assert!(matches!(after_stop, Err(ControllerError::AlreadyRunning(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_changes_are_published() {
        let controller = Arc::new(
            Controller::new(
                config(5),
                source(&[], Duration::ZERO),
                Arc::new(ScriptedHandler::default()),
            )
            .unwrap(),
        );
        let mut changes = controller.events().stream().filter(|e| {
            matches!(e, ControllerEvent::Lifecycle(LifecycleEvent::StateChanged { .. }))
        });

        let cancel = CancellationToken::new();
        let run = {
            let controller = Arc::clone(&controller);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await })
        };
        settle().await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        let mut path = Vec::new();
        while let Some(Ok(ControllerEvent::Lifecycle(LifecycleEvent::StateChanged { to, .. }))) =
            changes.try_recv()
        {
            path.push(to);
        }
        assert_eq!(path, vec!["syncing", "running", "draining", "stopped"]);
    }
}
