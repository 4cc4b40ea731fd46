//! Saga dispatcher: serialized load, handle and save under the saga lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::DispatchId;
use saga_locks::{LockGuard, SagaLocks};
use saga_store::{CorrelationKey, Revision, SagaId, SagaStore};

use crate::config::SagaConfig;
use crate::correlation::Resolution;
use crate::error::{Result, SagaError};
use crate::message::Message;
use crate::registry::{HandlerContext, Route, SagaRegistry};
use crate::state::DispatchStage;

/// How a successfully dispatched message was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The saga handled the message and its data was saved at `revision`.
    Handled {
        saga_id: SagaId,
        revision: Revision,
        created: bool,
    },

    /// The message does not start the saga and no instance exists for its
    /// key.
    Ignored { key: CorrelationKey },

    /// The message's correlation rule yielded no key.
    NoCorrelation,
}

/// Routes messages to sagas.
///
/// With pessimistic locking enabled, every dispatch acquires the saga lock
/// for its correlation key before loading the saga and releases it after
/// saving, so dispatches for one saga run one at a time while dispatches for
/// different sagas run in parallel. The lock is released on every path once
/// it has been acquired, including handler and store failures.
pub struct SagaDispatcher {
    registry: SagaRegistry,
    store: Arc<dyn SagaStore>,
    locks: Arc<dyn SagaLocks>,
    pessimistic_locking: bool,
    lock_max_wait: Duration,
}

impl SagaDispatcher {
    /// Creates a dispatcher over the given registry and backends.
    pub fn new(
        registry: SagaRegistry,
        store: Arc<dyn SagaStore>,
        locks: Arc<dyn SagaLocks>,
        config: &SagaConfig,
    ) -> Self {
        Self {
            registry,
            store,
            locks,
            pessimistic_locking: config.pessimistic_locking,
            lock_max_wait: config.lock_max_wait,
        }
    }

    pub fn registry(&self) -> &SagaRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn SagaStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<dyn SagaLocks> {
        &self.locks
    }

    /// Dispatches one message to the saga it correlates to.
    #[tracing::instrument(
        skip(self, message),
        fields(
            message_id = %message.id,
            message_type = %message.message_type,
            dispatch_id = tracing::field::Empty,
            key = tracing::field::Empty,
            stage = tracing::field::Empty,
        )
    )]
    pub async fn dispatch(&self, message: &Message) -> Result<DispatchOutcome> {
        metrics::counter!("saga_dispatch_total").increment(1);
        let started = Instant::now();
        let dispatch_id = DispatchId::new();
        tracing::Span::current().record("dispatch_id", tracing::field::display(dispatch_id));

        let mut stage = DispatchStage::default();
        advance(&mut stage, DispatchStage::Resolving);
        let result = self.resolve_and_process(message, dispatch_id, &mut stage).await;
        metrics::histogram!("saga_dispatch_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(outcome) => {
                tracing::debug!(?outcome, "dispatch done");
            }
            Err(e) => {
                metrics::counter!("saga_dispatch_failed_total", "reason" => e.reason())
                    .increment(1);
                match e {
                    SagaError::ConcurrencyConflict { .. } | SagaError::InvariantViolation(_) => {
                        tracing::error!(error = %e, failed_at = %stage, "dispatch failed");
                    }
                    _ if e.is_retryable() => {
                        tracing::warn!(error = %e, failed_at = %stage, "dispatch failed, retryable");
                    }
                    _ => {
                        tracing::warn!(error = %e, failed_at = %stage, "dispatch failed");
                    }
                }
            }
        }

        let terminal = if result.is_ok() {
            DispatchStage::Done
        } else {
            DispatchStage::Failed
        };
        advance(&mut stage, terminal);
        result
    }

    async fn resolve_and_process(
        &self,
        message: &Message,
        dispatch_id: DispatchId,
        stage: &mut DispatchStage,
    ) -> Result<DispatchOutcome> {
        let (route, resolution) = self.registry.route(message)?;
        let key = match resolution {
            Resolution::Correlated(key) => key,
            Resolution::NoCorrelation => {
                tracing::debug!("message carries no correlation value, skipping");
                return Ok(DispatchOutcome::NoCorrelation);
            }
        };
        tracing::Span::current().record("key", tracing::field::display(&key));

        if !self.pessimistic_locking {
            return self
                .process(route, &key, message, dispatch_id, None, stage)
                .await
                .map_err(into_optimistic);
        }

        advance(stage, DispatchStage::Acquiring);
        let guard = LockGuard::acquire(
            Arc::clone(&self.locks),
            &key,
            dispatch_id,
            self.lock_max_wait,
        )
        .await?;

        let processed = self
            .process(route, &key, message, dispatch_id, Some(guard.key()), stage)
            .await;
        let released = guard.release().await;
        if processed.is_ok() && released.is_ok() {
            advance(stage, DispatchStage::Released);
        }

        match (processed, released) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(release_err)) => Err(release_err.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                tracing::error!(error = %release_err, "saga lock release failed after dispatch error");
                Err(e)
            }
        }
    }

    /// Load, handle and save. `held` is the key of the lock held by the
    /// caller, if any.
    async fn process(
        &self,
        route: &Route,
        key: &CorrelationKey,
        message: &Message,
        dispatch_id: DispatchId,
        held: Option<&CorrelationKey>,
        stage: &mut DispatchStage,
    ) -> Result<DispatchOutcome> {
        let (mut instance, is_new) = if route.rule.initiates() {
            let initial = route.saga.initial_data()?;
            self.store.load_or_create(key, initial).await?
        } else {
            match self.store.find(key).await? {
                Some(instance) => (instance, false),
                None => {
                    tracing::debug!("no saga instance for non-initiating message, ignoring");
                    return Ok(DispatchOutcome::Ignored { key: key.clone() });
                }
            }
        };
        advance(stage, DispatchStage::Loaded);

        let ctx = HandlerContext {
            saga_id: instance.id(),
            revision: instance.revision(),
            is_new,
            key: key.clone(),
            message_id: message.id,
            dispatch_id,
        };

        advance(stage, DispatchStage::Handling);
        let mut data = instance.payload().clone();
        route.saga.handle(&mut data, message, &ctx).await?;
        instance.set_payload(data);

        advance(stage, DispatchStage::Persisting);
        if let Some(held) = held
            && instance.correlation() != held
        {
            return Err(SagaError::InvariantViolation(format!(
                "saving saga {} ({}) while holding the lock for {held}",
                instance.id(),
                instance.correlation()
            )));
        }
        let revision = self.store.save(&mut instance).await?;
        tracing::debug!(saga_id = %instance.id(), %revision, created = is_new, "saga saved");

        Ok(DispatchOutcome::Handled {
            saga_id: instance.id(),
            revision,
            created: is_new,
        })
    }
}

impl std::fmt::Debug for SagaDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaDispatcher")
            .field("registry", &self.registry)
            .field("pessimistic_locking", &self.pessimistic_locking)
            .field("lock_max_wait", &self.lock_max_wait)
            .finish_non_exhaustive()
    }
}

/// Moves `stage` forward and records it on the dispatch span.
fn advance(stage: &mut DispatchStage, next: DispatchStage) {
    *stage = next;
    tracing::Span::current().record("stage", next.as_str());
}

/// Without the saga lock a revision conflict is a lost race, not a bug.
fn into_optimistic(err: SagaError) -> SagaError {
    match err {
        SagaError::ConcurrencyConflict {
            saga_id,
            key,
            expected,
            actual,
        } => SagaError::OptimisticConflict {
            saga_id,
            key,
            expected,
            actual,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationConfig;
    use crate::error::HandlerError;
    use crate::message::SagaMessage;
    use crate::registry::Saga;
    use async_trait::async_trait;
    use saga_locks::InMemorySagaLocks;
    use saga_store::{InMemorySagaStore, SagaInstance, StoreError};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Start {
        id: String,
    }

    impl SagaMessage for Start {
        const MESSAGE_TYPE: &'static str = "Start";
    }

    #[derive(Serialize, Deserialize)]
    struct Bump {
        id: Option<String>,
        fail: bool,
    }

    impl SagaMessage for Bump {
        const MESSAGE_TYPE: &'static str = "Bump";
    }

    #[derive(Default, Serialize, Deserialize)]
    struct CounterData {
        id: String,
        count: u64,
    }

    struct CounterSaga;

    #[async_trait]
    impl Saga for CounterSaga {
        type Data = CounterData;
        const SAGA_TYPE: &'static str = "CounterSaga";

        fn correlate(&self, config: &mut CorrelationConfig) {
            config
                .initiated_by::<Start>("id", |m| m.id.clone())
                .correlate_partial::<Bump>("id", |m| m.id.clone());
        }

        async fn handle(
            &self,
            data: &mut CounterData,
            message: &Message,
            _ctx: &HandlerContext,
        ) -> std::result::Result<(), HandlerError> {
            if message.is::<Bump>() && message.body::<Bump>()?.fail {
                return Err(HandlerError::failed("bump refused"));
            }
            data.count += 1;
            Ok(())
        }
    }

    fn registry() -> SagaRegistry {
        let mut registry = SagaRegistry::new();
        registry.register(CounterSaga).unwrap();
        registry
    }

    fn start(id: &str) -> Message {
        Message::from_body(&Start { id: id.into() }).unwrap()
    }

    fn bump(id: &str, fail: bool) -> Message {
        Message::from_body(&Bump {
            id: Some(id.into()),
            fail,
        })
        .unwrap()
    }

    fn key(id: &str) -> CorrelationKey {
        CorrelationKey::new("CounterSaga", "id", id)
    }

    fn dispatcher(
        store: Arc<dyn SagaStore>,
        locks: &InMemorySagaLocks,
        config: &SagaConfig,
    ) -> SagaDispatcher {
        SagaDispatcher::new(registry(), store, Arc::new(locks.clone()), config)
    }

    /// Store that bumps the stored revision behind the dispatcher's back.
    struct InterferingStore {
        inner: InMemorySagaStore,
    }

    #[async_trait]
    impl SagaStore for InterferingStore {
        async fn find(&self, key: &CorrelationKey) -> saga_store::Result<Option<SagaInstance>> {
            self.inner.find(key).await
        }

        async fn save(&self, instance: &mut SagaInstance) -> saga_store::Result<Revision> {
            if !instance.is_new() {
                let mut rival = instance.clone();
                self.inner.save(&mut rival).await?;
            }
            self.inner.save(instance).await
        }

        async fn get(&self, id: SagaId) -> saga_store::Result<Option<SagaInstance>> {
            self.inner.get(id).await
        }

        async fn count(&self) -> saga_store::Result<usize> {
            self.inner.count().await
        }
    }

    #[tokio::test]
    async fn initiator_creates_and_continuation_updates() {
        let store = InMemorySagaStore::new();
        let locks = InMemorySagaLocks::new();
        let dispatcher = dispatcher(Arc::new(store.clone()), &locks, &SagaConfig::default());

        let created = dispatcher.dispatch(&start("a")).await.unwrap();
        let DispatchOutcome::Handled {
            saga_id,
            revision,
            created,
        } = created
        else {
            panic!("expected handled outcome");
        };
        assert!(created);
        assert_eq!(revision, Revision::new(1));

        let updated = dispatcher.dispatch(&bump("a", false)).await.unwrap();
        assert_eq!(
            updated,
            DispatchOutcome::Handled {
                saga_id,
                revision: Revision::new(2),
                created: false,
            }
        );

        let stored = store.get(saga_id).await.unwrap().unwrap();
        assert_eq!(stored.payload()["count"], 2);
        assert_eq!(stored.payload()["id"], "a");
        assert_eq!(locks.count(), 0);
        assert_eq!(locks.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn continuation_without_saga_is_ignored() {
        let store = InMemorySagaStore::new();
        let locks = InMemorySagaLocks::new();
        let dispatcher = dispatcher(Arc::new(store.clone()), &locks, &SagaConfig::default());

        let outcome = dispatcher.dispatch(&bump("ghost", false)).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Ignored { key: key("ghost") });
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(locks.count(), 0);
    }

    #[tokio::test]
    async fn message_without_key_is_not_dispatched() {
        let locks = InMemorySagaLocks::new();
        let dispatcher = dispatcher(
            Arc::new(InMemorySagaStore::new()),
            &locks,
            &SagaConfig::default(),
        );

        let message = Message::from_body(&Bump {
            id: None,
            fail: false,
        })
        .unwrap();
        assert_eq!(
            dispatcher.dispatch(&message).await.unwrap(),
            DispatchOutcome::NoCorrelation
        );
    }

    #[tokio::test]
    async fn unknown_message_type_is_configuration_error() {
        let locks = InMemorySagaLocks::new();
        let dispatcher = dispatcher(
            Arc::new(InMemorySagaStore::new()),
            &locks,
            &SagaConfig::default(),
        );

        let message = Message::builder()
            .message_type("Unrouted")
            .payload_raw(serde_json::json!({}))
            .try_build()
            .unwrap();
        let err = dispatcher.dispatch(&message).await.unwrap_err();
        assert!(matches!(err, SagaError::Configuration(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn handler_failure_releases_lock_and_keeps_state() {
        let store = InMemorySagaStore::new();
        let locks = InMemorySagaLocks::new();
        let dispatcher = dispatcher(Arc::new(store.clone()), &locks, &SagaConfig::default());

        dispatcher.dispatch(&start("a")).await.unwrap();
        let err = dispatcher.dispatch(&bump("a", true)).await.unwrap_err();
        assert!(matches!(err, SagaError::Handler { .. }));
        assert!(err.is_retryable());
        assert_eq!(locks.count(), 0);

        let stored = store.find(&key("a")).await.unwrap().unwrap();
        assert_eq!(stored.revision(), Revision::new(1));
        assert_eq!(stored.payload()["count"], 1);
    }

    #[tokio::test]
    async fn held_lock_times_out_dispatch() {
        let locks = InMemorySagaLocks::new();
        let config = SagaConfig::default().with_lock_max_wait(Duration::from_millis(20));
        let dispatcher = dispatcher(Arc::new(InMemorySagaStore::new()), &locks, &config);

        let handle = locks
            .acquire(&key("a"), DispatchId::new(), Duration::from_secs(1))
            .await
            .unwrap();

        let err = dispatcher.dispatch(&start("a")).await.unwrap_err();
        assert!(matches!(err, SagaError::LockTimeout { .. }));
        assert!(err.is_retryable());

        // The external holder is unaffected
        assert!(locks.is_held(&key("a")));
        locks.release(handle).await.unwrap();
        assert_eq!(locks.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn revision_moved_under_lock_is_fatal_conflict() {
        let inner = InMemorySagaStore::new();
        let locks = InMemorySagaLocks::new();
        let dispatcher = dispatcher(
            Arc::new(InterferingStore {
                inner: inner.clone(),
            }),
            &locks,
            &SagaConfig::default(),
        );

        dispatcher.dispatch(&start("a")).await.unwrap();
        let err = dispatcher.dispatch(&bump("a", false)).await.unwrap_err();
        assert!(matches!(err, SagaError::ConcurrencyConflict { .. }));
        assert!(!err.is_retryable());
        assert_eq!(locks.count(), 0);
    }

    #[tokio::test]
    async fn optimistic_mode_reports_retryable_conflict() {
        let locks = InMemorySagaLocks::new();
        let config = SagaConfig::default().with_pessimistic_locking(false);
        let dispatcher = dispatcher(
            Arc::new(InterferingStore {
                inner: InMemorySagaStore::new(),
            }),
            &locks,
            &config,
        );

        dispatcher.dispatch(&start("a")).await.unwrap();
        let err = dispatcher.dispatch(&bump("a", false)).await.unwrap_err();
        assert!(matches!(err, SagaError::OptimisticConflict { .. }));
        assert!(err.is_retryable());
        assert_eq!(locks.count(), 0);
    }

    #[tokio::test]
    async fn optimistic_mode_takes_no_locks() {
        let store = InMemorySagaStore::new();
        let locks = InMemorySagaLocks::new();
        let config = SagaConfig::default().with_pessimistic_locking(false);
        let dispatcher = dispatcher(Arc::new(store.clone()), &locks, &config);

        // A held lock does not block an unlocked dispatch
        let handle = locks
            .acquire(&key("a"), DispatchId::new(), Duration::from_secs(1))
            .await
            .unwrap();
        dispatcher.dispatch(&start("a")).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        locks.release(handle).await.unwrap();
    }

    #[tokio::test]
    async fn creation_race_loser_sees_winner_after_lock() {
        let store = InMemorySagaStore::new();
        let locks = InMemorySagaLocks::new();
        let dispatcher = Arc::new(dispatcher(
            Arc::new(store.clone()),
            &locks,
            &SagaConfig::default(),
        ));

        let first = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.dispatch(&start("a")).await }
        });
        let second = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.dispatch(&start("a")).await }
        });

        let outcomes = [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];
        let created = outcomes
            .iter()
            .filter(|o| matches!(o, DispatchOutcome::Handled { created: true, .. }))
            .count();
        assert_eq!(created, 1);
        assert_eq!(store.count().await.unwrap(), 1);

        let stored = store.find(&key("a")).await.unwrap().unwrap();
        assert_eq!(stored.revision(), Revision::new(2));
        assert_eq!(stored.payload()["count"], 2);
    }

    /// Store whose lookups always return the saga stored under `target`.
    struct MisroutingStore {
        inner: InMemorySagaStore,
        target: CorrelationKey,
    }

    #[async_trait]
    impl SagaStore for MisroutingStore {
        async fn find(&self, _key: &CorrelationKey) -> saga_store::Result<Option<SagaInstance>> {
            self.inner.find(&self.target).await
        }

        async fn save(&self, instance: &mut SagaInstance) -> saga_store::Result<Revision> {
            self.inner.save(instance).await
        }

        async fn get(&self, id: SagaId) -> saga_store::Result<Option<SagaInstance>> {
            self.inner.get(id).await
        }

        async fn count(&self) -> saga_store::Result<usize> {
            self.inner.count().await
        }
    }

    #[tokio::test]
    async fn saving_saga_under_foreign_lock_is_invariant_violation() {
        let inner = InMemorySagaStore::new();
        let locks = InMemorySagaLocks::new();
        dispatcher(Arc::new(inner.clone()), &locks, &SagaConfig::default())
            .dispatch(&start("b"))
            .await
            .unwrap();

        let misrouted = dispatcher(
            Arc::new(MisroutingStore {
                inner: inner.clone(),
                target: key("b"),
            }),
            &locks,
            &SagaConfig::default(),
        );
        let err = misrouted.dispatch(&bump("a", false)).await.unwrap_err();
        assert!(matches!(err, SagaError::InvariantViolation(_)));
        assert!(!err.is_retryable());
        assert_eq!(locks.count(), 0);

        let stored = inner.find(&key("b")).await.unwrap().unwrap();
        assert_eq!(stored.revision(), Revision::new(1));
        assert_eq!(stored.payload()["count"], 1);
    }

    /// Collects every `stage` value recorded on a span.
    #[derive(Clone, Default)]
    struct StageLog(Arc<std::sync::Mutex<Vec<String>>>);

    impl<S> tracing_subscriber::Layer<S> for StageLog
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        fn on_record(
            &self,
            _id: &tracing::span::Id,
            values: &tracing::span::Record<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            values.record(&mut StageVisitor(&self.0));
        }
    }

    struct StageVisitor<'a>(&'a std::sync::Mutex<Vec<String>>);

    impl tracing::field::Visit for StageVisitor<'_> {
        fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
            if field.name() == "stage" {
                self.0.lock().unwrap().push(value.to_string());
            }
        }

        fn record_debug(&mut self, _field: &tracing::field::Field, _value: &dyn std::fmt::Debug) {}
    }

    #[tokio::test]
    async fn dispatch_records_each_stage_on_its_span() {
        use tracing_subscriber::layer::SubscriberExt;

        let log = StageLog::default();
        let _default =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(log.clone()));

        let locks = InMemorySagaLocks::new();
        let dispatcher = dispatcher(
            Arc::new(InMemorySagaStore::new()),
            &locks,
            &SagaConfig::default(),
        );

        dispatcher.dispatch(&start("a")).await.unwrap();
        let succeeded = std::mem::take(&mut *log.0.lock().unwrap());
        assert_eq!(
            succeeded,
            ["Resolving", "Acquiring", "Loaded", "Handling", "Persisting", "Released", "Done"]
        );

        dispatcher.dispatch(&bump("a", true)).await.unwrap_err();
        let failed = log.0.lock().unwrap().clone();
        assert_eq!(failed, ["Resolving", "Acquiring", "Loaded", "Handling", "Failed"]);
    }

    #[test]
    fn store_conflict_maps_to_optimistic() {
        let err: SagaError = StoreError::ConcurrencyConflict {
            saga_id: SagaId::new(),
            key: key("a"),
            expected: Revision::new(1),
            actual: Revision::new(2),
        }
        .into();
        assert!(matches!(
            into_optimistic(err),
            SagaError::OptimisticConflict { .. }
        ));
    }
}
