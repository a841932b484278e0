//! Runtime manager: session binding strategies and the facade every caller,
//! including the timer driver, goes through.

mod per_instance;
mod per_request;
mod singleton;

pub use per_instance::PerProcessInstanceStrategy;
pub use per_request::PerRequestStrategy;
pub use singleton::SingletonStrategy;

use crate::config::StrategyKind;
use crate::environment::RuntimeEnvironment;
use crate::error::{EngineError, EngineResult, StateConflict};
use crate::instance::ProcessInstance;
use crate::session::{live_instances, BroadcastOutcome, ExecutionSession};
use crate::types::*;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

// ─── Strategy trait ───────────────────────────────────────────

/// Decides which execution session owns a context key.
#[async_trait]
pub trait SessionBindingStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Session for `key`, created or reconstructed as the policy requires.
    async fn bind(&self, key: &ContextKey) -> EngineResult<Arc<ExecutionSession>>;

    /// Fail with a state conflict when `session` may not operate on `key`.
    async fn validate(&self, session: &ExecutionSession, key: &ContextKey) -> EngineResult<()>;

    /// Called after every facade operation on a bound session.
    async fn release(&self, session: &Arc<ExecutionSession>) -> EngineResult<()>;

    /// Drop in-memory state. Persisted state stays and `bind` rebuilds it.
    async fn dispose(&self, session: &Arc<ExecutionSession>) -> EngineResult<()>;

    /// Dispose and remove the session's mappings. Only valid once the
    /// session owns no live instance.
    async fn destroy(&self, session: &Arc<ExecutionSession>) -> EngineResult<()>;
}

/// Shared validation: the session must accept the key, and a persisted
/// mapping for the key must name this session.
pub(crate) async fn validate_mapping(
    env: &RuntimeEnvironment,
    session: &ExecutionSession,
    key: &ContextKey,
) -> EngineResult<()> {
    session.check_key(key)?;
    if key.is_empty() && session.strategy() != StrategyKind::Singleton {
        return Ok(());
    }
    match env.mapper.find(key).await? {
        Some(mapping) if mapping.session_id != session.id() => Err(StateConflict::StaleSession {
            key: key.clone(),
            mapped: mapping.session_id,
            used: session.id(),
        }
        .into()),
        None if session.is_released() => Err(StateConflict::Disposed(session.id()).into()),
        _ => Ok(()),
    }
}

// ─── Facade ───────────────────────────────────────────────────

pub struct RuntimeManager {
    env: Arc<RuntimeEnvironment>,
    strategy: Arc<dyn SessionBindingStrategy>,
}

impl RuntimeManager {
    /// Manager with the strategy named by the environment's config.
    pub async fn new(env: Arc<RuntimeEnvironment>) -> EngineResult<Self> {
        let strategy: Arc<dyn SessionBindingStrategy> = match env.config.strategy {
            StrategyKind::Singleton => Arc::new(SingletonStrategy::init(env.clone()).await?),
            StrategyKind::PerProcessInstance => Arc::new(PerProcessInstanceStrategy::new(env.clone())),
            StrategyKind::PerRequest => Arc::new(PerRequestStrategy::new(env.clone())),
        };
        tracing::info!(
            deployment_id = %env.deployment_id(),
            strategy = ?strategy.kind(),
            "RuntimeManager: started"
        );
        Ok(Self { env, strategy })
    }

    pub fn with_strategy(env: Arc<RuntimeEnvironment>, strategy: Arc<dyn SessionBindingStrategy>) -> Self {
        Self { env, strategy }
    }

    pub fn environment(&self) -> &Arc<RuntimeEnvironment> {
        &self.env
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy.kind()
    }

    // ── Raw binding ──

    pub async fn bind(&self, key: &ContextKey) -> EngineResult<Arc<ExecutionSession>> {
        self.strategy.bind(key).await
    }

    pub async fn validate(&self, session: &ExecutionSession, key: &ContextKey) -> EngineResult<()> {
        self.strategy.validate(session, key).await
    }

    pub async fn dispose(&self, session: &Arc<ExecutionSession>) -> EngineResult<()> {
        self.strategy.dispose(session).await
    }

    pub async fn destroy(&self, session: &Arc<ExecutionSession>) -> EngineResult<()> {
        self.strategy.destroy(session).await
    }

    /// Bind, validate, run `op`, release. The op's error wins over a
    /// release error.
    async fn with_session<T, F, Fut>(&self, key: ContextKey, op: F) -> EngineResult<T>
    where
        F: FnOnce(Arc<ExecutionSession>) -> Fut + Send,
        Fut: Future<Output = EngineResult<T>> + Send,
        T: Send,
    {
        let session = self.strategy.bind(&key).await?;
        self.strategy.validate(&session, &key).await?;
        let result = op(session.clone()).await;
        let released = self.strategy.release(&session).await;
        let value = result?;
        released?;
        Ok(value)
    }

    // ── Operations ──

    pub async fn start_process(&self, process_id: &str, variables: Variables) -> EngineResult<Uuid> {
        self.with_session(ContextKey::Empty, |session| async move {
            session.start_process(process_id, variables).await
        })
        .await
    }

    /// Start an instance under a business correlation key. With
    /// per-process-instance binding the key may only own one live instance.
    pub async fn start_process_correlated(
        &self,
        process_id: &str,
        correlation_key: &str,
        variables: Variables,
    ) -> EngineResult<Uuid> {
        let key = ContextKey::Correlation(correlation_key.to_string());
        let per_instance = self.strategy.kind() == StrategyKind::PerProcessInstance;
        self.with_session(key.clone(), |session| async move {
            if per_instance && !session.owned_instances().is_empty() {
                return Err(StateConflict::DuplicateBinding {
                    key,
                    existing: session.id(),
                }
                .into());
            }
            session
                .start_process_correlated(process_id, correlation_key, variables)
                .await
        })
        .await
    }

    /// Instance bound to a correlation key, if one was started under it.
    pub async fn instance_for_correlation(&self, correlation_key: &str) -> EngineResult<Option<Uuid>> {
        let key = ContextKey::Correlation(correlation_key.to_string());
        Ok(self
            .env
            .mapper
            .find(&key)
            .await?
            .and_then(|m| m.process_instance_id))
    }

    pub async fn signal_instance(
        &self,
        pi: Uuid,
        event: EventType,
        payload: Option<Value>,
        correlation: Option<String>,
    ) -> EngineResult<usize> {
        self.with_session(ContextKey::ProcessInstance(pi), |session| async move {
            session.signal_instance(pi, event, payload, correlation).await
        })
        .await
    }

    /// Deliver an external event: start every definition whose start trigger
    /// matches, then signal every live instance.
    pub async fn broadcast(
        &self,
        event: EventType,
        payload: Option<Value>,
        correlation: Option<String>,
    ) -> EngineResult<BroadcastOutcome> {
        if self.strategy.kind() != StrategyKind::PerProcessInstance {
            return self
                .with_session(ContextKey::Empty, |session| async move {
                    session.broadcast(event, payload, correlation).await
                })
                .await;
        }

        // One session per instance: each start and each delivery binds on
        // its own.
        let live = live_instances(&self.env).await?;
        let starts = self
            .with_session(ContextKey::Empty, |session| {
                let event = event.clone();
                async move { session.matching_starts(&event).await }
            })
            .await?;

        let mut outcome = BroadcastOutcome::default();
        for (definition, node) in starts {
            let payload = payload.clone();
            let correlation = correlation.clone();
            let pi = self
                .with_session(ContextKey::Empty, |session| async move {
                    session
                        .start_triggered(definition, node, payload, correlation)
                        .await
                })
                .await?;
            outcome.started.push(pi);
        }

        for inst in live {
            let (event, payload, correlation) = (event.clone(), payload.clone(), correlation.clone());
            match self.signal_instance(inst.id, event, payload, correlation).await {
                Ok(n) => outcome.delivered += n,
                Err(EngineError::InstanceNotActive { .. }) | Err(EngineError::InstanceNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::info!(
            event = %event,
            started = outcome.started.len(),
            delivered = outcome.delivered,
            "RuntimeManager: broadcast delivered"
        );
        Ok(outcome)
    }

    pub async fn complete_work_item(
        &self,
        pi: Uuid,
        work_item_id: WorkItemId,
        results: Variables,
    ) -> EngineResult<()> {
        self.with_session(ContextKey::ProcessInstance(pi), |session| async move {
            session.complete_work_item(pi, work_item_id, results).await
        })
        .await
    }

    pub async fn fail_work_item(
        &self,
        pi: Uuid,
        work_item_id: WorkItemId,
        code: &str,
        message: &str,
    ) -> EngineResult<()> {
        self.with_session(ContextKey::ProcessInstance(pi), |session| async move {
            session.fail_work_item(pi, work_item_id, code, message).await
        })
        .await
    }

    pub async fn abort_process(&self, pi: Uuid) -> EngineResult<()> {
        self.with_session(ContextKey::ProcessInstance(pi), |session| async move {
            session.abort_process(pi).await
        })
        .await
    }

    pub async fn fire_timer(&self, pi: Uuid, timer_id: TimerId) -> EngineResult<bool> {
        self.with_session(ContextKey::ProcessInstance(pi), |session| async move {
            session.fire_timer(pi, timer_id).await
        })
        .await
    }

    /// Fire every timer due at the clock's current time. Returns how many
    /// fired. Failures are logged and do not stop the remaining timers.
    pub async fn fire_due_timers(&self) -> usize {
        let now = self.env.now();
        let mut fired = 0;
        for firing in self.env.timers.take_due(now) {
            match self.fire_timer(firing.process_instance_id, firing.timer_id).await {
                Ok(true) => fired += 1,
                Ok(false) => {
                    tracing::debug!(
                        process_instance_id = %firing.process_instance_id,
                        timer_id = %firing.timer_id,
                        "RuntimeManager: timer no longer pending"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        process_instance_id = %firing.process_instance_id,
                        timer_id = %firing.timer_id,
                        error = %e,
                        "RuntimeManager: timer delivery failed"
                    );
                }
            }
        }
        fired
    }

    pub async fn process_instance(&self, pi: Uuid) -> EngineResult<ProcessInstance> {
        self.with_session(ContextKey::ProcessInstance(pi), |session| async move {
            session.process_instance(pi).await
        })
        .await
    }

    /// Reload the timers of every persisted live instance. Used at startup.
    pub async fn recover_timers(&self) -> EngineResult<usize> {
        let mut recovered = 0;
        for inst in live_instances(&self.env).await? {
            recovered += inst.timers.len();
            self.env.timers.sync_instance(inst.id, inst.timers.values());
        }
        tracing::info!(recovered, "RuntimeManager: timers recovered");
        Ok(recovered)
    }
}

impl std::fmt::Debug for RuntimeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeManager")
            .field("deployment_id", &self.env.deployment_id())
            .field("strategy", &self.strategy.kind())
            .finish()
    }
}
