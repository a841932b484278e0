use super::{validate_mapping, SessionBindingStrategy};
use crate::config::StrategyKind;
use crate::environment::RuntimeEnvironment;
use crate::error::{EngineError, EngineResult, EntityKind, StateConflict};
use crate::instance::ProcessInstance;
use crate::session::{load_record, ExecutionSession};
use crate::store::find_as;
use crate::types::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

/// One session per live process instance.
///
/// Binds of one key are serialised, so concurrent `bind(k)` calls in one
/// process see one session. Across processes the store's first-writer-wins
/// mapping save decides, and the loser adopts the winner's session.
pub struct PerProcessInstanceStrategy {
    env: Arc<RuntimeEnvironment>,
    live: Mutex<HashMap<SessionId, Arc<ExecutionSession>>>,
    /// Per-key bind locks. An entry lives while some bind holds it.
    binds: StdMutex<HashMap<ContextKey, Arc<Mutex<()>>>>,
}

impl PerProcessInstanceStrategy {
    pub fn new(env: Arc<RuntimeEnvironment>) -> Self {
        Self {
            env,
            live: Mutex::new(HashMap::new()),
            binds: StdMutex::new(HashMap::new()),
        }
    }

    /// Sessions currently held in memory.
    pub async fn live_sessions(&self) -> usize {
        self.live.lock().await.len()
    }

    fn fresh(&self, key: &ContextKey) -> Arc<ExecutionSession> {
        Arc::new(ExecutionSession::new(
            self.env.clone(),
            StrategyKind::PerProcessInstance,
            key.clone(),
        ))
    }

    fn key_lock(&self, key: &ContextKey) -> Arc<Mutex<()>> {
        let mut binds = self.binds.lock().unwrap_or_else(|e| e.into_inner());
        binds.entry(key.clone()).or_default().clone()
    }

    /// Drop the key's lock once nobody else waits on it.
    fn forget_key_lock(&self, key: &ContextKey) {
        let mut binds = self.binds.lock().unwrap_or_else(|e| e.into_inner());
        if binds.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            binds.remove(key);
        }
    }

    /// In-memory session for `id`, rebuilt from its record when it was
    /// disposed or belongs to an earlier process.
    async fn resume(&self, key: &ContextKey, id: SessionId) -> EngineResult<Arc<ExecutionSession>> {
        if let Some(session) = self.live.lock().await.get(&id).filter(|s| usable(s)) {
            return Ok(session.clone());
        }
        let Some(record) = load_record(&self.env, id).await? else {
            return Err(EngineError::SessionNotFound {
                key: key.clone(),
                session_id: Some(id),
            });
        };
        let mut live = self.live.lock().await;
        // Another key mapped to the same session may have rebuilt it meanwhile.
        if let Some(session) = live.get(&id).filter(|s| usable(s)) {
            return Ok(session.clone());
        }
        let session = Arc::new(ExecutionSession::restore(self.env.clone(), record));
        live.insert(id, session.clone());
        Ok(session)
    }

    async fn unmapped_instance(&self, key: &ContextKey, pi: uuid::Uuid) -> EngineResult<Option<ProcessInstance>> {
        let mut tx = self.env.store.begin().await?;
        let found = find_as::<ProcessInstance>(tx.as_mut(), EntityKind::ProcessInstance, &pi.to_string()).await?;
        match found {
            Some((inst, _)) if !inst.is_terminal() => Err(EngineError::SessionNotFound {
                key: key.clone(),
                session_id: None,
            }),
            Some((inst, _)) => Ok(Some(inst)),
            None => Ok(None),
        }
    }

    async fn bind_mapped(&self, key: &ContextKey) -> EngineResult<Arc<ExecutionSession>> {
        loop {
            if let Some(mapping) = self.env.mapper.find(key).await? {
                return self.resume(key, mapping.session_id).await;
            }

            if let ContextKey::ProcessInstance(pi) = key {
                if self.unmapped_instance(key, *pi).await?.is_some() {
                    // Finished instance: a throwaway session can still read it.
                    tracing::debug!(key = %key, "PerProcessInstance: instance finished, unmapped session");
                    return Ok(self.fresh(key));
                }
            }

            let session = self.fresh(key);
            match session.persist_binding().await {
                Ok(()) => {
                    tracing::info!(session_id = %session.id(), key = %key, "PerProcessInstance: session bound");
                    self.live.lock().await.insert(session.id(), session.clone());
                    return Ok(session);
                }
                // Another process mapped the key first; adopt its session.
                Err(EngineError::StateConflict(StateConflict::DuplicateBinding { existing, .. })) => {
                    tracing::debug!(key = %key, existing = %existing, "PerProcessInstance: lost bind race");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn usable(session: &Arc<ExecutionSession>) -> bool {
    !session.is_disposed() && !session.is_released()
}

#[async_trait]
impl SessionBindingStrategy for PerProcessInstanceStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PerProcessInstance
    }

    async fn bind(&self, key: &ContextKey) -> EngineResult<Arc<ExecutionSession>> {
        if key.is_empty() {
            // Mapped by the commit that starts its first instance.
            let session = self.fresh(key);
            self.live.lock().await.insert(session.id(), session.clone());
            return Ok(session);
        }

        let lock = self.key_lock(key);
        let bound = {
            let _guard = lock.lock().await;
            self.bind_mapped(key).await
        };
        drop(lock);
        self.forget_key_lock(key);
        bound
    }

    async fn validate(&self, session: &ExecutionSession, key: &ContextKey) -> EngineResult<()> {
        validate_mapping(&self.env, session, key).await
    }

    async fn release(&self, session: &Arc<ExecutionSession>) -> EngineResult<()> {
        let key = session.key();
        let unowned = session.owned_instances().is_empty();
        if session.is_released() || (key.is_empty() && unowned) {
            self.live.lock().await.remove(&session.id());
            session.dispose().await;
            return Ok(());
        }

        // Bound to an instance id that never came to exist.
        if matches!(key, ContextKey::ProcessInstance(_)) && unowned {
            let lock = self.key_lock(&key);
            let result = {
                let _guard = lock.lock().await;
                let tracked = self.live.lock().await.remove(&session.id()).is_some();
                if tracked {
                    tracing::debug!(session_id = %session.id(), key = %key, "PerProcessInstance: dropping binding without an instance");
                    session.destroy().await
                } else {
                    session.dispose().await;
                    Ok(())
                }
            };
            drop(lock);
            self.forget_key_lock(&key);
            return result;
        }
        Ok(())
    }

    async fn dispose(&self, session: &Arc<ExecutionSession>) -> EngineResult<()> {
        self.live.lock().await.remove(&session.id());
        session.dispose().await;
        Ok(())
    }

    async fn destroy(&self, session: &Arc<ExecutionSession>) -> EngineResult<()> {
        let active = session.owned_instances().len();
        if active > 0 {
            return Err(StateConflict::SessionStillActive {
                session: session.id(),
                active,
            }
            .into());
        }
        self.live.lock().await.remove(&session.id());
        session.destroy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn correlation_key_is_mapped_before_any_instance() {
        let env = RuntimeEnvironment::builder()
            .config(crate::config::EngineConfig::with_strategy(StrategyKind::PerProcessInstance))
            .build();
        let strategy = PerProcessInstanceStrategy::new(env.clone());
        let key = ContextKey::Correlation("order-7".into());

        let session = strategy.bind(&key).await.unwrap();
        let mapping = env.mapper.find(&key).await.unwrap().unwrap();
        assert_eq!(mapping.session_id, session.id());
        assert_eq!(mapping.process_instance_id, None);
        assert!(session.owned_instances().is_empty());
    }

    #[tokio::test]
    async fn session_bound_to_another_key_is_rejected() {
        let env = RuntimeEnvironment::builder().build();
        let strategy = PerProcessInstanceStrategy::new(env.clone());
        let key = ContextKey::Correlation("k".into());
        let session = strategy.bind(&key).await.unwrap();

        let other = strategy.bind(&ContextKey::Correlation("other".into())).await.unwrap();
        assert_ne!(session.id(), other.id());
        let err = strategy.validate(&other, &key).await.unwrap_err();
        assert!(err.is_state_conflict());
    }

    #[tokio::test]
    async fn destroy_removes_the_mapping_of_an_idle_session() {
        let env = RuntimeEnvironment::builder().build();
        let strategy = PerProcessInstanceStrategy::new(env.clone());
        let key = ContextKey::Correlation("k".into());
        let session = strategy.bind(&key).await.unwrap();

        strategy.destroy(&session).await.unwrap();
        assert!(env.mapper.find(&key).await.unwrap().is_none());
        assert!(session.is_disposed());
    }

    #[tokio::test]
    async fn binding_for_an_unknown_instance_is_dropped_on_release() {
        let env = RuntimeEnvironment::builder().build();
        let strategy = PerProcessInstanceStrategy::new(env.clone());
        let key = ContextKey::ProcessInstance(uuid::Uuid::now_v7());

        let session = strategy.bind(&key).await.unwrap();
        assert!(env.mapper.find(&key).await.unwrap().is_some());
        assert_eq!(strategy.live_sessions().await, 1);

        strategy.release(&session).await.unwrap();
        assert!(env.mapper.find(&key).await.unwrap().is_none());
        assert_eq!(strategy.live_sessions().await, 0);
        assert!(session.is_disposed());
        assert!(strategy.binds.lock().unwrap().is_empty());
    }
}
