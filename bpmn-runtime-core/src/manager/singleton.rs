use super::{validate_mapping, SessionBindingStrategy};
use crate::config::StrategyKind;
use crate::environment::RuntimeEnvironment;
use crate::error::{EngineResult, StateConflict};
use crate::session::{load_record, ExecutionSession, SessionRecord};
use crate::types::*;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One session for the whole deployment, mapped under the empty key.
pub struct SingletonStrategy {
    env: Arc<RuntimeEnvironment>,
    current: Mutex<Arc<ExecutionSession>>,
}

impl SingletonStrategy {
    /// Reuse the session the empty key maps to, or create and map one.
    pub async fn init(env: Arc<RuntimeEnvironment>) -> EngineResult<Self> {
        let session = Self::load_or_create(&env).await?;
        Ok(Self {
            env,
            current: Mutex::new(session),
        })
    }

    async fn load_or_create(env: &Arc<RuntimeEnvironment>) -> EngineResult<Arc<ExecutionSession>> {
        if let Some(mapping) = env.mapper.find(&ContextKey::Empty).await? {
            let record = load_record(env, mapping.session_id)
                .await?
                .unwrap_or_else(|| SessionRecord {
                    id: mapping.session_id,
                    strategy: StrategyKind::Singleton,
                    key: ContextKey::Empty,
                    process_instances: BTreeSet::new(),
                    created_at: mapping.created_at,
                });
            return Ok(Arc::new(ExecutionSession::restore(env.clone(), record)));
        }

        let session = Arc::new(ExecutionSession::new(
            env.clone(),
            StrategyKind::Singleton,
            ContextKey::Empty,
        ));
        session.persist_binding().await?;
        tracing::info!(session_id = %session.id(), "Singleton: session created");
        Ok(session)
    }
}

#[async_trait]
impl SessionBindingStrategy for SingletonStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Singleton
    }

    async fn bind(&self, _key: &ContextKey) -> EngineResult<Arc<ExecutionSession>> {
        let mut current = self.current.lock().await;
        if current.is_disposed() {
            *current = Self::load_or_create(&self.env).await?;
        }
        Ok(current.clone())
    }

    async fn validate(&self, session: &ExecutionSession, key: &ContextKey) -> EngineResult<()> {
        validate_mapping(&self.env, session, &ContextKey::Empty).await?;
        session.check_key(key)
    }

    async fn release(&self, _session: &Arc<ExecutionSession>) -> EngineResult<()> {
        Ok(())
    }

    async fn dispose(&self, session: &Arc<ExecutionSession>) -> EngineResult<()> {
        session.dispose().await;
        Ok(())
    }

    async fn destroy(&self, session: &Arc<ExecutionSession>) -> EngineResult<()> {
        let active = session.loaded_instances().await.len();
        let persisted = crate::session::live_instance_ids(&self.env).await?.len();
        if active.max(persisted) > 0 {
            return Err(StateConflict::SessionStillActive {
                session: session.id(),
                active: active.max(persisted),
            }
            .into());
        }
        session.destroy().await
    }
}
