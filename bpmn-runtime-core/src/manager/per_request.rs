use super::SessionBindingStrategy;
use crate::config::StrategyKind;
use crate::environment::RuntimeEnvironment;
use crate::error::EngineResult;
use crate::session::ExecutionSession;
use crate::types::*;
use async_trait::async_trait;
use std::sync::Arc;

/// A fresh, unmapped session per call, discarded when the call returns.
pub struct PerRequestStrategy {
    env: Arc<RuntimeEnvironment>,
}

impl PerRequestStrategy {
    pub fn new(env: Arc<RuntimeEnvironment>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl SessionBindingStrategy for PerRequestStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PerRequest
    }

    async fn bind(&self, key: &ContextKey) -> EngineResult<Arc<ExecutionSession>> {
        let session = ExecutionSession::new(self.env.clone(), StrategyKind::PerRequest, key.clone());
        tracing::debug!(session_id = %session.id(), key = %key, "PerRequest: session created");
        Ok(Arc::new(session))
    }

    async fn validate(&self, session: &ExecutionSession, key: &ContextKey) -> EngineResult<()> {
        session.check_key(key)
    }

    async fn release(&self, session: &Arc<ExecutionSession>) -> EngineResult<()> {
        session.dispose().await;
        Ok(())
    }

    async fn dispose(&self, session: &Arc<ExecutionSession>) -> EngineResult<()> {
        session.dispose().await;
        Ok(())
    }

    async fn destroy(&self, session: &Arc<ExecutionSession>) -> EngineResult<()> {
        session.dispose().await;
        Ok(())
    }
}
