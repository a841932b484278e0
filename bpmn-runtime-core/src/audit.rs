//! Passive observers of engine events. A failing sink never affects engine
//! state: the session logs the error and moves on.

use crate::events::AuditEvent;
use crate::types::NodeInstanceStatus;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Mutex;

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, events: &[AuditEvent]) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _events: &[AuditEvent]) -> Result<()> {
        Ok(())
    }
}

/// Emits every event as a structured `tracing` record.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, events: &[AuditEvent]) -> Result<()> {
        for event in events {
            let pi = event
                .process_instance_id()
                .map(|id| id.to_string())
                .unwrap_or_default();
            match event {
                AuditEvent::ProcessStarted { .. }
                | AuditEvent::ProcessCompleted { .. }
                | AuditEvent::ProcessAborted { .. } => {
                    tracing::info!(process_instance_id = %pi, kind = event.name(), ?event, "Audit")
                }
                AuditEvent::ErrorUnclaimed { .. } | AuditEvent::SignalIgnored { .. } => {
                    tracing::warn!(process_instance_id = %pi, kind = event.name(), ?event, "Audit")
                }
                _ => tracing::debug!(process_instance_id = %pi, kind = event.name(), ?event, "Audit"),
            }
        }
        Ok(())
    }
}

/// Keeps events in memory for inspection in tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    /// Number of `NodeLeft` events with the given status for a definition node.
    pub fn count_left(&self, node_id: &str, status: NodeInstanceStatus) -> usize {
        self.events()
            .iter()
            .filter(|e| {
                matches!(e, AuditEvent::NodeLeft { node_id: n, status: s, .. } if n == node_id && *s == status)
            })
            .count()
    }

    pub fn count_entered(&self, node_id: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, AuditEvent::NodeEntered { node_id: n, .. } if n == node_id))
            .count()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, events: &[AuditEvent]) -> Result<()> {
        let mut guard = self.events.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        guard.extend_from_slice(events);
        Ok(())
    }
}
