use crate::types::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Engine events handed to the audit sink after each committed operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AuditEvent {
    ProcessStarted {
        process_instance_id: Uuid,
        process_id: String,
        parent: Option<Uuid>,
        at: Timestamp,
    },
    ProcessCompleted {
        process_instance_id: Uuid,
        at: Timestamp,
    },
    ProcessAborted {
        process_instance_id: Uuid,
        code: Option<String>,
        at: Timestamp,
    },
    NodeEntered {
        process_instance_id: Uuid,
        node_instance_id: NodeInstanceId,
        node_id: String,
        at: Timestamp,
    },
    NodeLeft {
        process_instance_id: Uuid,
        node_instance_id: NodeInstanceId,
        node_id: String,
        status: NodeInstanceStatus,
        at: Timestamp,
    },
    WorkItemActivated {
        process_instance_id: Uuid,
        work_item_id: WorkItemId,
        name: String,
    },
    TimerScheduled {
        process_instance_id: Uuid,
        timer_id: TimerId,
        owner: NodeInstanceId,
        due: Timestamp,
    },
    TimerFired {
        process_instance_id: Uuid,
        timer_id: TimerId,
        owner: NodeInstanceId,
        at: Timestamp,
    },
    /// An error or escalation was caught by a boundary or event sub-process.
    ErrorClaimed {
        process_instance_id: Uuid,
        event: String,
        node_id: String,
    },
    ErrorUnclaimed {
        process_instance_id: Uuid,
        event: String,
    },
    /// A delivered signal matched nothing.
    SignalIgnored {
        process_instance_id: Option<Uuid>,
        event: String,
    },
}

impl AuditEvent {
    pub fn process_instance_id(&self) -> Option<Uuid> {
        match self {
            AuditEvent::ProcessStarted {
                process_instance_id,
                ..
            }
            | AuditEvent::ProcessCompleted {
                process_instance_id,
                ..
            }
            | AuditEvent::ProcessAborted {
                process_instance_id,
                ..
            }
            | AuditEvent::NodeEntered {
                process_instance_id,
                ..
            }
            | AuditEvent::NodeLeft {
                process_instance_id,
                ..
            }
            | AuditEvent::WorkItemActivated {
                process_instance_id,
                ..
            }
            | AuditEvent::TimerScheduled {
                process_instance_id,
                ..
            }
            | AuditEvent::TimerFired {
                process_instance_id,
                ..
            }
            | AuditEvent::ErrorClaimed {
                process_instance_id,
                ..
            }
            | AuditEvent::ErrorUnclaimed {
                process_instance_id,
                ..
            } => Some(*process_instance_id),
            AuditEvent::SignalIgnored {
                process_instance_id,
                ..
            } => *process_instance_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuditEvent::ProcessStarted { .. } => "process_started",
            AuditEvent::ProcessCompleted { .. } => "process_completed",
            AuditEvent::ProcessAborted { .. } => "process_aborted",
            AuditEvent::NodeEntered { .. } => "node_entered",
            AuditEvent::NodeLeft { .. } => "node_left",
            AuditEvent::WorkItemActivated { .. } => "work_item_activated",
            AuditEvent::TimerScheduled { .. } => "timer_scheduled",
            AuditEvent::TimerFired { .. } => "timer_fired",
            AuditEvent::ErrorClaimed { .. } => "error_claimed",
            AuditEvent::ErrorUnclaimed { .. } => "error_unclaimed",
            AuditEvent::SignalIgnored { .. } => "signal_ignored",
        }
    }
}
