//! Session, task, and agent state-change events and their delivery path.
//!
//! Producers push into a bounded channel through an [`EventSink`] and never
//! block: when the buffer is full the event is dropped and a warning is logged.
//! A single dispatcher task drains the channel into the [`Notifier`]
//! collaborator.

use crate::types::{AgentId, AgentRole, AgentState, SessionStatus, TaskId, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genforge_core::GenforgeResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A state change worth telling clients about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    SessionStatus {
        status: SessionStatus,
        progress: u8,
        message: String,
    },
    TaskStatus {
        task_id: TaskId,
        role: AgentRole,
        status: TaskStatus,
        retry_count: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    AgentState {
        agent_id: AgentId,
        role: AgentRole,
        from: AgentState,
        to: AgentState,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<TaskId>,
    },
    ArtifactsReady {
        count: usize,
    },
    PreviewReady {
        url: String,
    },
}

/// An event tagged with its session and emission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: OrchestrationEvent,
}

/// The real-time notification channel to clients. Delivery is best effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn push(&self, session_id: Uuid, event: &OrchestrationEvent) -> GenforgeResult<()>;
}

/// Notifier that writes every event to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn push(&self, session_id: Uuid, event: &OrchestrationEvent) -> GenforgeResult<()> {
        let payload = serde_json::to_string(event)?;
        info!(session_id = %session_id, event = %payload, "notification");
        Ok(())
    }
}

/// Non-blocking producer side of the notification channel.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<SessionEvent>>,
}

impl EventSink {
    /// Create a sink and the matching receiver with room for `capacity` events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, session_id: Uuid, event: OrchestrationEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        let event = SessionEvent {
            session_id,
            timestamp: Utc::now(),
            event,
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(
                    session_id = %dropped.session_id,
                    "Notification buffer full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session_id = %session_id, "Notification channel closed");
            }
        }
    }
}

/// Spawn the task that drains `rx` into `notifier` until `shutdown` fires.
///
/// Events still buffered at shutdown are delivered before the task exits.
pub fn spawn_dispatcher(
    mut rx: mpsc::Receiver<SessionEvent>,
    notifier: Arc<dyn Notifier>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                maybe = rx.recv() => match maybe {
                    Some(event) => deliver(notifier.as_ref(), &event).await,
                    None => break,
                },
                () = shutdown.cancelled() => {
                    while let Ok(event) = rx.try_recv() {
                        deliver(notifier.as_ref(), &event).await;
                    }
                    break;
                }
            }
        }
        debug!("Notification dispatcher stopped");
    })
}

async fn deliver(notifier: &dyn Notifier, event: &SessionEvent) {
    if let Err(e) = notifier.push(event.session_id, &event.event).await {
        warn!(session_id = %event.session_id, error = %e, "Notification delivery failed");
    }
}
