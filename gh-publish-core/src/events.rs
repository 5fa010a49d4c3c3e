//! Progress events for presentation layers.
//!
//! Delivery is at-least-once: a resumed run re-announces the stage it
//! re-enters, so consumers must tolerate duplicates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::retry::ReasonCode;
use crate::run::Stage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventOutcome {
    Started,
    /// One execution of the stage's operation.
    Attempt,
    Retrying {
        delay_ms: u64,
        reason: ReasonCode,
        error: String,
    },
    Succeeded,
    Failed {
        error: String,
    },
    /// The stage was not needed (for example nothing to commit).
    Skipped {
        reason: String,
    },
    Resumed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: Uuid,
    pub stage: Stage,
    pub outcome: EventOutcome,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// Sending half handed to the runner. Cheap to clone; a sink without a
/// receiver only logs.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn channel() -> (ProgressSink, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ProgressSink { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> ProgressSink {
        ProgressSink::default()
    }

    pub fn emit(&self, run_id: Uuid, stage: Stage, outcome: EventOutcome, attempt: u32) {
        let event = ProgressEvent {
            run_id,
            stage,
            outcome,
            attempt,
            timestamp: Utc::now(),
        };
        tracing::debug!(
            run_id = %event.run_id,
            stage = %event.stage,
            attempt = event.attempt,
            outcome = ?event.outcome,
            "progress event"
        );
        if let Some(tx) = &self.tx {
            // A dropped receiver means nobody is rendering; the run goes on.
            let _ = tx.send(event);
        }
    }
}
