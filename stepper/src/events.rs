//! Step-lifecycle notifications.
//!
//! Publishing is infallible by signature: a sink that cannot deliver drops the
//! event, and the cycle carries on unaffected.

use std::sync::mpsc::Sender;

use serde::Serialize;
use tracing::debug;

use crate::core::lifecycle::StepPhase;
use crate::core::types::{Step, StepId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StepEvent {
    Created {
        step: Step,
    },
    Completed {
        step: Step,
        timed_out: bool,
    },
    /// A cycle aborted with a hard error. `step_id` is absent when it failed before the row existed.
    Failed {
        step_id: Option<StepId>,
        project_id: String,
        /// Last phase completed before the failure.
        phase: StepPhase,
        error: String,
    },
    RolledBack {
        project_id: String,
        restored_sha: Option<String>,
        deactivated: Vec<StepId>,
    },
}

pub trait EventSink {
    fn publish(&self, event: &StepEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _event: &StepEvent) {}
}

impl EventSink for Sender<StepEvent> {
    fn publish(&self, event: &StepEvent) {
        if self.send(event.clone()).is_err() {
            debug!("event receiver dropped, discarding event");
        }
    }
}

impl<S: EventSink + ?Sized> EventSink for &S {
    fn publish(&self, event: &StepEvent) {
        (**self).publish(event);
    }
}
