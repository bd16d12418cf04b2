//! Observability Sinks
//!
//! Read-only feed of cycle state transitions and evaluation records for
//! dashboards and logs. Delivery is best-effort: `publish` must never
//! block the controller, so slow consumers lose events instead.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::evaluator::EvaluationRecord;
use crate::feedback_loop::{CycleState, EvaluationRole, LoopStatus};

/// Event emitted by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// Status changed; `state` is a copy taken after the change
    Transition {
        from: LoopStatus,
        to: LoopStatus,
        state: CycleState,
    },
    /// A cycle finished (any outcome); copy of the state at the boundary
    CycleCompleted { state: CycleState },
    Evaluation {
        cycle_id: u64,
        role: EvaluationRole,
        record: EvaluationRecord,
    },
}

/// Consumer of loop events
pub trait ObservabilitySink: Send + Sync {
    /// Must return promptly
    fn publish(&self, event: &LoopEvent);
}

/// Forwards events to a bounded tokio channel, dropping on backpressure
pub struct ChannelSink {
    tx: mpsc::Sender<LoopEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel
    pub fn new(buffer_size: usize) -> (Self, mpsc::Receiver<LoopEvent>) {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events lost to a full or closed channel
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ObservabilitySink for ChannelSink {
    fn publish(&self, event: &LoopEvent) {
        if let Err(e) = self.tx.try_send(event.clone()) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("Observability event dropped ({} total): {}", total, e);
        }
    }
}

/// Logs every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn publish(&self, event: &LoopEvent) {
        match event {
            LoopEvent::Transition { from, to, state } => match to {
                LoopStatus::Halted | LoopStatus::Diverging => warn!(
                    "Loop {:?} -> {:?} at cycle {} (active version {})",
                    from, to, state.cycle_id, state.active_version_id
                ),
                _ => info!(
                    "Loop {:?} -> {:?} at cycle {} (active version {})",
                    from, to, state.cycle_id, state.active_version_id
                ),
            },
            LoopEvent::CycleCompleted { state } => debug!(
                "Cycle {} done: active {}, rejections {}",
                state.cycle_id, state.active_version_id, state.consecutive_rejections
            ),
            LoopEvent::Evaluation { cycle_id, role, record } => debug!(
                "Cycle {} {:?} evaluation: version {} score {:.4} ({:?})",
                cycle_id, role, record.version_id, record.score, record.verdict
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> CycleState {
        CycleState {
            cycle_id: 3,
            active_version_id: 2,
            consecutive_rejections: 0,
            status: LoopStatus::Running,
            halt_reason: None,
        }
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.publish(&LoopEvent::CycleCompleted { state: state() });

        let event = rx.recv().await.unwrap();
        assert_eq!(event, LoopEvent::CycleCompleted { state: state() });
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, _rx) = ChannelSink::new(1);
        sink.publish(&LoopEvent::CycleCompleted { state: state() });
        sink.publish(&LoopEvent::CycleCompleted { state: state() });
        sink.publish(&LoopEvent::CycleCompleted { state: state() });
        assert_eq!(sink.dropped(), 2);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = LoopEvent::Transition {
            from: LoopStatus::Running,
            to: LoopStatus::Converged,
            state: state(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "transition");
        assert_eq!(json["to"], "converged");
    }
}
