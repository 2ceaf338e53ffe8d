//! Loyalty event bus — trait for emitting loyalty events from the engine.
//!
//! The engine accepts an `Arc<dyn EventSink>` and emits one event per
//! committed ledger entry, tier change, account lifecycle step, and reward
//! consumption. Events are emitted after commit and never under an account
//! lock.

use crate::loyalty::{LoyaltyEvent, LoyaltyEventType};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Receives loyalty events. Implementations forward them to analytics,
/// notification or webhook pipelines.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LoyaltyEvent);
}

/// No-op sink for deployments that don't consume events.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: LoyaltyEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<LoyaltyEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<LoyaltyEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: LoyaltyEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: LoyaltyEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for a `LoyaltyEvent` stamped now.
pub fn make_event(
    event_type: LoyaltyEventType,
    account_id: Uuid,
    user_id: impl Into<String>,
    points: Option<i64>,
    tier: Option<String>,
    reference_id: Option<String>,
) -> LoyaltyEvent {
    LoyaltyEvent {
        event_id: Uuid::new_v4(),
        event_type,
        account_id,
        user_id: user_id.into(),
        points,
        tier,
        reference_id,
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op event bus.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
