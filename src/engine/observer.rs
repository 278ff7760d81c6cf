use crate::types::TxnId;

/// Engine lifecycle notifications, delivered synchronously after the fact.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Committed { txn_id: TxnId, pages: usize },
    RolledBack { txn_id: TxnId },
    Checkpointed { pages: usize },
    TreeCreated { name: String },
    TreeDropped { name: String },
    Rekeyed { pages: usize },
}

/// Observer hook for commit/rollback/checkpoint notifications. Callbacks
/// run on the engine's thread and must not call back into the engine.
pub trait EngineObserver {
    fn on_event(&self, event: &EngineEvent);
}

pub struct NoopObserver;

impl EngineObserver for NoopObserver {
    fn on_event(&self, _event: &EngineEvent) {}
}

/// Forwards events to the tracing subscriber. Useful as a default in
/// long-running embedders.
pub struct TracingObserver;

impl EngineObserver for TracingObserver {
    fn on_event(&self, event: &EngineEvent) {
        tracing::debug!(?event, "engine event");
    }
}
