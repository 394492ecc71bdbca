//! Event Bus (spec §5/§6): pub/sub of lifecycle events for external
//! observers (a dashboard, a logger, a CLI progress view) — fire-and-forget
//! broadcast, no persistence, no required subscribers.
//!
//! Wire shape is `{ type, timestamp, workspace_id, data }` (spec §6
//! External Interfaces "Event stream"). Ordering guarantee (P11):
//! `cycle.started` precedes all `agent.*`, `synthesis.*` precedes `node.*`,
//! `cycle.completed` (or `cycle.failed`) is last. The bus itself does not
//! enforce this — it is a property of call order in `cycle.rs`'s executor,
//! verified here only for the emitter's serialized `type` strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;

/// Default channel capacity (events). A cycle emits on the order of tens of
/// events; this comfortably covers several concurrent cycles' backlog for a
/// slow subscriber.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_000;

/// One of the eleven event types named in spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[serde(rename = "cycle.started")]
    CycleStarted,
    #[serde(rename = "cycle.step")]
    CycleStep,
    #[serde(rename = "cycle.completed")]
    CycleCompleted,
    #[serde(rename = "cycle.failed")]
    CycleFailed,
    #[serde(rename = "agent.started")]
    AgentStarted,
    #[serde(rename = "agent.search")]
    AgentSearch,
    #[serde(rename = "agent.completed")]
    AgentCompleted,
    #[serde(rename = "synthesis.started")]
    SynthesisStarted,
    #[serde(rename = "synthesis.completed")]
    SynthesisCompleted,
    #[serde(rename = "node.created")]
    NodeCreated,
    #[serde(rename = "node.updated")]
    NodeUpdated,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CycleStarted => "cycle.started",
            Self::CycleStep => "cycle.step",
            Self::CycleCompleted => "cycle.completed",
            Self::CycleFailed => "cycle.failed",
            Self::AgentStarted => "agent.started",
            Self::AgentSearch => "agent.search",
            Self::AgentCompleted => "agent.completed",
            Self::SynthesisStarted => "synthesis.started",
            Self::SynthesisCompleted => "synthesis.completed",
            Self::NodeCreated => "node.created",
            Self::NodeUpdated => "node.updated",
        }
    }
}

/// One event on the bus: `{ type, timestamp, workspace_id, data }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub workspace_id: String,
    pub data: Value,
}

/// Central event bus: a `tokio::sync::broadcast` channel. Cloning the bus
/// is cheap (it only clones the sender); share it via `Arc` when several
/// owners need to emit.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event. Fire-and-forget: dropped silently if there are no
    /// subscribers.
    pub fn emit(&self, event: Event) {
        debug!(event_type = event.event_type.as_str(), workspace_id = %event.workspace_id, "event emitted");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// An emitter bound to one workspace, for convenient per-cycle use.
    pub fn emitter_for(&self, workspace_id: impl Into<String>) -> EventEmitter {
        EventEmitter {
            tx: self.tx.clone(),
            workspace_id: workspace_id.into(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Cheaply-cloneable handle bound to one workspace, with one convenience
/// method per event type named in spec §6.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<Event>,
    workspace_id: String,
}

impl EventEmitter {
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    fn emit(&self, event_type: EventType, data: Value) {
        let event = Event {
            event_type,
            timestamp: Utc::now(),
            workspace_id: self.workspace_id.clone(),
            data,
        };
        debug!(event_type = event_type.as_str(), workspace_id = %self.workspace_id, "event emitted");
        let _ = self.tx.send(event);
    }

    pub fn cycle_started(&self, cycle_id: i64, target_node_id: Option<&str>) {
        self.emit(EventType::CycleStarted, json!({ "cycle_id": cycle_id, "target_node_id": target_node_id }));
    }

    pub fn cycle_step(&self, cycle_id: i64, stage: &str) {
        self.emit(EventType::CycleStep, json!({ "cycle_id": cycle_id, "stage": stage }));
    }

    pub fn cycle_completed(&self, cycle_id: i64, total_cost_usd: f64, duration_seconds: f64) {
        self.emit(
            EventType::CycleCompleted,
            json!({ "cycle_id": cycle_id, "total_cost_usd": total_cost_usd, "duration_seconds": duration_seconds }),
        );
    }

    pub fn cycle_failed(&self, cycle_id: i64, stage: &str, message: &str) {
        self.emit(EventType::CycleFailed, json!({ "cycle_id": cycle_id, "failed_stage": stage, "message": message }));
    }

    pub fn agent_started(&self, cycle_id: i64, agent_name: &str) {
        self.emit(EventType::AgentStarted, json!({ "cycle_id": cycle_id, "agent_name": agent_name }));
    }

    pub fn agent_search(&self, cycle_id: i64, agent_name: &str, query: &str) {
        self.emit(EventType::AgentSearch, json!({ "cycle_id": cycle_id, "agent_name": agent_name, "query": query }));
    }

    pub fn agent_completed(&self, cycle_id: i64, agent_name: &str, cost_usd: f64, failed: bool) {
        self.emit(
            EventType::AgentCompleted,
            json!({ "cycle_id": cycle_id, "agent_name": agent_name, "cost_usd": cost_usd, "failed": failed }),
        );
    }

    pub fn synthesis_started(&self, cycle_id: i64, worker_count: usize) {
        self.emit(EventType::SynthesisStarted, json!({ "cycle_id": cycle_id, "worker_count": worker_count }));
    }

    pub fn synthesis_completed(&self, cycle_id: i64, consensus_count: usize, contradiction_count: usize) {
        self.emit(
            EventType::SynthesisCompleted,
            json!({ "cycle_id": cycle_id, "consensus_count": consensus_count, "contradiction_count": contradiction_count }),
        );
    }

    pub fn node_created(&self, cycle_id: i64, node_id: &str, claim: &str) {
        self.emit(EventType::NodeCreated, json!({ "cycle_id": cycle_id, "node_id": node_id, "claim": claim }));
    }

    pub fn node_updated(&self, cycle_id: i64, node_id: &str, claim: &str) {
        self.emit(EventType::NodeUpdated, json!({ "cycle_id": cycle_id, "node_id": node_id, "claim": claim }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_bus_tracks_subscriber_count() {
        let bus = EventBus::new(16);
        assert_eq!(bus.subscriber_count(), 0);
        let _rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn emitter_round_trips_event_type_and_workspace() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let emitter = bus.emitter_for("ws-1");

        emitter.cycle_started(7, Some("abc123"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::CycleStarted);
        assert_eq!(event.workspace_id, "ws-1");
        assert_eq!(event.data["cycle_id"], 7);
    }

    #[tokio::test]
    async fn emit_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.emit(Event {
            event_type: EventType::CycleFailed,
            timestamp: Utc::now(),
            workspace_id: "ws".to_string(),
            data: json!({}),
        });
    }

    #[tokio::test]
    async fn full_cycle_lifecycle_emits_events_in_spec_order() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let emitter = bus.emitter_for("ws-order");

        emitter.cycle_started(1, Some("target"));
        emitter.agent_started(1, "agent-1");
        emitter.agent_search(1, "agent-1", "query");
        emitter.agent_completed(1, "agent-1", 0.01, false);
        emitter.synthesis_started(1, 1);
        emitter.synthesis_completed(1, 2, 0);
        emitter.node_created(1, "node-1", "claim");
        emitter.node_updated(1, "node-2", "claim");
        emitter.cycle_completed(1, 0.05, 12.3);

        let mut observed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            observed.push(event.event_type);
        }

        assert_eq!(
            observed,
            vec![
                EventType::CycleStarted,
                EventType::AgentStarted,
                EventType::AgentSearch,
                EventType::AgentCompleted,
                EventType::SynthesisStarted,
                EventType::SynthesisCompleted,
                EventType::NodeCreated,
                EventType::NodeUpdated,
                EventType::CycleCompleted,
            ]
        );
    }

    #[test]
    fn event_type_as_str_matches_wire_format() {
        assert_eq!(EventType::CycleStarted.as_str(), "cycle.started");
        assert_eq!(EventType::NodeUpdated.as_str(), "node.updated");
    }

    #[test]
    fn event_serializes_with_dotted_type_field() {
        let event = Event {
            event_type: EventType::SynthesisCompleted,
            timestamp: Utc::now(),
            workspace_id: "ws".to_string(),
            data: json!({ "consensus_count": 1 }),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "synthesis.completed");
    }
}
