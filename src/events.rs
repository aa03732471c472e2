//! Append-only event log and the recorder that owns it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

use crate::logging::{log_persist_failure, log_recorded};
use crate::sink::AnalyticsSink;
use crate::store::KeyValueStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentEvent {
    pub experiment_id: String,
    pub variant_id: String,
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversionScope {
    Experiment { experiment_id: String, event_type: String },
    FunnelStep { funnel_id: String, step_id: String },
}

impl ConversionScope {
    pub fn scope_id(&self) -> &str {
        match self {
            ConversionScope::Experiment { experiment_id, .. } => experiment_id,
            ConversionScope::FunnelStep { funnel_id, .. } => funnel_id,
        }
    }

    /// Event type for experiment conversions, step id for funnel steps.
    pub fn goal(&self) -> &str {
        match self {
            ConversionScope::Experiment { event_type, .. } => event_type,
            ConversionScope::FunnelStep { step_id, .. } => step_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionEvent {
    pub scope: ConversionScope,
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ConversionEvent {
    /// Unique-visitor key: user id when known, else session id.
    pub fn visitor_key(&self) -> &str {
        self.user_id.as_deref().unwrap_or(&self.session_id)
    }

    pub fn is_for_experiment(&self, id: &str) -> bool {
        matches!(&self.scope, ConversionScope::Experiment { experiment_id, .. } if experiment_id == id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventLog {
    assignments: Vec<AssignmentEvent>,
    conversions: Vec<ConversionEvent>,
    /// (experiment, session) -> index of the canonical assignment
    #[serde(skip)]
    canonical: HashMap<(String, String), usize>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(assignments: Vec<AssignmentEvent>, conversions: Vec<ConversionEvent>) -> Self {
        let mut log = Self { assignments, conversions, canonical: HashMap::new() };
        log.reindex();
        log
    }

    /// Rebuilds the canonical-assignment index; the earliest timestamp wins, ties go to
    /// the first appended.
    pub fn reindex(&mut self) {
        self.canonical.clear();
        for i in 0..self.assignments.len() {
            self.index_assignment(i);
        }
    }

    fn index_assignment(&mut self, i: usize) {
        let ev = &self.assignments[i];
        let key = (ev.experiment_id.clone(), ev.session_id.clone());
        let replace = match self.canonical.get(&key) {
            Some(&j) => ev.timestamp_ms < self.assignments[j].timestamp_ms,
            None => true,
        };
        if replace {
            self.canonical.insert(key, i);
        }
    }

    pub fn canonical_assignment(&self, experiment_id: &str, session_id: &str) -> Option<&AssignmentEvent> {
        self.canonical
            .get(&(experiment_id.to_string(), session_id.to_string()))
            .map(|&i| &self.assignments[i])
    }

    /// Canonical assignments for one experiment, keyed and ordered by session.
    pub fn canonical_assignments(&self, experiment_id: &str) -> BTreeMap<&str, &AssignmentEvent> {
        self.canonical
            .iter()
            .filter(|((exp, _), _)| exp == experiment_id)
            .map(|((_, session), &i)| (session.as_str(), &self.assignments[i]))
            .collect()
    }

    pub fn assignments(&self) -> &[AssignmentEvent] {
        &self.assignments
    }

    pub fn conversions(&self) -> &[ConversionEvent] {
        &self.conversions
    }

    pub fn references_experiment(&self, id: &str) -> bool {
        self.assignments.iter().any(|a| a.experiment_id == id) || self.conversions.iter().any(|c| c.is_for_experiment(id))
    }

    pub fn references_funnel(&self, id: &str) -> bool {
        self.conversions
            .iter()
            .any(|c| matches!(&c.scope, ConversionScope::FunnelStep { funnel_id, .. } if funnel_id == id))
    }

    pub fn len(&self) -> usize {
        self.assignments.len() + self.conversions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// SHA-256 over the serialized log, for checkpoint audit lines.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    fn push_assignment(&mut self, ev: AssignmentEvent) {
        self.assignments.push(ev);
        self.index_assignment(self.assignments.len() - 1);
    }

    fn push_conversion(&mut self, ev: ConversionEvent) {
        self.conversions.push(ev);
    }
}

/// Single entry point for appends. Each append checkpoints the whole log
/// (serialize-and-overwrite) and then notifies the sink; neither can fail the caller.
pub struct EventRecorder {
    log: EventLog,
    sink: Box<dyn AnalyticsSink>,
    key: String,
    persist_on_write: bool,
}

impl EventRecorder {
    pub fn new(log: EventLog, sink: Box<dyn AnalyticsSink>, key: String, persist_on_write: bool) -> Self {
        Self { log, sink, key, persist_on_write }
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn record_assignment(&mut self, ev: AssignmentEvent, store: &mut dyn KeyValueStore) {
        let props = json_props(&ev);
        log_recorded("assignment", &ev.experiment_id, &ev.session_id, self.log.len() + 1);
        self.log.push_assignment(ev);
        self.after_append(store, "experiment_assigned", props);
    }

    pub fn record_conversion(&mut self, ev: ConversionEvent, store: &mut dyn KeyValueStore) {
        let name = match ev.scope {
            ConversionScope::Experiment { .. } => "conversion",
            ConversionScope::FunnelStep { .. } => "funnel_step",
        };
        let props = json_props(&ev);
        log_recorded(name, ev.scope.scope_id(), &ev.session_id, self.log.len() + 1);
        self.log.push_conversion(ev);
        self.after_append(store, name, props);
    }

    fn after_append(&mut self, store: &mut dyn KeyValueStore, name: &str, props: Map<String, Value>) {
        if self.persist_on_write {
            self.checkpoint(store);
        }
        self.sink.send(name, &props);
    }

    /// Full-log overwrite; failures are logged and swallowed.
    pub fn checkpoint(&self, store: &mut dyn KeyValueStore) {
        let payload = match serde_json::to_value(&self.log) {
            Ok(v) => v,
            Err(err) => {
                log_persist_failure(&self.key, &anyhow::Error::from(err));
                return;
            }
        };
        if let Err(err) = store.save(&self.key, &payload) {
            log_persist_failure(&self.key, &err);
        }
    }
}

fn json_props<T: Serialize>(ev: &T) -> Map<String, Value> {
    match serde_json::to_value(ev) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            let mut map = Map::new();
            map.insert("event".to_string(), other);
            map
        }
        Err(err) => {
            let mut map = Map::new();
            map.insert("serialize_error".to_string(), json!(err.to_string()));
            map
        }
    }
}
