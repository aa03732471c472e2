//! The engine context: registries, recorder and collaborators behind one owned value.
//!
//! Mutations take `&mut self`, reads take `&self`. Registration is the only fallible
//! surface; recording and analytics degrade to `None`, no-ops or low-confidence results.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::aggregate::{
    self, ExperimentReport, FunnelAnalytics, Suggestion, SuggestionThresholds, TimeRange,
};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{DefinitionError, Result};
use crate::events::{AssignmentEvent, ConversionEvent, ConversionScope, EventLog, EventRecorder};
use crate::experiment::{admit, still_open, ActiveWindow, ExperimentDefinition, ExperimentRegistry, Gate, Upsert};
use crate::funnel::{FunnelDefinition, FunnelRegistry};
use crate::identity::{IdentityProvider, SessionIdentity, Visitor};
use crate::instrument::{AutoInstrumenter, UiEvent, UiEventStream};
use crate::logging::{self, log_assignment, log_gate, log_load_fallback, log_persist_failure, obj, v_str, Domain, Level};
use crate::significance::{SignificanceConfig, SignificanceResult};
use crate::sink::{self, AnalyticsSink, NullSink};
use crate::store::{KeyValueStore, MemoryStore};

const EXPERIMENTS_KEY: &str = "experiments";
const FUNNELS_KEY: &str = "funnels";
const EVENTS_KEY: &str = "events";

pub struct Engine {
    config: EngineConfig,
    store: Box<dyn KeyValueStore>,
    clock: Box<dyn Clock>,
    identity: Box<dyn IdentityProvider>,
    experiments: ExperimentRegistry,
    funnels: FunnelRegistry,
    recorder: EventRecorder,
    instrumenter: AutoInstrumenter,
}

impl Engine {
    /// Reloads experiments, funnels and the event log from `store`. Anything missing,
    /// unreadable or malformed starts empty.
    pub fn open(
        config: EngineConfig,
        store: Box<dyn KeyValueStore>,
        sink: Box<dyn AnalyticsSink>,
        clock: Box<dyn Clock>,
        identity: Box<dyn IdentityProvider>,
    ) -> Self {
        let experiments: Vec<ExperimentDefinition> = load_or_default(store.as_ref(), &config.key(EXPERIMENTS_KEY));
        let experiments = experiments
            .into_iter()
            .filter(|d| keep_valid(&config.key(EXPERIMENTS_KEY), &d.id, d.validate()))
            .collect();
        let funnels: Vec<FunnelDefinition> = load_or_default(store.as_ref(), &config.key(FUNNELS_KEY));
        let funnels = funnels
            .into_iter()
            .filter(|d| keep_valid(&config.key(FUNNELS_KEY), &d.id, d.validate()))
            .collect();
        let mut log: EventLog = load_or_default(store.as_ref(), &config.key(EVENTS_KEY));
        log.reindex();

        let engine = Self {
            recorder: EventRecorder::new(log, sink, config.key(EVENTS_KEY), config.persist_on_write),
            experiments: ExperimentRegistry::from_definitions(experiments),
            funnels: FunnelRegistry::from_definitions(funnels),
            instrumenter: AutoInstrumenter::new(),
            config,
            store,
            clock,
            identity,
        };
        logging::log(
            Level::Info,
            Domain::System,
            "opened",
            obj(&[
                ("experiments", json!(engine.experiments.len())),
                ("funnels", json!(engine.funnels.len())),
                ("events", json!(engine.recorder.log().len())),
                ("digest", v_str(&engine.recorder.log().digest())),
            ]),
        );
        engine
    }

    /// Store and sink from `config`, system clock, a fresh session.
    pub fn from_config(config: EngineConfig, runtime: Option<tokio::runtime::Handle>) -> anyhow::Result<Self> {
        let store = config.store_kind.build(&config)?;
        let sink = sink::from_config(&config, runtime);
        let clock = SystemClock;
        let identity = SessionIdentity::start(clock.now_ms());
        Ok(Self::open(config, store, sink, Box::new(clock), Box::new(identity)))
    }

    /// Memory store, no sink, system clock. Nothing is checkpointed until asked.
    pub fn in_memory(visitor: Visitor) -> Self {
        Self::open(
            EngineConfig { persist_on_write: false, ..EngineConfig::default() },
            Box::new(MemoryStore::new()),
            Box::new(NullSink),
            Box::new(SystemClock),
            Box::new(SessionIdentity::from_visitor(visitor)),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn visitor(&self) -> &Visitor {
        self.identity.current()
    }

    pub fn set_identity(&mut self, identity: Box<dyn IdentityProvider>) {
        self.identity = identity;
    }

    pub fn event_log(&self) -> &EventLog {
        self.recorder.log()
    }

    /// Hands the store back, e.g. to reopen it.
    pub fn into_store(self) -> Box<dyn KeyValueStore> {
        self.store
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub fn register_experiment(&mut self, def: ExperimentDefinition) -> Result<Upsert> {
        let referenced = self.recorder.log().references_experiment(&def.id);
        let id = def.id.clone();
        let outcome = self.experiments.upsert(def, referenced)?;
        if outcome != Upsert::Unchanged {
            self.persist_experiments();
        }
        logging::log(
            Level::Info,
            Domain::Assign,
            "experiment_registered",
            obj(&[("experiment_id", v_str(&id)), ("outcome", v_str(&format!("{:?}", outcome)))]),
        );
        Ok(outcome)
    }

    pub fn register_funnel(&mut self, def: FunnelDefinition) -> Result<Upsert> {
        let id = def.id.clone();
        let outcome = self.funnels.upsert(def)?;
        if outcome != Upsert::Unchanged {
            self.persist_funnels();
        }
        logging::log(
            Level::Info,
            Domain::Funnel,
            "funnel_registered",
            obj(&[("funnel_id", v_str(&id)), ("outcome", v_str(&format!("{:?}", outcome)))]),
        );
        Ok(outcome)
    }

    pub fn experiments(&self) -> impl Iterator<Item = &ExperimentDefinition> {
        self.experiments.iter()
    }

    pub fn funnels(&self) -> impl Iterator<Item = &FunnelDefinition> {
        self.funnels.iter()
    }

    pub fn set_experiment_active(&mut self, id: &str, active: bool) -> bool {
        let found = self.experiments.set_active(id, active);
        if found {
            self.persist_experiments();
        }
        found
    }

    pub fn set_funnel_active(&mut self, id: &str, active: bool) -> bool {
        let found = self.funnels.set_active(id, active);
        if found {
            self.persist_funnels();
        }
        found
    }

    pub fn set_active_window(&mut self, id: &str, window: ActiveWindow) -> Result<bool> {
        let found = self.experiments.set_window(id, window)?;
        if found {
            self.persist_experiments();
        }
        Ok(found)
    }

    /// Only experiments nothing in the log refers to can be removed.
    pub fn remove_experiment(&mut self, id: &str) -> Result<bool> {
        if self.recorder.log().references_experiment(id) {
            return Err(DefinitionError::InUse(id.to_string()));
        }
        let removed = self.experiments.remove(id).is_some();
        if removed {
            self.persist_experiments();
        }
        Ok(removed)
    }

    pub fn remove_funnel(&mut self, id: &str) -> Result<bool> {
        if self.recorder.log().references_funnel(id) {
            return Err(DefinitionError::InUse(id.to_string()));
        }
        let removed = self.funnels.remove(id).is_some();
        if removed {
            self.persist_funnels();
        }
        Ok(removed)
    }

    // =========================================================================
    // Assignment and recording
    // =========================================================================

    pub fn get_variant(&mut self, experiment_id: &str) -> Option<String> {
        let visitor = self.identity.current().clone();
        self.get_variant_for(experiment_id, &visitor)
    }

    /// Active and window gates run on every call. A session that already holds a
    /// variant keeps it, even after sign-in; allocation and audience only decide first
    /// assignments.
    pub fn get_variant_for(&mut self, experiment_id: &str, visitor: &Visitor) -> Option<String> {
        let Some(def) = self.experiments.get(experiment_id) else {
            log_gate(experiment_id, &visitor.session_id, Gate::Missing.as_str());
            return None;
        };
        let now = self.clock.now_ms();
        if let Err(gate) = still_open(def, now) {
            log_gate(experiment_id, &visitor.session_id, gate.as_str());
            return None;
        }
        if let Some(existing) = self.recorder.log().canonical_assignment(experiment_id, &visitor.session_id) {
            return Some(existing.variant_id.clone());
        }
        let admission = match admit(def, visitor, now) {
            Ok(a) => a,
            Err(gate) => {
                log_gate(experiment_id, &visitor.session_id, gate.as_str());
                return None;
            }
        };
        log_assignment(experiment_id, &visitor.session_id, &admission.variant_id, admission.bucket);
        let event = AssignmentEvent {
            experiment_id: experiment_id.to_string(),
            variant_id: admission.variant_id.clone(),
            session_id: visitor.session_id.clone(),
            user_id: visitor.user_id.clone(),
            timestamp_ms: now,
        };
        self.recorder.record_assignment(event, self.store.as_mut());
        Some(admission.variant_id)
    }

    pub fn record_conversion(
        &mut self,
        experiment_id: &str,
        event_type: &str,
        value: Option<f64>,
        metadata: Option<Map<String, Value>>,
    ) {
        let visitor = self.identity.current().clone();
        self.record_conversion_for(&visitor, experiment_id, event_type, value, metadata);
    }

    /// No-op for unknown experiments.
    pub fn record_conversion_for(
        &mut self,
        visitor: &Visitor,
        experiment_id: &str,
        event_type: &str,
        value: Option<f64>,
        metadata: Option<Map<String, Value>>,
    ) {
        if self.experiments.get(experiment_id).is_none() {
            logging::log(
                Level::Debug,
                Domain::Record,
                "conversion_skipped",
                obj(&[("experiment_id", v_str(experiment_id)), ("session_id", v_str(&visitor.session_id))]),
            );
            return;
        }
        let event = ConversionEvent {
            scope: ConversionScope::Experiment {
                experiment_id: experiment_id.to_string(),
                event_type: event_type.to_string(),
            },
            session_id: visitor.session_id.clone(),
            user_id: visitor.user_id.clone(),
            value,
            timestamp_ms: self.clock.now_ms(),
            metadata: metadata.unwrap_or_default(),
        };
        self.recorder.record_conversion(event, self.store.as_mut());
    }

    pub fn record_funnel_step(&mut self, funnel_id: &str, step_id: &str, metadata: Option<Map<String, Value>>) {
        let visitor = self.identity.current().clone();
        self.record_funnel_step_for(&visitor, funnel_id, step_id, metadata);
    }

    /// No-op unless the funnel is registered, active, and has the step.
    pub fn record_funnel_step_for(
        &mut self,
        visitor: &Visitor,
        funnel_id: &str,
        step_id: &str,
        metadata: Option<Map<String, Value>>,
    ) {
        let known = self
            .funnels
            .get(funnel_id)
            .is_some_and(|f| f.is_active && f.step(step_id).is_some());
        if !known {
            logging::log(
                Level::Debug,
                Domain::Funnel,
                "step_skipped",
                obj(&[
                    ("funnel_id", v_str(funnel_id)),
                    ("step_id", v_str(step_id)),
                    ("session_id", v_str(&visitor.session_id)),
                ]),
            );
            return;
        }
        let event = ConversionEvent {
            scope: ConversionScope::FunnelStep { funnel_id: funnel_id.to_string(), step_id: step_id.to_string() },
            session_id: visitor.session_id.clone(),
            user_id: visitor.user_id.clone(),
            value: None,
            timestamp_ms: self.clock.now_ms(),
            metadata: metadata.unwrap_or_default(),
        };
        self.recorder.record_conversion(event, self.store.as_mut());
    }

    // =========================================================================
    // Auto-instrumentation
    // =========================================================================

    /// Records every funnel step the event satisfies; returns how many.
    pub fn handle_ui_event(&mut self, event: &UiEvent) -> usize {
        let visitor = self.identity.current().clone();
        self.handle_ui_event_for(&visitor, event)
    }

    pub fn handle_ui_event_for(&mut self, visitor: &Visitor, event: &UiEvent) -> usize {
        let matched = self.instrumenter.matches(&self.funnels, event);
        for m in &matched {
            self.record_funnel_step_for(visitor, &m.funnel_id, &m.step_id, Some(event.metadata()));
        }
        matched.len()
    }

    /// Consumes everything currently pending on `stream`.
    pub fn drain(&mut self, stream: &mut dyn UiEventStream) -> usize {
        let mut recorded = 0;
        while let Some(event) = stream.next_event() {
            recorded += self.handle_ui_event(&event);
        }
        recorded
    }

    // =========================================================================
    // Analytics
    // =========================================================================

    pub fn get_funnel_analytics(&self, funnel_id: &str) -> Option<FunnelAnalytics> {
        let def = self.funnels.get(funnel_id)?;
        Some(aggregate::funnel_analytics(def, self.recorder.log()))
    }

    pub fn get_funnel_suggestions(&self, funnel_id: &str) -> Option<Vec<Suggestion>> {
        let analytics = self.get_funnel_analytics(funnel_id)?;
        let thresholds = SuggestionThresholds {
            drop_off_pct: self.config.drop_off_alert_pct,
            low_conversion_pct: self.config.low_conversion_pct,
            low_volume_users: self.config.low_volume_users,
        };
        Some(aggregate::suggestions(&analytics, &thresholds))
    }

    pub fn get_conversion_rate(&self, goal_id: &str, range: Option<TimeRange>) -> f64 {
        aggregate::conversion_rate(self.recorder.log(), goal_id, range.as_ref())
    }

    /// Unknown experiments come back as insufficient data.
    pub fn get_significance(&self, experiment_id: &str) -> SignificanceResult {
        self.get_experiment_report(experiment_id)
            .map(|r| r.significance)
            .unwrap_or_else(SignificanceResult::insufficient)
    }

    pub fn get_experiment_report(&self, experiment_id: &str) -> Option<ExperimentReport> {
        let def = self.experiments.get(experiment_id)?;
        Some(aggregate::experiment_report(def, self.recorder.log(), &self.significance_config()))
    }

    fn significance_config(&self) -> SignificanceConfig {
        SignificanceConfig { min_sample_size: self.config.min_sample_size, z_threshold: self.config.z_threshold }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Writes registries and the full log regardless of `persist_on_write`.
    pub fn checkpoint(&mut self) {
        self.persist_experiments();
        self.persist_funnels();
        self.recorder.checkpoint(self.store.as_mut());
    }

    fn persist_experiments(&mut self) {
        let key = self.config.key(EXPERIMENTS_KEY);
        save_json(self.store.as_mut(), &key, &self.experiments.to_definitions());
    }

    fn persist_funnels(&mut self) {
        let key = self.config.key(FUNNELS_KEY);
        save_json(self.store.as_mut(), &key, &self.funnels.to_definitions());
    }
}

fn save_json<T: Serialize>(store: &mut dyn KeyValueStore, key: &str, value: &T) {
    let result = serde_json::to_value(value)
        .map_err(anyhow::Error::from)
        .and_then(|v| store.save(key, &v));
    if let Err(err) = result {
        log_persist_failure(key, &err);
    }
}

fn load_or_default<T: DeserializeOwned + Default>(store: &dyn KeyValueStore, key: &str) -> T {
    match store.load(key) {
        Ok(Some(raw)) => match serde_json::from_value(raw) {
            Ok(v) => v,
            Err(err) => {
                log_load_fallback(key, &err.to_string());
                T::default()
            }
        },
        Ok(None) => T::default(),
        Err(err) => {
            log_load_fallback(key, &format!("{:#}", err));
            T::default()
        }
    }
}

fn keep_valid(key: &str, id: &str, check: Result<()>) -> bool {
    match check {
        Ok(()) => true,
        Err(err) => {
            log_load_fallback(key, &format!("dropping {}: {}", id, err));
            false
        }
    }
}
