//! Funnel definitions and registry.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::{DefinitionError, Result};
use crate::experiment::Upsert;

/// How a UI event is recognised as reaching a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchRule {
    /// URL substring match on navigation.
    PageView { url_contains: String },
    /// CSS selector against the activated element or one of its ancestors.
    ElementInteraction { selector: String },
    /// CSS selector against the submitted form.
    FormCompletion { selector: String },
    /// Named application event; also the rule for steps recorded only by hand.
    Custom { event_name: String },
}

impl MatchRule {
    pub fn kind(&self) -> &'static str {
        match self {
            MatchRule::PageView { .. } => "page_view",
            MatchRule::ElementInteraction { .. } => "element_interaction",
            MatchRule::FormCompletion { .. } => "form_completion",
            MatchRule::Custom { .. } => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelStep {
    pub id: String,
    pub match_rule: MatchRule,
    pub order: u32,
    #[serde(default = "default_required")]
    pub is_required: bool,
}

fn default_required() -> bool {
    true
}

impl FunnelStep {
    pub fn new(id: impl Into<String>, order: u32, match_rule: MatchRule) -> Self {
        Self { id: id.into(), match_rule, order, is_required: true }
    }

    pub fn optional(mut self) -> Self {
        self.is_required = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelDefinition {
    pub id: String,
    pub name: String,
    pub steps: Vec<FunnelStep>,
    pub is_active: bool,
}

impl FunnelDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, steps: Vec<FunnelStep>) -> Self {
        Self { id: id.into(), name: name.into(), steps, is_active: true }
    }

    /// Steps numbered in list order with `Custom` rules named after the step id.
    pub fn with_custom_steps(id: impl Into<String>, name: impl Into<String>, step_ids: &[&str]) -> Self {
        let steps = step_ids
            .iter()
            .enumerate()
            .map(|(i, s)| FunnelStep::new(*s, i as u32 + 1, MatchRule::Custom { event_name: (*s).to_string() }))
            .collect();
        Self::new(id, name, steps)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(DefinitionError::EmptyId);
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps(self.id.clone()));
        }
        let mut ids = HashSet::new();
        let mut prev: Option<u32> = None;
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(DefinitionError::DuplicateStep {
                    funnel: self.id.clone(),
                    step: step.id.clone(),
                });
            }
            if prev.is_some_and(|p| step.order <= p) {
                return Err(DefinitionError::StepOrder {
                    funnel: self.id.clone(),
                    step: step.id.clone(),
                });
            }
            prev = Some(step.order);
        }
        Ok(())
    }

    pub fn step(&self, step_id: &str) -> Option<&FunnelStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FunnelRegistry {
    funnels: BTreeMap<String, FunnelDefinition>,
}

impl FunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(defs: Vec<FunnelDefinition>) -> Self {
        Self { funnels: defs.into_iter().map(|d| (d.id.clone(), d)).collect() }
    }

    /// Idempotent upsert by id.
    pub fn upsert(&mut self, def: FunnelDefinition) -> Result<Upsert> {
        def.validate()?;
        match self.funnels.get_mut(&def.id) {
            None => {
                self.funnels.insert(def.id.clone(), def);
                Ok(Upsert::Inserted)
            }
            Some(existing) if *existing == def => Ok(Upsert::Unchanged),
            Some(existing) => {
                *existing = def;
                Ok(Upsert::Updated)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&FunnelDefinition> {
        self.funnels.get(id)
    }

    pub fn set_active(&mut self, id: &str, active: bool) -> bool {
        match self.funnels.get_mut(id) {
            Some(def) => {
                def.is_active = active;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<FunnelDefinition> {
        self.funnels.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunnelDefinition> {
        self.funnels.values()
    }

    pub fn active(&self) -> impl Iterator<Item = &FunnelDefinition> {
        self.funnels.values().filter(|f| f.is_active)
    }

    pub fn len(&self) -> usize {
        self.funnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funnels.is_empty()
    }

    pub fn to_definitions(&self) -> Vec<FunnelDefinition> {
        self.funnels.values().cloned().collect()
    }
}
