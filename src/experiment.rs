//! Experiment definitions, registry and traffic gating.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::{DefinitionError, Result};
use crate::hashing;
use crate::identity::{Visitor, VisitorAttributes};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    /// Relative weight on a 0..=100 scale; normalized at selection time.
    pub weight: f64,
}

impl Variant {
    pub fn new(id: impl Into<String>, weight: f64) -> Self {
        Self { id: id.into(), weight }
    }
}

/// Empty lists match everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudienceFilter {
    #[serde(default)]
    pub user_types: Vec<String>,
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub devices: Vec<String>,
}

fn list_matches(allowed: &[String], value: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match value {
        Some(v) => allowed.iter().any(|a| a.eq_ignore_ascii_case(v)),
        None => false,
    }
}

impl AudienceFilter {
    pub fn is_empty(&self) -> bool {
        self.user_types.is_empty() && self.countries.is_empty() && self.devices.is_empty()
    }

    pub fn matches(&self, attrs: &VisitorAttributes) -> bool {
        list_matches(&self.user_types, attrs.user_type.as_deref())
            && list_matches(&self.countries, attrs.country.as_deref())
            && list_matches(&self.devices, attrs.device.as_deref())
    }
}

/// Inclusive start, exclusive end; no end means open-ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveWindow {
    pub start_ms: u64,
    #[serde(default)]
    pub end_ms: Option<u64>,
}

impl ActiveWindow {
    pub fn open_from(start_ms: u64) -> Self {
        Self { start_ms, end_ms: None }
    }

    pub fn contains(&self, now_ms: u64) -> bool {
        now_ms >= self.start_ms && self.end_ms.map_or(true, |end| now_ms < end)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDefinition {
    pub id: String,
    pub name: String,
    pub variants: Vec<Variant>,
    pub traffic_allocation_percent: f64,
    #[serde(default)]
    pub audience: Option<AudienceFilter>,
    #[serde(default)]
    pub active_window: ActiveWindow,
    pub is_active: bool,
}

impl ExperimentDefinition {
    /// Active, fully allocated, open-ended from the epoch.
    pub fn new(id: impl Into<String>, name: impl Into<String>, variants: Vec<Variant>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            variants,
            traffic_allocation_percent: 100.0,
            audience: None,
            active_window: ActiveWindow::default(),
            is_active: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(DefinitionError::EmptyId);
        }
        if self.variants.is_empty() {
            return Err(DefinitionError::NoVariants(self.id.clone()));
        }
        let mut seen = HashSet::new();
        for v in &self.variants {
            if !(0.0..=100.0).contains(&v.weight) {
                return Err(DefinitionError::WeightOutOfRange {
                    experiment: self.id.clone(),
                    variant: v.id.clone(),
                    weight: v.weight,
                });
            }
            if !seen.insert(v.id.as_str()) {
                return Err(DefinitionError::DuplicateVariant {
                    experiment: self.id.clone(),
                    variant: v.id.clone(),
                });
            }
        }
        if !(0.0..=100.0).contains(&self.traffic_allocation_percent) {
            return Err(DefinitionError::AllocationOutOfRange(self.id.clone()));
        }
        if let Some(end) = self.active_window.end_ms {
            if end <= self.active_window.start_ms {
                return Err(DefinitionError::EmptyWindow(self.id.clone()));
            }
        }
        Ok(())
    }

    /// Everything except activity and window, which stay mutable after events reference
    /// the experiment.
    fn same_shape(&self, other: &Self) -> bool {
        self.name == other.name
            && self.variants == other.variants
            && self.traffic_allocation_percent == other.traffic_allocation_percent
            && self.audience == other.audience
    }

    pub fn variant_ids(&self) -> impl Iterator<Item = &str> {
        self.variants.iter().map(|v| v.id.as_str())
    }
}

// =============================================================================
// Gating
// =============================================================================

/// The first gate a visitor failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Missing,
    Inactive,
    Allocation,
    Audience,
    Window,
}

impl Gate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gate::Missing => "missing",
            Gate::Inactive => "inactive",
            Gate::Allocation => "allocation",
            Gate::Audience => "audience",
            Gate::Window => "window",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub variant_id: String,
    pub bucket: u32,
    pub variant_bucket: u32,
}

/// Gates that apply to every call, including sessions that already hold a variant.
pub fn still_open(def: &ExperimentDefinition, now_ms: u64) -> std::result::Result<(), Gate> {
    if !def.is_active {
        return Err(Gate::Inactive);
    }
    if !def.active_window.contains(now_ms) {
        return Err(Gate::Window);
    }
    Ok(())
}

/// Runs the hard gates in order and picks a variant. Pure: no recording happens here.
pub fn admit(def: &ExperimentDefinition, visitor: &Visitor, now_ms: u64) -> std::result::Result<Admission, Gate> {
    if !def.is_active {
        return Err(Gate::Inactive);
    }
    let identity = visitor.identity();
    let bucket = hashing::bucket(identity, &def.id);
    if f64::from(bucket) >= def.traffic_allocation_percent {
        return Err(Gate::Allocation);
    }
    if let Some(filter) = &def.audience {
        if !filter.matches(&visitor.attributes) {
            return Err(Gate::Audience);
        }
    }
    if !def.active_window.contains(now_ms) {
        return Err(Gate::Window);
    }
    let variant_bucket = hashing::variant_bucket(identity, &def.id);
    let variant = select_variant(&def.variants, variant_bucket).ok_or(Gate::Missing)?;
    Ok(Admission { variant_id: variant.id.clone(), bucket, variant_bucket })
}

/// Cumulative normalized ranges over [0, 100); the first variant whose upper bound
/// exceeds the bucket wins. Rounding gaps and all-zero weights fall back to the first
/// variant. `None` only for an empty list.
pub fn select_variant(variants: &[Variant], bucket: u32) -> Option<&Variant> {
    let first = variants.first()?;
    let total: f64 = variants.iter().map(|v| v.weight.max(0.0)).sum();
    if total <= 0.0 {
        return Some(first);
    }
    // compare bucket * total against cumulative * 100 to avoid dividing
    let point = f64::from(bucket) * total;
    let mut cumulative = 0.0;
    for v in variants {
        cumulative += v.weight.max(0.0);
        if cumulative * f64::from(hashing::BUCKETS) > point {
            return Some(v);
        }
    }
    Some(first)
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Default)]
pub struct ExperimentRegistry {
    experiments: BTreeMap<String, ExperimentDefinition>,
}

impl ExperimentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(defs: Vec<ExperimentDefinition>) -> Self {
        let experiments = defs.into_iter().map(|d| (d.id.clone(), d)).collect();
        Self { experiments }
    }

    /// Idempotent upsert by id. `referenced` marks experiments that already have events,
    /// which freezes everything but `is_active` and `active_window`.
    pub fn upsert(&mut self, def: ExperimentDefinition, referenced: bool) -> Result<Upsert> {
        def.validate()?;
        match self.experiments.get_mut(&def.id) {
            None => {
                self.experiments.insert(def.id.clone(), def);
                Ok(Upsert::Inserted)
            }
            Some(existing) if *existing == def => Ok(Upsert::Unchanged),
            Some(existing) => {
                if referenced && !existing.same_shape(&def) {
                    return Err(DefinitionError::Locked(def.id));
                }
                *existing = def;
                Ok(Upsert::Updated)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&ExperimentDefinition> {
        self.experiments.get(id)
    }

    pub fn set_active(&mut self, id: &str, active: bool) -> bool {
        match self.experiments.get_mut(id) {
            Some(def) => {
                def.is_active = active;
                true
            }
            None => false,
        }
    }

    pub fn set_window(&mut self, id: &str, window: ActiveWindow) -> Result<bool> {
        let Some(def) = self.experiments.get_mut(id) else {
            return Ok(false);
        };
        if window.end_ms.is_some_and(|end| end <= window.start_ms) {
            return Err(DefinitionError::EmptyWindow(id.to_string()));
        }
        def.active_window = window;
        Ok(true)
    }

    pub fn remove(&mut self, id: &str) -> Option<ExperimentDefinition> {
        self.experiments.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExperimentDefinition> {
        self.experiments.values()
    }

    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }

    pub fn to_definitions(&self) -> Vec<ExperimentDefinition> {
        self.experiments.values().cloned().collect()
    }
}
