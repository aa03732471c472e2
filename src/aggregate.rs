//! Read-only analytics over the event log.
//!
//! Nothing here mutates state or is persisted; every view is recomputed from the log,
//! so repeated calls without intervening writes return identical results.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::events::{ConversionEvent, ConversionScope, EventLog};
use crate::experiment::ExperimentDefinition;
use crate::funnel::FunnelDefinition;
use crate::logging::log_significance;
use crate::significance::{compare_arms, SignificanceConfig, SignificanceResult, VariantCounts};

// =============================================================================
// Funnels
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelStepAnalytics {
    pub step_id: String,
    pub order: u32,
    pub unique_visitors: u64,
    pub conversion_rate_from_previous: f64,
    pub drop_off_rate_from_previous: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelAnalytics {
    pub funnel_id: String,
    /// Distinct visitors seen at any step.
    pub total_users: u64,
    pub steps: Vec<FunnelStepAnalytics>,
    pub overall_conversion_rate: f64,
}

fn pct(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        (num as f64 * 100.0 / den as f64).clamp(0.0, 100.0)
    }
}

/// Per-step unique visitors in definition order. A visitor seen at a later step without
/// the earlier ones still counts there; sequencing is observed, not enforced.
pub fn funnel_analytics(def: &FunnelDefinition, log: &EventLog) -> FunnelAnalytics {
    let mut per_step: HashMap<&str, HashSet<&str>> = HashMap::new();
    let mut everyone: HashSet<&str> = HashSet::new();
    for ev in log.conversions() {
        if let ConversionScope::FunnelStep { funnel_id, step_id } = &ev.scope {
            if funnel_id == &def.id && def.step(step_id).is_some() {
                per_step.entry(step_id.as_str()).or_default().insert(ev.visitor_key());
                everyone.insert(ev.visitor_key());
            }
        }
    }

    let counts: Vec<u64> = def
        .steps
        .iter()
        .map(|s| per_step.get(s.id.as_str()).map_or(0, |set| set.len() as u64))
        .collect();

    let steps = def
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let (rate, drop) = if i == 0 {
                (100.0, 0.0)
            } else {
                let rate = pct(counts[i], counts[i - 1]);
                (rate, 100.0 - rate)
            };
            FunnelStepAnalytics {
                step_id: s.id.clone(),
                order: s.order,
                unique_visitors: counts[i],
                conversion_rate_from_previous: rate,
                drop_off_rate_from_previous: drop,
            }
        })
        .collect();

    let first = counts.first().copied().unwrap_or(0);
    let last = counts.last().copied().unwrap_or(0);
    FunnelAnalytics {
        funnel_id: def.id.clone(),
        total_users: everyone.len() as u64,
        steps,
        overall_conversion_rate: pct(last, first),
    }
}

// =============================================================================
// Optimization suggestions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuggestionThresholds {
    pub drop_off_pct: f64,
    pub low_conversion_pct: f64,
    pub low_volume_users: u64,
}

impl Default for SuggestionThresholds {
    fn default() -> Self {
        Self { drop_off_pct: 50.0, low_conversion_pct: 10.0, low_volume_users: 100 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Suggestion {
    HighDropOff { step_id: String, drop_off_rate: f64 },
    LowOverallConversion { rate: f64 },
    LowEntryVolume { users: u64 },
}

impl Suggestion {
    pub fn message(&self) -> String {
        match self {
            Suggestion::HighDropOff { step_id, drop_off_rate } => {
                format!("{:.1}% of visitors drop off before '{}'; simplify or clarify that step", drop_off_rate, step_id)
            }
            Suggestion::LowOverallConversion { rate } => {
                format!("overall conversion is {:.1}%; review the whole journey for friction", rate)
            }
            Suggestion::LowEntryVolume { users } => {
                format!("only {} visitors entered the funnel; drive more traffic before drawing conclusions", users)
            }
        }
    }
}

/// Advisory threshold rules over an aggregate.
pub fn suggestions(analytics: &FunnelAnalytics, t: &SuggestionThresholds) -> Vec<Suggestion> {
    let mut out: Vec<Suggestion> = analytics
        .steps
        .iter()
        .skip(1)
        .filter(|s| s.drop_off_rate_from_previous > t.drop_off_pct)
        .map(|s| Suggestion::HighDropOff {
            step_id: s.step_id.clone(),
            drop_off_rate: s.drop_off_rate_from_previous,
        })
        .collect();
    if analytics.overall_conversion_rate < t.low_conversion_pct {
        out.push(Suggestion::LowOverallConversion { rate: analytics.overall_conversion_rate });
    }
    let entry = analytics.steps.first().map_or(0, |s| s.unique_visitors);
    if entry < t.low_volume_users {
        out.push(Suggestion::LowEntryVolume { users: entry });
    }
    out
}

// =============================================================================
// Goal conversion rate
// =============================================================================

/// Inclusive start, exclusive end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ms: u64,
    #[serde(default)]
    pub end_ms: Option<u64>,
}

const DAY_MS: u64 = 86_400_000;

impl TimeRange {
    pub fn between(start_ms: u64, end_ms: u64) -> Self {
        Self { start_ms, end_ms: Some(end_ms) }
    }

    pub fn last_days(now_ms: u64, days: u64) -> Self {
        Self { start_ms: now_ms.saturating_sub(days.saturating_mul(DAY_MS)), end_ms: None }
    }

    pub fn contains(&self, ts_ms: u64) -> bool {
        ts_ms >= self.start_ms && self.end_ms.map_or(true, |end| ts_ms < end)
    }
}

fn in_range(range: Option<&TimeRange>, ts_ms: u64) -> bool {
    range.map_or(true, |r| r.contains(ts_ms))
}

/// Percentage of visitors active in the range who reached `goal_id` (an experiment event
/// type or a funnel step id). 0 when nobody was active.
pub fn conversion_rate(log: &EventLog, goal_id: &str, range: Option<&TimeRange>) -> f64 {
    let mut active: HashSet<&str> = HashSet::new();
    let mut converted: HashSet<&str> = HashSet::new();
    for a in log.assignments().iter().filter(|a| in_range(range, a.timestamp_ms)) {
        active.insert(a.user_id.as_deref().unwrap_or(&a.session_id));
    }
    for c in log.conversions().iter().filter(|c| in_range(range, c.timestamp_ms)) {
        active.insert(c.visitor_key());
        if c.scope.goal() == goal_id {
            converted.insert(c.visitor_key());
        }
    }
    pct(converted.len() as u64, active.len() as u64)
}

// =============================================================================
// Experiments
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantReport {
    pub variant_id: String,
    pub users: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
    pub total_value: f64,
}

impl VariantReport {
    pub fn counts(&self) -> VariantCounts {
        VariantCounts::new(self.users, self.conversions)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub experiment_id: String,
    pub variants: Vec<VariantReport>,
    pub significance: SignificanceResult,
}

/// Users are sessions with a canonical assignment to the variant; conversions are those
/// sessions with at least one conversion for the experiment. Variants come back in
/// definition order.
pub fn variant_reports(def: &ExperimentDefinition, log: &EventLog) -> Vec<VariantReport> {
    let assigned = log.canonical_assignments(&def.id);

    let mut by_session: HashMap<&str, Vec<&ConversionEvent>> = HashMap::new();
    for c in log.conversions().iter().filter(|c| c.is_for_experiment(&def.id)) {
        by_session.entry(c.session_id.as_str()).or_default().push(c);
    }

    def.variant_ids()
        .map(|vid| {
            let mut users = 0u64;
            let mut conversions = 0u64;
            let mut total_value = 0.0;
            for (session, a) in &assigned {
                if a.variant_id != vid {
                    continue;
                }
                users += 1;
                if let Some(events) = by_session.get(session) {
                    conversions += 1;
                    total_value += events.iter().filter_map(|e| e.value).sum::<f64>();
                }
            }
            VariantReport {
                variant_id: vid.to_string(),
                users,
                conversions,
                conversion_rate: pct(conversions, users),
                total_value,
            }
        })
        .collect()
}

pub fn experiment_report(def: &ExperimentDefinition, log: &EventLog, cfg: &SignificanceConfig) -> ExperimentReport {
    let variants = variant_reports(def, log);
    let arms: Vec<VariantCounts> = variants.iter().map(VariantReport::counts).collect();
    let significance = compare_arms(&arms, cfg);
    log_significance(
        &def.id,
        arms.iter().map(|a| a.users).sum(),
        significance.z_score,
        significance.p_value,
        significance.is_significant,
    );
    ExperimentReport { experiment_id: def.id.clone(), significance, variants }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AssignmentEvent;
    use crate::experiment::Variant;
    use serde_json::Map;

    fn step(funnel: &str, step: &str, session: &str, ts: u64) -> ConversionEvent {
        ConversionEvent {
            scope: ConversionScope::FunnelStep { funnel_id: funnel.into(), step_id: step.into() },
            session_id: session.into(),
            user_id: None,
            value: None,
            timestamp_ms: ts,
            metadata: Map::new(),
        }
    }

    fn conversion(exp: &str, event_type: &str, session: &str, value: Option<f64>) -> ConversionEvent {
        ConversionEvent {
            scope: ConversionScope::Experiment { experiment_id: exp.into(), event_type: event_type.into() },
            session_id: session.into(),
            user_id: None,
            value,
            timestamp_ms: 10,
            metadata: Map::new(),
        }
    }

    fn assign(exp: &str, session: &str, variant: &str) -> AssignmentEvent {
        AssignmentEvent {
            experiment_id: exp.into(),
            variant_id: variant.into(),
            session_id: session.into(),
            user_id: None,
            timestamp_ms: 1,
        }
    }

    fn checkout() -> FunnelDefinition {
        FunnelDefinition::with_custom_steps("checkout", "Checkout", &["view_cart", "enter_payment", "confirm"])
    }

    fn checkout_log() -> EventLog {
        let mut events = Vec::new();
        for i in 1..=10 {
            events.push(step("checkout", "view_cart", &format!("S{}", i), i));
        }
        for i in 1..=6 {
            events.push(step("checkout", "enter_payment", &format!("S{}", i), 100 + i));
        }
        for i in 1..=3 {
            events.push(step("checkout", "confirm", &format!("S{}", i), 200 + i));
        }
        EventLog::from_parts(vec![], events)
    }

    #[test]
    fn test_checkout_funnel() {
        let a = funnel_analytics(&checkout(), &checkout_log());
        let users: Vec<u64> = a.steps.iter().map(|s| s.unique_visitors).collect();
        assert_eq!(users, vec![10, 6, 3]);
        assert_eq!(a.steps[0].conversion_rate_from_previous, 100.0);
        assert_eq!(a.steps[0].drop_off_rate_from_previous, 0.0);
        assert!((a.steps[1].conversion_rate_from_previous - 60.0).abs() < 1e-9);
        assert!((a.steps[1].drop_off_rate_from_previous - 40.0).abs() < 1e-9);
        assert!((a.steps[2].conversion_rate_from_previous - 50.0).abs() < 1e-9);
        assert!((a.overall_conversion_rate - 30.0).abs() < 1e-9);
        assert_eq!(a.total_users, 10);
    }

    #[test]
    fn test_repeat_events_count_once() {
        let mut events = vec![step("checkout", "view_cart", "S1", 1), step("checkout", "view_cart", "S1", 2)];
        let mut signed_in = step("checkout", "view_cart", "S2", 3);
        signed_in.user_id = Some("u-1".into());
        let mut same_user = step("checkout", "view_cart", "S3", 4);
        same_user.user_id = Some("u-1".into());
        events.push(signed_in);
        events.push(same_user);
        let a = funnel_analytics(&checkout(), &EventLog::from_parts(vec![], events));
        assert_eq!(a.steps[0].unique_visitors, 2);
    }

    #[test]
    fn test_mid_funnel_entry_counted_and_rates_clamped() {
        // visitors only at later steps: step 2 has 3 users after 0 at step 1
        let events = vec![
            step("checkout", "enter_payment", "S1", 1),
            step("checkout", "enter_payment", "S2", 1),
            step("checkout", "enter_payment", "S3", 1),
            step("checkout", "confirm", "S1", 2),
            step("checkout", "confirm", "S4", 2),
            step("checkout", "confirm", "S5", 2),
            step("checkout", "confirm", "S6", 2),
        ];
        let a = funnel_analytics(&checkout(), &EventLog::from_parts(vec![], events));
        assert_eq!(a.steps[1].unique_visitors, 3);
        assert_eq!(a.steps[1].conversion_rate_from_previous, 0.0);
        assert_eq!(a.steps[1].drop_off_rate_from_previous, 100.0);
        // 4 after 3 would exceed 100
        assert_eq!(a.steps[2].conversion_rate_from_previous, 100.0);
        assert_eq!(a.steps[2].drop_off_rate_from_previous, 0.0);
        assert_eq!(a.overall_conversion_rate, 0.0);
        for s in &a.steps {
            assert!((0.0..=100.0).contains(&s.conversion_rate_from_previous));
            assert!((0.0..=100.0).contains(&s.drop_off_rate_from_previous));
        }
    }

    #[test]
    fn test_ignores_other_funnels_and_unknown_steps() {
        let events = vec![
            step("checkout", "view_cart", "S1", 1),
            step("signup", "view_cart", "S2", 1),
            step("checkout", "retired_step", "S3", 1),
        ];
        let a = funnel_analytics(&checkout(), &EventLog::from_parts(vec![], events));
        assert_eq!(a.steps[0].unique_visitors, 1);
        assert_eq!(a.total_users, 1);
    }

    #[test]
    fn test_aggregation_idempotent() {
        let log = checkout_log();
        assert_eq!(funnel_analytics(&checkout(), &log), funnel_analytics(&checkout(), &log));
    }

    fn valued_log(reverse: bool) -> EventLog {
        let mut assignments = Vec::new();
        let mut conversions = Vec::new();
        for i in 0..200 {
            let session = format!("S{}", i);
            assignments.push(assign("e1", &session, if i % 2 == 0 { "a" } else { "b" }));
            let value = match i % 3 {
                0 => 1e16 / 7.0,
                1 => -3.3,
                _ => -0.1 * i as f64 - 1e16 / 3.0,
            };
            conversions.push(conversion("e1", "purchase", &session, Some(value)));
        }
        if reverse {
            assignments.reverse();
            conversions.reverse();
        }
        EventLog::from_parts(assignments, conversions)
    }

    #[test]
    fn test_experiment_report_idempotent() {
        let def = ExperimentDefinition::new("e1", "E1", vec![Variant::new("a", 50.0), Variant::new("b", 50.0)]);
        let cfg = SignificanceConfig::default();
        let log = valued_log(false);
        let first = experiment_report(&def, &log, &cfg);
        assert_eq!(first.variants[0].users, 100);
        for _ in 0..20 {
            assert_eq!(experiment_report(&def, &log, &cfg), first);
        }
        // append order across sessions does not change the sums
        assert_eq!(experiment_report(&def, &valued_log(true), &cfg), first);
    }

    #[test]
    fn test_suggestions() {
        let a = funnel_analytics(&checkout(), &checkout_log());
        let s = suggestions(&a, &SuggestionThresholds::default());
        // 40% and 50% drop-off do not exceed 50; overall 30% is fine; 10 entries is low
        assert_eq!(s, vec![Suggestion::LowEntryVolume { users: 10 }]);

        let strict = SuggestionThresholds { drop_off_pct: 45.0, low_conversion_pct: 35.0, low_volume_users: 5 };
        let s = suggestions(&a, &strict);
        assert_eq!(
            s,
            vec![
                Suggestion::HighDropOff { step_id: "confirm".into(), drop_off_rate: 50.0 },
                Suggestion::LowOverallConversion { rate: 30.0 },
            ]
        );
        assert!(s[0].message().contains("confirm"));
    }

    #[test]
    fn test_time_range() {
        let r = TimeRange::between(10, 20);
        assert!(!r.contains(9));
        assert!(r.contains(10));
        assert!(!r.contains(20));
        let last = TimeRange::last_days(3 * DAY_MS, 1);
        assert_eq!(last.start_ms, 2 * DAY_MS);
        assert_eq!(TimeRange::last_days(5, 1).start_ms, 0);
    }

    #[test]
    fn test_conversion_rate_by_goal() {
        let log = EventLog::from_parts(
            vec![assign("e1", "S1", "a"), assign("e1", "S2", "b"), assign("e1", "S3", "a"), assign("e1", "S4", "b")],
            vec![conversion("e1", "purchase", "S1", Some(20.0)), conversion("e1", "signup", "S2", None)],
        );
        assert_eq!(conversion_rate(&log, "purchase", None), 25.0);
        assert_eq!(conversion_rate(&log, "signup", None), 25.0);
        assert_eq!(conversion_rate(&log, "refund", None), 0.0);
        // only the conversions (ts 10) fall in [5, 20)
        assert_eq!(conversion_rate(&log, "purchase", Some(&TimeRange::between(5, 20))), 50.0);
        assert_eq!(conversion_rate(&EventLog::new(), "purchase", None), 0.0);
    }

    #[test]
    fn test_funnel_step_is_a_goal() {
        let rate = conversion_rate(&checkout_log(), "confirm", None);
        assert!((rate - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_variant_reports() {
        let def = ExperimentDefinition::new("e1", "E1", vec![Variant::new("a", 50.0), Variant::new("b", 50.0)]);
        let log = EventLog::from_parts(
            vec![assign("e1", "S1", "a"), assign("e1", "S2", "a"), assign("e1", "S3", "b"), assign("e2", "S4", "a")],
            vec![
                conversion("e1", "purchase", "S1", Some(20.0)),
                conversion("e1", "upsell", "S1", Some(5.0)),
                conversion("e1", "purchase", "S3", None),
                conversion("e1", "purchase", "S9", Some(99.0)),
            ],
        );
        let r = variant_reports(&def, &log);
        assert_eq!(r[0].variant_id, "a");
        assert_eq!((r[0].users, r[0].conversions), (2, 1));
        assert_eq!(r[0].total_value, 25.0);
        assert_eq!(r[0].conversion_rate, 50.0);
        assert_eq!((r[1].users, r[1].conversions), (1, 1));
        assert_eq!(r[1].total_value, 0.0);

        let report = experiment_report(&def, &log, &SignificanceConfig::default());
        assert_eq!(report.significance, SignificanceResult::insufficient());
    }
}
