//! Funnel and significance scenarios end to end: UI events in, analytics out.

use serde_json::Map;
use tokio::sync::mpsc;

use abfunnel::aggregate::Suggestion;
use abfunnel::funnel::{FunnelDefinition, FunnelStep, MatchRule};
use abfunnel::identity::Visitor;
use abfunnel::instrument::UiEvent;
use abfunnel::selector::{ElementDescriptor, ElementNode};
use abfunnel::significance::{significance, SignificanceConfig, VariantCounts};
use abfunnel::Engine;

fn signup_funnel() -> FunnelDefinition {
    FunnelDefinition::new(
        "signup",
        "Signup",
        vec![
            FunnelStep::new("pricing", 1, MatchRule::PageView { url_contains: "/pricing".into() }),
            FunnelStep::new("cta", 2, MatchRule::ElementInteraction { selector: "main a[data-role=\"start\"]".into() }),
            FunnelStep::new("form", 3, MatchRule::FormCompletion { selector: "form.signup".into() }),
            FunnelStep::new("verified", 4, MatchRule::Custom { event_name: "email_verified".into() }).optional(),
        ],
    )
}

fn pricing() -> UiEvent {
    UiEvent::Navigation { url: "https://app.test/pricing?plan=pro".into() }
}

fn cta_click() -> UiEvent {
    let target = ElementDescriptor::new(ElementNode::new("span"))
        .inside(ElementNode::new("a").with_attr("data-role", "start"))
        .inside(ElementNode::new("main"));
    UiEvent::PointerActivation { url: "https://app.test/pricing".into(), target }
}

fn form_submit() -> UiEvent {
    let form = ElementDescriptor::new(ElementNode::new("form").with_class("signup").with_id("f1"));
    UiEvent::FormSubmission { url: "https://app.test/signup".into(), form }
}

fn verified() -> UiEvent {
    UiEvent::Custom { name: "email_verified".into(), properties: Map::new() }
}

// ---------------------------------------------------------------------------
// Funnels
// ---------------------------------------------------------------------------

#[test]
fn auto_instrumented_funnel_counts_unique_visitors() {
    let mut engine = Engine::in_memory(Visitor::anonymous("S-driver"));
    engine.register_funnel(signup_funnel()).unwrap();

    for i in 0..20 {
        let v = Visitor::anonymous(format!("S-{}", i));
        engine.handle_ui_event_for(&v, &pricing());
        // reloads don't inflate unique counts
        engine.handle_ui_event_for(&v, &pricing());
        if i % 2 == 0 {
            engine.handle_ui_event_for(&v, &cta_click());
        }
        if i % 4 == 0 {
            engine.handle_ui_event_for(&v, &form_submit());
        }
        if i == 0 {
            engine.handle_ui_event_for(&v, &verified());
        }
    }

    let a = engine.get_funnel_analytics("signup").unwrap();
    let users: Vec<u64> = a.steps.iter().map(|s| s.unique_visitors).collect();
    assert_eq!(users, vec![20, 10, 5, 1]);
    assert_eq!(a.total_users, 20);
    assert_eq!(a.steps[0].conversion_rate_from_previous, 100.0);
    assert_eq!(a.steps[0].drop_off_rate_from_previous, 0.0);
    assert_eq!(a.steps[1].drop_off_rate_from_previous, 50.0);
    assert_eq!(a.steps[3].conversion_rate_from_previous, 20.0);
    assert_eq!(a.overall_conversion_rate, 5.0);

    let tips = engine.get_funnel_suggestions("signup").unwrap();
    assert!(tips.contains(&Suggestion::HighDropOff { step_id: "verified".into(), drop_off_rate: 80.0 }));
    assert!(tips.contains(&Suggestion::LowOverallConversion { rate: 5.0 }));
    assert!(tips.contains(&Suggestion::LowEntryVolume { users: 20 }));
    assert!(!tips.iter().any(|t| matches!(t, Suggestion::HighDropOff { step_id, .. } if step_id == "cta")));
}

#[test]
fn signed_in_visitor_counts_once_across_sessions() {
    let mut engine = Engine::in_memory(Visitor::anonymous("S-driver"));
    engine.register_funnel(signup_funnel()).unwrap();
    let morning = Visitor::anonymous("S-am").with_user("u-1");
    let evening = Visitor::anonymous("S-pm").with_user("u-1");
    engine.handle_ui_event_for(&morning, &pricing());
    engine.handle_ui_event_for(&evening, &pricing());
    engine.handle_ui_event_for(&evening, &cta_click());
    let a = engine.get_funnel_analytics("signup").unwrap();
    assert_eq!(a.steps[0].unique_visitors, 1);
    assert_eq!(a.steps[1].unique_visitors, 1);
}

#[test]
fn analytics_are_idempotent_and_bounded() {
    let mut engine = Engine::in_memory(Visitor::anonymous("S-driver"));
    engine.register_funnel(signup_funnel()).unwrap();
    // entries that skip earlier steps
    for i in 0..5 {
        engine.handle_ui_event_for(&Visitor::anonymous(format!("S-{}", i)), &form_submit());
    }
    engine.handle_ui_event_for(&Visitor::anonymous("S-x"), &pricing());

    let first = engine.get_funnel_analytics("signup").unwrap();
    assert_eq!(engine.get_funnel_analytics("signup").unwrap(), first);
    for s in &first.steps {
        assert!((0.0..=100.0).contains(&s.conversion_rate_from_previous));
        assert!((0.0..=100.0).contains(&s.drop_off_rate_from_previous));
    }
    assert!((0.0..=100.0).contains(&first.overall_conversion_rate));
}

#[test]
fn channel_stream_feeds_the_engine() {
    let mut engine = Engine::in_memory(Visitor::anonymous("S-stream"));
    engine.register_funnel(signup_funnel()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    tx.send(pricing()).unwrap();
    tx.send(cta_click()).unwrap();
    assert_eq!(engine.drain(&mut rx), 2);
    // nothing pending: drain returns immediately
    assert_eq!(engine.drain(&mut rx), 0);
    tx.send(form_submit()).unwrap();
    assert_eq!(engine.drain(&mut rx), 1);

    let log = engine.event_log();
    assert!(log.conversions().iter().all(|c| c.session_id == "S-stream"));
    assert_eq!(log.conversions()[2].metadata["path"], "/signup");
}

// ---------------------------------------------------------------------------
// Significance
// ---------------------------------------------------------------------------

#[test]
fn significance_reference_scenarios() {
    let cfg = SignificanceConfig::default();

    let clear = significance(VariantCounts::new(120, 30), VariantCounts::new(130, 55), &cfg);
    assert!(clear.is_significant);
    assert_eq!(clear.confidence_level, 95);

    let tiny = significance(VariantCounts::new(10, 3), VariantCounts::new(12, 5), &cfg);
    assert!(!tiny.is_significant);
    assert_eq!(tiny.confidence_level, 0);
    assert_eq!(tiny.p_value, 1.0);
}
