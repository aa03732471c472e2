//! Synthetic traffic through a configured engine.
//!
//! Usage: cargo run --bin simulate -- [visitors] [seed]
//!
//! Store and sink come from the ABX_* environment (see `EngineConfig::from_env`).
//! Variant "b" converts better than "a" so the report has something to find.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use abfunnel::config::EngineConfig;
use abfunnel::experiment::{ExperimentDefinition, Variant};
use abfunnel::funnel::{FunnelDefinition, FunnelStep, MatchRule};
use abfunnel::identity::{new_session_id, Visitor, VisitorAttributes};
use abfunnel::instrument::UiEvent;
use abfunnel::selector::{ElementDescriptor, ElementNode};
use abfunnel::Engine;

const EXPERIMENT: &str = "checkout-cta";
const FUNNEL: &str = "checkout";
const DEVICES: [&str; 3] = ["desktop", "mobile", "tablet"];

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let visitors: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(2_000);
    let seed: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(7);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    // one checkpoint at the end instead of one per event
    let config = EngineConfig { persist_on_write: false, ..EngineConfig::from_env() };
    let mut engine = Engine::from_config(config, Some(runtime.handle().clone()))?;

    engine.register_experiment(ExperimentDefinition::new(
        EXPERIMENT,
        "Checkout call to action",
        vec![Variant::new("a", 50.0), Variant::new("b", 50.0)],
    ))?;
    engine.register_funnel(FunnelDefinition::new(
        FUNNEL,
        "Checkout",
        vec![
            FunnelStep::new("product", 1, MatchRule::PageView { url_contains: "/products/".into() }),
            FunnelStep::new("add_to_cart", 2, MatchRule::ElementInteraction { selector: "button.add-to-cart".into() }),
            FunnelStep::new("details", 3, MatchRule::FormCompletion { selector: "form#checkout".into() }),
            FunnelStep::new("paid", 4, MatchRule::Custom { event_name: "payment_succeeded".into() }),
        ],
    ))?;

    let started_ms = chrono::Utc::now().timestamp_millis() as u64;
    let mut rng = StdRng::seed_from_u64(seed);
    for i in 0..visitors {
        let device = DEVICES[rng.gen_range(0..DEVICES.len())];
        let visitor = Visitor::anonymous(new_session_id(started_ms + i)).with_attributes(VisitorAttributes {
            device: Some(device.to_string()),
            ..VisitorAttributes::default()
        });
        let variant = engine.get_variant_for(EXPERIMENT, &visitor);
        let lift = if variant.as_deref() == Some("b") { 0.15 } else { 0.0 };

        let product = format!("https://shop.example/products/{}", rng.gen_range(1..50));
        engine.handle_ui_event_for(&visitor, &UiEvent::Navigation { url: product.clone() });
        if !rng.gen_bool(0.55) {
            continue;
        }
        let button = ElementDescriptor::new(ElementNode::new("span"))
            .inside(ElementNode::new("button").with_class("btn").with_class("add-to-cart"));
        engine.handle_ui_event_for(&visitor, &UiEvent::PointerActivation { url: product, target: button });
        if !rng.gen_bool(0.45 + lift) {
            continue;
        }
        let form = ElementDescriptor::new(ElementNode::new("form").with_id("checkout"));
        engine.handle_ui_event_for(
            &visitor,
            &UiEvent::FormSubmission { url: "https://shop.example/checkout".into(), form },
        );
        if !rng.gen_bool(0.7) {
            continue;
        }
        let amount = (rng.gen_range(15.0..120.0_f64) * 100.0).round() / 100.0;
        engine.handle_ui_event_for(
            &visitor,
            &UiEvent::Custom { name: "payment_succeeded".into(), properties: Default::default() },
        );
        engine.record_conversion_for(&visitor, EXPERIMENT, "purchase", Some(amount), None);
    }
    engine.checkpoint();

    let suggestions: Vec<String> = engine
        .get_funnel_suggestions(FUNNEL)
        .unwrap_or_default()
        .iter()
        .map(|s| s.message())
        .collect();
    let report = json!({
        "visitors": visitors,
        "seed": seed,
        "experiment": engine.get_experiment_report(EXPERIMENT),
        "funnel": engine.get_funnel_analytics(FUNNEL),
        "suggestions": suggestions,
        "purchase_rate": engine.get_conversion_rate("purchase", None),
        "log_digest": engine.event_log().digest(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
