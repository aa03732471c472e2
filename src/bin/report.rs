//! Prints funnel analytics and experiment reports from a persisted store.
//!
//! Usage: ABX_STORE=sqlite ABX_STORE_PATH=abx.sqlite cargo run --bin report -- [id ...]
//!
//! With no ids every registered funnel and experiment is reported.

use anyhow::Result;

use abfunnel::config::EngineConfig;
use abfunnel::Engine;

fn main() -> Result<()> {
    let wanted: Vec<String> = std::env::args().skip(1).collect();
    let selected = |id: &str| wanted.is_empty() || wanted.iter().any(|w| w == id);

    let engine = Engine::from_config(EngineConfig::from_env(), None)?;
    println!("Events: {} (digest {})", engine.event_log().len(), engine.event_log().digest());
    println!();

    for funnel in engine.funnels().filter(|f| selected(&f.id)) {
        let Some(a) = engine.get_funnel_analytics(&funnel.id) else {
            continue;
        };
        println!("Funnel {} ({})", funnel.id, funnel.name);
        println!("{}", "=".repeat(60));
        println!("{:<20} {:>10} {:>12} {:>10}", "Step", "Visitors", "From prev %", "Drop %");
        println!("{}", "-".repeat(60));
        for s in &a.steps {
            println!(
                "{:<20} {:>10} {:>12.1} {:>10.1}",
                s.step_id, s.unique_visitors, s.conversion_rate_from_previous, s.drop_off_rate_from_previous
            );
        }
        println!("Total users: {}, overall conversion: {:.1}%", a.total_users, a.overall_conversion_rate);
        for tip in engine.get_funnel_suggestions(&funnel.id).unwrap_or_default() {
            println!("  * {}", tip.message());
        }
        println!();
    }

    for exp in engine.experiments().filter(|e| selected(&e.id)) {
        let Some(r) = engine.get_experiment_report(&exp.id) else {
            continue;
        };
        println!("Experiment {} ({}){}", exp.id, exp.name, if exp.is_active { "" } else { " [paused]" });
        println!("{}", "=".repeat(60));
        println!("{:<12} {:>8} {:>12} {:>10} {:>12}", "Variant", "Users", "Converted", "Rate %", "Value");
        println!("{}", "-".repeat(60));
        for v in &r.variants {
            println!(
                "{:<12} {:>8} {:>12} {:>10.2} {:>12.2}",
                v.variant_id, v.users, v.conversions, v.conversion_rate, v.total_value
            );
        }
        let sig = &r.significance;
        match sig.z_score {
            Some(z) => println!(
                "z = {:.3}, p ~ {:.3}, significant: {} (confidence {}%)",
                z, sig.p_value, sig.is_significant, sig.confidence_level
            ),
            None => println!("not enough traffic for a significance test"),
        }
        println!();
    }
    Ok(())
}
