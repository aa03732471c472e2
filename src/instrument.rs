//! Auto-instrumentation: turns UI activity into funnel-step events.
//!
//! Matching is pure. The engine feeds each matched step back through its public
//! recording call, so automatic and manual steps share one ingestion path.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};

use crate::funnel::{FunnelRegistry, MatchRule};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::selector::{ElementDescriptor, Selector};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UiEvent {
    Navigation { url: String },
    PointerActivation { url: String, target: ElementDescriptor },
    FormSubmission { url: String, form: ElementDescriptor },
    Custom {
        name: String,
        #[serde(default)]
        properties: Map<String, Value>,
    },
}

impl UiEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            UiEvent::Navigation { .. } => "navigation",
            UiEvent::PointerActivation { .. } => "pointer_activation",
            UiEvent::FormSubmission { .. } => "form_submission",
            UiEvent::Custom { .. } => "custom",
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            UiEvent::Navigation { url }
            | UiEvent::PointerActivation { url, .. }
            | UiEvent::FormSubmission { url, .. } => Some(url),
            UiEvent::Custom { .. } => None,
        }
    }

    /// Metadata attached to auto-recorded steps.
    pub fn metadata(&self) -> Map<String, Value> {
        let mut meta = obj(&[("source", v_str("auto")), ("trigger", v_str(self.kind()))]);
        if let Some(url) = self.url() {
            meta.insert("url".to_string(), v_str(url));
            if let Ok(parsed) = url::Url::parse(url) {
                meta.insert("path".to_string(), v_str(parsed.path()));
            }
        }
        match self {
            UiEvent::PointerActivation { target, .. } => {
                meta.insert("element".to_string(), v_str(&target.target.tag));
            }
            UiEvent::FormSubmission { form, .. } => {
                if let Some(id) = &form.target.id {
                    meta.insert("form_id".to_string(), v_str(id));
                }
            }
            UiEvent::Custom { name, properties } => {
                meta.insert("event_name".to_string(), v_str(name));
                meta.extend(properties.clone());
            }
            UiEvent::Navigation { .. } => {}
        }
        meta
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepMatch {
    pub funnel_id: String,
    pub step_id: String,
}

/// Caches compiled selectors; a selector that fails to parse is logged once and then
/// never matches.
#[derive(Debug, Default)]
pub struct AutoInstrumenter {
    selectors: HashMap<String, Option<Selector>>,
}

impl AutoInstrumenter {
    pub fn new() -> Self {
        Self::default()
    }

    fn selector(&mut self, src: &str) -> Option<&Selector> {
        self.selectors
            .entry(src.to_string())
            .or_insert_with(|| match Selector::parse(src) {
                Ok(sel) => Some(sel),
                Err(err) => {
                    log(
                        Level::Warn,
                        Domain::Instrument,
                        "bad_selector",
                        obj(&[("selector", v_str(src)), ("error", v_str(&err.to_string()))]),
                    );
                    None
                }
            })
            .as_ref()
    }

    pub fn rule_matches(&mut self, rule: &MatchRule, event: &UiEvent) -> bool {
        match (rule, event) {
            (MatchRule::PageView { url_contains }, UiEvent::Navigation { url }) => url.contains(url_contains.as_str()),
            (MatchRule::ElementInteraction { selector }, UiEvent::PointerActivation { target, .. }) => {
                self.selector(selector).is_some_and(|s| s.matches_closest(target))
            }
            (MatchRule::FormCompletion { selector }, UiEvent::FormSubmission { form, .. }) => {
                self.selector(selector).is_some_and(|s| s.matches_closest(form))
            }
            (MatchRule::Custom { event_name }, UiEvent::Custom { name, .. }) => event_name == name,
            _ => false,
        }
    }

    /// Every step of every active funnel the event satisfies, in registry order.
    pub fn matches(&mut self, funnels: &FunnelRegistry, event: &UiEvent) -> Vec<StepMatch> {
        let mut out = Vec::new();
        for funnel in funnels.active() {
            for step in &funnel.steps {
                if self.rule_matches(&step.match_rule, event) {
                    out.push(StepMatch { funnel_id: funnel.id.clone(), step_id: step.id.clone() });
                }
            }
        }
        if !out.is_empty() {
            log(
                Level::Debug,
                Domain::Instrument,
                "matched",
                obj(&[("trigger", v_str(event.kind())), ("steps", Value::from(out.len()))]),
            );
        }
        out
    }
}

// =============================================================================
// Event sources
// =============================================================================

/// Non-blocking source of UI notifications; `None` means nothing pending.
pub trait UiEventStream {
    fn next_event(&mut self) -> Option<UiEvent>;
}

/// Replays a fixed list.
#[derive(Debug, Clone, Default)]
pub struct VecStream {
    events: VecDeque<UiEvent>,
}

impl VecStream {
    pub fn new(events: Vec<UiEvent>) -> Self {
        Self { events: events.into() }
    }
}

impl UiEventStream for VecStream {
    fn next_event(&mut self) -> Option<UiEvent> {
        self.events.pop_front()
    }
}

impl UiEventStream for tokio::sync::mpsc::UnboundedReceiver<UiEvent> {
    fn next_event(&mut self) -> Option<UiEvent> {
        self.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::{FunnelDefinition, FunnelStep};
    use crate::selector::ElementNode;

    fn shop_funnel() -> FunnelDefinition {
        FunnelDefinition::new(
            "shop",
            "Shop",
            vec![
                FunnelStep::new("landing", 1, MatchRule::PageView { url_contains: "/products".into() }),
                FunnelStep::new("add_to_cart", 2, MatchRule::ElementInteraction { selector: "button.add-to-cart".into() }),
                FunnelStep::new("checkout", 3, MatchRule::FormCompletion { selector: "form#checkout".into() }),
                FunnelStep::new("thanks", 4, MatchRule::Custom { event_name: "order_confirmed".into() }),
            ],
        )
    }

    fn registry() -> FunnelRegistry {
        FunnelRegistry::from_definitions(vec![shop_funnel()])
    }

    fn step_ids(m: &[StepMatch]) -> Vec<&str> {
        m.iter().map(|s| s.step_id.as_str()).collect()
    }

    #[test]
    fn test_navigation_matches_url_substring() {
        let mut inst = AutoInstrumenter::new();
        let ev = UiEvent::Navigation { url: "https://shop.test/products/42".into() };
        assert_eq!(step_ids(&inst.matches(&registry(), &ev)), vec!["landing"]);
        let ev = UiEvent::Navigation { url: "https://shop.test/about".into() };
        assert!(inst.matches(&registry(), &ev).is_empty());
    }

    #[test]
    fn test_pointer_on_nested_element_matches() {
        let mut inst = AutoInstrumenter::new();
        let target = ElementDescriptor::new(ElementNode::new("svg"))
            .inside(ElementNode::new("button").with_class("btn").with_class("add-to-cart"));
        let ev = UiEvent::PointerActivation { url: "https://shop.test/products/42".into(), target };
        assert_eq!(step_ids(&inst.matches(&registry(), &ev)), vec!["add_to_cart"]);
    }

    #[test]
    fn test_form_submission_and_custom() {
        let mut inst = AutoInstrumenter::new();
        let form = ElementDescriptor::new(ElementNode::new("form").with_id("checkout"));
        let ev = UiEvent::FormSubmission { url: "https://shop.test/checkout".into(), form };
        assert_eq!(step_ids(&inst.matches(&registry(), &ev)), vec!["checkout"]);

        let ev = UiEvent::Custom { name: "order_confirmed".into(), properties: Map::new() };
        assert_eq!(step_ids(&inst.matches(&registry(), &ev)), vec!["thanks"]);
    }

    #[test]
    fn test_rule_kind_must_match_event_kind() {
        let mut inst = AutoInstrumenter::new();
        // a form submit on a /products URL is not a page view
        let form = ElementDescriptor::new(ElementNode::new("form").with_id("newsletter"));
        let ev = UiEvent::FormSubmission { url: "https://shop.test/products".into(), form };
        assert!(inst.matches(&registry(), &ev).is_empty());
    }

    #[test]
    fn test_inactive_funnels_ignored() {
        let mut reg = registry();
        reg.set_active("shop", false);
        let mut inst = AutoInstrumenter::new();
        let ev = UiEvent::Navigation { url: "/products".into() };
        assert!(inst.matches(&reg, &ev).is_empty());
    }

    #[test]
    fn test_bad_selector_never_matches() {
        let mut inst = AutoInstrumenter::new();
        let rule = MatchRule::ElementInteraction { selector: "a:hover".into() };
        let ev = UiEvent::PointerActivation { url: "/".into(), target: ElementDescriptor::new(ElementNode::new("a")) };
        assert!(!inst.rule_matches(&rule, &ev));
        assert!(!inst.rule_matches(&rule, &ev));
        assert_eq!(inst.selectors.len(), 1);
    }

    #[test]
    fn test_metadata() {
        let ev = UiEvent::Navigation { url: "https://shop.test/products/42?ref=ad".into() };
        let meta = ev.metadata();
        assert_eq!(meta["source"], "auto");
        assert_eq!(meta["trigger"], "navigation");
        assert_eq!(meta["path"], "/products/42");

        let ev = UiEvent::Navigation { url: "/relative".into() };
        assert!(ev.metadata().get("path").is_none());
    }

    #[test]
    fn test_streams() {
        let mut s = VecStream::new(vec![UiEvent::Navigation { url: "/a".into() }]);
        assert!(s.next_event().is_some());
        assert!(s.next_event().is_none());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tx.send(UiEvent::Navigation { url: "/b".into() }).unwrap();
        assert_eq!(rx.next_event(), Some(UiEvent::Navigation { url: "/b".into() }));
        assert_eq!(rx.next_event(), None);
    }

    #[test]
    fn test_ui_event_serde_shape() {
        let json = serde_json::json!({"kind": "navigation", "url": "/x"});
        let ev: UiEvent = serde_json::from_value(json).unwrap();
        assert_eq!(ev, UiEvent::Navigation { url: "/x".into() });
    }
}
