//! Property-based tests for core components using proptest.

use std::sync::Arc;

use proptest::prelude::*;

use switchyard_core::pipeline::template::{TemplateContext, evaluate_condition, interpolate};
use switchyard_core::pipeline::{Condition, ConditionAction, ConditionOperator, ExecutionContext};
use switchyard_core::resources::ResourceManager;
use switchyard_core::types::{BackendKind, ModelId};
use switchyard_core::{MockProvider, ModelProvider};

fn condition(operator: ConditionOperator, value: &str) -> Condition {
    Condition {
        check: "$v".to_string(),
        operator,
        value: Some(value.to_string()),
        action: ConditionAction::Continue,
        skip_to: None,
    }
}

// --- Template interpolation properties ---

proptest! {
    #[test]
    fn text_without_placeholders_is_unchanged(text in "[^{}]{0,200}") {
        let values = ExecutionContext::new();
        let out = interpolate(&text, &TemplateContext::new(&values)).unwrap();
        prop_assert_eq!(out, text);
    }

    #[test]
    fn bound_placeholders_are_fully_replaced(
        names in prop::collection::btree_set("[a-z][a-z0-9_]{0,8}", 1..6),
        value in "[^{}]{0,20}",
        filler in "[^{}]{0,20}",
    ) {
        let template: String = names
            .iter()
            .map(|n| format!("{filler}{{{{{n}}}}}"))
            .collect();
        let values: ExecutionContext = names.iter().map(|n| (n.clone(), value.clone())).collect();
        let out = interpolate(&template, &TemplateContext::new(&values)).unwrap();

        prop_assert!(!out.contains("{{"));
        prop_assert!(!out.contains("}}"));
        prop_assert_eq!(out.len(), names.len() * (filler.len() + value.len()));
    }

    #[test]
    fn if_block_follows_truthiness(name in "[a-z]{1,8}", body in "[^{}]{0,20}", value in "[^{}]{0,10}") {
        let template = format!("{{{{#if {name}}}}}{body}{{{{/if}}}}");
        let values: ExecutionContext = [(name.clone(), value.clone())].into_iter().collect();
        let out = interpolate(&template, &TemplateContext::new(&values)).unwrap();
        let truthy = !value.trim().is_empty() && !value.trim().eq_ignore_ascii_case("false");
        prop_assert_eq!(out, if truthy { body } else { String::new() });
    }
}

// --- Condition evaluation properties ---

proptest! {
    #[test]
    fn contains_matches_substring(prefix in ".{0,10}", needle in ".{0,10}", suffix in ".{0,10}") {
        let haystack = format!("{prefix}{needle}{suffix}");
        prop_assert!(evaluate_condition(&condition(ConditionOperator::Contains, &needle), &haystack));
    }

    #[test]
    fn equals_and_not_equals_are_complementary(a in ".{0,10}", b in ".{0,10}") {
        let eq = evaluate_condition(&condition(ConditionOperator::Equals, &b), &a);
        let ne = evaluate_condition(&condition(ConditionOperator::NotEquals, &b), &a);
        prop_assert_ne!(eq, ne);
    }

    #[test]
    fn empty_and_not_empty_are_complementary(value in ".{0,10}") {
        let empty = evaluate_condition(&condition(ConditionOperator::Empty, ""), &value);
        let not_empty = evaluate_condition(&condition(ConditionOperator::NotEmpty, ""), &value);
        prop_assert_eq!(empty, value.is_empty());
        prop_assert_ne!(empty, not_empty);
    }
}

// --- LRU eviction properties ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn eviction_respects_budget_and_recency(
        footprints in prop::collection::vec(1u64..1_000, 1..12),
        touches in prop::collection::vec(any::<prop::sample::Index>(), 0..20),
        budget in 0u64..6_000,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let mock = Arc::new(MockProvider::new(BackendKind::EmbeddedRuntime).host_managed());
        let adapters: Vec<Arc<dyn ModelProvider>> = vec![mock as Arc<dyn ModelProvider>];
        let rm = ResourceManager::new();
        let ids: Vec<ModelId> = (0..footprints.len())
            .map(|i| ModelId::new(BackendKind::EmbeddedRuntime, format!("m{i}")))
            .collect();
        for (id, bytes) in ids.iter().zip(&footprints) {
            rm.record_load(id.clone(), *bytes);
        }
        for touch in &touches {
            rm.touch(&ids[touch.index(ids.len())]);
        }

        let before = rm.list();
        let evicted = runtime.block_on(rm.evict_if_needed(budget, &adapters, None));

        prop_assert!(rm.total_footprint() <= budget);
        // Evicted models are exactly the least recently used prefix.
        let prefix: Vec<ModelId> = before
            .iter()
            .take(evicted.len())
            .map(|r| r.model_id.clone())
            .collect();
        prop_assert_eq!(&evicted, &prefix);
        // Removing one fewer model would have stayed over budget.
        if let Some(last) = before.get(evicted.len().wrapping_sub(1)) {
            prop_assert!(rm.total_footprint() + last.footprint_bytes > budget);
        }
    }
}
