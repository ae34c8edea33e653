use std::collections::HashSet;

use proptest::prelude::*;

use skillforge::core::{DependencyGraph, DependencyResolver, Skill, SkillRegistry};
use skillforge::events::EventBus;

/// Acyclic by construction: skill `i` may only depend on skills `j < i`.
fn dag_strategy() -> impl Strategy<Value = Vec<Skill>> {
    (1usize..24).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<prop::sample::Index>(), 0..4), n)
            .prop_map(move |picks| {
                picks
                    .into_iter()
                    .enumerate()
                    .map(|(i, deps)| {
                        let deps: Vec<String> = if i == 0 {
                            Vec::new()
                        } else {
                            deps.iter()
                                .map(|ix| format!("k{}", ix.index(i)))
                                .collect::<HashSet<_>>()
                                .into_iter()
                                .collect()
                        };
                        Skill::new(format!("k{i}"), "1.0.0", "").with_skill_dependencies(deps)
                    })
                    .collect()
            })
    })
}

fn names(skills: &[Skill]) -> Vec<String> {
    skills.iter().map(|s| s.name().to_string()).collect()
}

proptest! {
    #[test]
    fn dag_orders_dependencies_first(skills in dag_strategy()) {
        let graph = DependencyGraph::from_skills(&skills, EventBus::new());
        prop_assert!(graph.detect_cycles().is_empty());

        let all = names(&skills);
        let order = graph.topological_sort(&all).expect("acyclic graph sorts");
        prop_assert_eq!(order.len(), all.len());
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();
        for skill in &skills {
            for dep in skill.skill_dependencies() {
                prop_assert!(position(dep) < position(skill.name()));
            }
        }
    }

    #[test]
    fn subset_order_stays_inside_the_subset(skills in dag_strategy(), stride in 1usize..4) {
        let graph = DependencyGraph::from_skills(&skills, EventBus::new());
        let subset: Vec<String> = names(&skills).into_iter().step_by(stride).collect();
        let order = graph.topological_sort(&subset).expect("acyclic graph sorts");

        let expected: HashSet<&String> = subset.iter().collect();
        let actual: HashSet<&String> = order.iter().collect();
        prop_assert_eq!(actual, expected);
        prop_assert_eq!(order.len(), subset.len());
    }

    #[test]
    fn closure_lists_each_dependency_once_and_target_last(skills in dag_strategy()) {
        let graph = DependencyGraph::from_skills(&skills, EventBus::new());
        let registry = SkillRegistry::from_skills(skills.clone(), EventBus::new());
        let resolver = DependencyResolver::new(&graph, &registry);
        let target = skills.last().unwrap().name().to_string();

        let resolution = resolver.resolve(&target);
        prop_assert!(resolution.success);
        prop_assert_eq!(resolution.resolved.last(), Some(&target));
        let unique: HashSet<&String> = resolution.resolved.iter().collect();
        prop_assert_eq!(unique.len(), resolution.resolved.len());

        let mut expected: HashSet<String> = graph.all_dependencies(&target).into_iter().collect();
        expected.insert(target.clone());
        let resolved: HashSet<String> = resolution.resolved.iter().cloned().collect();
        prop_assert_eq!(resolved, expected);
    }

    #[test]
    fn rings_are_always_detected(len in 1usize..12) {
        let skills: Vec<Skill> = (0..len)
            .map(|i| {
                Skill::new(format!("r{i}"), "1.0.0", "")
                    .with_skill_dependencies([format!("r{}", (i + 1) % len)])
            })
            .collect();
        let graph = DependencyGraph::from_skills(&skills, EventBus::new());

        let cycles = graph.detect_cycles();
        prop_assert_eq!(cycles.len(), 1);
        prop_assert_eq!(cycles[0].cycle.len(), len + 1);
        prop_assert_eq!(cycles[0].cycle.first(), cycles[0].cycle.last());
        prop_assert!(graph.topological_sort(&names(&skills)).is_none());
    }
}
