use skillforge::core::{
    ChainBuilder, DependencyGraph, DependencyResolver, RegistryExport, SkillActivator, SkillRegistry,
    SkillStatus, StepStatus, validate_chain,
};
use skillforge::events::{EventBus, drain_names};
use skillforge::sandbox::{Permission, PermissionKind};
use skillforge::test_utils::{WorkspaceFixture, diamond_skills, skill};

fn position(order: &[String], name: &str) -> usize {
    order.iter().position(|n| n == name).unwrap()
}

#[test]
fn diamond_flows_from_registry_to_active_chain() {
    let skills = diamond_skills();
    let events = EventBus::new();
    let graph = DependencyGraph::from_skills(&skills, events.clone());
    let registry = SkillRegistry::from_skills(skills, events.clone());
    let resolver = DependencyResolver::new(&graph, &registry);

    let resolution = resolver.resolve("app");
    assert!(resolution.success);
    assert_eq!(resolution.resolved.len(), 4);
    assert_eq!(resolution.resolved.last().map(String::as_str), Some("app"));

    let chain = ChainBuilder::new(resolver, events.clone()).build_chain("app");
    assert!(chain.is_ready());
    assert!(validate_chain(&chain).valid);
    let names: Vec<String> = chain.skill_names().iter().map(ToString::to_string).collect();
    assert!(position(&names, "base") < position(&names, "left"));
    assert!(position(&names, "base") < position(&names, "right"));
    assert_eq!(names.last().map(String::as_str), Some("app"));
    assert!(chain.steps.iter().all(|s| s.status == StepStatus::Pending));

    let mut activator = SkillActivator::new(resolver, events);
    let result = activator.activate("left");
    assert_eq!(result.activated, vec!["base", "left"]);
    let result = activator.activate("app");
    assert_eq!(result.activated, vec!["right", "app"]);
    assert_eq!(activator.active_count(), 4);

    assert!(activator.deactivate("base"));
    assert_eq!(activator.active_count(), 0);
}

#[test]
fn chain_collects_permissions_once_across_steps() {
    let read = Permission::new(PermissionKind::FilesystemRead, "src", "scan sources");
    let skills = vec![
        skill("build", &["fetch"]).with_permission(read.clone()),
        skill("fetch", &[]).with_permission(read.clone()).with_permission(Permission::new(
            PermissionKind::NetworkHttps,
            "https://registry.npmjs.org",
            "download packages",
        )),
    ];
    let graph = DependencyGraph::from_skills(&skills, EventBus::new());
    let registry = SkillRegistry::from_skills(skills, EventBus::new());
    let chain = ChainBuilder::new(DependencyResolver::new(&graph, &registry), EventBus::new())
        .build_chain("build");

    assert_eq!(chain.skill_names(), vec!["fetch", "build"]);
    assert_eq!(chain.permissions.len(), 2);
    assert_eq!(chain.permissions[0], read);
}

#[test]
fn cyclic_registry_refuses_chains_and_activation() {
    let skills = vec![skill("a", &["b"]), skill("b", &["a"]), skill("free", &[])];
    let graph = DependencyGraph::from_skills(&skills, EventBus::new());
    let registry = SkillRegistry::from_skills(skills, EventBus::new());
    let resolver = DependencyResolver::new(&graph, &registry);

    assert_eq!(graph.detect_cycles().len(), 1);
    let chain = ChainBuilder::new(resolver, EventBus::new()).build_chain("a");
    assert!(!chain.is_ready());
    assert!(chain.errors.iter().any(|e| e.contains("circular")));

    let mut activator = SkillActivator::new(resolver, EventBus::new());
    assert!(!activator.activate("a").success());
    assert_eq!(activator.active_count(), 0);
}

#[tokio::test]
async fn registry_mutations_survive_an_export_round_trip() {
    let fixture = WorkspaceFixture::new();
    let events = EventBus::new();
    let rx = events.subscribe();
    let registry = SkillRegistry::with_events(events);

    assert!(registry.add(skill("lint", &[])).await);
    assert!(!registry.add(skill("lint", &[])).await);
    assert!(registry.add(skill("test", &["lint"])).await);
    assert!(registry.set_status("test", SkillStatus::Error).await);

    let path = fixture.path().join("export.json");
    registry.export().save(&path).unwrap();

    let restored = SkillRegistry::new();
    restored.import(RegistryExport::load(&path).unwrap()).await;
    assert_eq!(restored.len(), 2);
    assert_eq!(restored.get("test").unwrap().status, SkillStatus::Error);
    assert_eq!(restored.stats().error, 1);

    let names = drain_names(&rx);
    assert!(names.contains(&"registry:skill-added"));
    assert!(names.contains(&"registry:add-failed"));
}
