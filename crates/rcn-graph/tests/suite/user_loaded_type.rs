use rcn_config::MappingConfig;
use rcn_graph::{EdgeKind, NodeId, TypeKey};
use rcn_jdwp::{mock::ClassSpec, types::MODIFIER_PUBLIC};

use super::fixtures::Fixture;

/// A type defined twice: once by the system loader, once by a user-defined
/// `UserClassLoader` delegating to it.
#[tokio::test]
async fn user_loaded_types_are_named_by_their_loader() {
    let fixture = Fixture::spawn().await;
    let class_loader = fixture
        .server
        .with_vm(|vm| vm.class_id("java.lang.ClassLoader", 0))
        .await
        .unwrap();
    let user_loader_class = fixture
        .define(ClassSpec::class("RCNTests.UserClassLoader").modifiers(0).extends(class_loader))
        .await;
    let system_loader = fixture.system_loader;
    let loader = fixture
        .server
        .with_vm(|vm| vm.new_loader(user_loader_class, system_loader))
        .await;
    let spec = || ClassSpec::class("RCNTests.UserLoadedType").method("helloWorld", "()V", MODIFIER_PUBLIC);
    fixture.define(spec()).await;
    fixture.server.define_class(spec().loader(loader)).await.unwrap();

    let snapshotter = fixture.snapshotter(MappingConfig::default()).await;
    let mut graph = snapshotter.capture().await.unwrap();

    assert!(graph.type_by_rcn(&fixture.sys("RCNTests.UserLoadedType")).is_some());
    let user_loaded = graph
        .type_by_rcn(&format!("Loader{loader}-RCNTests.UserLoadedType"))
        .unwrap();
    assert_eq!(user_loaded.key, TypeKey::new(Some(loader), "RCNTests.UserLoadedType"));
    assert!(graph
        .member_by_rcn(&format!("Loader{loader}-RCNTests.UserLoadedType.-void-helloWorld()"))
        .is_some());

    let loaded_by = graph
        .edges_from(&NodeId::Type(user_loaded.key.clone()))
        .filter(|edge| edge.kind == EdgeKind::LoadedBy)
        .map(|edge| edge.to.clone())
        .collect::<Vec<_>>();
    assert_eq!(loaded_by, vec![NodeId::Instance(loader)]);
    assert!(graph.instances[&loader].live);

    fixture.server.collect(loader).await;
    assert_eq!(snapshotter.refresh_liveness(&mut graph).await.unwrap(), 1);
    let stale = graph
        .instances
        .values()
        .filter(|node| !node.live)
        .map(|node| node.object_id)
        .collect::<Vec<_>>();
    assert_eq!(stale, vec![loader]);
}

/// Between `defineClass` and the first `newInstance` the user-loaded type is
/// loaded but not prepared; its loader must still be in the graph.
#[tokio::test]
async fn unprepared_types_keep_their_loader() {
    let fixture = Fixture::spawn().await;
    let class_loader = fixture
        .server
        .with_vm(|vm| vm.class_id("java.lang.ClassLoader", 0))
        .await
        .unwrap();
    let user_loader_class = fixture
        .define(ClassSpec::class("RCNTests.UserClassLoader").modifiers(0).extends(class_loader))
        .await;
    let system_loader = fixture.system_loader;
    let loader = fixture
        .server
        .with_vm(|vm| vm.new_loader(user_loader_class, system_loader))
        .await;
    fixture
        .server
        .define_class(
            ClassSpec::class("RCNTests.UserLoadedType")
                .status(0)
                .loader(loader),
        )
        .await
        .unwrap();

    let snapshotter = fixture.snapshotter(MappingConfig::default()).await;
    let graph = snapshotter.capture().await.unwrap();

    let key = TypeKey::new(Some(loader), "RCNTests.UserLoadedType");
    assert!(graph.types[&key].is_partial());
    let loaded_by = graph
        .edges_from(&NodeId::Type(key))
        .filter(|edge| edge.kind == EdgeKind::LoadedBy)
        .count();
    assert_eq!(loaded_by, 1);
    assert!(graph.instances[&loader].live);
    assert!(
        graph.diagnostics.iter().all(|message| !message.contains("LoadedBy")),
        "{:?}",
        graph.diagnostics
    );
}
