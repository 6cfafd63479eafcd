use rcn_config::MappingConfig;
use rcn_graph::{EdgeKind, NodeId, Payload, Value};
use rcn_jdwp::{mock::ClassSpec, JdwpValue};

use super::fixtures::{node_class, Fixture};

#[tokio::test]
async fn cyclic_objects_are_materialized_once() {
    let fixture = Fixture::spawn().await;
    let node = node_class(&fixture).await;
    let holder = fixture
        .define(
            ClassSpec::class("RCNTests.Holder")
                .static_field("HEAD", "LRCNTests/Node;", 0, JdwpValue::null())
                .static_field("SELF", "LRCNTests/Node;", 0, JdwpValue::null()),
        )
        .await;
    let (a, b, c) = fixture
        .server
        .with_vm(|vm| {
            let a = vm.new_object(node);
            let b = vm.new_object(node);
            let c = vm.new_object(node);
            vm.set_field(a, "next", JdwpValue::object(b));
            vm.set_field(b, "next", JdwpValue::object(a));
            vm.set_field(c, "next", JdwpValue::object(c));
            vm.set_static(holder, "HEAD", JdwpValue::object(a));
            vm.set_static(holder, "SELF", JdwpValue::object(c));
            (a, b, c)
        })
        .await;

    let graph = fixture
        .snapshotter(MappingConfig::default())
        .await
        .capture()
        .await
        .unwrap();

    let next = fixture.sys("RCNTests.Node.next");
    for id in [a, b, c] {
        assert_eq!(graph.instances[&id].payload, Payload::Plain);
    }
    assert_eq!(graph.instances[&a].fields[&next], Value::Reference(b));
    assert_eq!(graph.instances[&b].fields[&next], Value::Reference(a));
    assert_eq!(graph.instances[&c].fields[&next], Value::Reference(c));

    let references = EdgeKind::References { via: next };
    let mut pairs = graph
        .edges_of_kind(&references)
        .map(|edge| (edge.from.clone(), edge.to.clone()))
        .collect::<Vec<_>>();
    pairs.sort();
    let mut expected = vec![
        (NodeId::Instance(a), NodeId::Instance(b)),
        (NodeId::Instance(b), NodeId::Instance(a)),
        (NodeId::Instance(c), NodeId::Instance(c)),
    ];
    expected.sort();
    assert_eq!(pairs, expected);
}

#[tokio::test]
async fn depth_bound_leaves_stubs() {
    let fixture = Fixture::spawn().await;
    let node = node_class(&fixture).await;
    let holder = fixture
        .define(ClassSpec::class("RCNTests.Chain").static_field(
            "HEAD",
            "LRCNTests/Node;",
            0,
            JdwpValue::null(),
        ))
        .await;
    let chain = fixture
        .server
        .with_vm(|vm| {
            let chain = (0..4).map(|_| vm.new_object(node)).collect::<Vec<_>>();
            for pair in chain.windows(2) {
                vm.set_field(pair[0], "next", JdwpValue::object(pair[1]));
            }
            vm.set_static(holder, "HEAD", JdwpValue::object(chain[0]));
            chain
        })
        .await;

    let config = MappingConfig {
        max_depth: Some(1),
        ..MappingConfig::default()
    };
    let graph = fixture.snapshotter(config).await.capture().await.unwrap();

    assert!(graph.instances[&chain[0]].is_explored());
    assert!(graph.instances[&chain[1]].is_explored());
    assert_eq!(graph.instances[&chain[2]].payload, Payload::Unexplored);
    assert!(!graph.instances.contains_key(&chain[3]));
}
