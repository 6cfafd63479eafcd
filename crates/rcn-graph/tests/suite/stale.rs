use rcn_config::MappingConfig;
use rcn_graph::{Unavailable, Value};
use rcn_jdwp::{
    mock::{ClassSpec, CollectOnCommand},
    types::{MODIFIER_PRIVATE, MODIFIER_PUBLIC},
    JdwpValue, ObjectId,
};

use super::fixtures::{node_class, Fixture};

#[tokio::test]
async fn collected_objects_stay_in_the_graph_as_dead_nodes() {
    let fixture = Fixture::spawn().await;
    let node = node_class(&fixture).await;
    let holder = fixture
        .define(ClassSpec::class("RCNTests.Holder").static_field(
            "GONE",
            "LRCNTests/Node;",
            0,
            JdwpValue::null(),
        ))
        .await;
    let gone = fixture
        .server
        .with_vm(|vm| {
            let gone = vm.new_object(node);
            vm.set_static(holder, "GONE", JdwpValue::object(gone));
            vm.collect(gone);
            gone
        })
        .await;

    let graph = fixture
        .snapshotter(MappingConfig::default())
        .await
        .capture()
        .await
        .unwrap();

    let field = graph
        .member_by_rcn(&fixture.sys("RCNTests.Holder.GONE"))
        .unwrap()
        .key()
        .clone();
    assert_eq!(graph.statics[&field], Value::Reference(gone));
    let dead = &graph.instances[&gone];
    assert!(!dead.live);
    assert_eq!(dead.runtime_type, None);
    assert!(graph.diagnostics.iter().all(|message| !message.contains("InstanceOf")));
}

/// `ObjectReference.GetValues`
fn collect_on_field_read(object: ObjectId) -> CollectOnCommand {
    CollectOnCommand {
        command_set: 9,
        command: 2,
        object,
    }
}

#[tokio::test]
async fn objects_collected_before_their_fields_are_read_keep_their_type() {
    let fixture = Fixture::spawn().await;
    let node = node_class(&fixture).await;
    let holder = fixture
        .define(ClassSpec::class("RCNTests.Holder").static_field(
            "HEAD",
            "LRCNTests/Node;",
            0,
            JdwpValue::null(),
        ))
        .await;
    let head = fixture
        .server
        .with_vm(|vm| {
            let head = vm.new_object(node);
            let tail = vm.new_object(node);
            vm.set_field(head, "next", JdwpValue::object(tail));
            vm.set_static(holder, "HEAD", JdwpValue::object(head));
            head
        })
        .await;
    fixture.server.collect_on_command(collect_on_field_read(head)).await;

    let graph = fixture
        .snapshotter(MappingConfig::default())
        .await
        .capture()
        .await
        .unwrap();

    let dead = &graph.instances[&head];
    assert_eq!(
        dead.runtime_type.as_ref().map(|key| key.name.as_str()),
        Some("RCNTests.Node")
    );
    assert!(!dead.live);
    assert!(!dead.fields.is_empty());
    assert!(dead
        .fields
        .values()
        .all(|value| *value == Value::Unavailable(Unavailable::Collected)));
    // The tail was only reachable through the collected head.
    assert_eq!(graph.instances.values().filter(|node| !node.live).count(), 1);
}

/// ```java
/// package lib;
/// public class Base { private int secret; }
///
/// class Derived extends lib.Base { Derived next; }
/// ```
#[tokio::test]
async fn collection_keeps_fields_the_limiter_skipped() {
    let fixture = Fixture::spawn().await;
    let base = fixture
        .define(ClassSpec::class("lib.Base").field("secret", "I", MODIFIER_PRIVATE))
        .await;
    let derived = fixture
        .define(
            ClassSpec::class("RCNTests.Derived")
                .extends(base)
                .field("next", "LRCNTests/Derived;", MODIFIER_PUBLIC),
        )
        .await;
    let holder = fixture
        .define(ClassSpec::class("RCNTests.Holder").static_field(
            "DERIVED",
            "LRCNTests/Derived;",
            MODIFIER_PUBLIC,
            JdwpValue::null(),
        ))
        .await;
    let object = fixture
        .server
        .with_vm(|vm| {
            let object = vm.new_object(derived);
            vm.set_static(holder, "DERIVED", JdwpValue::object(object));
            object
        })
        .await;
    fixture.server.collect_on_command(collect_on_field_read(object)).await;
    let config = MappingConfig {
        shallow_packages: vec!["lib".to_owned()],
        ..MappingConfig::default()
    };
    let graph = fixture.snapshotter(config).await.capture().await.unwrap();

    let dead = &graph.instances[&object];
    assert!(!dead.live);
    assert_eq!(
        dead.fields[&fixture.sys("lib.Base.secret")],
        Value::Unavailable(Unavailable::Skipped)
    );
    assert_eq!(
        dead.fields[&fixture.sys("RCNTests.Derived.next")],
        Value::Unavailable(Unavailable::Collected)
    );
}
