use std::sync::Arc;

use pretty_assertions::assert_eq;
use rcn_config::MappingConfig;

use super::fixtures::{member_type, Fixture};

#[tokio::test]
async fn resolving_twice_returns_the_cached_node() {
    let fixture = Fixture::spawn().await;
    let ids = member_type(&fixture).await;
    let snapshotter = fixture.snapshotter(MappingConfig::default()).await;

    let first = snapshotter.resolver().resolve(ids.member_class).await.unwrap();
    let second = snapshotter.resolver().resolve(ids.member_class).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    // A fresh session builds an identical node.
    let other = fixture.snapshotter(MappingConfig::default()).await;
    let rebuilt = other.resolver().resolve(ids.member_class).await.unwrap();
    assert_eq!(*rebuilt, *first);
}

#[tokio::test]
async fn repeated_captures_produce_the_same_graph() {
    let fixture = Fixture::spawn().await;
    let ids = member_type(&fixture).await;
    fixture
        .server
        .with_vm(|vm| {
            let outer = vm.new_object(ids.my_class);
            let inner = vm.new_object(ids.member_class);
            vm.set_field(inner, "this$0", rcn_jdwp::JdwpValue::object(outer));
        })
        .await;
    let snapshotter = fixture.snapshotter(MappingConfig::default()).await;

    let first = snapshotter.capture().await.unwrap();
    let second = snapshotter.capture().await.unwrap();
    assert_eq!(first, second);

    let static_member = first
        .type_by_rcn(&fixture.sys("RCNTests.MyClass$StaticMemberClass"))
        .unwrap();
    assert_eq!(static_member.type_id, ids.static_member_class);
    assert_eq!(
        snapshotter.resolver().type_id_of(&static_member.key),
        Some(ids.static_member_class)
    );
    let interface = snapshotter.resolver().resolve(ids.member_interface).await.unwrap();
    assert!(first.types.contains_key(&interface.key));
}
