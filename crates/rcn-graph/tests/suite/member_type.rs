use pretty_assertions::assert_eq;
use rcn_config::MappingConfig;
use rcn_graph::{EdgeKind, Nesting, NodeId, TypeKind};

use super::fixtures::{member_type, Fixture};

#[tokio::test]
async fn member_types_are_named_and_nested() {
    let fixture = Fixture::spawn().await;
    member_type(&fixture).await;
    let graph = fixture
        .snapshotter(MappingConfig::default())
        .await
        .capture()
        .await
        .unwrap();

    let outer = graph.type_by_rcn(&fixture.sys("RCNTests.MyClass")).unwrap();
    let member = graph
        .type_by_rcn(&fixture.sys("RCNTests.MyClass$MemberClass"))
        .unwrap();
    let static_member = graph
        .type_by_rcn(&fixture.sys("RCNTests.MyClass$StaticMemberClass"))
        .unwrap();
    let interface = graph
        .type_by_rcn(&fixture.sys("RCNTests.MyClass$MemberInterface"))
        .unwrap();

    assert_eq!(outer.nesting, Nesting::TopLevel);
    assert_eq!(member.nesting, Nesting::InstanceMember);
    assert_eq!(static_member.nesting, Nesting::StaticMember);
    assert_eq!(interface.nesting, Nesting::StaticMember);
    assert_eq!(interface.kind, TypeKind::Interface);
    for nested in [member, static_member, interface] {
        assert_eq!(nested.enclosing.as_ref(), Some(&outer.key));
        assert!(graph.edges.iter().any(|edge| {
            edge.kind == EdgeKind::EnclosedBy
                && edge.from == NodeId::Type(nested.key.clone())
                && edge.to == NodeId::Type(outer.key.clone())
        }));
    }
}

#[tokio::test]
async fn each_implementor_has_one_implements_edge() {
    let fixture = Fixture::spawn().await;
    member_type(&fixture).await;
    let snapshotter = fixture.snapshotter(MappingConfig::default()).await;
    let graph = snapshotter.capture().await.unwrap();

    let interface = graph
        .type_by_rcn(&fixture.sys("RCNTests.MyClass$MemberInterface"))
        .unwrap();
    let mut implementors = graph
        .edges_of_kind(&EdgeKind::Implements)
        .filter(|edge| edge.to == NodeId::Type(interface.key.clone()))
        .map(|edge| match &edge.from {
            NodeId::Type(key) => graph.types[key].rcn.clone(),
            other => panic!("unexpected implementor {other:?}"),
        })
        .collect::<Vec<_>>();
    implementors.sort();
    assert_eq!(
        implementors,
        vec![
            fixture.sys("RCNTests.MyClass$MemberClass"),
            fixture.sys("RCNTests.MyClass$StaticMemberClass"),
        ]
    );
}

#[tokio::test]
async fn the_outer_instance_field_is_marked() {
    let fixture = Fixture::spawn().await;
    member_type(&fixture).await;
    let graph = fixture
        .snapshotter(MappingConfig::default())
        .await
        .capture()
        .await
        .unwrap();

    let this0 = graph
        .member_by_rcn(&fixture.sys("RCNTests.MyClass$MemberClass.this$0"))
        .and_then(|member| member.as_field())
        .unwrap();
    assert!(this0.outer_instance);
    assert!(this0.synthetic);
    assert!(!this0.is_static);
    assert_eq!(this0.declared_type.rcn(), fixture.sys("RCNTests.MyClass"));
}
