use rcn_config::MappingConfig;
use rcn_graph::{Access, MemberDescriptor};
use rcn_jdwp::mock::ClassSpec;

use super::fixtures::Fixture;

/// ```java
/// public class Constructors {
///     static class StaticMemberClass {
///         StaticMemberClass() { }
///         StaticMemberClass(StaticMemberClass x, StaticMemberClass y) { }
///     }
/// }
/// ```
#[tokio::test]
async fn constructors_are_keyed_by_signature() {
    let fixture = Fixture::spawn().await;
    let outer = fixture.define(ClassSpec::class("RCNTests.Constructors")).await;
    fixture
        .define(
            ClassSpec::class("RCNTests.Constructors$StaticMemberClass")
                .modifiers(rcn_jdwp::types::MODIFIER_STATIC)
                .enclosed_by(outer)
                .method("<init>", "()V", 0)
                .method(
                    "<init>",
                    "(LRCNTests/Constructors$StaticMemberClass;LRCNTests/Constructors$StaticMemberClass;)V",
                    0,
                ),
        )
        .await;
    let graph = fixture
        .snapshotter(MappingConfig::default())
        .await
        .capture()
        .await
        .unwrap();

    let owner = graph
        .type_by_rcn(&fixture.sys("RCNTests.Constructors$StaticMemberClass"))
        .unwrap();
    let constructors = graph
        .members_of(&owner.key)
        .filter_map(MemberDescriptor::as_constructor)
        .collect::<Vec<_>>();
    assert_eq!(constructors.len(), 2);

    let owner_rcn = fixture.sys("RCNTests.Constructors$StaticMemberClass");
    let no_args = graph
        .member_by_rcn(&format!("{owner_rcn}.-void-<init>()"))
        .and_then(MemberDescriptor::as_constructor)
        .unwrap();
    assert!(no_args.parameters.is_empty());
    assert_eq!(no_args.access, Access::PackagePrivate);

    let two_args = graph
        .member_by_rcn(&format!("{owner_rcn}.-void-<init>({owner_rcn},{owner_rcn})"))
        .and_then(MemberDescriptor::as_constructor)
        .unwrap();
    assert_eq!(two_args.parameters.len(), 2);
    assert!(two_args.parameters.iter().all(|param| param.rcn() == owner_rcn));
}
