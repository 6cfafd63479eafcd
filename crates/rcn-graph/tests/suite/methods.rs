use rcn_config::MappingConfig;
use rcn_graph::{EdgeKind, MemberDescriptor, NodeId, RcnError};
use rcn_jdwp::{mock::ClassSpec, types::MODIFIER_STATIC, VariableInfo};

use super::fixtures::Fixture;

/// ```java
/// public class Methods {
///     static class NotLoaded { }
///     static class StaticMemberClass {
///         void someMethod() { }
///         StaticMemberClass complexMethod(StaticMemberClass x, StaticMemberClass y) { return null; }
///     }
///     void someMethod() { }
///     NotLoaded notLoadedTypesMethod(NotLoaded x) { return null; }
/// }
/// ```
async fn methods(fixture: &Fixture) {
    let outer = fixture
        .define(
            ClassSpec::class("RCNTests.Methods")
                .method("someMethod", "()V", 0)
                .method(
                    "notLoadedTypesMethod",
                    "(LRCNTests/Methods$NotLoaded;)LRCNTests/Methods$NotLoaded;",
                    0,
                ),
        )
        .await;
    fixture
        .define(
            ClassSpec::class("RCNTests.Methods$StaticMemberClass")
                .modifiers(MODIFIER_STATIC)
                .enclosed_by(outer)
                .method("someMethod", "()V", 0)
                .method(
                    "complexMethod",
                    "(LRCNTests/Methods$StaticMemberClass;LRCNTests/Methods$StaticMemberClass;)LRCNTests/Methods$StaticMemberClass;",
                    0,
                ),
        )
        .await;
}

#[tokio::test]
async fn method_rcns_name_return_and_parameter_types() {
    let fixture = Fixture::spawn().await;
    methods(&fixture).await;
    let graph = fixture
        .snapshotter(MappingConfig::default())
        .await
        .capture()
        .await
        .unwrap();

    let methods = fixture.sys("RCNTests.Methods");
    let member = fixture.sys("RCNTests.Methods$StaticMemberClass");
    for rcn in [
        format!("{methods}.-void-someMethod()"),
        format!(
            "{methods}.-Unprepared-RCNTests.Methods$NotLoaded-notLoadedTypesMethod(Unprepared-RCNTests.Methods$NotLoaded)"
        ),
        format!("{member}.-void-someMethod()"),
        format!("{member}.-{member}-complexMethod({member},{member})"),
    ] {
        let method = graph.member_by_rcn(&rcn).and_then(MemberDescriptor::as_method);
        assert!(method.is_some(), "missing {rcn}");
    }
}

#[tokio::test]
async fn types_never_loaded_become_placeholders() {
    let fixture = Fixture::spawn().await;
    methods(&fixture).await;
    let snapshotter = fixture.snapshotter(MappingConfig::default()).await;
    let graph = snapshotter.capture().await.unwrap();

    assert!(graph.unloaded.contains("RCNTests.Methods$NotLoaded"));
    let method = graph
        .member_by_rcn(&format!(
            "{}.-Unprepared-RCNTests.Methods$NotLoaded-notLoadedTypesMethod(Unprepared-RCNTests.Methods$NotLoaded)",
            fixture.sys("RCNTests.Methods")
        ))
        .unwrap();
    let targets = graph
        .edges_from(&NodeId::Member(method.key().clone()))
        .map(|edge| edge.to.clone())
        .collect::<Vec<_>>();
    assert_eq!(
        targets,
        vec![NodeId::Unloaded("RCNTests.Methods$NotLoaded".to_owned())]
    );

    match snapshotter
        .members()
        .members_of_name(Some(fixture.system_loader), "RCNTests.Methods$NotLoaded")
        .await
    {
        Err(RcnError::UnresolvedType { identity }) => {
            assert_eq!(identity, "RCNTests.Methods$NotLoaded")
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn overloads_are_distinct_members() {
    let fixture = Fixture::spawn().await;
    fixture
        .define(
            ClassSpec::class("RCNTests.Overloads")
                .method("run", "()V", 0)
                .method("run", "(I)V", 0)
                .method("run", "(Ljava/lang/String;)I", 0),
        )
        .await;
    let snapshotter = fixture.snapshotter(MappingConfig::default()).await;
    let members = snapshotter
        .members()
        .members_of_name(Some(fixture.system_loader), "RCNTests.Overloads")
        .await
        .unwrap();

    let owner = fixture.sys("RCNTests.Overloads");
    let rcns = members
        .iter()
        .filter_map(MemberDescriptor::as_method)
        .map(|method| method.rcn.clone())
        .collect::<Vec<_>>();
    assert_eq!(
        rcns,
        vec![
            format!("{owner}.-void-run()"),
            format!("{owner}.-void-run(int)"),
            format!("{owner}.-int-run(java.lang.String)"),
        ]
    );
}

fn local(name: &str, signature: &str, code_index: u64, length: u32, slot: u32) -> VariableInfo {
    VariableInfo {
        code_index,
        name: name.to_owned(),
        signature: signature.to_owned(),
        length,
        slot,
    }
}

/// ```java
/// public class Locals {
///     Locals() { }                                    // line 3
///     static int sum(int x) {                         // line 5
///         int total = 0;                              // line 6
///         for (int i = 0; i < x; i++) total += i;     // line 7
///         for (int i = x; i > 0; i--) total -= i;     // line 9
///         return total;
///     }
/// }
/// ```
#[tokio::test]
async fn methods_declare_their_variables_and_locations() {
    let fixture = Fixture::spawn().await;
    fixture
        .define(
            ClassSpec::class("RCNTests.Locals")
                .source_file("Locals.java")
                .method_with_variables(
                    "<init>",
                    "()V",
                    0,
                    vec![local("this", "LRCNTests/Locals;", 0, 2, 0)],
                )
                .at_lines(vec![(0, 3)])
                .method_with_variables(
                    "sum",
                    "(I)I",
                    MODIFIER_STATIC,
                    vec![
                        local("x", "I", 0, 12, 0),
                        local("total", "I", 2, 10, 1),
                        local("i", "I", 3, 3, 2),
                        local("i", "I", 6, 3, 2),
                    ],
                )
                .at_lines(vec![(0, 5), (2, 6), (3, 7), (6, 9)]),
        )
        .await;
    let graph = fixture
        .snapshotter(MappingConfig::default())
        .await
        .capture()
        .await
        .unwrap();

    let owner = fixture.sys("RCNTests.Locals");
    let sum = graph
        .member_by_rcn(&format!("{owner}.-int-sum(int)"))
        .and_then(MemberDescriptor::as_method)
        .unwrap();
    let location = sum.location.as_ref().unwrap();
    assert_eq!(location.line, 5);
    assert_eq!(location.source_path.as_deref(), Some("RCNTests/Locals.java"));

    let variables = sum
        .variables
        .iter()
        .map(|variable| (variable.rcn.clone(), variable.line, variable.is_parameter))
        .collect::<Vec<_>>();
    assert_eq!(
        variables,
        vec![
            (format!("{}.x", sum.rcn), Some(5), true),
            (format!("{}.total", sum.rcn), Some(6), false),
            (format!("{}.i-3", sum.rcn), Some(7), false),
            (format!("{}.i-6", sum.rcn), Some(9), false),
        ]
    );

    let total = graph
        .variable_by_rcn(&format!("{}.total", sum.rcn))
        .unwrap();
    assert_eq!(total.declared_type.rcn(), "int");
    let declared = graph
        .edges_from(&NodeId::Member(sum.key.clone()))
        .filter(|edge| edge.kind == EdgeKind::DeclaresVariable)
        .map(|edge| edge.to.clone())
        .collect::<Vec<_>>();
    assert_eq!(declared.len(), 4);
    assert!(declared.contains(&NodeId::Variable(total.key.clone())));

    let constructor = graph
        .member_by_rcn(&format!("{owner}.-void-<init>()"))
        .and_then(MemberDescriptor::as_constructor)
        .unwrap();
    assert!(constructor.variables.is_empty());
    assert_eq!(constructor.location.as_ref().map(|location| location.line), Some(3));
}

#[tokio::test]
async fn methods_without_debug_information_have_no_location() {
    let fixture = Fixture::spawn().await;
    methods(&fixture).await;
    let graph = fixture
        .snapshotter(MappingConfig::default())
        .await
        .capture()
        .await
        .unwrap();

    let method = graph
        .member_by_rcn(&format!("{}.-void-someMethod()", fixture.sys("RCNTests.Methods")))
        .and_then(MemberDescriptor::as_method)
        .unwrap();
    assert!(method.location.is_none());
    assert!(method.variables.is_empty());
}
