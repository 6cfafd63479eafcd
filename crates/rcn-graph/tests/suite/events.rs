use std::time::Duration;

use rcn_config::MappingConfig;
use rcn_graph::{MemberDescriptor, Snapshotter};
use rcn_jdwp::mock::ClassSpec;

use super::fixtures::Fixture;

async fn return_type_of(snapshotter: &Snapshotter, fixture: &Fixture) -> String {
    let members = snapshotter
        .members()
        .members_of_name(Some(fixture.system_loader), "RCNTests.Methods")
        .await
        .unwrap();
    members
        .iter()
        .find_map(MemberDescriptor::as_method)
        .map(|method| method.return_type.rcn().to_owned())
        .unwrap()
}

#[tokio::test]
async fn class_events_keep_the_caches_current() {
    let fixture = Fixture::spawn().await;
    fixture
        .define(ClassSpec::class("RCNTests.Methods").method(
            "make",
            "()LRCNTests/Methods$NotLoaded;",
            0,
        ))
        .await;
    let snapshotter = fixture.snapshotter(MappingConfig::default()).await;
    assert_eq!(
        return_type_of(&snapshotter, &fixture).await,
        "Unprepared-RCNTests.Methods$NotLoaded"
    );

    let mut tracker = snapshotter.track_class_events().await.unwrap();
    let not_loaded = fixture
        .define(ClassSpec::class("RCNTests.Methods$NotLoaded"))
        .await;
    tokio::time::timeout(Duration::from_secs(2), tracker.wait_processed(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        return_type_of(&snapshotter, &fixture).await,
        fixture.sys("RCNTests.Methods$NotLoaded")
    );

    let node = snapshotter.resolver().resolve(not_loaded).await.unwrap();
    assert!(snapshotter.resolver().cached(&node.key).is_some());
    fixture.server.unload_class(not_loaded).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), tracker.wait_processed(2))
        .await
        .unwrap()
        .unwrap();
    assert!(snapshotter.resolver().cached(&node.key).is_none());

    tracker.stop().await.unwrap();
    assert_eq!(fixture.server.command_count(15, 2).await, 2);
}
