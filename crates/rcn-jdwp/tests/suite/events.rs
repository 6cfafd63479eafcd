use std::time::Duration;

use rcn_jdwp::{
    mock::{ClassSpec, MockJdwpServer},
    types::{EVENT_KIND_CLASS_PREPARE, EVENT_KIND_CLASS_UNLOAD, SUSPEND_POLICY_NONE},
    EventModifier, JdwpClient, JdwpEvent,
};

async fn next_event(events: &mut tokio::sync::broadcast::Receiver<JdwpEvent>) -> JdwpEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn class_prepare_events_reach_subscribers() {
    let server = MockJdwpServer::spawn().await.unwrap();
    let client = JdwpClient::connect(server.addr()).await.unwrap();
    let mut events = client.subscribe_events();

    let request_id = client
        .event_request_set(
            EVENT_KIND_CLASS_PREPARE,
            SUSPEND_POLICY_NONE,
            vec![EventModifier::ClassMatch {
                pattern: "com.example.*".to_string(),
            }],
        )
        .await
        .unwrap();

    let late = server
        .define_class(ClassSpec::class("com.example.Late"))
        .await
        .unwrap();

    match next_event(&mut events).await {
        JdwpEvent::ClassPrepare {
            request_id: got,
            type_id,
            signature,
            ..
        } => {
            assert_eq!(got, request_id);
            assert_eq!(type_id, late);
            assert_eq!(signature, "Lcom/example/Late;");
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Events do not disturb request/reply correlation.
    let signature = client.reference_type_signature(late).await.unwrap();
    assert_eq!(signature, "Lcom/example/Late;");
}

#[tokio::test]
async fn class_unload_events_carry_the_signature() {
    let server = MockJdwpServer::spawn().await.unwrap();
    let gone = server
        .define_class(ClassSpec::class("com.example.Gone"))
        .await
        .unwrap();
    let client = JdwpClient::connect(server.addr()).await.unwrap();
    let mut events = client.subscribe_events();

    client
        .event_request_set(EVENT_KIND_CLASS_UNLOAD, SUSPEND_POLICY_NONE, Vec::new())
        .await
        .unwrap();
    server.unload_class(gone).await.unwrap();

    match next_event(&mut events).await {
        JdwpEvent::ClassUnload { signature, .. } => {
            assert_eq!(signature, "Lcom/example/Gone;");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(client.reference_type_signature(gone).await.is_err());
}

#[tokio::test]
async fn cleared_requests_stop_event_delivery() {
    let server = MockJdwpServer::spawn().await.unwrap();
    let client = JdwpClient::connect(server.addr()).await.unwrap();
    let mut events = client.subscribe_events();

    let request_id = client
        .event_request_set(EVENT_KIND_CLASS_PREPARE, SUSPEND_POLICY_NONE, Vec::new())
        .await
        .unwrap();
    client
        .event_request_clear(EVENT_KIND_CLASS_PREPARE, request_id)
        .await
        .unwrap();

    server
        .define_class(ClassSpec::class("com.example.Quiet"))
        .await
        .unwrap();
    // A round trip after the definition guarantees any event would have arrived.
    client.all_threads().await.unwrap();
    assert!(events.try_recv().is_err());
}
