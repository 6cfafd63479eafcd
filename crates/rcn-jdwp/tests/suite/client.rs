use std::time::Duration;

use pretty_assertions::assert_eq;
use rcn_jdwp::{
    mock::{ClassSpec, CollectOnCommand, DelayedReply, MockJdwpServer, MockJdwpServerConfig, MockVm},
    types::{
        CLASS_STATUS_VERIFIED, ERROR_ABSENT_INFORMATION, ERROR_CLASS_NOT_PREPARED, ERROR_INVALID_OBJECT,
        ERROR_THREAD_NOT_SUSPENDED, MODIFIER_PRIVATE, MODIFIER_PUBLIC, MODIFIER_STATIC,
        TYPE_TAG_CLASS,
    },
    JdwpClient, JdwpClientConfig, JdwpError, JdwpIdSizes, JdwpValue, Location, VariableInfo,
};

#[tokio::test]
async fn handshake_and_type_metadata() {
    let mut vm = MockVm::new();
    let sys = vm.system_loader();
    let point = vm.define(
        ClassSpec::class("com.example.Point")
            .loader(sys)
            .field("x", "I", MODIFIER_PRIVATE)
            .field("y", "I", MODIFIER_PRIVATE)
            .method("<init>", "(II)V", MODIFIER_PUBLIC)
            .method("length", "()D", MODIFIER_PUBLIC),
    );
    let server = MockJdwpServer::spawn_with_vm(vm).await.unwrap();
    let client = JdwpClient::connect(server.addr()).await.unwrap();

    let classes = client.all_classes().await.unwrap();
    let info = classes.iter().find(|c| c.type_id == point).unwrap();
    assert_eq!(info.signature, "Lcom/example/Point;");
    assert_eq!(info.ref_type_tag, TYPE_TAG_CLASS);

    assert_eq!(client.reference_type_class_loader(point).await.unwrap(), sys);
    assert_eq!(
        client.reference_type_modifiers(point).await.unwrap(),
        MODIFIER_PUBLIC
    );

    let fields = client.reference_type_fields(point).await.unwrap();
    let names: Vec<_> = fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["x", "y"]);

    let methods = client.reference_type_methods(point).await.unwrap();
    let names: Vec<_> = methods.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["<init>", "length"]);

    let object = client.class_type_superclass(point).await.unwrap();
    assert_eq!(
        client.reference_type_signature(object).await.unwrap(),
        "Ljava/lang/Object;"
    );
    assert_eq!(client.class_type_superclass(object).await.unwrap(), 0);
}

#[tokio::test]
async fn unprepared_types_report_class_not_prepared() {
    let mut vm = MockVm::new();
    let lazy = vm.define(ClassSpec::class("com.example.Lazy").status(CLASS_STATUS_VERIFIED));
    let server = MockJdwpServer::spawn_with_vm(vm).await.unwrap();
    let client = JdwpClient::connect(server.addr()).await.unwrap();

    assert_eq!(
        client.reference_type_status(lazy).await.unwrap(),
        CLASS_STATUS_VERIFIED
    );
    let err = client.reference_type_fields(lazy).await.unwrap_err();
    assert!(
        matches!(err, JdwpError::VmError(ERROR_CLASS_NOT_PREPARED)),
        "{err:?}"
    );
    // A VM error does not end the session.
    assert!(!client.is_closed());
}

#[tokio::test]
async fn line_tables_and_source_files() {
    let mut vm = MockVm::new();
    let methods = vm.define(
        ClassSpec::class("RCNTests.Methods")
            .source_file("Methods.java")
            .method("helloWorld", "()V", MODIFIER_PUBLIC)
            .at_lines(vec![(0, 12), (4, 13), (9, 14)])
            .method("stripped", "()V", MODIFIER_PUBLIC),
    );
    let bare = vm.define(ClassSpec::class("RCNTests.Bare"));
    let hello = vm.method_id(methods, "helloWorld", "()V").unwrap();
    let stripped = vm.method_id(methods, "stripped", "()V").unwrap();
    let server = MockJdwpServer::spawn_with_vm(vm).await.unwrap();
    let client = JdwpClient::connect(server.addr()).await.unwrap();

    let table = client.method_line_table(methods, hello).await.unwrap();
    assert_eq!((table.start, table.end), (0, 9));
    assert_eq!(table.first_line(), Some(12));
    assert_eq!(table.line_at(6), Some(13));
    assert_eq!(
        client.reference_type_source_file(methods).await.unwrap(),
        "Methods.java"
    );

    let err = client.method_line_table(methods, stripped).await.unwrap_err();
    assert!(matches!(err, JdwpError::VmError(ERROR_ABSENT_INFORMATION)), "{err:?}");
    let err = client.reference_type_source_file(bare).await.unwrap_err();
    assert!(matches!(err, JdwpError::VmError(ERROR_ABSENT_INFORMATION)), "{err:?}");
}

#[tokio::test]
async fn objects_can_be_collected_when_a_command_names_them() {
    let mut vm = MockVm::new();
    let node = vm.define(ClassSpec::class("com.example.Node").field("value", "I", MODIFIER_PRIVATE));
    let first = vm.new_object(node);
    let second = vm.new_object(node);
    let server = MockJdwpServer::spawn_with_vm(vm).await.unwrap();
    server
        .collect_on_command(CollectOnCommand {
            command_set: 9,
            command: 2,
            object: second,
        })
        .await;
    let client = JdwpClient::connect(server.addr()).await.unwrap();
    let field_ids: Vec<_> = client
        .reference_type_fields(node)
        .await
        .unwrap()
        .iter()
        .map(|f| f.field_id)
        .collect();

    // Commands naming other objects, or other commands, leave it alone.
    client.object_reference_get_values(first, &field_ids).await.unwrap();
    client.object_reference_reference_type(second).await.unwrap();

    let err = client
        .object_reference_get_values(second, &field_ids)
        .await
        .unwrap_err();
    assert!(matches!(err, JdwpError::VmError(ERROR_INVALID_OBJECT)), "{err:?}");
    assert!(client.object_reference_is_collected(second).await.unwrap());
    assert!(!client.object_reference_is_collected(first).await.unwrap());
}

#[tokio::test]
async fn object_fields_and_collection() {
    let mut vm = MockVm::new();
    let node = vm.define(
        ClassSpec::class("com.example.Node")
            .field("value", "I", MODIFIER_PRIVATE)
            .field("label", "Ljava/lang/String;", MODIFIER_PRIVATE),
    );
    let object = vm.new_object(node);
    let label = vm.new_string("head");
    assert!(vm.set_field(object, "value", JdwpValue::Int(7)));
    assert!(vm.set_field(object, "label", JdwpValue::object(label)));
    let server = MockJdwpServer::spawn_with_vm(vm).await.unwrap();
    let client = JdwpClient::connect(server.addr()).await.unwrap();

    let (tag, type_id) = client.object_reference_reference_type(object).await.unwrap();
    assert_eq!((tag, type_id), (TYPE_TAG_CLASS, node));

    let field_ids: Vec<_> = client
        .reference_type_fields(node)
        .await
        .unwrap()
        .iter()
        .map(|f| f.field_id)
        .collect();
    let values = client
        .object_reference_get_values(object, &field_ids)
        .await
        .unwrap();
    assert_eq!(values[0], JdwpValue::Int(7));
    // Strings come back with the `s` tag.
    assert_eq!(values[1], JdwpValue::Object { tag: b's', id: label });
    assert_eq!(client.string_reference_value(label).await.unwrap(), "head");

    assert!(!client.object_reference_is_collected(object).await.unwrap());
    server.collect(object).await;
    assert!(client.object_reference_is_collected(object).await.unwrap());
    let err = client
        .object_reference_get_values(object, &field_ids)
        .await
        .unwrap_err();
    assert!(matches!(err, JdwpError::VmError(ERROR_INVALID_OBJECT)), "{err:?}");
}

#[tokio::test]
async fn static_values_and_arrays() {
    let mut vm = MockVm::new();
    let int_array = vm.define(ClassSpec::array("int[]"));
    let string_array = vm.define(ClassSpec::array("java.lang.String[]"));
    let numbers = vm.new_array(
        int_array,
        b'I',
        vec![JdwpValue::Int(1), JdwpValue::Int(2), JdwpValue::Int(3)],
    );
    let word = vm.new_string("w");
    let words = vm.new_array(
        string_array,
        b'L',
        vec![JdwpValue::object(word), JdwpValue::null()],
    );
    let holder = vm.define(ClassSpec::class("com.example.Holder").static_field(
        "NUMBERS",
        "[I",
        MODIFIER_PUBLIC,
        JdwpValue::object(numbers),
    ));
    let server = MockJdwpServer::spawn_with_vm(vm).await.unwrap();
    let client = JdwpClient::connect(server.addr()).await.unwrap();

    let field = client.reference_type_fields(holder).await.unwrap()[0].clone();
    assert_eq!(field.mod_bits & MODIFIER_STATIC, MODIFIER_STATIC);
    let values = client
        .reference_type_get_values(holder, &[field.field_id])
        .await
        .unwrap();
    assert_eq!(values, vec![JdwpValue::Object { tag: b'[', id: numbers }]);

    assert_eq!(client.array_reference_length(numbers).await.unwrap(), 3);
    assert_eq!(
        client.array_reference_get_values(numbers, 1, 2).await.unwrap(),
        vec![JdwpValue::Int(2), JdwpValue::Int(3)]
    );
    assert_eq!(
        client.array_reference_get_values(words, 0, 2).await.unwrap(),
        vec![JdwpValue::Object { tag: b's', id: word }, JdwpValue::null()]
    );
}

#[tokio::test]
async fn stack_frames_require_suspension() {
    let mut vm = MockVm::new();
    let app = vm.define(ClassSpec::class("com.example.App").method_with_variables(
        "run",
        "(I)V",
        MODIFIER_PUBLIC,
        vec![
            VariableInfo {
                code_index: 0,
                name: "count".to_string(),
                signature: "I".to_string(),
                length: 20,
                slot: 1,
            },
            VariableInfo {
                code_index: 4,
                name: "self".to_string(),
                signature: "Lcom/example/App;".to_string(),
                length: 16,
                slot: 2,
            },
        ],
    ));
    let run = vm.method_id(app, "run", "(I)V").unwrap();
    let receiver = vm.new_object(app);
    let thread = vm.main_thread();
    vm.push_frame(
        thread,
        Location {
            type_tag: TYPE_TAG_CLASS,
            class_id: app,
            method_id: run,
            index: 6,
        },
        receiver,
        vec![(1, JdwpValue::Int(42)), (2, JdwpValue::object(receiver))],
    )
    .unwrap();
    let server = MockJdwpServer::spawn_with_vm(vm).await.unwrap();
    let client = JdwpClient::connect(server.addr()).await.unwrap();

    let threads = client.all_threads().await.unwrap();
    assert_eq!(threads, vec![thread]);
    assert_eq!(client.thread_name(thread).await.unwrap(), "main");

    let err = client.frames(thread, 0, -1).await.unwrap_err();
    assert!(
        matches!(err, JdwpError::VmError(ERROR_THREAD_NOT_SUSPENDED)),
        "{err:?}"
    );

    client.vm_suspend().await.unwrap();
    let frames = client.frames(thread, 0, -1).await.unwrap();
    assert_eq!(frames.len(), 1);
    let frame = frames[0];
    assert_eq!(frame.location.method_id, run);

    let (_argc, vars) = client.method_variable_table(app, run).await.unwrap();
    let live: Vec<_> = vars
        .iter()
        .filter(|v| v.is_live_at(frame.location.index))
        .map(|v| (v.slot, v.signature.clone()))
        .collect();
    assert_eq!(live.len(), 2);
    let values = client
        .stack_frame_get_values(thread, frame.frame_id, &live)
        .await
        .unwrap();
    assert_eq!(values[0], JdwpValue::Int(42));
    assert_eq!(values[1].object_id(), Some(receiver));
    assert_eq!(
        client
            .stack_frame_this_object(thread, frame.frame_id)
            .await
            .unwrap(),
        receiver
    );

    client.vm_resume().await.unwrap();
    assert_eq!(server.vm_suspend_calls(), 1);
    assert_eq!(server.vm_resume_calls(), 1);
}

#[tokio::test]
async fn visible_classes_include_parent_loaders() {
    let mut vm = MockVm::new();
    let sys = vm.system_loader();
    let loader_class = vm.class_id("java.lang.ClassLoader", 0).unwrap();
    let plugin_loader_class = vm.define(
        ClassSpec::class("com.example.PluginLoader")
            .loader(sys)
            .extends(loader_class),
    );
    let plugin_loader = vm.new_loader(plugin_loader_class, sys);
    let plugin = vm.define(ClassSpec::class("com.example.Plugin").loader(plugin_loader));
    let server = MockJdwpServer::spawn_with_vm(vm).await.unwrap();
    let client = JdwpClient::connect(server.addr()).await.unwrap();

    let visible: Vec<_> = client
        .class_loader_visible_classes(plugin_loader)
        .await
        .unwrap()
        .into_iter()
        .map(|(_, id)| id)
        .collect();
    assert!(visible.contains(&plugin));
    assert!(visible.contains(&plugin_loader_class));

    let from_system: Vec<_> = client
        .class_loader_visible_classes(sys)
        .await
        .unwrap()
        .into_iter()
        .map(|(_, id)| id)
        .collect();
    assert!(!from_system.contains(&plugin));
}

#[tokio::test]
async fn negotiated_id_sizes_are_used_for_every_reply() {
    let sizes = JdwpIdSizes {
        object_id: 4,
        reference_type_id: 4,
        field_id: 4,
        ..JdwpIdSizes::default()
    };
    let mut vm = MockVm::new().with_id_sizes(sizes);
    let node = vm.define(ClassSpec::class("com.example.Node").field("next", "Lcom/example/Node;", 0));
    let a = vm.new_object(node);
    let b = vm.new_object(node);
    vm.set_field(a, "next", JdwpValue::object(b));
    let server = MockJdwpServer::spawn_with_vm(vm).await.unwrap();
    let client = JdwpClient::connect(server.addr()).await.unwrap();

    assert_eq!(client.idsizes().await.unwrap(), sizes);
    let field = client.reference_type_fields(node).await.unwrap()[0].field_id;
    let values = client.object_reference_get_values(a, &[field]).await.unwrap();
    assert_eq!(values[0].object_id(), Some(b));
}

#[tokio::test]
async fn replies_are_matched_out_of_order() {
    let mut vm = MockVm::new();
    let slow = vm.define(ClassSpec::class("com.example.Slow"));
    let server = MockJdwpServer::spawn_with_config(
        vm,
        MockJdwpServerConfig {
            delayed_replies: vec![DelayedReply {
                command_set: 2,
                command: 1,
                delay: Duration::from_millis(300),
            }],
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let client = JdwpClient::connect(server.addr()).await.unwrap();

    let slow_client = client.clone();
    let slow_request =
        tokio::spawn(async move { slow_client.reference_type_signature(slow).await });

    // The delayed reply must not block requests issued after it.
    let threads = tokio::time::timeout(Duration::from_millis(200), client.all_threads())
        .await
        .expect("fast request should not wait behind the delayed one")
        .unwrap();
    assert_eq!(threads.len(), 1);

    let signature = slow_request.await.unwrap().unwrap();
    assert_eq!(signature, "Lcom/example/Slow;");
}

#[tokio::test]
async fn reply_timeout_is_reported() {
    let server = MockJdwpServer::spawn_with_config(
        MockVm::new(),
        MockJdwpServerConfig {
            delayed_replies: vec![DelayedReply {
                command_set: 1,
                command: 4,
                delay: Duration::from_secs(5),
            }],
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let client = JdwpClient::connect_with_config(
        server.addr(),
        JdwpClientConfig {
            reply_timeout: Duration::from_millis(100),
            ..JdwpClientConfig::default()
        },
    )
    .await
    .unwrap();

    let err = client.all_threads().await.unwrap_err();
    assert!(matches!(err, JdwpError::Timeout), "{err:?}");
}

#[tokio::test]
async fn connection_loss_fails_pending_and_later_requests() {
    let server = MockJdwpServer::spawn_with_config(
        MockVm::new(),
        MockJdwpServerConfig {
            close_on_command: Some((1, 4)),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let client = JdwpClient::connect(server.addr()).await.unwrap();

    let err = client.all_threads().await.unwrap_err();
    assert!(matches!(err, JdwpError::ConnectionClosed), "{err:?}");
    assert!(err.is_fatal());

    tokio::time::timeout(Duration::from_secs(2), client.shutdown_token().cancelled())
        .await
        .expect("client should notice the closed connection");
    assert!(client.is_closed());

    let err = client.all_classes().await.unwrap_err();
    assert!(matches!(err, JdwpError::ConnectionClosed), "{err:?}");
}
