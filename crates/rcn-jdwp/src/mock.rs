use std::{
    collections::{BTreeMap, HashMap},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpListener},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{
        binary_name_to_signature, encode_command, encode_reply, JdwpReader, JdwpWriter,
        PacketHeader, EVENT_COMMAND, HANDSHAKE, HEADER_LEN,
    },
    types::{
        FieldId, FrameId, JdwpIdSizes, JdwpValue, Location, MethodId, ObjectId, ReferenceTypeId,
        ThreadId, VariableInfo, CLASS_STATUS_INITIALIZED, CLASS_STATUS_PREPARED,
        CLASS_STATUS_VERIFIED, ERROR_ABSENT_INFORMATION, ERROR_CLASS_NOT_PREPARED, ERROR_INVALID_CLASS, ERROR_INVALID_OBJECT,
        ERROR_NOT_IMPLEMENTED, ERROR_THREAD_NOT_SUSPENDED, EVENT_KIND_CLASS_PREPARE,
        EVENT_KIND_CLASS_UNLOAD, MODIFIER_ABSTRACT, MODIFIER_FINAL, MODIFIER_INTERFACE,
        MODIFIER_PRIVATE, MODIFIER_PUBLIC, MODIFIER_STATIC, SUSPEND_POLICY_NONE, TYPE_TAG_ARRAY,
        TYPE_TAG_CLASS, TYPE_TAG_INTERFACE,
    },
};

const ERROR_INVALID_THREAD: u16 = 10;
const ERROR_INVALID_FRAMEID: u16 = 30;
const ERROR_INVALID_FIELDID: u16 = 25;
const ERROR_INVALID_METHODID: u16 = 23;
const ERROR_INVALID_SLOT: u16 = 35;
const ERROR_INVALID_INDEX: u16 = 503;
const ERROR_ILLEGAL_ARGUMENT: u16 = 103;

const STATUS_READY: u32 = CLASS_STATUS_VERIFIED | CLASS_STATUS_PREPARED | CLASS_STATUS_INITIALIZED;

/// A type to define in a [`MockVm`].
#[derive(Debug, Clone)]
pub struct ClassSpec {
    pub name: String,
    pub tag: u8,
    /// Defining loader; `0` is the bootstrap loader.
    pub loader: ObjectId,
    pub modifiers: u32,
    pub status: u32,
    pub superclass: Option<ReferenceTypeId>,
    pub interfaces: Vec<ReferenceTypeId>,
    /// Registers this type in the outer type's `NestedTypes` reply.
    pub enclosing: Option<ReferenceTypeId>,
    pub fields: Vec<FieldSpec>,
    pub methods: Vec<MethodSpec>,
    /// Reported by `ReferenceType.SourceFile`; absent when `None`.
    pub source_file: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub signature: String,
    pub modifiers: u32,
    pub static_value: Option<JdwpValue>,
}

#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub name: String,
    pub signature: String,
    pub modifiers: u32,
    pub variables: Vec<VariableInfo>,
    /// `(code_index, line)` pairs; an empty table is reported as absent.
    pub lines: Vec<(u64, i32)>,
}

impl ClassSpec {
    fn new(name: &str, tag: u8, modifiers: u32) -> Self {
        Self {
            name: name.to_string(),
            tag,
            loader: 0,
            modifiers,
            status: STATUS_READY,
            superclass: None,
            interfaces: Vec::new(),
            enclosing: None,
            fields: Vec::new(),
            methods: Vec::new(),
            source_file: None,
        }
    }

    /// A public class; its superclass defaults to `java.lang.Object`.
    pub fn class(name: &str) -> Self {
        Self::new(name, TYPE_TAG_CLASS, MODIFIER_PUBLIC)
    }

    pub fn interface(name: &str) -> Self {
        Self::new(
            name,
            TYPE_TAG_INTERFACE,
            MODIFIER_PUBLIC | MODIFIER_INTERFACE | MODIFIER_ABSTRACT,
        )
    }

    /// An array type such as `int[]` or `com.example.Foo[]`.
    pub fn array(name: &str) -> Self {
        Self::new(
            name,
            TYPE_TAG_ARRAY,
            MODIFIER_PUBLIC | MODIFIER_FINAL | MODIFIER_ABSTRACT,
        )
    }

    pub fn loader(mut self, loader: ObjectId) -> Self {
        self.loader = loader;
        self
    }

    pub fn modifiers(mut self, modifiers: u32) -> Self {
        self.modifiers = modifiers;
        self
    }

    pub fn status(mut self, status: u32) -> Self {
        self.status = status;
        self
    }

    pub fn extends(mut self, superclass: ReferenceTypeId) -> Self {
        self.superclass = Some(superclass);
        self
    }

    pub fn implements(mut self, interface: ReferenceTypeId) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn source_file(mut self, name: &str) -> Self {
        self.source_file = Some(name.to_string());
        self
    }

    pub fn enclosed_by(mut self, outer: ReferenceTypeId) -> Self {
        self.enclosing = Some(outer);
        self
    }

    pub fn field(mut self, name: &str, signature: &str, modifiers: u32) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            signature: signature.to_string(),
            modifiers,
            static_value: None,
        });
        self
    }

    pub fn static_field(
        mut self,
        name: &str,
        signature: &str,
        modifiers: u32,
        value: JdwpValue,
    ) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            signature: signature.to_string(),
            modifiers: modifiers | MODIFIER_STATIC,
            static_value: Some(value),
        });
        self
    }

    pub fn method(self, name: &str, signature: &str, modifiers: u32) -> Self {
        self.method_with_variables(name, signature, modifiers, Vec::new())
    }

    pub fn method_with_variables(
        mut self,
        name: &str,
        signature: &str,
        modifiers: u32,
        variables: Vec<VariableInfo>,
    ) -> Self {
        self.methods.push(MethodSpec {
            name: name.to_string(),
            signature: signature.to_string(),
            modifiers,
            variables,
            lines: Vec::new(),
        });
        self
    }

    /// Sets the line table of the most recently added method.
    pub fn at_lines(mut self, lines: Vec<(u64, i32)>) -> Self {
        if let Some(method) = self.methods.last_mut() {
            method.lines = lines;
        }
        self
    }
}

#[derive(Debug, Clone)]
struct MockClass {
    id: ReferenceTypeId,
    tag: u8,
    name: String,
    signature: String,
    loader: ObjectId,
    modifiers: u32,
    status: u32,
    superclass: ReferenceTypeId,
    interfaces: Vec<ReferenceTypeId>,
    nested: Vec<ReferenceTypeId>,
    fields: Vec<MockField>,
    methods: Vec<MockMethod>,
    source_file: Option<String>,
    unloaded: bool,
}

impl MockClass {
    fn is_prepared(&self) -> bool {
        self.status & CLASS_STATUS_PREPARED != 0
    }
}

#[derive(Debug, Clone)]
struct MockField {
    id: FieldId,
    name: String,
    signature: String,
    modifiers: u32,
    static_value: Option<JdwpValue>,
}

#[derive(Debug, Clone)]
struct MockMethod {
    id: MethodId,
    name: String,
    signature: String,
    modifiers: u32,
    variables: Vec<VariableInfo>,
    lines: Vec<(u64, i32)>,
}

#[derive(Debug, Clone)]
struct MockObject {
    class: ReferenceTypeId,
    fields: HashMap<FieldId, JdwpValue>,
    string: Option<String>,
    element_tag: u8,
    elements: Vec<JdwpValue>,
    collected: bool,
}

#[derive(Debug, Clone)]
struct MockFrame {
    id: FrameId,
    location: Location,
    this_object: ObjectId,
    slots: HashMap<u32, JdwpValue>,
}

#[derive(Debug, Clone)]
struct MockThread {
    id: ThreadId,
    name: String,
    frames: Vec<MockFrame>,
}

/// An in-memory model of a JVM heap served by [`MockJdwpServer`].
///
/// A fresh VM already contains the bootstrap types a debugger relies on
/// (`java.lang.Object`, `String`, `ClassLoader`, `Cloneable`, `Serializable`),
/// an application class loader reachable through `ClassLoader.scl`, and a
/// `main` thread without frames.
#[derive(Debug, Clone)]
pub struct MockVm {
    id_sizes: JdwpIdSizes,
    classes: BTreeMap<ReferenceTypeId, MockClass>,
    objects: BTreeMap<ObjectId, MockObject>,
    field_owners: HashMap<FieldId, ReferenceTypeId>,
    loader_parents: HashMap<ObjectId, ObjectId>,
    threads: Vec<MockThread>,
    event_requests: Vec<(u8, i32)>,
    next_id: u64,
    next_request_id: i32,
    suspend_count: u32,
    object_class: ReferenceTypeId,
    string_class: ReferenceTypeId,
    system_loader: ObjectId,
}

impl Default for MockVm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVm {
    pub fn new() -> Self {
        let mut vm = Self {
            id_sizes: JdwpIdSizes::default(),
            classes: BTreeMap::new(),
            objects: BTreeMap::new(),
            field_owners: HashMap::new(),
            loader_parents: HashMap::new(),
            threads: Vec::new(),
            event_requests: Vec::new(),
            next_id: 0x1000,
            next_request_id: 1,
            suspend_count: 0,
            object_class: 0,
            string_class: 0,
            system_loader: 0,
        };

        vm.object_class = vm.define(ClassSpec::class("java.lang.Object").method("<init>", "()V", MODIFIER_PUBLIC));
        let serializable = vm.define(ClassSpec::interface("java.io.Serializable"));
        vm.define(ClassSpec::interface("java.lang.Cloneable"));
        vm.string_class = vm.define(
            ClassSpec::class("java.lang.String")
                .modifiers(MODIFIER_PUBLIC | MODIFIER_FINAL)
                .implements(serializable)
                .field("value", "[B", MODIFIER_PRIVATE | MODIFIER_FINAL),
        );
        let class_loader = vm.define(
            ClassSpec::class("java.lang.ClassLoader")
                .modifiers(MODIFIER_PUBLIC | MODIFIER_ABSTRACT)
                .field("parent", "Ljava/lang/ClassLoader;", MODIFIER_PRIVATE | MODIFIER_FINAL)
                .static_field(
                    "scl",
                    "Ljava/lang/ClassLoader;",
                    MODIFIER_PRIVATE,
                    JdwpValue::null(),
                ),
        );
        let app_loader = vm.define(
            ClassSpec::class("jdk.internal.loader.ClassLoaders$AppClassLoader")
                .modifiers(MODIFIER_STATIC)
                .extends(class_loader),
        );
        vm.system_loader = vm.new_loader(app_loader, 0);
        let system_loader = vm.system_loader;
        vm.set_static(class_loader, "scl", JdwpValue::object(system_loader));

        let main = vm.alloc_id();
        vm.threads.push(MockThread {
            id: main,
            name: "main".to_string(),
            frames: Vec::new(),
        });
        vm
    }

    pub fn with_id_sizes(mut self, sizes: JdwpIdSizes) -> Self {
        self.id_sizes = sizes;
        self
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// The application class loader (`ClassLoader.scl`).
    pub fn system_loader(&self) -> ObjectId {
        self.system_loader
    }

    pub fn object_class(&self) -> ReferenceTypeId {
        self.object_class
    }

    pub fn main_thread(&self) -> ThreadId {
        self.threads.first().map(|t| t.id).unwrap_or_default()
    }

    pub fn suspend_count(&self) -> u32 {
        self.suspend_count
    }

    /// Defines a type and returns its reference type id.
    pub fn define(&mut self, spec: ClassSpec) -> ReferenceTypeId {
        let id = self.alloc_id();
        let superclass = match (spec.tag, spec.superclass) {
            (_, Some(superclass)) => superclass,
            (TYPE_TAG_CLASS | TYPE_TAG_ARRAY, None) => self.object_class,
            _ => 0,
        };
        let fields = spec
            .fields
            .into_iter()
            .map(|f| MockField {
                id: self.alloc_id(),
                name: f.name,
                signature: f.signature,
                modifiers: f.modifiers,
                static_value: f.static_value,
            })
            .collect::<Vec<_>>();
        let methods = spec
            .methods
            .into_iter()
            .map(|m| MockMethod {
                id: self.alloc_id(),
                name: m.name,
                signature: m.signature,
                modifiers: m.modifiers,
                variables: m.variables,
                lines: m.lines,
            })
            .collect();
        for field in &fields {
            self.field_owners.insert(field.id, id);
        }
        if let Some(outer) = spec.enclosing.and_then(|outer| self.classes.get_mut(&outer)) {
            outer.nested.push(id);
        }
        self.classes.insert(
            id,
            MockClass {
                id,
                tag: spec.tag,
                signature: binary_name_to_signature(&spec.name),
                name: spec.name,
                loader: spec.loader,
                modifiers: spec.modifiers,
                status: spec.status,
                superclass,
                interfaces: spec.interfaces,
                nested: Vec::new(),
                fields,
                methods,
                source_file: spec.source_file,
                unloaded: false,
            },
        );
        id
    }

    /// Finds a loaded type by binary name and defining loader.
    pub fn class_id(&self, name: &str, loader: ObjectId) -> Option<ReferenceTypeId> {
        self.classes
            .values()
            .find(|c| !c.unloaded && c.name == name && c.loader == loader)
            .map(|c| c.id)
    }

    pub fn set_status(&mut self, class: ReferenceTypeId, status: u32) {
        if let Some(class) = self.classes.get_mut(&class) {
            class.status = status;
        }
    }

    pub fn unload(&mut self, class: ReferenceTypeId) -> Option<String> {
        let class = self.classes.get_mut(&class)?;
        class.unloaded = true;
        Some(class.signature.clone())
    }

    fn superclass_chain(&self, class: ReferenceTypeId) -> Vec<ReferenceTypeId> {
        let mut chain = Vec::new();
        let mut current = class;
        while current != 0 && !chain.contains(&current) {
            chain.push(current);
            current = self.classes.get(&current).map(|c| c.superclass).unwrap_or(0);
        }
        chain
    }

    fn find_field(&self, class: ReferenceTypeId, name: &str) -> Option<&MockField> {
        self.superclass_chain(class).into_iter().find_map(|id| {
            self.classes
                .get(&id)
                .and_then(|c| c.fields.iter().find(|f| f.name == name))
        })
    }

    fn field_by_id(&self, field_id: FieldId) -> Option<&MockField> {
        let owner = self.field_owners.get(&field_id)?;
        self.classes
            .get(owner)?
            .fields
            .iter()
            .find(|f| f.id == field_id)
    }

    /// Looks a field up by name on `class` or one of its superclasses.
    pub fn field_id(&self, class: ReferenceTypeId, name: &str) -> Option<FieldId> {
        self.find_field(class, name).map(|f| f.id)
    }

    pub fn method_id(&self, class: ReferenceTypeId, name: &str, signature: &str) -> Option<MethodId> {
        self.classes.get(&class).and_then(|c| {
            c.methods
                .iter()
                .find(|m| m.name == name && m.signature == signature)
                .map(|m| m.id)
        })
    }

    pub fn set_static(&mut self, class: ReferenceTypeId, name: &str, value: JdwpValue) -> bool {
        let Some(class) = self.classes.get_mut(&class) else {
            return false;
        };
        match class.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => {
                field.static_value = Some(value);
                true
            }
            None => false,
        }
    }

    fn insert_object(&mut self, class: ReferenceTypeId) -> ObjectId {
        let id = self.alloc_id();
        self.objects.insert(
            id,
            MockObject {
                class,
                fields: HashMap::new(),
                string: None,
                element_tag: b'L',
                elements: Vec::new(),
                collected: false,
            },
        );
        id
    }

    pub fn new_object(&mut self, class: ReferenceTypeId) -> ObjectId {
        self.insert_object(class)
    }

    pub fn new_string(&mut self, value: &str) -> ObjectId {
        let id = self.insert_object(self.string_class);
        if let Some(object) = self.objects.get_mut(&id) {
            object.string = Some(value.to_string());
        }
        id
    }

    /// Allocates an array of the given array type. `element_tag` is the
    /// signature tag of the component type (`I`, `L`, ...).
    pub fn new_array(
        &mut self,
        class: ReferenceTypeId,
        element_tag: u8,
        elements: Vec<JdwpValue>,
    ) -> ObjectId {
        let id = self.insert_object(class);
        if let Some(object) = self.objects.get_mut(&id) {
            object.element_tag = element_tag;
            object.elements = elements;
        }
        id
    }

    /// Allocates a class loader instance delegating to `parent` (`0` for bootstrap).
    pub fn new_loader(&mut self, class: ReferenceTypeId, parent: ObjectId) -> ObjectId {
        let id = self.insert_object(class);
        self.loader_parents.insert(id, parent);
        if parent != 0 {
            self.set_field(id, "parent", JdwpValue::object(parent));
        }
        id
    }

    /// Sets an instance field by name, searching the object's class hierarchy.
    pub fn set_field(&mut self, object: ObjectId, name: &str, value: JdwpValue) -> bool {
        let Some(class) = self.objects.get(&object).map(|o| o.class) else {
            return false;
        };
        let Some(field_id) = self.field_id(class, name) else {
            return false;
        };
        match self.objects.get_mut(&object) {
            Some(object) => {
                object.fields.insert(field_id, value);
                true
            }
            None => false,
        }
    }

    /// Marks an object as garbage collected.
    pub fn collect(&mut self, object: ObjectId) {
        if let Some(object) = self.objects.get_mut(&object) {
            object.collected = true;
        }
    }

    pub fn push_frame(
        &mut self,
        thread: ThreadId,
        location: Location,
        this_object: ObjectId,
        slots: Vec<(u32, JdwpValue)>,
    ) -> Option<FrameId> {
        let id = self.alloc_id();
        let thread = self.threads.iter_mut().find(|t| t.id == thread)?;
        // Frame 0 is the innermost frame.
        thread.frames.insert(
            0,
            MockFrame {
                id,
                location,
                this_object,
                slots: slots.into_iter().collect(),
            },
        );
        Some(id)
    }

    fn live_object(&self, id: ObjectId) -> Result<&MockObject, u16> {
        match self.objects.get(&id) {
            Some(object) if !object.collected => Ok(object),
            _ => Err(ERROR_INVALID_OBJECT),
        }
    }

    fn live_class(&self, id: ReferenceTypeId) -> Result<&MockClass, u16> {
        match self.classes.get(&id) {
            Some(class) if !class.unloaded => Ok(class),
            _ => Err(ERROR_INVALID_CLASS),
        }
    }

    fn prepared_class(&self, id: ReferenceTypeId) -> Result<&MockClass, u16> {
        let class = self.live_class(id)?;
        if class.is_prepared() {
            Ok(class)
        } else {
            Err(ERROR_CLASS_NOT_PREPARED)
        }
    }

    /// The runtime tag the VM would attach to a reference to `id`.
    fn object_tag(&self, id: ObjectId) -> u8 {
        let Some(object) = self.objects.get(&id) else {
            return b'L';
        };
        if object.class == self.string_class {
            return b's';
        }
        if self.loader_parents.contains_key(&id) {
            return b'l';
        }
        if self.threads.iter().any(|t| t.id == id) {
            return b't';
        }
        match self.classes.get(&object.class) {
            Some(class) if class.tag == TYPE_TAG_ARRAY => b'[',
            _ => b'L',
        }
    }

    fn retag(&self, value: &JdwpValue) -> JdwpValue {
        match *value {
            JdwpValue::Object { id, .. } if id != 0 => JdwpValue::Object {
                tag: self.object_tag(id),
                id,
            },
            ref other => other.clone(),
        }
    }

    fn loader_chain(&self, loader: ObjectId) -> Vec<ObjectId> {
        let mut chain = vec![loader];
        let mut current = loader;
        while current != 0 {
            current = self.loader_parents.get(&current).copied().unwrap_or(0);
            if chain.contains(&current) {
                break;
            }
            chain.push(current);
        }
        chain
    }

    fn register_event_request(&mut self, kind: u8) -> i32 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        self.event_requests.push((kind, id));
        id
    }

    fn event_request(&self, kind: u8) -> Option<i32> {
        self.event_requests
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, id)| *id)
    }

    fn class_prepare_event(&self, class: ReferenceTypeId) -> Option<Vec<u8>> {
        let request_id = self.event_request(EVENT_KIND_CLASS_PREPARE)?;
        let class = self.classes.get(&class)?;
        let sizes = &self.id_sizes;
        let mut w = JdwpWriter::new();
        w.write_u8(SUSPEND_POLICY_NONE);
        w.write_u32(1);
        w.write_u8(EVENT_KIND_CLASS_PREPARE);
        w.write_i32(request_id);
        w.write_object_id(self.main_thread(), sizes);
        w.write_u8(class.tag);
        w.write_reference_type_id(class.id, sizes);
        w.write_string(&class.signature);
        w.write_u32(class.status);
        Some(w.into_vec())
    }

    fn class_unload_event(&self, signature: &str) -> Option<Vec<u8>> {
        let request_id = self.event_request(EVENT_KIND_CLASS_UNLOAD)?;
        let mut w = JdwpWriter::new();
        w.write_u8(SUSPEND_POLICY_NONE);
        w.write_u32(1);
        w.write_u8(EVENT_KIND_CLASS_UNLOAD);
        w.write_i32(request_id);
        w.write_string(signature);
        Some(w.into_vec())
    }

    /// Executes one command and returns the reply payload or a JDWP error code.
    fn handle_command(&mut self, command_set: u8, command: u8, payload: &[u8]) -> Result<Vec<u8>, u16> {
        let sizes = self.id_sizes;
        let mut r = Args {
            reader: JdwpReader::new(payload),
            sizes,
        };
        let mut w = JdwpWriter::new();

        match (command_set, command) {
            // VirtualMachine.ClassesBySignature
            (1, 2) => {
                let signature = r.string()?;
                let matches = self
                    .classes
                    .values()
                    .filter(|c| !c.unloaded && c.signature == signature)
                    .collect::<Vec<_>>();
                w.write_u32(matches.len() as u32);
                for class in matches {
                    w.write_u8(class.tag);
                    w.write_reference_type_id(class.id, &sizes);
                    w.write_u32(class.status);
                }
            }
            // VirtualMachine.AllClasses
            (1, 3) => {
                let live = self.classes.values().filter(|c| !c.unloaded).collect::<Vec<_>>();
                w.write_u32(live.len() as u32);
                for class in live {
                    w.write_u8(class.tag);
                    w.write_reference_type_id(class.id, &sizes);
                    w.write_string(&class.signature);
                    w.write_u32(class.status);
                }
            }
            // VirtualMachine.AllThreads
            (1, 4) => {
                w.write_u32(self.threads.len() as u32);
                for thread in &self.threads {
                    w.write_object_id(thread.id, &sizes);
                }
            }
            // VirtualMachine.IDSizes
            (1, 7) => {
                w.write_u32(sizes.field_id as u32);
                w.write_u32(sizes.method_id as u32);
                w.write_u32(sizes.object_id as u32);
                w.write_u32(sizes.reference_type_id as u32);
                w.write_u32(sizes.frame_id as u32);
            }
            // VirtualMachine.Suspend
            (1, 8) => self.suspend_count += 1,
            // VirtualMachine.Resume
            (1, 9) => self.suspend_count = self.suspend_count.saturating_sub(1),
            // VirtualMachine.CapabilitiesNew
            (1, 17) => {
                for _ in 0..32 {
                    w.write_bool(false);
                }
            }
            // ReferenceType.Signature
            (2, 1) => {
                let class = self.live_class(r.type_id()?)?;
                w.write_string(&class.signature);
            }
            // ReferenceType.ClassLoader
            (2, 2) => {
                let class = self.live_class(r.type_id()?)?;
                w.write_object_id(class.loader, &sizes);
            }
            // ReferenceType.Modifiers
            (2, 3) => {
                let class = self.live_class(r.type_id()?)?;
                w.write_u32(class.modifiers);
            }
            // ReferenceType.Fields
            (2, 4) => {
                let class = self.prepared_class(r.type_id()?)?;
                w.write_u32(class.fields.len() as u32);
                for field in &class.fields {
                    w.write_id(field.id, sizes.field_id);
                    w.write_string(&field.name);
                    w.write_string(&field.signature);
                    w.write_u32(field.modifiers);
                }
            }
            // ReferenceType.Methods
            (2, 5) => {
                let class = self.prepared_class(r.type_id()?)?;
                w.write_u32(class.methods.len() as u32);
                for method in &class.methods {
                    w.write_id(method.id, sizes.method_id);
                    w.write_string(&method.name);
                    w.write_string(&method.signature);
                    w.write_u32(method.modifiers);
                }
            }
            // ReferenceType.GetValues
            (2, 6) => {
                let class = self.prepared_class(r.type_id()?)?;
                let chain = self.superclass_chain(class.id);
                let count = r.u32()?;
                w.write_u32(count);
                for _ in 0..count {
                    let field_id = r.field_id()?;
                    let owner = self.field_owners.get(&field_id).copied();
                    let field = self
                        .field_by_id(field_id)
                        .filter(|f| f.modifiers & MODIFIER_STATIC != 0)
                        .filter(|_| owner.is_some_and(|o| chain.contains(&o)))
                        .ok_or(ERROR_INVALID_FIELDID)?;
                    let value = field
                        .static_value
                        .clone()
                        .unwrap_or_else(|| default_value(&field.signature));
                    w.write_tagged_value(&self.retag(&value), &sizes);
                }
            }
            // ReferenceType.SourceFile
            (2, 7) => {
                let class = self.prepared_class(r.type_id()?)?;
                let source_file = class.source_file.as_deref().ok_or(ERROR_ABSENT_INFORMATION)?;
                w.write_string(source_file);
            }
            // ReferenceType.NestedTypes
            (2, 8) => {
                let class = self.live_class(r.type_id()?)?;
                let nested = class
                    .nested
                    .iter()
                    .filter_map(|id| self.classes.get(id))
                    .filter(|c| !c.unloaded)
                    .collect::<Vec<_>>();
                w.write_u32(nested.len() as u32);
                for class in nested {
                    w.write_u8(class.tag);
                    w.write_reference_type_id(class.id, &sizes);
                }
            }
            // ReferenceType.Status
            (2, 9) => {
                let class = self.live_class(r.type_id()?)?;
                w.write_u32(class.status);
            }
            // ReferenceType.Interfaces
            (2, 10) => {
                let class = self.prepared_class(r.type_id()?)?;
                w.write_u32(class.interfaces.len() as u32);
                for interface in &class.interfaces {
                    w.write_reference_type_id(*interface, &sizes);
                }
            }
            // ClassType.Superclass
            (3, 1) => {
                let class = self.live_class(r.type_id()?)?;
                if class.tag != TYPE_TAG_CLASS {
                    return Err(ERROR_INVALID_CLASS);
                }
                w.write_reference_type_id(class.superclass, &sizes);
            }
            // Method.LineTable
            (6, 1) => {
                let class = self.prepared_class(r.type_id()?)?;
                let method_id = r.method_id()?;
                let method = class
                    .methods
                    .iter()
                    .find(|m| m.id == method_id)
                    .ok_or(ERROR_INVALID_METHODID)?;
                let indices = method.lines.iter().map(|(index, _)| *index);
                let (Some(start), Some(end)) = (indices.clone().min(), indices.max()) else {
                    return Err(ERROR_ABSENT_INFORMATION);
                };
                w.write_u64(start);
                w.write_u64(end);
                w.write_u32(method.lines.len() as u32);
                for (index, line) in &method.lines {
                    w.write_u64(*index);
                    w.write_i32(*line);
                }
            }
            // Method.VariableTable
            (6, 2) => {
                let class = self.prepared_class(r.type_id()?)?;
                let method_id = r.method_id()?;
                let method = class
                    .methods
                    .iter()
                    .find(|m| m.id == method_id)
                    .ok_or(ERROR_INVALID_METHODID)?;
                let arg_count = method
                    .variables
                    .iter()
                    .filter(|v| v.code_index == 0)
                    .count();
                w.write_u32(arg_count as u32);
                w.write_u32(method.variables.len() as u32);
                for var in &method.variables {
                    w.write_u64(var.code_index);
                    w.write_string(&var.name);
                    w.write_string(&var.signature);
                    w.write_u32(var.length);
                    w.write_u32(var.slot);
                }
            }
            // ObjectReference.ReferenceType
            (9, 1) => {
                let object = self.live_object(r.object_id()?)?;
                let class = self.live_class(object.class)?;
                w.write_u8(class.tag);
                w.write_reference_type_id(class.id, &sizes);
            }
            // ObjectReference.GetValues
            (9, 2) => {
                let object = self.live_object(r.object_id()?)?;
                let chain = self.superclass_chain(object.class);
                let count = r.u32()?;
                w.write_u32(count);
                for _ in 0..count {
                    let field_id = r.field_id()?;
                    let owner = self
                        .field_owners
                        .get(&field_id)
                        .filter(|owner| chain.contains(owner))
                        .ok_or(ERROR_INVALID_FIELDID)?;
                    let field = self
                        .classes
                        .get(owner)
                        .and_then(|c| c.fields.iter().find(|f| f.id == field_id))
                        .ok_or(ERROR_INVALID_FIELDID)?;
                    let value = object
                        .fields
                        .get(&field_id)
                        .cloned()
                        .unwrap_or_else(|| default_value(&field.signature));
                    w.write_tagged_value(&self.retag(&value), &sizes);
                }
            }
            // ObjectReference.IsCollected
            (9, 9) => {
                let id = r.object_id()?;
                let object = self.objects.get(&id).ok_or(ERROR_INVALID_OBJECT)?;
                w.write_bool(object.collected);
            }
            // StringReference.Value
            (10, 1) => {
                let object = self.live_object(r.object_id()?)?;
                let value = object.string.as_deref().ok_or(ERROR_INVALID_OBJECT)?;
                w.write_string(value);
            }
            // ThreadReference.Name
            (11, 1) => {
                let id = r.object_id()?;
                let thread = self
                    .threads
                    .iter()
                    .find(|t| t.id == id)
                    .ok_or(ERROR_INVALID_THREAD)?;
                w.write_string(&thread.name);
            }
            // ThreadReference.Frames
            (11, 6) => {
                let id = r.object_id()?;
                let start = r.i32()?.max(0) as usize;
                let length = r.i32()?;
                let thread = self
                    .threads
                    .iter()
                    .find(|t| t.id == id)
                    .ok_or(ERROR_INVALID_THREAD)?;
                if self.suspend_count == 0 {
                    return Err(ERROR_THREAD_NOT_SUSPENDED);
                }
                let available = thread.frames.len().saturating_sub(start);
                let take = if length < 0 {
                    available
                } else {
                    (length as usize).min(available)
                };
                w.write_u32(take as u32);
                for frame in thread.frames.iter().skip(start).take(take) {
                    w.write_id(frame.id, sizes.frame_id);
                    w.write_location(&frame.location, &sizes);
                }
            }
            // ArrayReference.Length
            (13, 1) => {
                let object = self.live_object(r.object_id()?)?;
                w.write_i32(object.elements.len() as i32);
            }
            // ArrayReference.GetValues
            (13, 2) => {
                let object = self.live_object(r.object_id()?)?;
                let first = r.i32()?;
                let length = r.i32()?;
                if first < 0 || length < 0 {
                    return Err(ERROR_INVALID_INDEX);
                }
                let (first, length) = (first as usize, length as usize);
                if first + length > object.elements.len() {
                    return Err(ERROR_INVALID_INDEX);
                }
                let primitive = !matches!(object.element_tag, b'L' | b'[');
                w.write_u8(object.element_tag);
                w.write_u32(length as u32);
                for value in &object.elements[first..first + length] {
                    if primitive {
                        w.write_value(value, &sizes);
                    } else {
                        w.write_tagged_value(&self.retag(value), &sizes);
                    }
                }
            }
            // ClassLoaderReference.VisibleClasses
            (14, 1) => {
                let loader = r.object_id()?;
                self.live_object(loader)?;
                let chain = self.loader_chain(loader);
                let visible = self
                    .classes
                    .values()
                    .filter(|c| !c.unloaded && chain.contains(&c.loader))
                    .collect::<Vec<_>>();
                w.write_u32(visible.len() as u32);
                for class in visible {
                    w.write_u8(class.tag);
                    w.write_reference_type_id(class.id, &sizes);
                }
            }
            // EventRequest.Set
            (15, 1) => {
                let kind = r.u8()?;
                let id = self.register_event_request(kind);
                w.write_i32(id);
            }
            // EventRequest.Clear
            (15, 2) => {
                let kind = r.u8()?;
                let id = r.i32()?;
                self.event_requests.retain(|(k, i)| !(*k == kind && *i == id));
            }
            // StackFrame.GetValues
            (16, 1) => {
                let frame = self.frame(r.object_id()?, r.frame_id()?)?;
                let count = r.u32()?;
                let mut values = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let slot = r.u32()?;
                    let _tag = r.u8()?;
                    values.push(frame.slots.get(&slot).cloned().ok_or(ERROR_INVALID_SLOT)?);
                }
                w.write_u32(values.len() as u32);
                for value in &values {
                    w.write_tagged_value(&self.retag(value), &sizes);
                }
            }
            // StackFrame.ThisObject
            (16, 3) => {
                let frame = self.frame(r.object_id()?, r.frame_id()?)?;
                let this = frame.this_object;
                w.write_u8(if this == 0 { b'L' } else { self.object_tag(this) });
                w.write_object_id(this, &sizes);
            }
            _ => return Err(ERROR_NOT_IMPLEMENTED),
        }

        Ok(w.into_vec())
    }

    fn frame(&self, thread: ThreadId, frame_id: FrameId) -> Result<&MockFrame, u16> {
        if self.suspend_count == 0 {
            return Err(ERROR_THREAD_NOT_SUSPENDED);
        }
        self.threads
            .iter()
            .find(|t| t.id == thread)
            .ok_or(ERROR_INVALID_THREAD)?
            .frames
            .iter()
            .find(|f| f.id == frame_id)
            .ok_or(ERROR_INVALID_FRAMEID)
    }
}

fn default_value(signature: &str) -> JdwpValue {
    match signature.as_bytes().first() {
        Some(b'Z') => JdwpValue::Boolean(false),
        Some(b'B') => JdwpValue::Byte(0),
        Some(b'C') => JdwpValue::Char(0),
        Some(b'S') => JdwpValue::Short(0),
        Some(b'I') => JdwpValue::Int(0),
        Some(b'J') => JdwpValue::Long(0),
        Some(b'F') => JdwpValue::Float(0.0),
        Some(b'D') => JdwpValue::Double(0.0),
        Some(b'[') => JdwpValue::Object { tag: b'[', id: 0 },
        _ => JdwpValue::null(),
    }
}

/// Command argument reader that reports malformed input as a JDWP error code.
struct Args<'a> {
    reader: JdwpReader<'a>,
    sizes: JdwpIdSizes,
}

impl Args<'_> {
    fn u8(&mut self) -> Result<u8, u16> {
        self.reader.read_u8().map_err(|_| ERROR_ILLEGAL_ARGUMENT)
    }

    fn u32(&mut self) -> Result<u32, u16> {
        self.reader.read_u32().map_err(|_| ERROR_ILLEGAL_ARGUMENT)
    }

    fn i32(&mut self) -> Result<i32, u16> {
        self.reader.read_i32().map_err(|_| ERROR_ILLEGAL_ARGUMENT)
    }

    fn string(&mut self) -> Result<String, u16> {
        self.reader.read_string().map_err(|_| ERROR_ILLEGAL_ARGUMENT)
    }

    fn object_id(&mut self) -> Result<ObjectId, u16> {
        self.reader
            .read_object_id(&self.sizes)
            .map_err(|_| ERROR_ILLEGAL_ARGUMENT)
    }

    fn type_id(&mut self) -> Result<ReferenceTypeId, u16> {
        self.reader
            .read_reference_type_id(&self.sizes)
            .map_err(|_| ERROR_ILLEGAL_ARGUMENT)
    }

    fn field_id(&mut self) -> Result<FieldId, u16> {
        self.reader
            .read_id(self.sizes.field_id)
            .map_err(|_| ERROR_ILLEGAL_ARGUMENT)
    }

    fn method_id(&mut self) -> Result<MethodId, u16> {
        self.reader
            .read_id(self.sizes.method_id)
            .map_err(|_| ERROR_ILLEGAL_ARGUMENT)
    }

    fn frame_id(&mut self) -> Result<FrameId, u16> {
        self.reader
            .read_id(self.sizes.frame_id)
            .map_err(|_| ERROR_ILLEGAL_ARGUMENT)
    }
}

#[derive(Clone, Debug)]
pub struct DelayedReply {
    pub command_set: u8,
    pub command: u8,
    pub delay: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct MockJdwpServerConfig {
    /// Reply delays keyed by `(command_set, command)`.
    ///
    /// The server keeps answering other commands while a delayed reply is pending.
    pub delayed_replies: Vec<DelayedReply>,
    /// Drop the connection, without replying, when this command arrives.
    pub close_on_command: Option<(u8, u8)>,
}

/// Collects an object just before the first command naming it is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CollectOnCommand {
    pub command_set: u8,
    pub command: u8,
    pub object: ObjectId,
}

struct State {
    config: MockJdwpServerConfig,
    vm: Mutex<MockVm>,
    writer: Mutex<Option<Arc<Mutex<OwnedWriteHalf>>>>,
    commands: Mutex<HashMap<(u8, u8), usize>>,
    collect_on: Mutex<Option<CollectOnCommand>>,
    next_packet_id: AtomicU32,
    vm_suspend_calls: AtomicU32,
    vm_resume_calls: AtomicU32,
}

impl State {
    fn reply_delay(&self, command_set: u8, command: u8) -> Option<Duration> {
        self.config
            .delayed_replies
            .iter()
            .find(|d| d.command_set == command_set && d.command == command)
            .map(|d| d.delay)
    }

    async fn send_event(&self, payload: Vec<u8>) -> std::io::Result<()> {
        let writer = self.writer.lock().await.clone();
        let Some(writer) = writer else {
            return Ok(());
        };
        let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        let (command_set, command) = EVENT_COMMAND;
        let packet = encode_command(id, command_set, command, &payload);
        let mut guard = writer.lock().await;
        guard.write_all(&packet).await
    }
}

/// A JDWP server backed by a [`MockVm`], used in place of a real JVM in tests.
///
/// It accepts a single debugger connection.
pub struct MockJdwpServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

impl MockJdwpServer {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_vm(MockVm::new()).await
    }

    pub async fn spawn_with_vm(vm: MockVm) -> std::io::Result<Self> {
        Self::spawn_with_config(vm, MockJdwpServerConfig::default()).await
    }

    pub async fn spawn_with_config(vm: MockVm, config: MockJdwpServerConfig) -> std::io::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let state = Arc::new(State {
            config,
            vm: Mutex::new(vm),
            writer: Mutex::new(None),
            commands: Mutex::new(HashMap::new()),
            collect_on: Mutex::new(None),
            next_packet_id: AtomicU32::new(0x4000_0000),
            vm_suspend_calls: AtomicU32::new(0),
            vm_resume_calls: AtomicU32::new(0),
        });

        let task_shutdown = shutdown.clone();
        let task_state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = run(listener, task_state, task_shutdown).await {
                tracing::debug!(target: "rcn.jdwp", error = %err, "mock JDWP server stopped");
            }
        });

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Runs `f` against the live VM model.
    pub async fn with_vm<R>(&self, f: impl FnOnce(&mut MockVm) -> R) -> R {
        let mut vm = self.state.vm.lock().await;
        f(&mut vm)
    }

    /// Defines a new type and, if the debugger asked for them, sends a
    /// `ClassPrepare` event for it.
    pub async fn define_class(&self, spec: ClassSpec) -> std::io::Result<ReferenceTypeId> {
        let (id, event) = {
            let mut vm = self.state.vm.lock().await;
            let id = vm.define(spec);
            (id, vm.class_prepare_event(id))
        };
        if let Some(event) = event {
            self.state.send_event(event).await?;
        }
        Ok(id)
    }

    /// Unloads a type and, if requested, sends a `ClassUnload` event.
    pub async fn unload_class(&self, class: ReferenceTypeId) -> std::io::Result<()> {
        let event = {
            let mut vm = self.state.vm.lock().await;
            vm.unload(class)
                .and_then(|signature| vm.class_unload_event(&signature))
        };
        if let Some(event) = event {
            self.state.send_event(event).await?;
        }
        Ok(())
    }

    pub async fn collect(&self, object: ObjectId) {
        self.state.vm.lock().await.collect(object);
    }

    /// Arms a one-shot hook: `object` is collected when a command whose first
    /// argument is `object` arrives.
    pub async fn collect_on_command(&self, hook: CollectOnCommand) {
        *self.state.collect_on.lock().await = Some(hook);
    }

    /// Drops the debugger connection.
    pub fn disconnect(&self) {
        self.shutdown.cancel();
    }

    /// Number of times `(command_set, command)` has been received.
    pub async fn command_count(&self, command_set: u8, command: u8) -> usize {
        self.state
            .commands
            .lock()
            .await
            .get(&(command_set, command))
            .copied()
            .unwrap_or(0)
    }

    pub fn vm_suspend_calls(&self) -> u32 {
        self.state.vm_suspend_calls.load(Ordering::Relaxed)
    }

    pub fn vm_resume_calls(&self) -> u32 {
        self.state.vm_resume_calls.load(Ordering::Relaxed)
    }
}

impl Drop for MockJdwpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run(
    listener: TcpListener,
    state: Arc<State>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let result = serve(listener, &state, &shutdown).await;

    // Close the socket even though event senders may still hold the write half.
    if let Some(writer) = state.writer.lock().await.take() {
        let _ = writer.lock().await.shutdown().await;
    }
    shutdown.cancel();
    result
}

async fn serve(
    listener: TcpListener,
    state: &Arc<State>,
    shutdown: &CancellationToken,
) -> std::io::Result<()> {
    let (mut socket, _) = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        accept = listener.accept() => accept?,
    };

    // Handshake: debugger -> "JDWP-Handshake", server echoes back.
    let mut hs = [0u8; HANDSHAKE.len()];
    socket.read_exact(&mut hs).await?;
    if hs != *HANDSHAKE {
        return Ok(());
    }
    socket.write_all(HANDSHAKE).await?;

    let (mut reader, writer) = socket.into_split();
    let writer = Arc::new(Mutex::new(writer));
    *state.writer.lock().await = Some(writer.clone());

    loop {
        let packet = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            res = read_packet(&mut reader) => res?,
        };
        let Some(packet) = packet else {
            return Ok(());
        };

        *state
            .commands
            .lock()
            .await
            .entry((packet.command_set, packet.command))
            .or_default() += 1;

        if state.config.close_on_command == Some((packet.command_set, packet.command)) {
            return Ok(());
        }

        match (packet.command_set, packet.command) {
            (1, 8) => {
                state.vm_suspend_calls.fetch_add(1, Ordering::Relaxed);
            }
            (1, 9) => {
                state.vm_resume_calls.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        let reply = {
            let mut vm = state.vm.lock().await;
            let mut collect_on = state.collect_on.lock().await;
            if let Some(hook) = *collect_on {
                let named = JdwpReader::new(&packet.payload).read_object_id(&vm.id_sizes).ok();
                if (hook.command_set, hook.command) == (packet.command_set, packet.command)
                    && named == Some(hook.object)
                {
                    vm.collect(hook.object);
                    *collect_on = None;
                }
            }
            drop(collect_on);
            match vm.handle_command(packet.command_set, packet.command, &packet.payload) {
                Ok(payload) => encode_reply(packet.id, 0, &payload),
                Err(code) => encode_reply(packet.id, code, &[]),
            }
        };

        write_reply(
            &writer,
            reply,
            state.reply_delay(packet.command_set, packet.command),
            shutdown.clone(),
        )
        .await?;
    }
}

struct Packet {
    id: u32,
    command_set: u8,
    command: u8,
    payload: Vec<u8>,
}

async fn read_packet(
    socket: &mut tokio::net::tcp::OwnedReadHalf,
) -> std::io::Result<Option<Packet>> {
    let mut header = [0u8; HEADER_LEN];
    match socket.read_exact(&mut header).await {
        Ok(_n) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let Ok(header) = PacketHeader::parse(&header) else {
        return Ok(None);
    };
    if header.is_reply() {
        // The mock only expects commands from the debugger.
        return Ok(None);
    }
    let mut payload = vec![0u8; header.payload_len()];
    socket.read_exact(&mut payload).await?;
    Ok(Some(Packet {
        id: header.id,
        command_set: header.tail[0],
        command: header.tail[1],
        payload,
    }))
}

async fn write_reply(
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    reply: Vec<u8>,
    delay: Option<Duration>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    match delay.filter(|d| !d.is_zero()) {
        Some(delay) => {
            let writer = writer.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        let _ = writer.lock().await.write_all(&reply).await;
                    }
                }
            });
            Ok(())
        }
        None => writer.lock().await.write_all(&reply).await,
    }
}
