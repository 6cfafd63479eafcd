//! Graph vertices, edges and the values they carry.
//!
//! Every type here derives `Serialize` so an exporter can consume a [`Graph`]
//! directly. Maps serialize as plain sequences of their values; the keys are
//! always repeated inside the value.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rcn_jdwp::{
    types::{
        CLASS_STATUS_ERROR, CLASS_STATUS_INITIALIZED, CLASS_STATUS_PREPARED,
        CLASS_STATUS_VERIFIED, MODIFIER_PRIVATE, MODIFIER_PROTECTED, MODIFIER_PUBLIC,
    },
    FieldId, MethodId, ObjectId, ReferenceTypeId,
};
use serde::{Serialize, Serializer};

fn values<S, K, V>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    V: Serialize,
{
    serializer.collect_seq(map.values())
}

fn entries<S, K, V>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    K: Serialize,
    V: Serialize,
{
    serializer.collect_seq(map.iter())
}

/// Identity of a type: its defining loader (`None` for bootstrap) and binary name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TypeKey {
    pub loader: Option<ObjectId>,
    pub name: String,
}

impl TypeKey {
    pub fn new(loader: Option<ObjectId>, name: impl Into<String>) -> Self {
        Self {
            loader,
            name: name.into(),
        }
    }

    pub fn bootstrap(name: impl Into<String>) -> Self {
        Self::new(None, name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.loader {
            Some(loader) => write!(f, "{} (loader {loader:#x})", self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TypeKind {
    Class,
    Interface,
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Access {
    Public,
    Protected,
    Private,
    PackagePrivate,
}

impl Access {
    pub fn from_modifiers(modifiers: u32) -> Self {
        if modifiers & MODIFIER_PUBLIC != 0 {
            Access::Public
        } else if modifiers & MODIFIER_PROTECTED != 0 {
            Access::Protected
        } else if modifiers & MODIFIER_PRIVATE != 0 {
            Access::Private
        } else {
            Access::PackagePrivate
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Nesting {
    TopLevel,
    StaticMember,
    InstanceMember,
    Anonymous,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Linkage {
    /// Loaded, but not (yet) verified and prepared; also used for partially
    /// resolved nodes.
    Loaded,
    Linked,
    Initialized,
    Error,
}

impl Linkage {
    pub fn from_status(status: u32) -> Self {
        if status & CLASS_STATUS_ERROR != 0 {
            Linkage::Error
        } else if status & CLASS_STATUS_INITIALIZED != 0 {
            Linkage::Initialized
        } else if status & (CLASS_STATUS_VERIFIED | CLASS_STATUS_PREPARED) != 0 {
            Linkage::Linked
        } else {
            Linkage::Loaded
        }
    }
}

/// A reference to a class, interface or array type from a signature.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum TypeRef {
    Loaded { key: TypeKey, rcn: String },
    /// Not loaded by the loader the reference was resolved against.
    Unprepared { name: String, rcn: String },
}

impl TypeRef {
    pub fn rcn(&self) -> &str {
        match self {
            TypeRef::Loaded { rcn, .. } | TypeRef::Unprepared { rcn, .. } => rcn,
        }
    }

    pub fn key(&self) -> Option<&TypeKey> {
        match self {
            TypeRef::Loaded { key, .. } => Some(key),
            TypeRef::Unprepared { .. } => None,
        }
    }
}

/// Declared type of a field, parameter, return value or array component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueType {
    Void,
    Primitive(String),
    Reference(TypeRef),
}

impl ValueType {
    pub fn rcn(&self) -> &str {
        match self {
            ValueType::Void => "void",
            ValueType::Primitive(keyword) => keyword,
            ValueType::Reference(reference) => reference.rcn(),
        }
    }

    pub fn type_ref(&self) -> Option<&TypeRef> {
        match self {
            ValueType::Reference(reference) => Some(reference),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeNode {
    pub key: TypeKey,
    /// Debuggee handle; only meaningful for the session that produced it.
    #[serde(skip)]
    pub type_id: ReferenceTypeId,
    pub rcn: String,
    pub signature: String,
    pub kind: TypeKind,
    pub access: Access,
    pub is_abstract: bool,
    pub is_final: bool,
    pub nesting: Nesting,
    pub superclass: Option<TypeKey>,
    pub interfaces: Vec<TypeKey>,
    pub enclosing: Option<TypeKey>,
    /// Element type, for arrays.
    pub component: Option<ValueType>,
    pub linkage: Linkage,
}

impl TypeNode {
    /// Partial nodes come from missing metadata or unresolvable supertypes.
    pub fn is_partial(&self) -> bool {
        self.linkage == Linkage::Loaded
    }
}

/// Identity of a member: declaring type, name and JVM signature.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MemberKey {
    pub owner: TypeKey,
    pub name: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDescriptor {
    pub key: MemberKey,
    pub rcn: String,
    #[serde(skip)]
    pub field_id: FieldId,
    pub declared_type: ValueType,
    pub is_static: bool,
    pub access: Access,
    pub synthetic: bool,
    /// The compiler-generated `this$N` reference to the enclosing instance.
    pub outer_instance: bool,
    /// Whether the declaring type was initialized, i.e. the field holds a value.
    pub has_value: bool,
}

/// Where a method body starts in its source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    /// Package directories and file name (`com/example/Foo.java`), when the
    /// type records its source file.
    pub source_path: Option<String>,
    pub line: u32,
}

/// Identity of a local variable: its method, name and the code index where
/// its scope starts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct VariableKey {
    pub method: MemberKey,
    pub name: String,
    pub scope_start: u64,
}

/// A local variable or parameter declared by a method's variable table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableDescriptor {
    pub key: VariableKey,
    pub rcn: String,
    pub declared_type: ValueType,
    /// Source line where the variable's scope starts.
    pub line: Option<u32>,
    pub is_parameter: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodDescriptor {
    pub key: MemberKey,
    pub rcn: String,
    #[serde(skip)]
    pub method_id: MethodId,
    pub parameters: Vec<ValueType>,
    pub return_type: ValueType,
    pub is_static: bool,
    pub is_abstract: bool,
    pub access: Access,
    pub location: Option<SourceLocation>,
    /// Empty when the method was compiled without a variable table.
    pub variables: Vec<VariableDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConstructorDescriptor {
    pub key: MemberKey,
    pub rcn: String,
    #[serde(skip)]
    pub method_id: MethodId,
    pub parameters: Vec<ValueType>,
    pub access: Access,
    pub location: Option<SourceLocation>,
    pub variables: Vec<VariableDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "member", rename_all = "kebab-case")]
pub enum MemberDescriptor {
    Field(FieldDescriptor),
    Method(MethodDescriptor),
    Constructor(ConstructorDescriptor),
}

impl MemberDescriptor {
    pub fn key(&self) -> &MemberKey {
        match self {
            MemberDescriptor::Field(field) => &field.key,
            MemberDescriptor::Method(method) => &method.key,
            MemberDescriptor::Constructor(ctor) => &ctor.key,
        }
    }

    pub fn rcn(&self) -> &str {
        match self {
            MemberDescriptor::Field(field) => &field.rcn,
            MemberDescriptor::Method(method) => &method.rcn,
            MemberDescriptor::Constructor(ctor) => &ctor.rcn,
        }
    }

    pub fn as_field(&self) -> Option<&FieldDescriptor> {
        match self {
            MemberDescriptor::Field(field) => Some(field),
            _ => None,
        }
    }

    pub fn as_method(&self) -> Option<&MethodDescriptor> {
        match self {
            MemberDescriptor::Method(method) => Some(method),
            _ => None,
        }
    }

    pub fn as_constructor(&self) -> Option<&ConstructorDescriptor> {
        match self {
            MemberDescriptor::Constructor(ctor) => Some(ctor),
            _ => None,
        }
    }

    /// Declared variables of a method or constructor.
    pub fn variables(&self) -> &[VariableDescriptor] {
        match self {
            MemberDescriptor::Field(_) => &[],
            MemberDescriptor::Method(method) => &method.variables,
            MemberDescriptor::Constructor(ctor) => &ctor.variables,
        }
    }

    pub fn location(&self) -> Option<&SourceLocation> {
        match self {
            MemberDescriptor::Field(_) => None,
            MemberDescriptor::Method(method) => method.location.as_ref(),
            MemberDescriptor::Constructor(ctor) => ctor.location.as_ref(),
        }
    }

    /// Every type mentioned by the member's declaration.
    pub fn mentioned_types(&self) -> Vec<&ValueType> {
        match self {
            MemberDescriptor::Field(field) => vec![&field.declared_type],
            MemberDescriptor::Method(method) => method
                .parameters
                .iter()
                .chain(std::iter::once(&method.return_type))
                .collect(),
            MemberDescriptor::Constructor(ctor) => ctor.parameters.iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Unavailable {
    /// The holding object was garbage collected mid-read.
    Collected,
    /// The declaring type has not run its initializer.
    NotInitialized,
    /// The value's type could not be resolved.
    UnresolvedType,
    Malformed,
    /// Left out by the mapping limiter.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum Value {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Null,
    Reference(ObjectId),
    Unavailable(Unavailable),
}

impl Value {
    pub fn reference(&self) -> Option<ObjectId> {
        match *self {
            Value::Reference(id) => Some(id),
            _ => None,
        }
    }
}

impl From<&rcn_jdwp::JdwpValue> for Value {
    fn from(value: &rcn_jdwp::JdwpValue) -> Self {
        use rcn_jdwp::JdwpValue;

        match *value {
            JdwpValue::Boolean(v) => Value::Boolean(v),
            JdwpValue::Byte(v) => Value::Byte(v),
            JdwpValue::Char(v) => Value::Char(v),
            JdwpValue::Short(v) => Value::Short(v),
            JdwpValue::Int(v) => Value::Int(v),
            JdwpValue::Long(v) => Value::Long(v),
            JdwpValue::Float(v) => Value::Float(v),
            JdwpValue::Double(v) => Value::Double(v),
            JdwpValue::Object { id: 0, .. } => Value::Null,
            JdwpValue::Object { id, .. } => Value::Reference(id),
            JdwpValue::Void => Value::Unavailable(Unavailable::Malformed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Payload {
    Plain,
    String { value: String },
    Array { length: usize, elements: Vec<Value> },
    /// Referenced, but beyond the walk's depth bound or left out by the limiter.
    Unexplored,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceNode {
    pub object_id: ObjectId,
    /// Absent when the object was collected before its type could be read.
    pub runtime_type: Option<TypeKey>,
    pub live: bool,
    pub payload: Payload,
    /// Instance field values keyed by field RCN.
    pub fields: BTreeMap<String, Value>,
}

impl InstanceNode {
    pub fn is_explored(&self) -> bool {
        !matches!(self.payload, Payload::Unexplored)
    }

    pub fn references(&self) -> impl Iterator<Item = (String, ObjectId)> + '_ {
        let fields = self
            .fields
            .iter()
            .filter_map(|(rcn, value)| value.reference().map(|id| (rcn.clone(), id)));
        let elements: &[Value] = match &self.payload {
            Payload::Array { elements, .. } => elements.as_slice(),
            _ => &[],
        };
        let elements = elements
            .iter()
            .enumerate()
            .filter_map(|(idx, value)| value.reference().map(|id| (format!("[{idx}]"), id)));
        fields.chain(elements)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "node", content = "id", rename_all = "kebab-case")]
pub enum NodeId {
    Type(TypeKey),
    /// Placeholder for a type some signature mentions but no loader has loaded.
    Unloaded(String),
    Member(MemberKey),
    Variable(VariableKey),
    Instance(ObjectId),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "edge", rename_all = "kebab-case")]
pub enum EdgeKind {
    InstanceOf,
    SubclassOf,
    Implements,
    DeclaresField,
    DeclaresMethod,
    DeclaresConstructor,
    DeclaresVariable,
    EnclosedBy,
    LoadedBy,
    /// `via` is the field RCN or `[index]` for array elements.
    References { via: String },
    HasType,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Graph {
    #[serde(serialize_with = "values")]
    pub types: BTreeMap<TypeKey, TypeNode>,
    pub unloaded: BTreeSet<String>,
    #[serde(serialize_with = "values")]
    pub members: BTreeMap<MemberKey, MemberDescriptor>,
    #[serde(serialize_with = "values")]
    pub instances: BTreeMap<ObjectId, InstanceNode>,
    /// Static field values, keyed by the field.
    #[serde(serialize_with = "entries")]
    pub statics: BTreeMap<MemberKey, Value>,
    pub edges: BTreeSet<Edge>,
    /// Problems local to one type or object that did not abort the capture.
    pub diagnostics: Vec<String>,
}

impl Graph {
    pub fn type_by_rcn(&self, rcn: &str) -> Option<&TypeNode> {
        self.types.values().find(|node| node.rcn == rcn)
    }

    pub fn member_by_rcn(&self, rcn: &str) -> Option<&MemberDescriptor> {
        self.members.values().find(|member| member.rcn() == rcn)
    }

    pub fn members_of<'a>(
        &'a self,
        owner: &'a TypeKey,
    ) -> impl Iterator<Item = &'a MemberDescriptor> + 'a {
        self.members
            .values()
            .filter(move |member| &member.key().owner == owner)
    }

    pub fn edges_from<'a>(&'a self, from: &'a NodeId) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| &edge.from == from)
    }

    pub fn edges_of_kind<'a>(
        &'a self,
        kind: &'a EdgeKind,
    ) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| &edge.kind == kind)
    }

    pub fn variable(&self, key: &VariableKey) -> Option<&VariableDescriptor> {
        self.members
            .get(&key.method)?
            .variables()
            .iter()
            .find(|variable| &variable.key == key)
    }

    pub fn variable_by_rcn(&self, rcn: &str) -> Option<&VariableDescriptor> {
        self.members
            .values()
            .flat_map(MemberDescriptor::variables)
            .find(|variable| variable.rcn == rcn)
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        match node {
            NodeId::Type(key) => self.types.contains_key(key),
            NodeId::Unloaded(name) => self.unloaded.contains(name),
            NodeId::Member(key) => self.members.contains_key(key),
            NodeId::Variable(key) => self.variable(key).is_some(),
            NodeId::Instance(id) => self.instances.contains_key(id),
        }
    }
}
