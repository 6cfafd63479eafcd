use thiserror::Error;

pub type ObjectId = u64;
pub type ThreadId = ObjectId;
pub type ReferenceTypeId = u64;
pub type FieldId = u64;
pub type MethodId = u64;
pub type FrameId = u64;

pub type Result<T> = std::result::Result<T, JdwpError>;

/// JDWP `Error` constants the client and its callers branch on.
pub const ERROR_THREAD_NOT_SUSPENDED: u16 = 13;
pub const ERROR_INVALID_OBJECT: u16 = 20;
pub const ERROR_INVALID_CLASS: u16 = 21;
pub const ERROR_CLASS_NOT_PREPARED: u16 = 22;
pub const ERROR_ABSENT_INFORMATION: u16 = 101;
pub const ERROR_NOT_IMPLEMENTED: u16 = 99;

/// `TypeTag` values.
pub const TYPE_TAG_CLASS: u8 = 1;
pub const TYPE_TAG_INTERFACE: u8 = 2;
pub const TYPE_TAG_ARRAY: u8 = 3;

/// `ClassStatus` bits.
pub const CLASS_STATUS_VERIFIED: u32 = 1;
pub const CLASS_STATUS_PREPARED: u32 = 2;
pub const CLASS_STATUS_INITIALIZED: u32 = 4;
pub const CLASS_STATUS_ERROR: u32 = 8;

/// Access flags as reported by `ReferenceType.Modifiers`, `Fields` and `Methods`.
pub const MODIFIER_PUBLIC: u32 = 0x0001;
pub const MODIFIER_PRIVATE: u32 = 0x0002;
pub const MODIFIER_PROTECTED: u32 = 0x0004;
pub const MODIFIER_STATIC: u32 = 0x0008;
pub const MODIFIER_FINAL: u32 = 0x0010;
pub const MODIFIER_NATIVE: u32 = 0x0100;
pub const MODIFIER_INTERFACE: u32 = 0x0200;
pub const MODIFIER_ABSTRACT: u32 = 0x0400;
pub const MODIFIER_SYNTHETIC: u32 = 0x1000;
/// JDWP marks synthetic members with these bits when the VM supports it.
pub const MODIFIER_JDWP_SYNTHETIC: u32 = 0xf000_0000;

/// `EventKind` values.
pub const EVENT_KIND_SINGLE_STEP: u8 = 1;
pub const EVENT_KIND_BREAKPOINT: u8 = 2;
pub const EVENT_KIND_CLASS_PREPARE: u8 = 8;
pub const EVENT_KIND_CLASS_UNLOAD: u8 = 9;
pub const EVENT_KIND_VM_START: u8 = 90;
pub const EVENT_KIND_VM_DEATH: u8 = 99;

/// `SuspendPolicy` values.
pub const SUSPEND_POLICY_NONE: u8 = 0;
pub const SUSPEND_POLICY_EVENT_THREAD: u8 = 1;
pub const SUSPEND_POLICY_ALL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JdwpIdSizes {
    pub field_id: usize,
    pub method_id: usize,
    pub object_id: usize,
    pub reference_type_id: usize,
    pub frame_id: usize,
}

impl Default for JdwpIdSizes {
    fn default() -> Self {
        Self {
            field_id: 8,
            method_id: 8,
            object_id: 8,
            reference_type_id: 8,
            frame_id: 8,
        }
    }
}

/// A tagged JDWP value.
///
/// Object-like values (`L`, `s`, `[`, `t`, `g`, `l`, `c`) keep their tag so the
/// caller can tell strings and arrays apart without another round trip. An
/// object id of `0` is `null`.
#[derive(Debug, Clone, PartialEq)]
pub enum JdwpValue {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object { tag: u8, id: ObjectId },
    Void,
}

impl JdwpValue {
    pub fn null() -> Self {
        JdwpValue::Object { tag: b'L', id: 0 }
    }

    pub fn object(id: ObjectId) -> Self {
        JdwpValue::Object { tag: b'L', id }
    }

    /// The referenced object, if this is a non-null reference.
    pub fn object_id(&self) -> Option<ObjectId> {
        match *self {
            JdwpValue::Object { id, .. } if id != 0 => Some(id),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, JdwpValue::Object { id: 0, .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub ref_type_tag: u8,
    pub type_id: ReferenceTypeId,
    pub signature: String,
    pub status: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub field_id: FieldId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub method_id: MethodId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub type_tag: u8,
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_id: FrameId,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    pub code_index: u64,
    pub name: String,
    pub signature: String,
    pub length: u32,
    pub slot: u32,
}

impl VariableInfo {
    /// Whether the variable is in scope at `index`.
    pub fn is_live_at(&self, index: u64) -> bool {
        index >= self.code_index && index < self.code_index + u64::from(self.length)
    }
}

/// Reply of `Method.LineTable`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineTable {
    pub start: u64,
    pub end: u64,
    /// `(code_index, line)` pairs, in the order the VM reports them.
    pub lines: Vec<(u64, i32)>,
}

impl LineTable {
    /// Source line of the instruction at `index`.
    pub fn line_at(&self, index: u64) -> Option<i32> {
        self.lines
            .iter()
            .filter(|(code_index, _)| *code_index <= index)
            .max_by_key(|(code_index, _)| *code_index)
            .map(|(_, line)| *line)
    }

    /// Line of the method's first instruction.
    pub fn first_line(&self) -> Option<i32> {
        self.line_at(self.start)
            .or_else(|| self.lines.iter().min_by_key(|(index, _)| *index).map(|(_, line)| *line))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JdwpEvent {
    Breakpoint {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    ClassPrepare {
        request_id: i32,
        thread: ThreadId,
        ref_type_tag: u8,
        type_id: ReferenceTypeId,
        signature: String,
        status: u32,
    },
    ClassUnload {
        request_id: i32,
        signature: String,
    },
    VmStart {
        request_id: i32,
        thread: ThreadId,
    },
    VmDeath,
}

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timed out waiting for the debuggee")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("VM returned error code {0}")]
    VmError(u16),
}

impl JdwpError {
    /// Errors after which the session cannot be used anymore.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            JdwpError::Io(_) | JdwpError::Timeout | JdwpError::Cancelled | JdwpError::ConnectionClosed
        )
    }
}
