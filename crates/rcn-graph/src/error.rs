use rcn_jdwp::{
    types::{ERROR_CLASS_NOT_PREPARED, ERROR_INVALID_CLASS, ERROR_INVALID_OBJECT},
    JdwpError, ObjectId, ReferenceTypeId,
};
use thiserror::Error;

pub type RcnResult<T> = Result<T, RcnError>;

#[derive(Error, Debug)]
pub enum RcnError {
    /// The session is gone (closed, timed out, or never established).
    #[error("debuggee connection lost: {0}")]
    Connection(#[source] JdwpError),
    /// The type is not loaded, or loaded but not yet prepared.
    #[error("type {identity} is not loaded or not prepared")]
    UnresolvedType { identity: String },
    #[error("object {object_id:#x} has been garbage collected")]
    StaleReference { object_id: ObjectId },
    #[error("malformed metadata for {identity}: {detail}")]
    MalformedMetadata { identity: String, detail: String },
}

impl RcnError {
    pub fn is_connection(&self) -> bool {
        matches!(self, RcnError::Connection(_))
    }

    pub(crate) fn closed() -> Self {
        RcnError::Connection(JdwpError::ConnectionClosed)
    }

    pub(crate) fn malformed(subject: Subject<'_>, detail: impl Into<String>) -> Self {
        RcnError::MalformedMetadata {
            identity: subject.identity(),
            detail: detail.into(),
        }
    }

    /// Maps a protocol error onto the taxonomy, attributing it to `subject`.
    pub(crate) fn from_jdwp(err: JdwpError, subject: Subject<'_>) -> Self {
        if err.is_fatal() {
            return RcnError::Connection(err);
        }
        match (&err, subject) {
            (JdwpError::VmError(ERROR_INVALID_OBJECT), Subject::Object(object_id)) => {
                RcnError::StaleReference { object_id }
            }
            (
                JdwpError::VmError(ERROR_INVALID_OBJECT | ERROR_INVALID_CLASS | ERROR_CLASS_NOT_PREPARED),
                subject,
            ) => RcnError::UnresolvedType {
                identity: subject.identity(),
            },
            (_, subject) => RcnError::malformed(subject, err.to_string()),
        }
    }
}

/// What a failed request was about.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Subject<'a> {
    Type(&'a str),
    TypeId(ReferenceTypeId),
    Object(ObjectId),
}

impl Subject<'_> {
    fn identity(&self) -> String {
        match *self {
            Subject::Type(name) => name.to_owned(),
            Subject::TypeId(id) => format!("type {id:#x}"),
            Subject::Object(id) => format!("object {id:#x}"),
        }
    }
}
