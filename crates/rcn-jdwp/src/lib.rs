//! Wire-level JDWP client.
//!
//! This crate speaks the JDWP binary protocol over TCP. It is async (`tokio`),
//! pipelines correlated requests up to a configurable bound, and demultiplexes
//! VM events (class prepare/unload, breakpoints, VM start/death) onto a
//! broadcast channel independently of command replies.
//!
//! The client is a passive observer: it exposes no command that invokes code
//! in, or redefines classes of, the debuggee.

mod client;
pub mod codec;
pub mod types;

pub use client::{EventModifier, JdwpClient, JdwpClientConfig};
pub use types::{
    ClassInfo, FieldId, FieldInfo, FrameId, FrameInfo, JdwpError, JdwpEvent, JdwpIdSizes,
    JdwpValue, LineTable, Location, MethodId, MethodInfo, ObjectId, ReferenceTypeId, Result,
    ThreadId, VariableInfo,
};

/// Size of the fixed JDWP packet header (length, id, flags, command/error).
pub const JDWP_HEADER_LEN: usize = 11;

// The mock server is only needed for tests and downstream integration suites.
// Compile it for this crate's unit tests unconditionally (via `cfg(test)`), while
// keeping it behind the `test-support` feature for normal builds.
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
