//! Runtime class graph of a live JVM.
//!
//! Attaches to a debuggee over JDWP and turns what it has loaded into a
//! [`Graph`]: type nodes named by their runtime canonical names (RCNs), the
//! fields, methods and constructors they declare, and the objects reachable
//! from static fields, class loaders and (optionally) a thread's stack.
//!
//! [`Snapshotter`] drives a full capture. The pieces it is built from
//! ([`TypeResolver`], [`MemberExtractor`], [`InstanceWalker`],
//! [`GraphAssembler`]) are usable on their own and share one cache per
//! session.

mod assembler;
mod debuggee;
mod error;
mod limiter;
mod members;
pub mod model;
pub mod names;
mod resolver;
mod snapshot;
mod walker;

pub use assembler::GraphAssembler;
pub use debuggee::{
    ClassEvents, Debuggee, FrameLocal, FrameSeeds, MethodDebugInfo, TypeHeader, TypeMetadata,
};
pub use error::{RcnError, RcnResult};
pub use limiter::MappingLimiter;
pub use members::MemberExtractor;
pub use model::{
    Access, ConstructorDescriptor, Edge, EdgeKind, FieldDescriptor, Graph, InstanceNode, Linkage,
    MemberDescriptor, MemberKey, MethodDescriptor, Nesting, NodeId, Payload, SourceLocation,
    TypeKey, TypeKind, TypeNode, TypeRef, Unavailable, Value, ValueType, VariableDescriptor,
    VariableKey,
};
pub use resolver::{Closure, Resolved, TypeIdentity, TypeResolver};
pub use snapshot::{ClassTracker, Snapshotter};
pub use walker::{InstanceWalker, Seed, Walk};
