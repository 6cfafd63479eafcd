//! One full capture of a debuggee: types, members, statics and the objects
//! reachable from them.

use std::{
    collections::{BTreeSet, HashMap},
    net::SocketAddr,
    sync::Arc,
};

use futures::{stream, StreamExt};
use rcn_config::{MappingConfig, RcnConfig};
use rcn_jdwp::{JdwpEvent, ObjectId, ThreadId};
use tokio::{
    sync::{broadcast::error::RecvError, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    assembler::GraphAssembler,
    debuggee::{ClassEvents, Debuggee, FrameSeeds},
    error::{RcnError, RcnResult},
    limiter::MappingLimiter,
    members::MemberExtractor,
    model::{Access, Graph, MemberDescriptor, TypeKey, TypeNode, Unavailable, Value},
    names::variable_rcn,
    resolver::{Closure, TypeResolver},
    walker::{InstanceWalker, Seed},
};

/// Drives captures against one debuggee session.
///
/// The resolver and member caches live as long as the snapshotter, so later
/// captures only fetch what changed.
#[derive(Debug, Clone)]
pub struct Snapshotter {
    debuggee: Debuggee,
    resolver: TypeResolver,
    members: MemberExtractor,
    walker: InstanceWalker,
    limiter: Arc<MappingLimiter>,
    suspend_vm: bool,
}

impl Snapshotter {
    pub fn new(debuggee: Debuggee, config: &MappingConfig) -> Self {
        let resolver = TypeResolver::new(debuggee.clone(), config);
        let members = MemberExtractor::new(resolver.clone());
        let limiter = Arc::new(MappingLimiter::new(config));
        let walker = InstanceWalker::new(
            members.clone(),
            limiter.clone(),
            config.max_depth,
            config.max_array_elements,
        );
        Self {
            debuggee,
            resolver,
            members,
            walker,
            limiter,
            suspend_vm: config.suspend_vm,
        }
    }

    pub async fn attach(addr: SocketAddr, config: &RcnConfig) -> RcnResult<Self> {
        let debuggee = Debuggee::attach(addr, &config.jdwp).await?;
        tracing::info!(target: "rcn.graph", %addr, "attached to debuggee");
        Ok(Self::new(debuggee, &config.mapping))
    }

    pub fn debuggee(&self) -> &Debuggee {
        &self.debuggee
    }

    pub fn resolver(&self) -> &TypeResolver {
        &self.resolver
    }

    pub fn members(&self) -> &MemberExtractor {
        &self.members
    }

    pub fn walker(&self) -> &InstanceWalker {
        &self.walker
    }

    pub fn limiter(&self) -> &MappingLimiter {
        &self.limiter
    }

    /// Captures every loaded type and the objects reachable from static
    /// fields and class loaders.
    pub async fn capture(&self) -> RcnResult<Graph> {
        self.suspended(self.collect(None)).await
    }

    /// Like [`Snapshotter::capture`], also seeding the walk with `this` and the
    /// live locals of every frame of `thread`.
    pub async fn capture_with_stack(&self, thread: ThreadId) -> RcnResult<Graph> {
        self.suspended(self.collect(Some(thread))).await
    }

    /// Marks instances whose objects have since been collected. Returns how
    /// many changed.
    pub async fn refresh_liveness(&self, graph: &mut Graph) -> RcnResult<usize> {
        let mut changed = 0;
        for node in graph.instances.values_mut().filter(|node| node.live) {
            if self.debuggee.is_collected(node.object_id).await? {
                node.live = false;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Keeps the caches in step with class prepare and unload events until
    /// [`ClassTracker::stop`].
    pub async fn track_class_events(&self) -> RcnResult<ClassTracker> {
        let events = self.debuggee.watch_class_events().await?;
        let stop = self.debuggee.cancellation().child_token();
        let (processed_tx, processed) = watch::channel(0u64);
        let task = tokio::spawn(track(
            events,
            self.resolver.clone(),
            self.members.clone(),
            stop.clone(),
            processed_tx,
        ));
        Ok(ClassTracker {
            debuggee: self.debuggee.clone(),
            stop,
            processed,
            task,
        })
    }

    async fn suspended(
        &self,
        capture: impl std::future::Future<Output = RcnResult<Graph>>,
    ) -> RcnResult<Graph> {
        if !self.suspend_vm {
            return capture.await;
        }
        self.debuggee.suspend().await?;
        let result = capture.await;
        if let Err(err) = self.debuggee.resume().await {
            tracing::warn!(target: "rcn.graph", error = %err, "failed to resume debuggee after capture");
        }
        result
    }

    async fn collect(&self, thread: Option<ThreadId>) -> RcnResult<Graph> {
        let mut assembler = GraphAssembler::new();

        self.resolver.refresh_lookups();
        let loaded = self.debuggee.list_loaded_types().await?;
        for class in &loaded {
            self.resolver.refresh_status(class.type_id, class.status);
        }
        tracing::debug!(target: "rcn.graph", types = loaded.len(), "listed loaded types");

        let closure = self
            .resolver
            .resolve_closure(loaded.iter().map(|class| class.type_id))
            .await?;
        for (type_id, err) in &closure.failures {
            note(&mut assembler, format!("type {type_id:#x}: {err}"));
        }

        let (kept, mut loader_seeds) = self.apply_limits(&closure, &mut assembler);
        let mut static_seeds = Vec::new();
        let extracted = stream::iter(kept.iter().map(|node| {
            let members = self.members.clone();
            let type_id = node.type_id;
            async move { (type_id, members.members(type_id).await) }
        }))
        .buffer_unordered(self.resolver.concurrency())
        .collect::<Vec<_>>()
        .await;
        let by_id = kept
            .iter()
            .map(|node| (node.type_id, node.clone()))
            .collect::<HashMap<_, _>>();

        for (type_id, result) in extracted {
            let Some(node) = by_id.get(&type_id) else {
                continue;
            };
            match result {
                Ok(members) => {
                    let members = members
                        .iter()
                        .filter(|member| {
                            !self.limiter.can_member_be_skipped(
                                false,
                                &node.key.name,
                                member_access(member),
                            )
                        })
                        .cloned()
                        .collect::<Vec<_>>();
                    self.read_statics(node, &members, &mut assembler, &mut static_seeds)
                        .await?;
                    assembler.add_members(members);
                }
                Err(err) if err.is_connection() => return Err(err),
                Err(err) => note(&mut assembler, format!("members of {}: {err}", node.key)),
            }
        }

        loader_seeds.extend(self.debuggee.system_loader().await?);

        let mut groups = vec![
            static_seeds,
            loader_seeds.into_iter().map(Seed::object).collect(),
        ];
        if let Some(thread) = thread {
            let frames = self.debuggee.stack_seeds(thread).await?;
            groups.push(self.stack_seeds(frames, &mut assembler).await?);
        }

        let walk = self.walker.walk_many(groups).await?;
        for message in walk.diagnostics {
            assembler.add_diagnostic(message);
        }
        let mut runtime_types = BTreeSet::new();
        for (_, node) in walk.instances {
            runtime_types.extend(node.runtime_type.clone());
            assembler.add_instance(node);
        }
        // Runtime types first seen by the walk.
        for key in runtime_types {
            if closure.nodes.contains_key(&key) {
                continue;
            }
            if let Some(node) = self.resolver.cached(&key) {
                assembler.add_type(TypeNode::clone(&node));
            }
        }

        let graph = assembler.finish();
        tracing::info!(
            target: "rcn.graph",
            types = graph.types.len(),
            members = graph.members.len(),
            instances = graph.instances.len(),
            diagnostics = graph.diagnostics.len(),
            "snapshot captured"
        );
        Ok(graph)
    }

    /// Adds the types the limiter keeps. Returns those with metadata, and the
    /// defining loaders of every added type, prepared or not.
    fn apply_limits(
        &self,
        closure: &Closure,
        assembler: &mut GraphAssembler,
    ) -> (Vec<Arc<TypeNode>>, BTreeSet<ObjectId>) {
        let lookup = |key: &TypeKey| closure.nodes.get(key).map(|resolved| resolved.node.as_ref());
        let mut kept = Vec::new();
        let mut loaders = BTreeSet::new();
        for resolved in closure.nodes.values() {
            let node = &resolved.node;
            if self.limiter.can_type_be_skipped(node, &lookup) {
                assembler.exclude_type(node.key.clone());
                continue;
            }
            loaders.extend(node.key.loader);
            assembler.add_type(TypeNode::clone(node));
            if resolved.metadata.is_some() {
                kept.push(node.clone());
            }
        }
        (kept, loaders)
    }

    async fn read_statics(
        &self,
        node: &TypeNode,
        members: &[MemberDescriptor],
        assembler: &mut GraphAssembler,
        seeds: &mut Vec<Seed>,
    ) -> RcnResult<()> {
        let fields = members
            .iter()
            .filter_map(MemberDescriptor::as_field)
            .filter(|field| field.is_static)
            .collect::<Vec<_>>();
        if fields.is_empty() {
            return Ok(());
        }
        if !fields.iter().all(|field| field.has_value) {
            for field in fields {
                assembler.add_static(
                    field.key.clone(),
                    Value::Unavailable(Unavailable::NotInitialized),
                );
            }
            return Ok(());
        }

        let ids = fields.iter().map(|field| field.field_id).collect::<Vec<_>>();
        let values = match self.debuggee.static_values(node.type_id, &ids).await {
            Ok(values) => values.iter().map(Value::from).collect::<Vec<_>>(),
            Err(err) if err.is_connection() => return Err(err),
            Err(err) => {
                note(assembler, format!("statics of {}: {err}", node.key));
                vec![Value::Unavailable(Unavailable::Malformed); fields.len()]
            }
        };
        for (field, value) in fields.into_iter().zip(values) {
            if let Some(object_id) = value.reference() {
                seeds.push(Seed::held_by(object_id, field.rcn.clone()));
            }
            assembler.add_static(field.key.clone(), value);
        }
        Ok(())
    }

    async fn stack_seeds(
        &self,
        frames: Vec<FrameSeeds>,
        assembler: &mut GraphAssembler,
    ) -> RcnResult<Vec<Seed>> {
        let mut seeds = Vec::new();
        for frame in frames {
            seeds.extend(frame.this_object.map(Seed::object));
            if frame.locals.is_empty() {
                continue;
            }
            let location = frame.location;
            let method_rcn = match self.members.members(location.class_id).await {
                Ok(members) => members.iter().find_map(|member| match member {
                    MemberDescriptor::Method(method) if method.method_id == location.method_id => {
                        Some(method.rcn.clone())
                    }
                    MemberDescriptor::Constructor(ctor) if ctor.method_id == location.method_id => {
                        Some(ctor.rcn.clone())
                    }
                    _ => None,
                }),
                Err(err) if err.is_connection() => return Err(err),
                Err(err) => {
                    note(assembler, format!("frame in type {:#x}: {err}", location.class_id));
                    None
                }
            };
            for local in frame.locals {
                let Some(object_id) = local.value.object_id() else {
                    continue;
                };
                let referrer = method_rcn.as_deref().map(|method_rcn| {
                    let scope = local.ambiguous.then_some(local.variable.code_index);
                    variable_rcn(method_rcn, &local.variable.name, scope)
                });
                seeds.push(Seed {
                    object_id,
                    referrer,
                });
            }
        }
        Ok(seeds)
    }
}

fn member_access(member: &MemberDescriptor) -> Access {
    match member {
        MemberDescriptor::Field(field) => field.access,
        MemberDescriptor::Method(method) => method.access,
        MemberDescriptor::Constructor(ctor) => ctor.access,
    }
}

fn note(assembler: &mut GraphAssembler, message: String) {
    tracing::warn!(target: "rcn.graph", "{message}");
    assembler.add_diagnostic(message);
}

/// Background task keeping the resolver and member caches current.
#[derive(Debug)]
pub struct ClassTracker {
    debuggee: Debuggee,
    stop: CancellationToken,
    processed: watch::Receiver<u64>,
    task: JoinHandle<ClassEvents>,
}

impl ClassTracker {
    /// Waits until `count` class events have been applied since tracking
    /// started.
    pub async fn wait_processed(&mut self, count: u64) -> RcnResult<()> {
        self.processed
            .wait_for(|processed| *processed >= count)
            .await
            .map(|_| ())
            .map_err(|_| RcnError::closed())
    }

    /// Stops tracking and clears the event requests.
    pub async fn stop(self) -> RcnResult<()> {
        self.stop.cancel();
        match self.task.await {
            Ok(events) => self.debuggee.clear_class_events(events).await,
            Err(err) => {
                tracing::warn!(target: "rcn.graph", error = %err, "class event task failed");
                Ok(())
            }
        }
    }
}

async fn track(
    mut events: ClassEvents,
    resolver: TypeResolver,
    members: MemberExtractor,
    stop: CancellationToken,
    processed: watch::Sender<u64>,
) -> ClassEvents {
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = events.events.recv() => event,
        };
        let applied = match event {
            Ok(JdwpEvent::ClassPrepare { signature, type_id, .. }) => {
                tracing::trace!(target: "rcn.graph", type_id, %signature, "class prepared");
                resolver.refresh_lookups();
                members.forget_unprepared();
                1
            }
            Ok(JdwpEvent::ClassUnload { signature, .. }) => {
                tracing::debug!(target: "rcn.graph", %signature, "class unloaded");
                for key in resolver.forget_signature(&signature) {
                    members.forget(&key);
                }
                1
            }
            Ok(JdwpEvent::VmDeath) | Err(RecvError::Closed) => break,
            Ok(_) => 0,
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(target: "rcn.graph", missed, "class events lagged; dropping caches");
                resolver.clear();
                members.clear();
                missed
            }
        };
        if applied > 0 {
            processed.send_modify(|count| *count += applied);
        }
    }
    events
}
