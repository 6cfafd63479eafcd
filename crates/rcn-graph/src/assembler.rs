//! Collects nodes into a [`Graph`] and derives its edges.
//!
//! Edges are never added directly. They are recomputed from node attributes
//! every time a graph is produced, so assembling the same nodes twice gives
//! the same graph.

use std::collections::BTreeSet;

use crate::model::{
    Edge, EdgeKind, Graph, InstanceNode, MemberDescriptor, MemberKey, NodeId, TypeKey, TypeKind,
    TypeNode, TypeRef, Value, ValueType,
};

#[derive(Debug, Clone, Default)]
pub struct GraphAssembler {
    graph: Graph,
    /// Types left out on purpose; edges to them are dropped silently.
    excluded: BTreeSet<TypeKey>,
}

impl GraphAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continues from an earlier snapshot.
    pub fn from_graph(graph: Graph) -> Self {
        let mut assembler = Self::new();
        assembler.merge(graph);
        assembler
    }

    /// Adds a type. A partial node never replaces a complete one.
    pub fn add_type(&mut self, node: TypeNode) {
        match self.graph.types.get(&node.key) {
            Some(existing) if !existing.is_partial() && node.is_partial() => {}
            _ => {
                self.graph.types.insert(node.key.clone(), node);
            }
        }
    }

    pub fn add_members(&mut self, members: impl IntoIterator<Item = MemberDescriptor>) {
        for member in members {
            self.graph.members.insert(member.key().clone(), member);
        }
    }

    /// Adds an instance. An unexplored stub never replaces an explored node.
    pub fn add_instance(&mut self, node: InstanceNode) {
        match self.graph.instances.get(&node.object_id) {
            Some(existing) if existing.is_explored() && !node.is_explored() => {}
            _ => {
                self.graph.instances.insert(node.object_id, node);
            }
        }
    }

    pub fn add_static(&mut self, field: MemberKey, value: Value) {
        self.graph.statics.insert(field, value);
    }

    pub fn exclude_type(&mut self, key: TypeKey) {
        self.graph.types.remove(&key);
        self.excluded.insert(key);
    }

    pub fn add_diagnostic(&mut self, message: impl Into<String>) {
        self.graph.diagnostics.push(message.into());
    }

    /// Folds another graph in. Its nodes win over older ones under the same
    /// rules as the `add_*` methods; its edges are derived again.
    pub fn merge(&mut self, graph: Graph) {
        let Graph {
            types,
            unloaded: _,
            members,
            instances,
            statics,
            edges: _,
            diagnostics,
        } = graph;
        types.into_values().for_each(|node| self.add_type(node));
        self.add_members(members.into_values());
        instances.into_values().for_each(|node| self.add_instance(node));
        self.graph.statics.extend(statics);
        self.graph.diagnostics.extend(diagnostics);
    }

    pub fn assemble(&self) -> Graph {
        let mut graph = self.graph.clone();
        derive_edges(&mut graph, &self.excluded);
        graph
    }

    pub fn finish(mut self) -> Graph {
        derive_edges(&mut self.graph, &self.excluded);
        self.graph
    }
}

fn derive_edges(graph: &mut Graph, excluded: &BTreeSet<TypeKey>) {
    graph.edges.clear();
    graph.unloaded.clear();

    let mut candidates = Vec::new();
    for node in graph.types.values() {
        let from = NodeId::Type(node.key.clone());
        if let Some(superclass) = &node.superclass {
            candidates.push(edge(&from, NodeId::Type(superclass.clone()), EdgeKind::SubclassOf));
        }
        let kind = match node.kind {
            TypeKind::Interface => EdgeKind::SubclassOf,
            _ => EdgeKind::Implements,
        };
        for interface in &node.interfaces {
            candidates.push(edge(&from, NodeId::Type(interface.clone()), kind.clone()));
        }
        if let Some(enclosing) = &node.enclosing {
            candidates.push(edge(&from, NodeId::Type(enclosing.clone()), EdgeKind::EnclosedBy));
        }
        if let Some(loader) = node.key.loader {
            candidates.push(edge(&from, NodeId::Instance(loader), EdgeKind::LoadedBy));
        }
        if let Some(to) = node.component.as_ref().and_then(type_target) {
            candidates.push(edge(&from, to, EdgeKind::HasType));
        }
    }

    for member in graph.members.values() {
        let from = NodeId::Member(member.key().clone());
        let declares = match member {
            MemberDescriptor::Field(_) => EdgeKind::DeclaresField,
            MemberDescriptor::Method(_) => EdgeKind::DeclaresMethod,
            MemberDescriptor::Constructor(_) => EdgeKind::DeclaresConstructor,
        };
        candidates.push(Edge {
            from: NodeId::Type(member.key().owner.clone()),
            to: from.clone(),
            kind: declares,
        });
        for ty in member.mentioned_types() {
            if let Some(to) = type_target(ty) {
                candidates.push(edge(&from, to, EdgeKind::HasType));
            }
        }
        for variable in member.variables() {
            let node = NodeId::Variable(variable.key.clone());
            if let Some(to) = type_target(&variable.declared_type) {
                candidates.push(edge(&node, to, EdgeKind::HasType));
            }
            candidates.push(edge(&from, node, EdgeKind::DeclaresVariable));
        }
    }

    for node in graph.instances.values() {
        let from = NodeId::Instance(node.object_id);
        if let Some(runtime_type) = &node.runtime_type {
            candidates.push(edge(&from, NodeId::Type(runtime_type.clone()), EdgeKind::InstanceOf));
        }
        for (via, target) in node.references() {
            candidates.push(edge(&from, NodeId::Instance(target), EdgeKind::References { via }));
        }
    }

    for (field, value) in &graph.statics {
        if let Some(target) = value.reference() {
            let via = graph
                .members
                .get(field)
                .map_or_else(|| field.name.clone(), |member| member.rcn().to_owned());
            candidates.push(Edge {
                from: NodeId::Member(field.clone()),
                to: NodeId::Instance(target),
                kind: EdgeKind::References { via },
            });
        }
    }

    // Types no loader has loaded become placeholders as soon as anything
    // mentions them.
    for candidate in &candidates {
        if let NodeId::Unloaded(name) = &candidate.to {
            graph.unloaded.insert(name.clone());
        }
    }

    let is_excluded = |node: &NodeId| matches!(node, NodeId::Type(key) if excluded.contains(key));
    let mut dropped = Vec::new();
    for candidate in candidates {
        if graph.contains(&candidate.from) && graph.contains(&candidate.to) {
            graph.edges.insert(candidate);
        } else if !is_excluded(&candidate.from) && !is_excluded(&candidate.to) {
            dropped.push(candidate);
        }
    }
    for candidate in dropped {
        let missing = if graph.contains(&candidate.from) {
            &candidate.to
        } else {
            &candidate.from
        };
        tracing::debug!(target: "rcn.graph", ?candidate, "edge endpoint not in graph");
        graph
            .diagnostics
            .push(format!("{:?} edge dropped: {missing:?} is not in the graph", candidate.kind));
    }
    graph.diagnostics.sort();
    graph.diagnostics.dedup();
}

fn edge(from: &NodeId, to: NodeId, kind: EdgeKind) -> Edge {
    Edge {
        from: from.clone(),
        to,
        kind,
    }
}

/// Node a value type points at. Primitive types are not nodes.
fn type_target(ty: &ValueType) -> Option<NodeId> {
    match ty.type_ref()? {
        TypeRef::Loaded { key, .. } => Some(NodeId::Type(key.clone())),
        TypeRef::Unprepared { name, .. } => Some(NodeId::Unloaded(name.clone())),
    }
}
