//! Live objects to [`InstanceNode`]s.
//!
//! A walk is breadth first from its seeds and materializes each object once;
//! references to objects already visited only become edges later.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::Arc,
};

use futures::future::try_join_all;
use rcn_jdwp::{ObjectId, ReferenceTypeId};

use crate::{
    error::{RcnError, RcnResult},
    limiter::MappingLimiter,
    members::MemberExtractor,
    model::{FieldDescriptor, InstanceNode, Payload, TypeKey, TypeKind, Unavailable, Value},
    resolver::TypeResolver,
};

const STRING_CLASS: &str = "java.lang.String";

/// Where a walk starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seed {
    pub object_id: ObjectId,
    /// RCN of the static field or local variable holding the object.
    pub referrer: Option<String>,
}

impl Seed {
    pub fn object(object_id: ObjectId) -> Self {
        Self {
            object_id,
            referrer: None,
        }
    }

    pub fn held_by(object_id: ObjectId, referrer: impl Into<String>) -> Self {
        Self {
            object_id,
            referrer: Some(referrer.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct Walk {
    pub instances: BTreeMap<ObjectId, InstanceNode>,
    pub diagnostics: Vec<String>,
}

impl Walk {
    fn note(&mut self, message: String) {
        tracing::warn!(target: "rcn.graph", "{message}");
        self.diagnostics.push(message);
    }

    /// Keeps the most informative node per object.
    fn absorb(&mut self, other: Walk) {
        for (object_id, node) in other.instances {
            match self.instances.get(&object_id) {
                Some(existing) if detail(existing) >= detail(&node) => {}
                _ => {
                    self.instances.insert(object_id, node);
                }
            }
        }
        self.diagnostics.extend(other.diagnostics);
    }
}

/// Explored nodes beat unexplored ones; arrays with captured elements beat
/// arrays left shallow.
fn detail(node: &InstanceNode) -> (bool, usize) {
    let elements = match &node.payload {
        Payload::Array { elements, .. } => elements.len(),
        _ => 0,
    };
    (node.is_explored(), elements)
}

#[derive(Debug, Clone)]
pub struct InstanceWalker {
    resolver: TypeResolver,
    members: MemberExtractor,
    limiter: Arc<MappingLimiter>,
    max_depth: Option<usize>,
    max_array_elements: usize,
}

impl InstanceWalker {
    pub fn new(
        members: MemberExtractor,
        limiter: Arc<MappingLimiter>,
        max_depth: Option<usize>,
        max_array_elements: usize,
    ) -> Self {
        Self {
            resolver: members.resolver().clone(),
            members,
            limiter,
            max_depth,
            max_array_elements,
        }
    }

    /// Walks several seed sets concurrently and merges the results. The walks
    /// share the resolver cache.
    pub async fn walk_many(&self, groups: Vec<Vec<Seed>>) -> RcnResult<Walk> {
        let walks = try_join_all(groups.into_iter().map(|seeds| self.walk(seeds))).await?;
        let mut merged = Walk::default();
        for walk in walks {
            merged.absorb(walk);
        }
        Ok(merged)
    }

    pub async fn walk(&self, seeds: Vec<Seed>) -> RcnResult<Walk> {
        let debuggee = self.resolver.debuggee();
        let mut walk = Walk::default();
        let mut queue = VecDeque::new();
        let mut visited = HashSet::new();
        let mut referrers: HashMap<ObjectId, Vec<String>> = HashMap::new();
        // Arrays whose elements were left out, with the depth they were seen at.
        let mut shallow_arrays: HashMap<ObjectId, usize> = HashMap::new();

        for seed in seeds {
            if let Some(referrer) = seed.referrer {
                referrers.entry(seed.object_id).or_default().push(referrer);
            }
            if seed.object_id != 0 && visited.insert(seed.object_id) {
                queue.push_back((seed.object_id, 0usize));
            }
        }

        while let Some((object_id, depth)) = queue.pop_front() {
            debuggee.check_connected()?;
            let explore = self.max_depth.map_or(true, |max| depth <= max);
            let object_referrers = referrers.get(&object_id).cloned().unwrap_or_default();
            let (node, children) = self
                .visit(object_id, explore, &object_referrers, &mut walk)
                .await?;
            if matches!(node.payload, Payload::Array { .. })
                && self.is_sequence_skipped(&object_referrers)
            {
                shallow_arrays.insert(object_id, depth);
            }

            for (via, child) in children {
                let entry = referrers.entry(child).or_default();
                entry.extend(via);
                if visited.insert(child) {
                    queue.push_back((child, depth + 1));
                } else if let Some(&seen_at) = shallow_arrays.get(&child) {
                    // A deep referrer found after the array was visited.
                    if !self.is_sequence_skipped(entry) {
                        shallow_arrays.remove(&child);
                        queue.push_back((child, seen_at));
                    }
                }
            }
            walk.instances.insert(object_id, node);
        }
        Ok(walk)
    }

    fn is_sequence_skipped(&self, referrers: &[String]) -> bool {
        self.limiter
            .can_sequence_be_skipped(referrers.iter().map(String::as_str))
    }

    /// Reads one object. Returns the node and the objects it refers to, each
    /// with the RCN of the referring field when there is one.
    async fn visit(
        &self,
        object_id: ObjectId,
        explore: bool,
        referrers: &[String],
        walk: &mut Walk,
    ) -> RcnResult<(InstanceNode, Vec<(Option<String>, ObjectId)>)> {
        let debuggee = self.resolver.debuggee();
        let mut node = InstanceNode {
            object_id,
            runtime_type: None,
            live: true,
            payload: Payload::Unexplored,
            fields: BTreeMap::new(),
        };

        let type_id = match debuggee.runtime_type(object_id).await {
            Ok(type_id) => type_id,
            Err(RcnError::StaleReference { .. }) => {
                node.live = false;
                return Ok((node, Vec::new()));
            }
            Err(err) if err.is_connection() => return Err(err),
            Err(err) => {
                walk.note(format!("object {object_id:#x}: {err}"));
                return Ok((node, Vec::new()));
            }
        };
        let resolved = match self.resolver.resolve_entry(type_id).await {
            Ok(resolved) => resolved,
            Err(err) if err.is_connection() => return Err(err),
            Err(err) => {
                walk.note(format!("type of object {object_id:#x}: {err}"));
                return Ok((node, Vec::new()));
            }
        };
        let runtime_type = resolved.node;
        node.runtime_type = Some(runtime_type.key.clone());
        if !explore {
            return Ok((node, Vec::new()));
        }

        let mut children = Vec::new();
        let read = match runtime_type.kind {
            TypeKind::Array => self.read_array(object_id, referrers, &mut node, &mut children).await,
            _ if runtime_type.key.name == STRING_CLASS => debuggee
                .string_value(object_id)
                .await
                .map(|value| node.payload = Payload::String { value }),
            _ if self.limiter.can_instance_be_skipped(&runtime_type.key.name) => Ok(()),
            _ => {
                node.payload = Payload::Plain;
                self.read_fields(object_id, &runtime_type.key, type_id, &mut node, &mut children, walk)
                    .await
            }
        };

        match read {
            Ok(()) => {}
            Err(RcnError::StaleReference { .. }) => {
                node.live = false;
                for value in node.fields.values_mut() {
                    if *value != Value::Unavailable(Unavailable::Skipped) {
                        *value = Value::Unavailable(Unavailable::Collected);
                    }
                }
                children.clear();
            }
            Err(err) if err.is_connection() => return Err(err),
            Err(err) => walk.note(format!("object {object_id:#x}: {err}")),
        }
        Ok((node, children))
    }

    async fn read_array(
        &self,
        object_id: ObjectId,
        referrers: &[String],
        node: &mut InstanceNode,
        children: &mut Vec<(Option<String>, ObjectId)>,
    ) -> RcnResult<()> {
        let debuggee = self.resolver.debuggee();
        let length = debuggee.array_length(object_id).await?;
        if self.is_sequence_skipped(referrers) {
            node.payload = Payload::Array {
                length,
                elements: Vec::new(),
            };
            return Ok(());
        }

        let values = debuggee
            .array_values(object_id, 0, length.min(self.max_array_elements))
            .await?;
        let elements = values.iter().map(Value::from).collect::<Vec<_>>();
        // Nested arrays inherit the referrers of their container.
        for element in elements.iter().filter_map(Value::reference) {
            if referrers.is_empty() {
                children.push((None, element));
            }
            for referrer in referrers {
                children.push((Some(referrer.clone()), element));
            }
        }
        node.payload = Payload::Array { length, elements };
        Ok(())
    }

    async fn read_fields(
        &self,
        object_id: ObjectId,
        key: &TypeKey,
        type_id: ReferenceTypeId,
        node: &mut InstanceNode,
        children: &mut Vec<(Option<String>, ObjectId)>,
        walk: &mut Walk,
    ) -> RcnResult<()> {
        let fields = self.instance_fields(key, type_id, walk).await?;
        let (readable, skipped): (Vec<_>, Vec<_>) = fields.into_iter().partition(|field| {
            !self
                .limiter
                .can_member_be_skipped(false, &field.key.owner.name, field.access)
        });
        for field in skipped {
            node.fields
                .insert(field.rcn, Value::Unavailable(Unavailable::Skipped));
        }

        let values = match self.field_values(object_id, &readable).await {
            Ok(values) => values,
            Err(err) => {
                if matches!(err, RcnError::StaleReference { .. }) {
                    for field in &readable {
                        node.fields
                            .insert(field.rcn.clone(), Value::Unavailable(Unavailable::Collected));
                    }
                }
                return Err(err);
            }
        };

        for (field, value) in readable.into_iter().zip(values) {
            if let Some(child) = value.reference() {
                children.push((Some(field.rcn.clone()), child));
            }
            node.fields.insert(field.rcn, value);
        }
        Ok(())
    }

    /// Reads `fields` in one request, falling back to one request per field
    /// when the batch fails for a reason other than collection.
    async fn field_values(
        &self,
        object_id: ObjectId,
        fields: &[FieldDescriptor],
    ) -> RcnResult<Vec<Value>> {
        let debuggee = self.resolver.debuggee();
        let ids = fields.iter().map(|field| field.field_id).collect::<Vec<_>>();
        match debuggee.field_values(object_id, &ids).await {
            Ok(values) => Ok(values.iter().map(Value::from).collect()),
            Err(err @ RcnError::StaleReference { .. }) => Err(err),
            Err(err) if err.is_connection() => Err(err),
            Err(err) => {
                tracing::debug!(
                    target: "rcn.graph",
                    object_id,
                    error = %err,
                    "batched field read failed, retrying one by one"
                );
                let mut values = Vec::with_capacity(fields.len());
                for field in fields {
                    values.push(match debuggee.field_value(object_id, field.field_id).await {
                        Ok(value) => Value::from(&value),
                        Err(err @ RcnError::StaleReference { .. }) => return Err(err),
                        Err(err) if err.is_connection() => return Err(err),
                        Err(RcnError::UnresolvedType { .. }) => {
                            Value::Unavailable(Unavailable::UnresolvedType)
                        }
                        Err(_) => Value::Unavailable(Unavailable::Malformed),
                    });
                }
                Ok(values)
            }
        }
    }

    /// Instance fields declared by the type and its superclasses.
    async fn instance_fields(
        &self,
        key: &TypeKey,
        type_id: ReferenceTypeId,
        walk: &mut Walk,
    ) -> RcnResult<Vec<FieldDescriptor>> {
        let mut fields = Vec::new();
        let mut current = Some((key.clone(), type_id));
        let mut seen = HashSet::new();
        while let Some((key, type_id)) = current.take() {
            if !seen.insert(type_id) {
                break;
            }
            match self.members.members(type_id).await {
                Ok(members) => fields.extend(
                    members
                        .iter()
                        .filter_map(|member| member.as_field())
                        .filter(|field| !field.is_static)
                        .cloned(),
                ),
                Err(err) if err.is_connection() => return Err(err),
                Err(err) => walk.note(format!("fields of {key}: {err}")),
            }
            let node = self.resolver.resolve(type_id).await?;
            current = node
                .superclass
                .as_ref()
                .and_then(|superclass| Some((superclass.clone(), self.resolver.type_id_of(superclass)?)));
        }
        Ok(fields)
    }
}
