//! Raw type handles to [`TypeNode`]s.
//!
//! Nodes are cached per session by type id. A type id names exactly one
//! (loader, binary name) identity for as long as the type stays loaded.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use futures::{stream, StreamExt};
use parking_lot::Mutex;
use rcn_config::{MappingConfig, NestingCriterion};
use rcn_jdwp::{
    codec::binary_name_to_signature,
    types::{MODIFIER_ABSTRACT, MODIFIER_FINAL, MODIFIER_STATIC},
    ObjectId, ReferenceTypeId,
};

use crate::{
    debuggee::{Debuggee, TypeHeader, TypeMetadata},
    error::{RcnError, RcnResult},
    model::{Access, Linkage, Nesting, TypeKey, TypeKind, TypeNode, TypeRef, ValueType},
    names::{
        classify, parse_field_signature, parse_method_signature, signature_to_binary_name,
        type_rcn, unprepared_rcn, JavaType, LoaderKind, NameShape,
    },
};

/// Array supertypes, after `java.lang.Object`.
const ARRAY_INTERFACES: [&str; 2] = ["java.lang.Cloneable", "java.io.Serializable"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeIdentity {
    pub key: TypeKey,
    pub rcn: String,
}

/// A resolved node together with what it was built from.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub node: Arc<TypeNode>,
    /// `None` when the type was not prepared.
    pub metadata: Option<Arc<TypeMetadata>>,
    /// Supertypes, enclosing type and array component, for closure walks.
    pub related: Vec<ReferenceTypeId>,
}

/// The transitive closure of a set of types over their supertypes, enclosing
/// types and array components.
#[derive(Debug, Default)]
pub struct Closure {
    pub nodes: BTreeMap<TypeKey, Resolved>,
    pub failures: Vec<(ReferenceTypeId, RcnError)>,
}

type Slot = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug)]
struct Inner {
    debuggee: Debuggee,
    criterion: NestingCriterion,
    concurrency: usize,
    identities: Mutex<HashMap<ReferenceTypeId, TypeIdentity>>,
    ids: Mutex<HashMap<TypeKey, ReferenceTypeId>>,
    resolved: Mutex<HashMap<ReferenceTypeId, Resolved>>,
    slots: Mutex<HashMap<ReferenceTypeId, Slot>>,
    lookups: Mutex<HashMap<(Option<ObjectId>, String), Option<ReferenceTypeId>>>,
    visible: Mutex<HashMap<ObjectId, Arc<HashSet<ReferenceTypeId>>>>,
}

/// Cheap to clone; clones share one cache.
#[derive(Debug, Clone)]
pub struct TypeResolver {
    inner: Arc<Inner>,
}

impl TypeResolver {
    pub fn new(debuggee: Debuggee, config: &MappingConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                debuggee,
                criterion: config.nesting_criterion,
                concurrency: config.resolve_concurrency.max(1),
                identities: Mutex::default(),
                ids: Mutex::default(),
                resolved: Mutex::default(),
                slots: Mutex::default(),
                lookups: Mutex::default(),
                visible: Mutex::default(),
            }),
        }
    }

    pub fn debuggee(&self) -> &Debuggee {
        &self.inner.debuggee
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// The node for `type_id`, resolving it on first use.
    pub async fn resolve(&self, type_id: ReferenceTypeId) -> RcnResult<Arc<TypeNode>> {
        self.resolve_entry(type_id).await.map(|resolved| resolved.node)
    }

    /// Like [`TypeResolver::resolve`], but keeps the metadata the node was built from.
    ///
    /// Concurrent callers for one type serialize on a per-type slot and all
    /// observe the same node. Partial nodes are returned but not cached, so
    /// a later call retries.
    pub async fn resolve_entry(&self, type_id: ReferenceTypeId) -> RcnResult<Resolved> {
        if let Some(resolved) = self.inner.resolved.lock().get(&type_id) {
            return Ok(resolved.clone());
        }

        let slot = self.inner.slots.lock().entry(type_id).or_default().clone();
        let _guard = slot.lock().await;
        if let Some(resolved) = self.inner.resolved.lock().get(&type_id) {
            return Ok(resolved.clone());
        }

        self.inner.debuggee.check_connected()?;
        let resolved = self.build(type_id).await?;
        if resolved.node.is_partial() {
            tracing::debug!(
                target: "rcn.graph",
                type_id,
                name = %resolved.node.key.name,
                "type resolved partially"
            );
        } else {
            self.inner.resolved.lock().insert(type_id, resolved.clone());
        }
        Ok(resolved)
    }

    /// Cached node for a type identity, if it has been fully resolved.
    pub fn cached(&self, key: &TypeKey) -> Option<Arc<TypeNode>> {
        let type_id = *self.inner.ids.lock().get(key)?;
        self.inner
            .resolved
            .lock()
            .get(&type_id)
            .map(|resolved| resolved.node.clone())
    }

    pub fn type_id_of(&self, key: &TypeKey) -> Option<ReferenceTypeId> {
        self.inner.ids.lock().get(key).copied()
    }

    /// Loader and binary name of a type, plus its RCN. Cheaper than a full
    /// resolution and never fails on unprepared types.
    pub async fn identity(&self, type_id: ReferenceTypeId) -> RcnResult<TypeIdentity> {
        if let Some(identity) = self.inner.identities.lock().get(&type_id) {
            return Ok(identity.clone());
        }
        let header = self.inner.debuggee.type_header(type_id).await?;
        self.remember(&header).await
    }

    async fn remember(&self, header: &TypeHeader) -> RcnResult<TypeIdentity> {
        let system_loader = match self.inner.debuggee.system_loader().await {
            Ok(loader) => loader,
            Err(err) if err.is_connection() => return Err(err),
            Err(err) => {
                tracing::debug!(target: "rcn.graph", error = %err, "system loader unavailable");
                None
            }
        };
        let identity = TypeIdentity {
            key: TypeKey::new(header.loader, header.name.clone()),
            rcn: type_rcn(LoaderKind::of(header.loader, system_loader), &header.name),
        };
        self.inner
            .identities
            .lock()
            .insert(header.type_id, identity.clone());
        self.inner
            .ids
            .lock()
            .insert(identity.key.clone(), header.type_id);
        Ok(identity)
    }

    async fn build(&self, type_id: ReferenceTypeId) -> RcnResult<Resolved> {
        let metadata = match self.inner.debuggee.type_metadata(type_id).await {
            Ok(metadata) => Some(Arc::new(metadata)),
            Err(RcnError::UnresolvedType { .. }) => None,
            Err(err) => return Err(err),
        };
        let header = match &metadata {
            Some(metadata) => metadata.header.clone(),
            None => self.inner.debuggee.type_header(type_id).await?,
        };
        let identity = self.remember(&header).await?;
        let kind = header.kind();

        let mut partial = metadata.is_none();
        let mut related = Vec::new();
        let mut superclass = None;
        let mut interfaces = Vec::new();
        let mut component = None;
        let (mut nesting, mut enclosing) = (Nesting::TopLevel, None);

        if kind == TypeKind::Array {
            let component_type = parse_field_signature(&header.signature[1..]).ok_or_else(|| {
                RcnError::MalformedMetadata {
                    identity: header.name.clone(),
                    detail: format!("invalid array signature {:?}", header.signature),
                }
            })?;
            let component_type = self.java_type(header.loader, &component_type).await?;
            if let Some(key) = component_type.type_ref().and_then(TypeRef::key) {
                related.extend(self.type_id_of(key));
            }
            component = Some(component_type);

            match self.find_defined(None, "java.lang.Object").await? {
                Some((id, key)) => {
                    related.push(id);
                    superclass = Some(key);
                }
                None => partial = true,
            }
            for name in ARRAY_INTERFACES {
                match self.find_defined(None, name).await? {
                    Some((id, key)) => {
                        related.push(id);
                        interfaces.push(key);
                    }
                    None => partial = true,
                }
            }
        } else {
            if let Some(metadata) = &metadata {
                let supertypes = metadata.superclass.iter().chain(&metadata.interfaces);
                for &id in supertypes {
                    match self.identity(id).await {
                        Ok(identity) => {
                            related.push(id);
                            if Some(id) == metadata.superclass {
                                superclass = Some(identity.key);
                            } else {
                                interfaces.push(identity.key);
                            }
                        }
                        Err(err) if err.is_connection() => return Err(err),
                        Err(err) => {
                            tracing::debug!(
                                target: "rcn.graph",
                                type_id,
                                supertype = id,
                                error = %err,
                                "supertype unavailable"
                            );
                            partial = true;
                        }
                    }
                }
            }

            let (shape_nesting, outer) = self.nesting(&header, metadata.as_deref()).await?;
            nesting = shape_nesting;
            if let Some((outer_id, outer_key)) = outer {
                related.push(outer_id);
                enclosing = Some(outer_key);
            }
        }

        let linkage = if partial {
            Linkage::Loaded
        } else {
            Linkage::from_status(header.status)
        };
        let node = TypeNode {
            key: identity.key,
            type_id,
            rcn: identity.rcn,
            signature: header.signature.clone(),
            kind,
            access: Access::from_modifiers(header.modifiers),
            is_abstract: header.modifiers & MODIFIER_ABSTRACT != 0,
            is_final: header.modifiers & MODIFIER_FINAL != 0,
            nesting,
            superclass,
            interfaces,
            enclosing,
            component,
            linkage,
        };
        related.sort_unstable();
        related.dedup();
        Ok(Resolved {
            node: Arc::new(node),
            metadata,
            related,
        })
    }

    /// Nesting from the binary name, confirmed against the enclosing type's
    /// nested type list.
    async fn nesting(
        &self,
        header: &TypeHeader,
        metadata: Option<&TypeMetadata>,
    ) -> RcnResult<(Nesting, Option<(ReferenceTypeId, TypeKey)>)> {
        let (outer_name, shape) = match classify(&header.name) {
            NameShape::TopLevel | NameShape::Array { .. } => return Ok((Nesting::TopLevel, None)),
            NameShape::Member { outer } => (outer, Nesting::StaticMember),
            NameShape::Anonymous { outer } => (outer, Nesting::Anonymous),
            NameShape::Local { outer } => (outer, Nesting::Local),
        };

        let outer = self.find_defined(header.loader, outer_name).await?;
        if shape != Nesting::StaticMember {
            return Ok((shape, outer));
        }

        let confirmed = match &outer {
            Some((outer_id, _)) => match self.inner.debuggee.nested_types(*outer_id).await {
                Ok(nested) => nested.contains(&header.type_id),
                Err(err) if err.is_connection() => return Err(err),
                Err(_) => false,
            },
            None => false,
        };
        let is_static = header.modifiers & MODIFIER_STATIC != 0;

        let nesting = match (self.inner.criterion, confirmed, metadata) {
            (NestingCriterion::PreferModifier, true, _) | (_, _, None) => {
                if is_static {
                    Nesting::StaticMember
                } else {
                    Nesting::InstanceMember
                }
            }
            (_, _, Some(metadata)) => {
                if has_outer_instance(metadata, outer_name) {
                    Nesting::InstanceMember
                } else {
                    Nesting::StaticMember
                }
            }
        };
        Ok((nesting, outer))
    }

    /// The type named `name` whose defining loader is `loader`.
    async fn find_defined(
        &self,
        loader: Option<ObjectId>,
        name: &str,
    ) -> RcnResult<Option<(ReferenceTypeId, TypeKey)>> {
        let candidates = self.inner.debuggee.classes_by_name(name).await?;
        for candidate in candidates {
            match self.identity(candidate.type_id).await {
                Ok(identity) if identity.key.loader == loader => {
                    return Ok(Some((candidate.type_id, identity.key)));
                }
                Ok(_) => {}
                Err(err) if err.is_connection() => return Err(err),
                // Unloaded between the two requests.
                Err(_) => {}
            }
        }
        Ok(None)
    }

    /// The type named `name` as seen from code defined by `loader`.
    pub async fn find_type(
        &self,
        loader: Option<ObjectId>,
        name: &str,
    ) -> RcnResult<Option<ReferenceTypeId>> {
        let cache_key = (loader, name.to_owned());
        if let Some(found) = self.inner.lookups.lock().get(&cache_key) {
            return Ok(*found);
        }

        let found = match loader {
            None => self.find_defined(None, name).await?.map(|(id, _)| id),
            Some(loader) => {
                let candidates = self.inner.debuggee.classes_by_name(name).await?;
                if candidates.is_empty() {
                    None
                } else {
                    let visible = self.visible_from(loader).await?;
                    candidates
                        .iter()
                        .map(|candidate| candidate.type_id)
                        .find(|id| visible.contains(id))
                }
            }
        };
        self.inner.lookups.lock().insert(cache_key, found);
        Ok(found)
    }

    async fn visible_from(&self, loader: ObjectId) -> RcnResult<Arc<HashSet<ReferenceTypeId>>> {
        if let Some(visible) = self.inner.visible.lock().get(&loader) {
            return Ok(visible.clone());
        }
        let visible = match self.inner.debuggee.visible_classes(loader).await {
            Ok(types) => Arc::new(types.into_iter().collect::<HashSet<_>>()),
            Err(err) if err.is_connection() => return Err(err),
            Err(err) => {
                tracing::debug!(target: "rcn.graph", loader, error = %err, "loader unavailable");
                Arc::default()
            }
        };
        self.inner.visible.lock().insert(loader, visible.clone());
        Ok(visible)
    }

    /// Resolves a type from a signature against `loader`. Reference types the
    /// loader cannot see become [`TypeRef::Unprepared`].
    pub async fn java_type(&self, loader: Option<ObjectId>, ty: &JavaType) -> RcnResult<ValueType> {
        let name = match ty {
            JavaType::Void => return Ok(ValueType::Void),
            JavaType::Primitive(keyword) => return Ok(ValueType::Primitive((*keyword).to_owned())),
            JavaType::Reference(name) => name,
        };
        let reference = match self.find_type(loader, name).await? {
            Some(type_id) => {
                let identity = self.identity(type_id).await?;
                TypeRef::Loaded {
                    key: identity.key,
                    rcn: identity.rcn,
                }
            }
            None => TypeRef::Unprepared {
                name: name.clone(),
                rcn: unprepared_rcn(name),
            },
        };
        Ok(ValueType::Reference(reference))
    }

    pub async fn value_type(&self, loader: Option<ObjectId>, signature: &str) -> RcnResult<ValueType> {
        let ty = parse_field_signature(signature).ok_or_else(|| RcnError::MalformedMetadata {
            identity: signature.to_owned(),
            detail: "invalid field signature".to_owned(),
        })?;
        self.java_type(loader, &ty).await
    }

    /// Parameter and return types of a method signature.
    pub async fn method_types(
        &self,
        loader: Option<ObjectId>,
        signature: &str,
    ) -> RcnResult<(Vec<ValueType>, ValueType)> {
        let (params, ret) =
            parse_method_signature(signature).ok_or_else(|| RcnError::MalformedMetadata {
                identity: signature.to_owned(),
                detail: "invalid method signature".to_owned(),
            })?;
        let mut parameters = Vec::with_capacity(params.len());
        for param in &params {
            parameters.push(self.java_type(loader, param).await?);
        }
        Ok((parameters, self.java_type(loader, &ret).await?))
    }

    /// Resolves `roots` and, breadth first, everything they relate to.
    ///
    /// Failures local to one type are collected; a lost connection aborts.
    pub async fn resolve_closure(
        &self,
        roots: impl IntoIterator<Item = ReferenceTypeId>,
    ) -> RcnResult<Closure> {
        let mut seen = HashSet::new();
        let mut frontier = roots
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect::<Vec<_>>();
        let mut closure = Closure::default();

        while !frontier.is_empty() {
            let results = stream::iter(std::mem::take(&mut frontier).into_iter().map(|type_id| {
                let resolver = self.clone();
                async move { (type_id, resolver.resolve_entry(type_id).await) }
            }))
            .buffer_unordered(self.inner.concurrency)
            .collect::<Vec<_>>()
            .await;

            for (type_id, result) in results {
                match result {
                    Ok(resolved) => {
                        frontier.extend(resolved.related.iter().copied().filter(|id| seen.insert(*id)));
                        closure.nodes.insert(resolved.node.key.clone(), resolved);
                    }
                    Err(err) if err.is_connection() => return Err(err),
                    Err(err) => closure.failures.push((type_id, err)),
                }
            }
        }

        closure.failures.sort_by_key(|(type_id, _)| *type_id);
        Ok(closure)
    }

    /// Drops name lookups so newly loaded types become visible.
    pub fn refresh_lookups(&self) {
        self.inner.lookups.lock().clear();
        self.inner.visible.lock().clear();
    }

    /// Drops a cached node whose linkage no longer matches `status`, so the
    /// next resolution sees the initialized type.
    pub fn refresh_status(&self, type_id: ReferenceTypeId, status: u32) -> bool {
        let stale = self
            .inner
            .resolved
            .lock()
            .get(&type_id)
            .is_some_and(|resolved| resolved.node.linkage != Linkage::from_status(status));
        if stale {
            self.inner.resolved.lock().remove(&type_id);
        }
        stale
    }

    /// Forgets every cached type.
    pub fn clear(&self) {
        self.inner.identities.lock().clear();
        self.inner.ids.lock().clear();
        self.inner.resolved.lock().clear();
        self.inner.slots.lock().clear();
        self.refresh_lookups();
    }

    /// Forgets everything cached about an unloaded type.
    pub fn forget(&self, type_id: ReferenceTypeId) {
        if let Some(identity) = self.inner.identities.lock().remove(&type_id) {
            self.inner.ids.lock().remove(&identity.key);
        }
        self.inner.resolved.lock().remove(&type_id);
        self.inner.slots.lock().remove(&type_id);
        self.refresh_lookups();
    }

    /// Forgets every type with the given signature; class unload events
    /// carry no type id.
    pub fn forget_signature(&self, signature: &str) -> Vec<TypeKey> {
        let Some(name) = signature_to_binary_name(signature) else {
            return Vec::new();
        };
        let forgotten = self
            .inner
            .identities
            .lock()
            .iter()
            .filter(|(_, identity)| identity.key.name == name)
            .map(|(id, identity)| (*id, identity.key.clone()))
            .collect::<Vec<_>>();
        for (type_id, _) in &forgotten {
            self.forget(*type_id);
        }
        self.refresh_lookups();
        forgotten.into_iter().map(|(_, key)| key).collect()
    }
}

/// The compiler's marks of an inner class: a `this$N` field of the outer
/// type, or an outer instance as first parameter of every constructor.
fn has_outer_instance(metadata: &TypeMetadata, outer: &str) -> bool {
    let outer_signature = binary_name_to_signature(outer);
    let outer_field = metadata
        .fields
        .iter()
        .any(|field| field.name.starts_with("this$") && field.signature == outer_signature);
    if outer_field {
        return true;
    }

    let mut constructors = metadata
        .methods
        .iter()
        .filter(|method| method.name == "<init>")
        .peekable();
    constructors.peek().is_some()
        && constructors.all(|ctor| {
            ctor.signature
                .strip_prefix('(')
                .is_some_and(|params| params.starts_with(outer_signature.as_str()))
        })
}
