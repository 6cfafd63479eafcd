use std::{future::Future, net::SocketAddr, sync::Arc};

use rcn_config::JdwpConfig;
use rcn_jdwp::{
    codec::binary_name_to_signature,
    types::{
        CLASS_STATUS_PREPARED, ERROR_ABSENT_INFORMATION, ERROR_INVALID_OBJECT,
        EVENT_KIND_CLASS_PREPARE, EVENT_KIND_CLASS_UNLOAD, MODIFIER_INTERFACE,
        SUSPEND_POLICY_NONE,
    },
    ClassInfo, FieldId, FieldInfo, JdwpClient, JdwpError, JdwpEvent, JdwpValue, LineTable,
    Location, MethodId, MethodInfo, ObjectId, ReferenceTypeId, ThreadId, VariableInfo,
};
use tokio::sync::{broadcast, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{RcnError, RcnResult, Subject},
    model::TypeKind,
    names::signature_to_binary_name,
};

async fn cancellable_jdwp<T, F>(token: &CancellationToken, fut: F) -> Result<T, JdwpError>
where
    F: Future<Output = Result<T, JdwpError>>,
{
    tokio::select! {
        _ = token.cancelled() => Err(JdwpError::Cancelled),
        res = fut => res,
    }
}

/// What every loaded type reports, prepared or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeHeader {
    pub type_id: ReferenceTypeId,
    pub signature: String,
    pub name: String,
    /// `None` for the bootstrap loader.
    pub loader: Option<ObjectId>,
    pub modifiers: u32,
    pub status: u32,
}

impl TypeHeader {
    pub fn kind(&self) -> TypeKind {
        if self.signature.starts_with('[') {
            TypeKind::Array
        } else if self.modifiers & MODIFIER_INTERFACE != 0 {
            TypeKind::Interface
        } else {
            TypeKind::Class
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.status & CLASS_STATUS_PREPARED != 0
    }
}

/// Reflective metadata of a prepared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMetadata {
    pub header: TypeHeader,
    pub superclass: Option<ReferenceTypeId>,
    pub interfaces: Vec<ReferenceTypeId>,
    pub nested: Vec<ReferenceTypeId>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
}

/// A local variable in scope in a suspended frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameLocal {
    pub variable: VariableInfo,
    pub value: JdwpValue,
    /// The method declares more than one variable with this name.
    pub ambiguous: bool,
}

/// Compiler-emitted debug tables of one method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodDebugInfo {
    /// Variables in slots below this are the method's parameters.
    pub argument_slots: u32,
    pub variables: Option<Vec<VariableInfo>>,
    pub lines: Option<LineTable>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameSeeds {
    pub location: Location,
    pub this_object: Option<ObjectId>,
    pub locals: Vec<FrameLocal>,
}

/// Class prepare/unload notifications for one session.
#[derive(Debug)]
pub struct ClassEvents {
    pub events: broadcast::Receiver<JdwpEvent>,
    requests: Vec<(u8, i32)>,
}

/// Read-only view of the debuggee.
///
/// Wraps the protocol client, races every request against the session's
/// shutdown token and maps protocol failures onto [`RcnError`].
#[derive(Clone, Debug)]
pub struct Debuggee {
    client: JdwpClient,
    cancel: CancellationToken,
    system_loader: Arc<OnceCell<Option<ObjectId>>>,
}

impl Debuggee {
    pub async fn attach(addr: SocketAddr, config: &JdwpConfig) -> RcnResult<Self> {
        let client = JdwpClient::connect_with_config(addr, config.client_config())
            .await
            .map_err(RcnError::Connection)?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: JdwpClient) -> Self {
        Self {
            cancel: client.shutdown_token(),
            client,
            system_loader: Arc::default(),
        }
    }

    pub fn client(&self) -> &JdwpClient {
        &self.client
    }

    /// Fires once the session is gone.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn check_connected(&self) -> RcnResult<()> {
        if self.cancel.is_cancelled() {
            Err(RcnError::closed())
        } else {
            Ok(())
        }
    }

    async fn request<T, F>(&self, fut: F, subject: Subject<'_>) -> RcnResult<T>
    where
        F: Future<Output = Result<T, JdwpError>>,
    {
        cancellable_jdwp(&self.cancel, fut)
            .await
            .map_err(|err| RcnError::from_jdwp(err, subject))
    }

    /// Like [`Debuggee::request`], with `ABSENT_INFORMATION` as `None`.
    async fn optional<T, F>(&self, fut: F, subject: Subject<'_>) -> RcnResult<Option<T>>
    where
        F: Future<Output = Result<T, JdwpError>>,
    {
        match cancellable_jdwp(&self.cancel, fut).await {
            Ok(value) => Ok(Some(value)),
            Err(JdwpError::VmError(ERROR_ABSENT_INFORMATION)) => Ok(None),
            Err(err) => Err(RcnError::from_jdwp(err, subject)),
        }
    }

    /// Every type the VM has loaded, in VM order.
    pub async fn list_loaded_types(&self) -> RcnResult<Vec<ClassInfo>> {
        cancellable_jdwp(&self.cancel, self.client.all_classes())
            .await
            .map_err(|err| RcnError::from_jdwp(err, Subject::Type("<all classes>")))
    }

    pub async fn type_header(&self, type_id: ReferenceTypeId) -> RcnResult<TypeHeader> {
        let subject = Subject::TypeId(type_id);
        let (signature, loader, modifiers, status) = tokio::try_join!(
            self.request(self.client.reference_type_signature(type_id), subject),
            self.request(self.client.reference_type_class_loader(type_id), subject),
            self.request(self.client.reference_type_modifiers(type_id), subject),
            self.request(self.client.reference_type_status(type_id), subject),
        )?;
        let name = signature_to_binary_name(&signature).ok_or_else(|| {
            RcnError::malformed(subject, format!("invalid type signature {signature:?}"))
        })?;
        Ok(TypeHeader {
            type_id,
            signature,
            name,
            loader: (loader != 0).then_some(loader),
            modifiers,
            status,
        })
    }

    /// Full metadata of a type. Fails with [`RcnError::UnresolvedType`] when
    /// the type is loaded but not prepared.
    pub async fn type_metadata(&self, type_id: ReferenceTypeId) -> RcnResult<TypeMetadata> {
        let header = self.type_header(type_id).await?;
        let kind = header.kind();
        if kind == TypeKind::Array {
            // Arrays declare no members; their supertypes are fixed by the language.
            return Ok(TypeMetadata {
                header,
                superclass: None,
                interfaces: Vec::new(),
                nested: Vec::new(),
                fields: Vec::new(),
                methods: Vec::new(),
            });
        }
        if !header.is_prepared() {
            return Err(RcnError::UnresolvedType {
                identity: header.name,
            });
        }

        let subject = Subject::Type(&header.name);
        let superclass = async {
            if kind != TypeKind::Class {
                return Ok::<_, RcnError>(None);
            }
            let id = self
                .request(self.client.class_type_superclass(type_id), subject)
                .await?;
            Ok((id != 0).then_some(id))
        };
        let (superclass, interfaces, nested, fields, methods) = tokio::try_join!(
            superclass,
            self.request(self.client.reference_type_interfaces(type_id), subject),
            self.request(self.client.reference_type_nested_types(type_id), subject),
            self.request(self.client.reference_type_fields(type_id), subject),
            self.request(self.client.reference_type_methods(type_id), subject),
        )?;

        Ok(TypeMetadata {
            superclass,
            interfaces,
            nested: nested.into_iter().map(|(_, id)| id).collect(),
            fields,
            methods,
            header,
        })
    }

    /// Member types the VM lists for `type_id`.
    pub async fn nested_types(&self, type_id: ReferenceTypeId) -> RcnResult<Vec<ReferenceTypeId>> {
        self.request(
            self.client.reference_type_nested_types(type_id),
            Subject::TypeId(type_id),
        )
        .await
        .map(|types| types.into_iter().map(|(_, id)| id).collect())
    }

    /// Instance field values; fails with [`RcnError::StaleReference`] once the
    /// object is collected.
    pub async fn field_values(
        &self,
        object_id: ObjectId,
        fields: &[FieldId],
    ) -> RcnResult<Vec<JdwpValue>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let values = self
            .request(
                self.client.object_reference_get_values(object_id, fields),
                Subject::Object(object_id),
            )
            .await?;
        expect_len(values, fields.len(), Subject::Object(object_id))
    }

    pub async fn field_value(&self, object_id: ObjectId, field: FieldId) -> RcnResult<JdwpValue> {
        let mut values = self.field_values(object_id, &[field]).await?;
        values
            .pop()
            .ok_or_else(|| RcnError::malformed(Subject::Object(object_id), "empty reply"))
    }

    pub async fn static_values(
        &self,
        type_id: ReferenceTypeId,
        fields: &[FieldId],
    ) -> RcnResult<Vec<JdwpValue>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let values = self
            .request(
                self.client.reference_type_get_values(type_id, fields),
                Subject::TypeId(type_id),
            )
            .await?;
        expect_len(values, fields.len(), Subject::TypeId(type_id))
    }

    pub async fn runtime_type(&self, object_id: ObjectId) -> RcnResult<ReferenceTypeId> {
        self.request(
            self.client.object_reference_reference_type(object_id),
            Subject::Object(object_id),
        )
        .await
        .map(|(_, type_id)| type_id)
    }

    pub async fn string_value(&self, object_id: ObjectId) -> RcnResult<String> {
        self.request(
            self.client.string_reference_value(object_id),
            Subject::Object(object_id),
        )
        .await
    }

    pub async fn array_length(&self, object_id: ObjectId) -> RcnResult<usize> {
        let length = self
            .request(
                self.client.array_reference_length(object_id),
                Subject::Object(object_id),
            )
            .await?;
        usize::try_from(length).map_err(|_| {
            RcnError::malformed(Subject::Object(object_id), format!("negative length {length}"))
        })
    }

    pub async fn array_values(
        &self,
        object_id: ObjectId,
        first: usize,
        length: usize,
    ) -> RcnResult<Vec<JdwpValue>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let subject = Subject::Object(object_id);
        let (Ok(first), Ok(count)) = (i32::try_from(first), i32::try_from(length)) else {
            return Err(RcnError::malformed(subject, "array range out of bounds"));
        };
        let values = self
            .request(
                self.client.array_reference_get_values(object_id, first, count),
                subject,
            )
            .await?;
        expect_len(values, length, subject)
    }

    pub async fn is_collected(&self, object_id: ObjectId) -> RcnResult<bool> {
        match cancellable_jdwp(
            &self.cancel,
            self.client.object_reference_is_collected(object_id),
        )
        .await
        {
            Ok(collected) => Ok(collected),
            Err(JdwpError::VmError(ERROR_INVALID_OBJECT)) => Ok(true),
            Err(err) => Err(RcnError::from_jdwp(err, Subject::Object(object_id))),
        }
    }

    /// Types for which `loader` is an initiating loader (including those it
    /// delegated to its parents).
    pub async fn visible_classes(&self, loader: ObjectId) -> RcnResult<Vec<ReferenceTypeId>> {
        self.request(
            self.client.class_loader_visible_classes(loader),
            Subject::Object(loader),
        )
        .await
        .map(|types| types.into_iter().map(|(_, id)| id).collect())
    }

    /// Loaded types with the given binary name, across all loaders.
    pub async fn classes_by_name(&self, name: &str) -> RcnResult<Vec<ClassInfo>> {
        let signature = binary_name_to_signature(name);
        self.request(
            self.client.classes_by_signature(&signature),
            Subject::Type(name),
        )
        .await
    }

    /// The application class loader, read from `java.lang.ClassLoader.scl`.
    ///
    /// `None` until the VM has initialized it. Only a successful lookup is
    /// cached.
    pub async fn system_loader(&self) -> RcnResult<Option<ObjectId>> {
        if let Some(loader) = self.system_loader.get() {
            return Ok(*loader);
        }
        let loader = self.read_system_loader().await?;
        if loader.is_some() {
            let _ = self.system_loader.set(loader);
        }
        Ok(loader)
    }

    async fn read_system_loader(&self) -> RcnResult<Option<ObjectId>> {
        let candidates = self.classes_by_name("java.lang.ClassLoader").await?;
        for candidate in candidates {
            if candidate.status & CLASS_STATUS_PREPARED == 0 {
                continue;
            }
            let subject = Subject::Type("java.lang.ClassLoader");
            let loader = self
                .request(
                    self.client.reference_type_class_loader(candidate.type_id),
                    subject,
                )
                .await?;
            if loader != 0 {
                continue;
            }
            let fields = self
                .request(self.client.reference_type_fields(candidate.type_id), subject)
                .await?;
            let Some(scl) = fields.iter().find(|field| field.name == "scl") else {
                return Ok(None);
            };
            let values = self
                .static_values(candidate.type_id, &[scl.field_id])
                .await?;
            return Ok(values.first().and_then(JdwpValue::object_id));
        }
        Ok(None)
    }

    /// Source file name of a type, `None` when it was compiled without one.
    pub async fn source_file(&self, type_id: ReferenceTypeId) -> RcnResult<Option<String>> {
        self.optional(
            self.client.reference_type_source_file(type_id),
            Subject::TypeId(type_id),
        )
        .await
    }

    /// Variable and line tables of a method. Either is `None` when the method
    /// was compiled without it; abstract and native methods have neither.
    pub async fn method_debug_info(
        &self,
        type_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> RcnResult<MethodDebugInfo> {
        let subject = Subject::TypeId(type_id);
        let (variables, lines) = tokio::try_join!(
            self.optional(self.client.method_variable_table(type_id, method_id), subject),
            self.optional(self.client.method_line_table(type_id, method_id), subject),
        )?;
        let (argument_slots, variables) = match variables {
            Some((slots, variables)) => (slots, Some(variables)),
            None => (0, None),
        };
        Ok(MethodDebugInfo {
            argument_slots,
            variables,
            lines,
        })
    }

    /// `this` and the live locals of every frame of a suspended thread.
    ///
    /// Frames of methods compiled without a variable table contribute only
    /// their `this` object.
    pub async fn stack_seeds(&self, thread: ThreadId) -> RcnResult<Vec<FrameSeeds>> {
        let subject = Subject::Object(thread);
        let frames = self.request(self.client.frames(thread, 0, -1), subject).await?;

        let mut seeds = Vec::with_capacity(frames.len());
        for frame in frames {
            let this_object = self
                .request(
                    self.client.stack_frame_this_object(thread, frame.frame_id),
                    subject,
                )
                .await?;

            let location = frame.location;
            let variables = self
                .optional(
                    self.client
                        .method_variable_table(location.class_id, location.method_id),
                    Subject::TypeId(location.class_id),
                )
                .await?
                .map(|(_, variables)| variables)
                .unwrap_or_default();

            let live = variables
                .iter()
                .filter(|var| var.is_live_at(location.index))
                .cloned()
                .collect::<Vec<_>>();
            let slots = live
                .iter()
                .map(|var| (var.slot, var.signature.clone()))
                .collect::<Vec<_>>();
            let values = if slots.is_empty() {
                Vec::new()
            } else {
                let values = self
                    .request(
                        self.client
                            .stack_frame_get_values(thread, frame.frame_id, &slots),
                        subject,
                    )
                    .await?;
                expect_len(values, slots.len(), subject)?
            };

            let locals = live
                .into_iter()
                .zip(values)
                .map(|(variable, value)| FrameLocal {
                    ambiguous: variables
                        .iter()
                        .filter(|other| other.name == variable.name)
                        .count()
                        > 1,
                    variable,
                    value,
                })
                .collect();

            seeds.push(FrameSeeds {
                location,
                this_object: (this_object != 0).then_some(this_object),
                locals,
            });
        }
        Ok(seeds)
    }

    pub async fn suspend(&self) -> RcnResult<()> {
        self.request(self.client.vm_suspend(), Subject::Type("<vm>"))
            .await
    }

    pub async fn resume(&self) -> RcnResult<()> {
        self.request(self.client.vm_resume(), Subject::Type("<vm>"))
            .await
    }

    /// Requests class prepare and unload events. The receiver subscribes
    /// before the requests are set, so no event is missed.
    pub async fn watch_class_events(&self) -> RcnResult<ClassEvents> {
        let events = self.client.subscribe_events();
        let mut requests = Vec::with_capacity(2);
        for kind in [EVENT_KIND_CLASS_PREPARE, EVENT_KIND_CLASS_UNLOAD] {
            let request_id = self
                .request(
                    self.client
                        .event_request_set(kind, SUSPEND_POLICY_NONE, Vec::new()),
                    Subject::Type("<event request>"),
                )
                .await?;
            requests.push((kind, request_id));
        }
        Ok(ClassEvents { events, requests })
    }

    pub async fn clear_class_events(&self, events: ClassEvents) -> RcnResult<()> {
        for (kind, request_id) in events.requests {
            self.request(
                self.client.event_request_clear(kind, request_id),
                Subject::Type("<event request>"),
            )
            .await?;
        }
        Ok(())
    }
}

fn expect_len<T>(values: Vec<T>, expected: usize, subject: Subject<'_>) -> RcnResult<Vec<T>> {
    if values.len() == expected {
        Ok(values)
    } else {
        Err(RcnError::malformed(
            subject,
            format!("expected {expected} values, got {}", values.len()),
        ))
    }
}
