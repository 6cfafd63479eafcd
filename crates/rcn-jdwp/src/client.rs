use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{broadcast, oneshot, Mutex, Semaphore},
};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{
        encode_command, signature_to_tag, JdwpReader, JdwpWriter, PacketHeader, EVENT_COMMAND,
        HANDSHAKE, HEADER_LEN,
    },
    types::{
        ClassInfo, FieldId, FieldInfo, FrameId, FrameInfo, JdwpError, JdwpEvent, JdwpIdSizes,
        JdwpValue, LineTable, Location, MethodId, MethodInfo, ObjectId, ReferenceTypeId, Result,
        ThreadId, VariableInfo, EVENT_KIND_BREAKPOINT, EVENT_KIND_CLASS_PREPARE, EVENT_KIND_CLASS_UNLOAD,
        EVENT_KIND_VM_DEATH, EVENT_KIND_VM_START,
    },
};

#[derive(Debug, Clone)]
pub struct JdwpClientConfig {
    pub handshake_timeout: Duration,
    pub reply_timeout: Duration,
    /// Upper bound on correlated requests awaiting a reply at the same time.
    pub max_in_flight: usize,
    pub event_channel_size: usize,
}

impl Default for JdwpClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(10),
            max_in_flight: 32,
            event_channel_size: 64,
        }
    }
}

#[derive(Debug)]
struct Reply {
    error_code: u16,
    payload: Vec<u8>,
}

type PendingReplies = HashMap<u32, oneshot::Sender<std::result::Result<Reply, JdwpError>>>;

#[derive(Debug)]
struct Inner {
    writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    pending: Mutex<PendingReplies>,
    in_flight: Semaphore,
    next_id: AtomicU32,
    id_sizes: Mutex<JdwpIdSizes>,
    events: broadcast::Sender<JdwpEvent>,
    shutdown: CancellationToken,
    config: JdwpClientConfig,
}

/// A JDWP session.
///
/// Cloning is cheap; all clones share one connection. Every request carries a
/// fresh correlation id and a single reader task routes replies back to their
/// caller, so requests may be issued concurrently from many tasks.
#[derive(Clone, Debug)]
pub struct JdwpClient {
    inner: Arc<Inner>,
}

impl JdwpClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_config(addr, JdwpClientConfig::default()).await
    }

    pub async fn connect_with_config(addr: SocketAddr, config: JdwpClientConfig) -> Result<Self> {
        let mut stream = tokio::time::timeout(config.handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| JdwpError::Timeout)??;
        let _ = stream.set_nodelay(true);

        tokio::time::timeout(config.handshake_timeout, stream.write_all(HANDSHAKE))
            .await
            .map_err(|_| JdwpError::Timeout)??;

        let mut handshake = [0u8; HANDSHAKE.len()];
        tokio::time::timeout(config.handshake_timeout, stream.read_exact(&mut handshake))
            .await
            .map_err(|_| JdwpError::Timeout)??;

        if handshake != *HANDSHAKE {
            return Err(JdwpError::Protocol(format!(
                "invalid handshake reply: {:?}",
                String::from_utf8_lossy(&handshake)
            )));
        }

        let (reader, writer) = stream.into_split();
        let (events, _) = broadcast::channel(config.event_channel_size.max(1));

        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            next_id: AtomicU32::new(1),
            id_sizes: Mutex::new(JdwpIdSizes::default()),
            events,
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(read_loop(reader, inner.clone()));

        let client = Self { inner };
        // ID sizes are required for correct parsing of most replies/events.
        let sizes = client.idsizes().await?;
        tracing::debug!(target: "rcn.jdwp", %addr, ?sizes, "attached to debuggee");
        // Capabilities are not strictly required; older VMs may not implement them.
        if let Err(err) = client.capabilities_new().await {
            if err.is_fatal() {
                return Err(err);
            }
            tracing::debug!(target: "rcn.jdwp", error = %err, "CapabilitiesNew unavailable");
        }

        Ok(client)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Cancelled when the session ends, either through [`JdwpClient::shutdown`]
    /// or because the connection closed.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<JdwpEvent> {
        self.inner.events.subscribe()
    }

    async fn send_command_raw(
        &self,
        command_set: u8,
        command: u8,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(JdwpError::ConnectionClosed);
        }

        let _permit = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Err(JdwpError::ConnectionClosed),
            permit = self.inner.in_flight.acquire() => {
                permit.map_err(|_| JdwpError::ConnectionClosed)?
            }
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let packet = encode_command(id, command_set, command, &payload);
        let written = {
            let mut writer = self.inner.writer.lock().await;
            writer.write_all(&packet).await
        };
        if let Err(err) = written {
            self.remove_pending(id).await;
            return Err(err.into());
        }

        let reply = tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                self.remove_pending(id).await;
                return Err(JdwpError::ConnectionClosed);
            }
            res = tokio::time::timeout(self.inner.config.reply_timeout, rx) => {
                match res {
                    Ok(Ok(r)) => r,
                    Ok(Err(_closed)) => return Err(JdwpError::ConnectionClosed),
                    Err(_elapsed) => {
                        self.remove_pending(id).await;
                        tracing::warn!(
                            target: "rcn.jdwp",
                            command_set,
                            command,
                            "timed out waiting for reply"
                        );
                        return Err(JdwpError::Timeout);
                    }
                }
            }
        }?;

        if reply.error_code != 0 {
            return Err(JdwpError::VmError(reply.error_code));
        }

        Ok(reply.payload)
    }

    async fn remove_pending(&self, id: u32) {
        self.inner.pending.lock().await.remove(&id);
    }

    async fn id_sizes(&self) -> JdwpIdSizes {
        *self.inner.id_sizes.lock().await
    }

    /// VirtualMachine.IDSizes (1, 7)
    pub async fn idsizes(&self) -> Result<JdwpIdSizes> {
        let payload = self.send_command_raw(1, 7, Vec::new()).await?;
        let mut r = JdwpReader::new(&payload);
        let sizes = JdwpIdSizes {
            field_id: r.read_u32()? as usize,
            method_id: r.read_u32()? as usize,
            object_id: r.read_u32()? as usize,
            reference_type_id: r.read_u32()? as usize,
            frame_id: r.read_u32()? as usize,
        };
        *self.inner.id_sizes.lock().await = sizes;
        Ok(sizes)
    }

    /// VirtualMachine.CapabilitiesNew (1, 17)
    ///
    /// Returns the raw capability booleans in wire order.
    pub async fn capabilities_new(&self) -> Result<Vec<bool>> {
        let payload = self.send_command_raw(1, 17, Vec::new()).await?;
        let mut r = JdwpReader::new(&payload);
        let mut caps = Vec::with_capacity(r.remaining());
        while r.remaining() > 0 {
            caps.push(r.read_bool()?);
        }
        Ok(caps)
    }

    /// VirtualMachine.AllClasses (1, 3)
    pub async fn all_classes(&self) -> Result<Vec<ClassInfo>> {
        let payload = self.send_command_raw(1, 3, Vec::new()).await?;
        let sizes = self.id_sizes().await;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_count()?;
        let mut classes = Vec::with_capacity(count);
        for _ in 0..count {
            classes.push(ClassInfo {
                ref_type_tag: r.read_u8()?,
                type_id: r.read_reference_type_id(&sizes)?,
                signature: r.read_string()?,
                status: r.read_u32()?,
            });
        }
        Ok(classes)
    }

    /// VirtualMachine.ClassesBySignature (1, 2)
    pub async fn classes_by_signature(&self, signature: &str) -> Result<Vec<ClassInfo>> {
        let mut w = JdwpWriter::new();
        w.write_string(signature);
        let payload = self.send_command_raw(1, 2, w.into_vec()).await?;
        let sizes = self.id_sizes().await;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_count()?;
        let mut classes = Vec::with_capacity(count);
        for _ in 0..count {
            classes.push(ClassInfo {
                ref_type_tag: r.read_u8()?,
                type_id: r.read_reference_type_id(&sizes)?,
                signature: signature.to_string(),
                status: r.read_u32()?,
            });
        }
        Ok(classes)
    }

    /// VirtualMachine.AllThreads (1, 4)
    pub async fn all_threads(&self) -> Result<Vec<ThreadId>> {
        let payload = self.send_command_raw(1, 4, Vec::new()).await?;
        let sizes = self.id_sizes().await;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_count()?;
        let mut threads = Vec::with_capacity(count);
        for _ in 0..count {
            threads.push(r.read_object_id(&sizes)?);
        }
        Ok(threads)
    }

    /// VirtualMachine.Suspend (1, 8)
    pub async fn vm_suspend(&self) -> Result<()> {
        self.send_command_raw(1, 8, Vec::new()).await.map(drop)
    }

    /// VirtualMachine.Resume (1, 9)
    pub async fn vm_resume(&self) -> Result<()> {
        self.send_command_raw(1, 9, Vec::new()).await.map(drop)
    }

    async fn reference_type_command(
        &self,
        command: u8,
        type_id: ReferenceTypeId,
    ) -> Result<(Vec<u8>, JdwpIdSizes)> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(type_id, &sizes);
        let payload = self.send_command_raw(2, command, w.into_vec()).await?;
        Ok((payload, sizes))
    }

    /// ReferenceType.Signature (2, 1)
    pub async fn reference_type_signature(&self, type_id: ReferenceTypeId) -> Result<String> {
        let (payload, _) = self.reference_type_command(1, type_id).await?;
        JdwpReader::new(&payload).read_string()
    }

    /// ReferenceType.ClassLoader (2, 2). `0` is the bootstrap loader.
    pub async fn reference_type_class_loader(&self, type_id: ReferenceTypeId) -> Result<ObjectId> {
        let (payload, sizes) = self.reference_type_command(2, type_id).await?;
        JdwpReader::new(&payload).read_object_id(&sizes)
    }

    /// ReferenceType.Modifiers (2, 3)
    pub async fn reference_type_modifiers(&self, type_id: ReferenceTypeId) -> Result<u32> {
        let (payload, _) = self.reference_type_command(3, type_id).await?;
        JdwpReader::new(&payload).read_u32()
    }

    /// ReferenceType.Fields (2, 4)
    pub async fn reference_type_fields(&self, type_id: ReferenceTypeId) -> Result<Vec<FieldInfo>> {
        let (payload, sizes) = self.reference_type_command(4, type_id).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_count()?;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            fields.push(FieldInfo {
                field_id: r.read_id(sizes.field_id)?,
                name: r.read_string()?,
                signature: r.read_string()?,
                mod_bits: r.read_u32()?,
            });
        }
        Ok(fields)
    }

    /// ReferenceType.Methods (2, 5)
    pub async fn reference_type_methods(
        &self,
        type_id: ReferenceTypeId,
    ) -> Result<Vec<MethodInfo>> {
        let (payload, sizes) = self.reference_type_command(5, type_id).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_count()?;
        let mut methods = Vec::with_capacity(count);
        for _ in 0..count {
            methods.push(MethodInfo {
                method_id: r.read_id(sizes.method_id)?,
                name: r.read_string()?,
                signature: r.read_string()?,
                mod_bits: r.read_u32()?,
            });
        }
        Ok(methods)
    }

    /// ReferenceType.GetValues (2, 6): values of static fields.
    pub async fn reference_type_get_values(
        &self,
        type_id: ReferenceTypeId,
        field_ids: &[FieldId],
    ) -> Result<Vec<JdwpValue>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(type_id, &sizes);
        w.write_u32(field_ids.len() as u32);
        for field_id in field_ids {
            w.write_id(*field_id, sizes.field_id);
        }
        let payload = self.send_command_raw(2, 6, w.into_vec()).await?;
        read_tagged_values(&payload, &sizes)
    }

    /// ReferenceType.SourceFile (2, 7). Fails with `ABSENT_INFORMATION` when
    /// the type was compiled without it.
    pub async fn reference_type_source_file(&self, type_id: ReferenceTypeId) -> Result<String> {
        let (payload, _) = self.reference_type_command(7, type_id).await?;
        JdwpReader::new(&payload).read_string()
    }

    /// ReferenceType.NestedTypes (2, 8)
    pub async fn reference_type_nested_types(
        &self,
        type_id: ReferenceTypeId,
    ) -> Result<Vec<(u8, ReferenceTypeId)>> {
        let (payload, sizes) = self.reference_type_command(8, type_id).await?;
        read_tagged_type_ids(&payload, &sizes)
    }

    /// ReferenceType.Status (2, 9)
    pub async fn reference_type_status(&self, type_id: ReferenceTypeId) -> Result<u32> {
        let (payload, _) = self.reference_type_command(9, type_id).await?;
        JdwpReader::new(&payload).read_u32()
    }

    /// ReferenceType.Interfaces (2, 10): directly implemented (or extended) interfaces.
    pub async fn reference_type_interfaces(
        &self,
        type_id: ReferenceTypeId,
    ) -> Result<Vec<ReferenceTypeId>> {
        let (payload, sizes) = self.reference_type_command(10, type_id).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_count()?;
        let mut interfaces = Vec::with_capacity(count);
        for _ in 0..count {
            interfaces.push(r.read_reference_type_id(&sizes)?);
        }
        Ok(interfaces)
    }

    /// ClassType.Superclass (3, 1). `0` means no superclass (`java.lang.Object`).
    pub async fn class_type_superclass(&self, class_id: ReferenceTypeId) -> Result<ReferenceTypeId> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        let payload = self.send_command_raw(3, 1, w.into_vec()).await?;
        JdwpReader::new(&payload).read_reference_type_id(&sizes)
    }

    /// Method.LineTable (6, 1)
    pub async fn method_line_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<LineTable> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        w.write_id(method_id, sizes.method_id);
        let payload = self.send_command_raw(6, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let start = r.read_u64()?;
        let end = r.read_u64()?;
        let count = r.read_count()?;
        let mut lines = Vec::with_capacity(count);
        for _ in 0..count {
            lines.push((r.read_u64()?, r.read_i32()?));
        }
        Ok(LineTable { start, end, lines })
    }

    /// Method.VariableTable (6, 2). Returns the argument slot count and the variables.
    pub async fn method_variable_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<(u32, Vec<VariableInfo>)> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        w.write_id(method_id, sizes.method_id);
        let payload = self.send_command_raw(6, 2, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let arg_count = r.read_u32()?;
        let count = r.read_count()?;
        let mut vars = Vec::with_capacity(count);
        for _ in 0..count {
            vars.push(VariableInfo {
                code_index: r.read_u64()?,
                name: r.read_string()?,
                signature: r.read_string()?,
                length: r.read_u32()?,
                slot: r.read_u32()?,
            });
        }
        Ok((arg_count, vars))
    }

    /// ObjectReference.ReferenceType (9, 1): the runtime type tag and id.
    pub async fn object_reference_reference_type(
        &self,
        object_id: ObjectId,
    ) -> Result<(u8, ReferenceTypeId)> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(object_id, &sizes);
        let payload = self.send_command_raw(9, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let tag = r.read_u8()?;
        Ok((tag, r.read_reference_type_id(&sizes)?))
    }

    /// ObjectReference.GetValues (9, 2)
    pub async fn object_reference_get_values(
        &self,
        object_id: ObjectId,
        field_ids: &[FieldId],
    ) -> Result<Vec<JdwpValue>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(object_id, &sizes);
        w.write_u32(field_ids.len() as u32);
        for field_id in field_ids {
            w.write_id(*field_id, sizes.field_id);
        }
        let payload = self.send_command_raw(9, 2, w.into_vec()).await?;
        read_tagged_values(&payload, &sizes)
    }

    /// ObjectReference.IsCollected (9, 9)
    pub async fn object_reference_is_collected(&self, object_id: ObjectId) -> Result<bool> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(object_id, &sizes);
        let payload = self.send_command_raw(9, 9, w.into_vec()).await?;
        JdwpReader::new(&payload).read_bool()
    }

    /// StringReference.Value (10, 1)
    pub async fn string_reference_value(&self, string_id: ObjectId) -> Result<String> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(string_id, &sizes);
        let payload = self.send_command_raw(10, 1, w.into_vec()).await?;
        JdwpReader::new(&payload).read_string()
    }

    /// ThreadReference.Name (11, 1)
    pub async fn thread_name(&self, thread: ThreadId) -> Result<String> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        let payload = self.send_command_raw(11, 1, w.into_vec()).await?;
        JdwpReader::new(&payload).read_string()
    }

    /// ThreadReference.Frames (11, 6). A `length` of `-1` requests all remaining frames.
    pub async fn frames(&self, thread: ThreadId, start: i32, length: i32) -> Result<Vec<FrameInfo>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_i32(start);
        w.write_i32(length);
        let payload = self.send_command_raw(11, 6, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_count()?;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let frame_id = r.read_id(sizes.frame_id)?;
            let location = r.read_location(&sizes)?;
            frames.push(FrameInfo { frame_id, location });
        }
        Ok(frames)
    }

    /// ArrayReference.Length (13, 1)
    pub async fn array_reference_length(&self, array_id: ObjectId) -> Result<i32> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(array_id, &sizes);
        let payload = self.send_command_raw(13, 1, w.into_vec()).await?;
        JdwpReader::new(&payload).read_i32()
    }

    /// ArrayReference.GetValues (13, 2)
    pub async fn array_reference_get_values(
        &self,
        array_id: ObjectId,
        first_index: i32,
        length: i32,
    ) -> Result<Vec<JdwpValue>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(array_id, &sizes);
        w.write_i32(first_index);
        w.write_i32(length);
        let payload = self.send_command_raw(13, 2, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        // Primitive arrays share one tag for all elements; object arrays tag every element.
        let tag = r.read_u8()?;
        let count = r.read_count()?;
        let primitive = !matches!(tag, b'L' | b's' | b'[' | b't' | b'g' | b'l' | b'c');
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            if primitive {
                values.push(r.read_value(tag, &sizes)?);
            } else {
                values.push(r.read_tagged_value(&sizes)?);
            }
        }
        Ok(values)
    }

    /// ClassLoaderReference.VisibleClasses (14, 1): types this loader has initiated.
    pub async fn class_loader_visible_classes(
        &self,
        loader: ObjectId,
    ) -> Result<Vec<(u8, ReferenceTypeId)>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(loader, &sizes);
        let payload = self.send_command_raw(14, 1, w.into_vec()).await?;
        read_tagged_type_ids(&payload, &sizes)
    }

    /// EventRequest.Set (15, 1)
    pub async fn event_request_set(
        &self,
        event_kind: u8,
        suspend_policy: u8,
        modifiers: Vec<EventModifier>,
    ) -> Result<i32> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_u8(event_kind);
        w.write_u8(suspend_policy);
        w.write_u32(modifiers.len() as u32);
        for modifier in modifiers {
            modifier.encode(&mut w, &sizes);
        }
        let payload = self.send_command_raw(15, 1, w.into_vec()).await?;
        JdwpReader::new(&payload).read_i32()
    }

    /// EventRequest.Clear (15, 2)
    pub async fn event_request_clear(&self, event_kind: u8, request_id: i32) -> Result<()> {
        let mut w = JdwpWriter::new();
        w.write_u8(event_kind);
        w.write_i32(request_id);
        self.send_command_raw(15, 2, w.into_vec()).await.map(drop)
    }

    /// StackFrame.GetValues (16, 1). `slots` pairs a slot index with the variable's signature.
    pub async fn stack_frame_get_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        slots: &[(u32, String)],
    ) -> Result<Vec<JdwpValue>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_id(frame_id, sizes.frame_id);
        w.write_u32(slots.len() as u32);
        for (slot, signature) in slots {
            w.write_u32(*slot);
            w.write_u8(signature_to_tag(signature));
        }
        let payload = self.send_command_raw(16, 1, w.into_vec()).await?;
        read_tagged_values(&payload, &sizes)
    }

    /// StackFrame.ThisObject (16, 3). `0` for static and native frames.
    pub async fn stack_frame_this_object(&self, thread: ThreadId, frame_id: FrameId) -> Result<ObjectId> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_id(frame_id, sizes.frame_id);
        let payload = self.send_command_raw(16, 3, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let _tag = r.read_u8()?;
        r.read_object_id(&sizes)
    }
}

fn read_tagged_values(payload: &[u8], sizes: &JdwpIdSizes) -> Result<Vec<JdwpValue>> {
    let mut r = JdwpReader::new(payload);
    let count = r.read_count()?;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(r.read_tagged_value(sizes)?);
    }
    Ok(values)
}

fn read_tagged_type_ids(payload: &[u8], sizes: &JdwpIdSizes) -> Result<Vec<(u8, ReferenceTypeId)>> {
    let mut r = JdwpReader::new(payload);
    let count = r.read_count()?;
    let mut types = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = r.read_u8()?;
        types.push((tag, r.read_reference_type_id(sizes)?));
    }
    Ok(types)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventModifier {
    Count { count: i32 },
    ThreadOnly { thread: ThreadId },
    ClassMatch { pattern: String },
    ClassExclude { pattern: String },
    LocationOnly { location: Location },
}

impl EventModifier {
    fn encode(self, w: &mut JdwpWriter, sizes: &JdwpIdSizes) {
        match self {
            EventModifier::Count { count } => {
                w.write_u8(1);
                w.write_i32(count);
            }
            EventModifier::ThreadOnly { thread } => {
                w.write_u8(3);
                w.write_object_id(thread, sizes);
            }
            EventModifier::ClassMatch { pattern } => {
                w.write_u8(5);
                w.write_string(&pattern);
            }
            EventModifier::ClassExclude { pattern } => {
                w.write_u8(6);
                w.write_string(&pattern);
            }
            EventModifier::LocationOnly { location } => {
                w.write_u8(7);
                w.write_location(&location, sizes);
            }
        }
    }
}

async fn read_loop(mut reader: tokio::net::tcp::OwnedReadHalf, inner: Arc<Inner>) {
    let reason = loop {
        let mut header = [0u8; HEADER_LEN];
        let header_read = tokio::select! {
            _ = inner.shutdown.cancelled() => break None,
            res = reader.read_exact(&mut header) => res,
        };
        if let Err(err) = header_read {
            break Some(JdwpError::from(err));
        }

        let header = match PacketHeader::parse(&header) {
            Ok(header) => header,
            Err(err) => break Some(err),
        };

        let mut payload = vec![0u8; header.payload_len()];
        let payload_read = tokio::select! {
            _ = inner.shutdown.cancelled() => break None,
            res = reader.read_exact(&mut payload) => res,
        };
        if let Err(err) = payload_read {
            break Some(JdwpError::from(err));
        }

        if header.is_reply() {
            let tx = inner.pending.lock().await.remove(&header.id);
            match tx {
                Some(tx) => {
                    let _ = tx.send(Ok(Reply {
                        error_code: header.error_code(),
                        payload,
                    }));
                }
                None => {
                    tracing::debug!(target: "rcn.jdwp", id = header.id, "dropping reply for abandoned request");
                }
            }
        } else if (header.tail[0], header.tail[1]) == EVENT_COMMAND {
            if let Err(err) = handle_event_packet(&inner, &payload).await {
                break Some(err);
            }
        } else {
            // The VM sends no other commands to a debugger.
            tracing::debug!(
                target: "rcn.jdwp",
                command_set = header.tail[0],
                command = header.tail[1],
                "ignoring unexpected command packet"
            );
        }
    };

    if let Some(err) = &reason {
        tracing::debug!(target: "rcn.jdwp", error = %err, "debuggee connection closed");
    }

    inner.shutdown.cancel();

    let pending = std::mem::take(&mut *inner.pending.lock().await);
    for (_id, tx) in pending {
        let _ = tx.send(Err(JdwpError::ConnectionClosed));
    }
    inner.in_flight.close();
}

async fn handle_event_packet(inner: &Inner, payload: &[u8]) -> Result<()> {
    let sizes = *inner.id_sizes.lock().await;
    let mut r = JdwpReader::new(payload);
    let _suspend_policy = r.read_u8()?;
    let event_count = r.read_count()?;
    for _ in 0..event_count {
        let kind = r.read_u8()?;
        let request_id = r.read_i32()?;
        let event = match kind {
            EVENT_KIND_BREAKPOINT => JdwpEvent::Breakpoint {
                request_id,
                thread: r.read_object_id(&sizes)?,
                location: r.read_location(&sizes)?,
            },
            EVENT_KIND_CLASS_PREPARE => JdwpEvent::ClassPrepare {
                request_id,
                thread: r.read_object_id(&sizes)?,
                ref_type_tag: r.read_u8()?,
                type_id: r.read_reference_type_id(&sizes)?,
                signature: r.read_string()?,
                status: r.read_u32()?,
            },
            EVENT_KIND_CLASS_UNLOAD => JdwpEvent::ClassUnload {
                request_id,
                signature: r.read_string()?,
            },
            EVENT_KIND_VM_START => JdwpEvent::VmStart {
                request_id,
                thread: r.read_object_id(&sizes)?,
            },
            EVENT_KIND_VM_DEATH => JdwpEvent::VmDeath,
            other => {
                // The remainder of the packet cannot be parsed without knowing this event's layout.
                tracing::debug!(target: "rcn.jdwp", kind = other, "ignoring unsupported event kind");
                return Ok(());
            }
        };
        // No subscribers is fine; events are advisory.
        let _ = inner.events.send(event);
    }
    Ok(())
}
