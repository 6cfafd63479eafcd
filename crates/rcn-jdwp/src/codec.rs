use crate::types::{
    JdwpError, JdwpIdSizes, JdwpValue, Location, ObjectId, ReferenceTypeId, Result,
};

pub const HANDSHAKE: &[u8] = b"JDWP-Handshake";
pub const HEADER_LEN: usize = crate::JDWP_HEADER_LEN;
pub const FLAG_REPLY: u8 = 0x80;

/// Command set / command pair of a composite event packet sent by the VM.
pub const EVENT_COMMAND: (u8, u8) = (64, 100);

/// Tag byte used on the wire for values of the given field signature.
pub fn signature_to_tag(signature: &str) -> u8 {
    signature.as_bytes().first().copied().unwrap_or(b'V')
}

/// Convert a Java binary class name (`com.example.Foo$Bar`) into a JDWP
/// reference type signature (`Lcom/example/Foo$Bar;`).
///
/// Array names (`int[]`, `Foo[][]`) become array signatures. Anything that
/// already looks like a signature is returned unchanged.
pub fn binary_name_to_signature(name: &str) -> String {
    if (name.starts_with('L') && name.ends_with(';')) || name.starts_with('[') {
        return name.to_string();
    }
    if let Some(component) = name.strip_suffix("[]") {
        let component = match component {
            "boolean" => "Z".to_string(),
            "byte" => "B".to_string(),
            "char" => "C".to_string(),
            "short" => "S".to_string(),
            "int" => "I".to_string(),
            "long" => "J".to_string(),
            "float" => "F".to_string(),
            "double" => "D".to_string(),
            other => binary_name_to_signature(other),
        };
        return format!("[{component}");
    }
    format!("L{};", name.replace('.', "/"))
}

#[derive(Default)]
pub struct JdwpWriter {
    buf: Vec<u8>,
}

impl JdwpWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_string(&mut self, s: &str) {
        // Strings are length-prefixed with a u32 number of (modified UTF-8) bytes.
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// Writes the low `size` bytes of `id`, big-endian.
    pub fn write_id(&mut self, id: u64, size: usize) {
        let be = id.to_be_bytes();
        let size = size.min(8);
        self.buf.extend_from_slice(&be[8 - size..]);
    }

    pub fn write_object_id(&mut self, id: ObjectId, sizes: &JdwpIdSizes) {
        self.write_id(id, sizes.object_id);
    }

    pub fn write_reference_type_id(&mut self, id: ReferenceTypeId, sizes: &JdwpIdSizes) {
        self.write_id(id, sizes.reference_type_id);
    }

    pub fn write_location(&mut self, loc: &Location, sizes: &JdwpIdSizes) {
        self.write_u8(loc.type_tag);
        self.write_reference_type_id(loc.class_id, sizes);
        self.write_id(loc.method_id, sizes.method_id);
        self.write_u64(loc.index);
    }

    /// Writes an untagged value.
    pub fn write_value(&mut self, v: &JdwpValue, sizes: &JdwpIdSizes) {
        match *v {
            JdwpValue::Boolean(v) => self.write_bool(v),
            JdwpValue::Byte(v) => self.write_u8(v as u8),
            JdwpValue::Char(v) => self.write_u16(v),
            JdwpValue::Short(v) => self.write_u16(v as u16),
            JdwpValue::Int(v) => self.write_i32(v),
            JdwpValue::Long(v) => self.write_i64(v),
            JdwpValue::Float(v) => self.write_u32(v.to_bits()),
            JdwpValue::Double(v) => self.write_u64(v.to_bits()),
            JdwpValue::Object { id, .. } => self.write_object_id(id, sizes),
            JdwpValue::Void => {}
        }
    }

    pub fn write_tagged_value(&mut self, v: &JdwpValue, sizes: &JdwpIdSizes) {
        self.write_u8(value_tag(v));
        self.write_value(v, sizes);
    }
}

pub fn value_tag(v: &JdwpValue) -> u8 {
    match *v {
        JdwpValue::Boolean(_) => b'Z',
        JdwpValue::Byte(_) => b'B',
        JdwpValue::Char(_) => b'C',
        JdwpValue::Short(_) => b'S',
        JdwpValue::Int(_) => b'I',
        JdwpValue::Long(_) => b'J',
        JdwpValue::Float(_) => b'F',
        JdwpValue::Double(_) => b'D',
        JdwpValue::Object { tag, .. } => tag,
        JdwpValue::Void => b'V',
    }
}

pub struct JdwpReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> JdwpReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                JdwpError::Protocol(format!(
                    "buffer underflow: need {n} bytes at {}, have {}",
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    /// Reads a `u32` element count, rejecting counts that could not possibly
    /// fit in the rest of the packet.
    pub fn read_count(&mut self) -> Result<usize> {
        let count = self.read_u32()? as usize;
        if count > self.remaining() {
            return Err(JdwpError::Protocol(format!(
                "element count {count} exceeds remaining {} bytes",
                self.remaining()
            )));
        }
        Ok(count)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| JdwpError::Protocol(format!("invalid utf-8 string: {e}")))
    }

    pub fn read_id(&mut self, size: usize) -> Result<u64> {
        if size == 0 || size > 8 {
            return Err(JdwpError::Protocol(format!("invalid id size: {size}")));
        }
        let mut be = [0u8; 8];
        be[8 - size..].copy_from_slice(self.take(size)?);
        Ok(u64::from_be_bytes(be))
    }

    pub fn read_object_id(&mut self, sizes: &JdwpIdSizes) -> Result<ObjectId> {
        self.read_id(sizes.object_id)
    }

    pub fn read_reference_type_id(&mut self, sizes: &JdwpIdSizes) -> Result<ReferenceTypeId> {
        self.read_id(sizes.reference_type_id)
    }

    pub fn read_location(&mut self, sizes: &JdwpIdSizes) -> Result<Location> {
        Ok(Location {
            type_tag: self.read_u8()?,
            class_id: self.read_reference_type_id(sizes)?,
            method_id: self.read_id(sizes.method_id)?,
            index: self.read_u64()?,
        })
    }

    pub fn read_value(&mut self, tag: u8, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        let v = match tag {
            b'Z' => JdwpValue::Boolean(self.read_bool()?),
            b'B' => JdwpValue::Byte(self.read_u8()? as i8),
            b'C' => JdwpValue::Char(self.read_u16()?),
            b'S' => JdwpValue::Short(self.read_u16()? as i16),
            b'I' => JdwpValue::Int(self.read_i32()?),
            b'J' => JdwpValue::Long(self.read_i64()?),
            b'F' => JdwpValue::Float(f32::from_bits(self.read_u32()?)),
            b'D' => JdwpValue::Double(f64::from_bits(self.read_u64()?)),
            b'V' => JdwpValue::Void,
            b'L' | b's' | b'[' | b't' | b'g' | b'l' | b'c' => JdwpValue::Object {
                tag,
                id: self.read_object_id(sizes)?,
            },
            other => {
                return Err(JdwpError::Protocol(format!(
                    "unknown value tag {:?}",
                    other as char
                )))
            }
        };
        Ok(v)
    }

    pub fn read_tagged_value(&mut self, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        let tag = self.read_u8()?;
        self.read_value(tag, sizes)
    }
}

fn encode_header(out: &mut Vec<u8>, payload_len: usize, id: u32, flags: u8) {
    let length = (HEADER_LEN + payload_len) as u32;
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(flags);
}

pub fn encode_command(id: u32, command_set: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    encode_header(&mut out, payload.len(), id, 0);
    out.push(command_set);
    out.push(command);
    out.extend_from_slice(payload);
    out
}

pub fn encode_reply(id: u32, error_code: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    encode_header(&mut out, payload.len(), id, FLAG_REPLY);
    out.extend_from_slice(&error_code.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Parsed fixed-size packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub length: usize,
    pub id: u32,
    pub flags: u8,
    /// `(command_set, command)` for commands, the error code split in two
    /// bytes for replies.
    pub tail: [u8; 2],
}

impl PacketHeader {
    pub fn parse(header: &[u8; HEADER_LEN]) -> Result<Self> {
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length < HEADER_LEN {
            return Err(JdwpError::Protocol(format!(
                "packet length {length} is shorter than the header"
            )));
        }
        Ok(Self {
            length,
            id: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
            flags: header[8],
            tail: [header[9], header[10]],
        })
    }

    pub fn is_reply(&self) -> bool {
        self.flags & FLAG_REPLY != 0
    }

    pub fn error_code(&self) -> u16 {
        u16::from_be_bytes(self.tail)
    }

    pub fn payload_len(&self) -> usize {
        self.length - HEADER_LEN
    }
}
