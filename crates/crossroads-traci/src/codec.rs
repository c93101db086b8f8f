//! Binary framing of the control protocol.
//!
//! ```text
//! message := u32 total_len (BE, includes itself) command*
//! command := u8 len (includes itself) u8 id payload
//!          | 0x00 u32 len (includes both length fields) u8 id payload
//! status  := command(id = request id) u8 result string description
//! string  := i32 len (BE) utf8 bytes
//! ```
//!
//! Every request command is answered by a status command, optionally
//! followed by a command-specific response command.

use std::collections::HashMap;

use crate::constants::{
    RESPONSE_OFFSET, RTYPE_OK, TYPE_BYTE, TYPE_COMPOUND, TYPE_DOUBLE, TYPE_INTEGER, TYPE_STRING,
    TYPE_STRINGLIST, TYPE_UBYTE,
};
use crate::error::ProtocolError;

/// Subscribed variables of one object, keyed by variable id.
pub type VariableMap = HashMap<u8, TraciValue>;

/// Deepest compound nesting accepted when decoding. Simulator responses
/// nest only a few levels.
pub const MAX_COMPOUND_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A typed value as it appears on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum TraciValue {
    /// Unsigned byte.
    UByte(u8),
    /// Signed byte.
    Byte(i8),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// List of strings.
    StringList(Vec<String>),
    /// Heterogeneous list of typed values.
    Compound(Vec<TraciValue>),
}

impl TraciValue {
    /// Numeric view. Integers widen losslessly.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            Self::Int(v) => Some(f64::from(*v)),
            Self::UByte(v) => Some(f64::from(*v)),
            Self::Byte(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    /// Integer view.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            Self::UByte(v) => Some(i32::from(*v)),
            Self::Byte(v) => Some(i32::from(*v)),
            _ => None,
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// String list view.
    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            Self::StringList(list) => Some(list),
            _ => None,
        }
    }

    /// Short name of the wire type, for error messages.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::UByte(_) => "ubyte",
            Self::Byte(_) => "byte",
            Self::Int(_) => "int",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::StringList(_) => "stringlist",
            Self::Compound(_) => "compound",
        }
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Big-endian payload builder.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Empty writer.
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append one byte.
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    /// Append a big-endian `i32`.
    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Append a big-endian `f64`.
    pub fn put_f64(&mut self, value: f64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Append a length-prefixed string.
    pub fn put_string(&mut self, value: &str) -> Result<&mut Self, ProtocolError> {
        let len = i32::try_from(value.len())
            .map_err(|e| ProtocolError::Malformed(format!("string too long: {e}")))?;
        self.put_i32(len);
        self.buf.extend_from_slice(value.as_bytes());
        Ok(self)
    }

    /// Append a count-prefixed list of strings.
    pub fn put_string_list(&mut self, values: &[String]) -> Result<&mut Self, ProtocolError> {
        let count = i32::try_from(values.len())
            .map_err(|e| ProtocolError::Malformed(format!("string list too long: {e}")))?;
        self.put_i32(count);
        for value in values {
            self.put_string(value)?;
        }
        Ok(self)
    }

    /// Append a type tag followed by the value.
    pub fn put_value(&mut self, value: &TraciValue) -> Result<&mut Self, ProtocolError> {
        match value {
            TraciValue::UByte(v) => {
                self.put_u8(TYPE_UBYTE).put_u8(*v);
            }
            TraciValue::Byte(v) => {
                self.put_u8(TYPE_BYTE).buf.extend_from_slice(&v.to_be_bytes());
            }
            TraciValue::Int(v) => {
                self.put_u8(TYPE_INTEGER).put_i32(*v);
            }
            TraciValue::Double(v) => {
                self.put_u8(TYPE_DOUBLE).put_f64(*v);
            }
            TraciValue::String(s) => {
                self.put_u8(TYPE_STRING).put_string(s)?;
            }
            TraciValue::StringList(list) => {
                self.put_u8(TYPE_STRINGLIST).put_string_list(list)?;
            }
            TraciValue::Compound(items) => {
                let count = i32::try_from(items.len())
                    .map_err(|e| ProtocolError::Malformed(format!("compound too long: {e}")))?;
                self.put_u8(TYPE_COMPOUND).put_i32(count);
                for item in items {
                    self.put_value(item)?;
                }
            }
        }
        Ok(self)
    }

    /// Consume the writer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Append one framed command (`len id payload`) to `out`.
pub fn put_command(out: &mut Vec<u8>, id: u8, payload: &[u8]) -> Result<(), ProtocolError> {
    let short = payload.len().checked_add(2);
    match short.and_then(|len| u8::try_from(len).ok()) {
        Some(len) => {
            out.push(len);
        }
        None => {
            let len = payload
                .len()
                .checked_add(6)
                .and_then(|len| u32::try_from(len).ok())
                .ok_or_else(|| ProtocolError::Malformed(String::from("command too long")))?;
            out.push(0);
            out.extend_from_slice(&len.to_be_bytes());
        }
    }
    out.push(id);
    out.extend_from_slice(payload);
    Ok(())
}

/// Wrap a run of framed commands into one message.
pub fn encode_message(commands: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let total = commands
        .len()
        .checked_add(4)
        .and_then(|len| u32::try_from(len).ok())
        .ok_or_else(|| ProtocolError::Malformed(String::from("message too long")))?;
    let mut out = Vec::with_capacity(commands.len().saturating_add(4));
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(commands);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Cursor over a received message body.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Cursor at the start of `buf`.
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Whether every byte has been consumed.
    pub const fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or_else(|| ProtocolError::Malformed(String::from("length overflow")))?;
        let bytes = self.buf.get(self.pos..end).ok_or_else(|| {
            ProtocolError::Malformed(format!(
                "truncated: wanted {n} bytes at offset {}, have {}",
                self.pos,
                self.buf.len()
            ))
        })?;
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let bytes = self.take(N)?;
        <[u8; N]>::try_from(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Read one byte.
    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(u8::from_be_bytes(self.array::<1>()?))
    }

    /// Read a big-endian `i32`.
    pub fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.array::<4>()?))
    }

    /// Read a big-endian `u32`.
    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.array::<4>()?))
    }

    /// Read a big-endian `f64`.
    pub fn f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(f64::from_be_bytes(self.array::<8>()?))
    }

    fn count(&mut self, what: &str) -> Result<usize, ProtocolError> {
        let raw = self.i32()?;
        usize::try_from(raw).map_err(|e| ProtocolError::Malformed(format!("negative {what} {raw}: {e}")))
    }

    /// Read a length-prefixed string. Invalid UTF-8 is replaced, not rejected.
    pub fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.count("string length")?;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read a count-prefixed list of strings.
    pub fn string_list(&mut self) -> Result<Vec<String>, ProtocolError> {
        let count = self.count("list length")?;
        // Cap the preallocation; a lying count must not allocate gigabytes.
        let mut out = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            out.push(self.string()?);
        }
        Ok(out)
    }

    /// Read a type tag and the value it announces.
    ///
    /// Compounds nested deeper than [`MAX_COMPOUND_DEPTH`] are malformed.
    pub fn value(&mut self) -> Result<TraciValue, ProtocolError> {
        self.value_at(0)
    }

    fn value_at(&mut self, depth: usize) -> Result<TraciValue, ProtocolError> {
        let tag = self.u8()?;
        match tag {
            TYPE_UBYTE => Ok(TraciValue::UByte(self.u8()?)),
            TYPE_BYTE => Ok(TraciValue::Byte(i8::from_be_bytes(self.array::<1>()?))),
            TYPE_INTEGER => Ok(TraciValue::Int(self.i32()?)),
            TYPE_DOUBLE => Ok(TraciValue::Double(self.f64()?)),
            TYPE_STRING => Ok(TraciValue::String(self.string()?)),
            TYPE_STRINGLIST => Ok(TraciValue::StringList(self.string_list()?)),
            TYPE_COMPOUND => {
                if depth >= MAX_COMPOUND_DEPTH {
                    return Err(ProtocolError::Malformed(format!(
                        "compound nested deeper than {MAX_COMPOUND_DEPTH} levels"
                    )));
                }
                let count = self.count("compound length")?;
                let mut items = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    items.push(self.value_at(depth.saturating_add(1))?);
                }
                Ok(TraciValue::Compound(items))
            }
            other => Err(ProtocolError::Malformed(format!(
                "unknown value type 0x{other:02x}"
            ))),
        }
    }

    /// Read one framed command, returning its id and a cursor over its
    /// payload. The outer cursor is advanced past the whole command.
    pub fn command(&mut self) -> Result<(u8, Self), ProtocolError> {
        let short = self.u8()?;
        let (len, header) = if short == 0 {
            let long = usize::try_from(self.u32()?)
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
            (long, 5_usize)
        } else {
            (usize::from(short), 1_usize)
        };
        let content_len = len
            .checked_sub(header)
            .filter(|n| *n >= 1)
            .ok_or_else(|| ProtocolError::Malformed(format!("command length {len} too short")))?;
        let content = self.take(content_len)?;
        let (id, payload) = content
            .split_first()
            .ok_or_else(|| ProtocolError::Malformed(String::from("empty command")))?;
        Ok((*id, Self::new(payload)))
    }

    /// Read the status response for `command`, failing if the simulator
    /// reported anything but success.
    pub fn expect_status(&mut self, command: u8) -> Result<(), ProtocolError> {
        let (id, mut body) = self.command()?;
        if id != command {
            return Err(ProtocolError::Malformed(format!(
                "status for 0x{id:02x}, expected 0x{command:02x}"
            )));
        }
        let result = body.u8()?;
        let description = body.string()?;
        if result == RTYPE_OK {
            Ok(())
        } else {
            Err(ProtocolError::CommandFailed {
                command,
                description,
            })
        }
    }

    /// Read the response to a get-variable request and return its value.
    pub fn get_response(&mut self, command: u8, variable: u8) -> Result<TraciValue, ProtocolError> {
        let expected = command.wrapping_add(RESPONSE_OFFSET);
        let (id, mut body) = self.command()?;
        if id != expected {
            return Err(ProtocolError::Malformed(format!(
                "response 0x{id:02x}, expected 0x{expected:02x}"
            )));
        }
        let var = body.u8()?;
        if var != variable {
            return Err(ProtocolError::Malformed(format!(
                "variable 0x{var:02x}, expected 0x{variable:02x}"
            )));
        }
        let _object = body.string()?;
        body.value()
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// One object's subscription results from a single tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionResult {
    /// Object id.
    pub object_id: String,
    /// Variables the simulator delivered successfully.
    pub variables: VariableMap,
    /// Variables the simulator reported as failed, with its message.
    pub failed: Vec<(u8, String)>,
}

/// Decode the payload of a variable subscription response.
///
/// Layout: `string object_id, u8 count, (u8 var, u8 status, value)*`.
/// A variable whose status is not OK carries a string value explaining
/// why; it is collected in `failed` instead of `variables`.
pub fn parse_subscription(body: &mut Reader<'_>) -> Result<SubscriptionResult, ProtocolError> {
    let object_id = body.string()?;
    let count = body.u8()?;
    let mut variables = VariableMap::with_capacity(usize::from(count));
    let mut failed = Vec::new();
    for _ in 0..count {
        let var = body.u8()?;
        let status = body.u8()?;
        let value = body.value()?;
        if status == RTYPE_OK {
            variables.insert(var, value);
        } else {
            let reason = value
                .as_str()
                .map_or_else(|| String::from("unspecified"), str::to_owned);
            failed.push((var, reason));
        }
    }
    Ok(SubscriptionResult {
        object_id,
        variables,
        failed,
    })
}
