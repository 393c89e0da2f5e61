//! Binary codec: one tag byte then fields, laid out per protocol revision.
//! Legacy (2.0) strings carry a u16 BE length, current (3.0) strings a ULEB128 length.

use crate::protocol::{tag, tag_supported_at_legacy, Message, CLEAR_ALL_MAGIC, PROTO_REV_CURRENT};
use crate::seqnum::SequenceNumber;
use crate::value::{Value, ValueType};

/// Longest array the wire can carry; longer arrays are truncated on send.
pub const MAX_ARRAY_LEN: usize = 255;
const MAX_LEGACY_STRING_LEN: usize = 0xFFFF;
const MAX_LEB128_BYTES: usize = 10;
/// Longest string or raw body accepted from a peer.
pub const MAX_DECODED_STRING_LEN: usize = 16 * 1024 * 1024;

/// Encode one message for the given revision, appending to `out`.
/// On error `out` is left as it was.
pub fn encode_message(msg: &Message, proto_rev: u16, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    if !msg.supported_at(proto_rev) {
        return Err(EncodeError::UnsupportedMessage {
            tag: msg.tag(),
            proto_rev,
        });
    }
    let start = out.len();
    let res = write_message(msg, proto_rev, out);
    if res.is_err() {
        out.truncate(start);
    }
    res
}

fn write_message(msg: &Message, proto_rev: u16, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    out.push(msg.tag());
    match msg {
        Message::KeepAlive | Message::ServerHelloDone | Message::ClientHelloDone => {}
        Message::ClientHello {
            proto_rev: rev,
            identity,
        } => {
            out.extend_from_slice(&rev.to_be_bytes());
            if *rev >= PROTO_REV_CURRENT {
                write_string(out, identity.as_bytes(), PROTO_REV_CURRENT);
            }
        }
        Message::ProtoUnsup { proto_rev: rev } => out.extend_from_slice(&rev.to_be_bytes()),
        Message::ServerHello { flags, identity } => {
            out.push(*flags);
            write_string(out, identity.as_bytes(), proto_rev);
        }
        Message::EntryAssign {
            name,
            id,
            seq_num,
            value,
            flags,
        } => {
            write_string(out, name.as_bytes(), proto_rev);
            out.push(wire_type(value));
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&seq_num.value().to_be_bytes());
            if proto_rev >= PROTO_REV_CURRENT {
                out.push(*flags);
            }
            write_value(out, value, proto_rev)?;
        }
        Message::EntryUpdate { id, seq_num, value } => {
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&seq_num.value().to_be_bytes());
            if proto_rev >= PROTO_REV_CURRENT {
                out.push(wire_type(value));
            }
            write_value(out, value, proto_rev)?;
        }
        Message::FlagsUpdate { id, flags } => {
            out.extend_from_slice(&id.to_be_bytes());
            out.push(*flags);
        }
        Message::EntryDelete { id } => out.extend_from_slice(&id.to_be_bytes()),
        Message::ClearEntries => out.extend_from_slice(&CLEAR_ALL_MAGIC.to_be_bytes()),
        Message::ExecuteRpc {
            id,
            call_uid,
            params: data,
        }
        | Message::RpcResponse {
            id,
            call_uid,
            result: data,
        } => {
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&call_uid.to_be_bytes());
            write_string(out, data, proto_rev);
        }
    }
    Ok(())
}

fn wire_type(value: &Value) -> u8 {
    // every concrete value type has a wire tag
    value.value_type().wire_tag().unwrap_or(0)
}

/// Encode a value body (no type tag).
pub fn write_value(out: &mut Vec<u8>, value: &Value, proto_rev: u16) -> Result<(), EncodeError> {
    match value {
        Value::Boolean(b) => out.push(u8::from(*b)),
        Value::Double(d) => out.extend_from_slice(&d.to_be_bytes()),
        Value::String(s) => write_string(out, s.as_bytes(), proto_rev),
        Value::Raw(bytes) | Value::Rpc(bytes) => {
            if proto_rev < PROTO_REV_CURRENT {
                return Err(EncodeError::UnsupportedValue {
                    value_type: value.value_type(),
                    proto_rev,
                });
            }
            write_string(out, bytes, proto_rev);
        }
        Value::BooleanArray(v) => {
            let n = write_array_len(out, v.len());
            out.extend(v[..n].iter().map(|b| u8::from(*b)));
        }
        Value::DoubleArray(v) => {
            let n = write_array_len(out, v.len());
            for d in &v[..n] {
                out.extend_from_slice(&d.to_be_bytes());
            }
        }
        Value::StringArray(v) => {
            let n = write_array_len(out, v.len());
            for s in &v[..n] {
                write_string(out, s.as_bytes(), proto_rev);
            }
        }
    }
    Ok(())
}

fn write_array_len(out: &mut Vec<u8>, len: usize) -> usize {
    let n = len.min(MAX_ARRAY_LEN);
    out.push(n as u8);
    n
}

/// Length-prefixed byte string. Legacy strings longer than 65535 bytes are truncated.
pub fn write_string(out: &mut Vec<u8>, bytes: &[u8], proto_rev: u16) {
    if proto_rev < PROTO_REV_CURRENT {
        let n = bytes.len().min(MAX_LEGACY_STRING_LEN);
        out.extend_from_slice(&(n as u16).to_be_bytes());
        out.extend_from_slice(&bytes[..n]);
    } else {
        write_uleb128(out, bytes.len() as u64);
        out.extend_from_slice(bytes);
    }
}

pub fn write_uleb128(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Error encoding a message (kind or value type absent at the revision).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("message tag {tag:#04x} does not exist at protocol revision {proto_rev:#06x}")]
    UnsupportedMessage { tag: u8, proto_rev: u16 },
    #[error("{value_type:?} values do not exist at protocol revision {proto_rev:#06x}")]
    UnsupportedValue { value_type: ValueType, proto_rev: u16 },
}

/// Decode one message from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with a partial buffer; returns `NeedMore` with a lower bound on the
/// message length until the whole message is present.
/// `entry_type` resolves the value type of legacy updates, which carry none on the wire.
pub fn decode_message(
    bytes: &[u8],
    proto_rev: u16,
    entry_type: &dyn Fn(u16) -> ValueType,
) -> Result<(Message, usize), DecodeError> {
    let mut r = Reader { buf: bytes, pos: 0 };
    let t = r.u8()?;
    if proto_rev < PROTO_REV_CURRENT && !tag_supported_at_legacy(t) {
        return Err(DecodeError::UnknownMessage(t));
    }
    let msg = match t {
        tag::KEEP_ALIVE => Message::KeepAlive,
        tag::CLIENT_HELLO => {
            let rev = r.u16()?;
            let identity = if rev >= PROTO_REV_CURRENT {
                r.string(PROTO_REV_CURRENT)?
            } else {
                String::new()
            };
            Message::ClientHello {
                proto_rev: rev,
                identity,
            }
        }
        tag::PROTO_UNSUP => Message::ProtoUnsup { proto_rev: r.u16()? },
        tag::SERVER_HELLO_DONE => Message::ServerHelloDone,
        tag::SERVER_HELLO => {
            let flags = r.u8()?;
            Message::ServerHello {
                flags,
                identity: r.string(proto_rev)?,
            }
        }
        tag::CLIENT_HELLO_DONE => Message::ClientHelloDone,
        tag::ENTRY_ASSIGN => {
            let name = r.string(proto_rev)?;
            let value_type = r.value_type()?;
            let id = r.u16()?;
            let seq_num = SequenceNumber(r.u16()?);
            let flags = if proto_rev >= PROTO_REV_CURRENT { r.u8()? } else { 0 };
            let value = r.value(value_type, proto_rev)?;
            Message::EntryAssign {
                name,
                id,
                seq_num,
                value,
                flags,
            }
        }
        tag::ENTRY_UPDATE => {
            let id = r.u16()?;
            let seq_num = SequenceNumber(r.u16()?);
            let value_type = if proto_rev >= PROTO_REV_CURRENT {
                r.value_type()?
            } else {
                match entry_type(id) {
                    ValueType::Unassigned => return Err(DecodeError::UnknownEntryType { id }),
                    t => t,
                }
            };
            let value = r.value(value_type, proto_rev)?;
            Message::EntryUpdate { id, seq_num, value }
        }
        tag::FLAGS_UPDATE => {
            let id = r.u16()?;
            Message::FlagsUpdate { id, flags: r.u8()? }
        }
        tag::ENTRY_DELETE => Message::EntryDelete { id: r.u16()? },
        tag::CLEAR_ENTRIES => {
            let magic = r.u32()?;
            if magic != CLEAR_ALL_MAGIC {
                return Err(DecodeError::BadMagic(magic));
            }
            Message::ClearEntries
        }
        tag::EXECUTE_RPC => {
            let id = r.u16()?;
            let call_uid = r.u16()?;
            Message::ExecuteRpc {
                id,
                call_uid,
                params: r.bytes_string(proto_rev)?,
            }
        }
        tag::RPC_RESPONSE => {
            let id = r.u16()?;
            let call_uid = r.u16()?;
            Message::RpcResponse {
                id,
                call_uid,
                result: r.bytes_string(proto_rev)?,
            }
        }
        other => return Err(DecodeError::UnknownMessage(other)),
    };
    Ok((msg, r.pos))
}

/// Error decoding a message. Everything except `NeedMore` is a protocol violation.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("need at least {0} bytes")]
    NeedMore(usize),
    #[error("unknown message tag {0:#04x}")]
    UnknownMessage(u8),
    #[error("unknown value type tag {0:#04x}")]
    UnknownValueType(u8),
    #[error("update for entry {id} with no known type")]
    UnknownEntryType { id: u16 },
    #[error("{value_type:?} values do not exist at protocol revision {proto_rev:#06x}")]
    UnsupportedValue { value_type: ValueType, proto_rev: u16 },
    #[error("bad clear-entries magic {0:#010x}")]
    BadMagic(u32),
    #[error("LEB128 length too long")]
    Leb128Overflow,
    #[error("string of {0} bytes exceeds the decode limit")]
    StringTooLong(usize),
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(DecodeError::NeedMore(self.pos + n));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self) -> Result<f64, DecodeError> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(f64::from_be_bytes(a))
    }

    fn uleb128(&mut self) -> Result<u64, DecodeError> {
        let mut result = 0u64;
        for i in 0..MAX_LEB128_BYTES {
            let byte = self.u8()?;
            result |= u64::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(DecodeError::Leb128Overflow)
    }

    fn bytes_string(&mut self, proto_rev: u16) -> Result<Vec<u8>, DecodeError> {
        let len = if proto_rev < PROTO_REV_CURRENT {
            usize::from(self.u16()?)
        } else {
            let len = usize::try_from(self.uleb128()?).map_err(|_| DecodeError::Leb128Overflow)?;
            if len > MAX_DECODED_STRING_LEN {
                return Err(DecodeError::StringTooLong(len));
            }
            len
        };
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self, proto_rev: u16) -> Result<String, DecodeError> {
        let bytes = self.bytes_string(proto_rev)?;
        Ok(String::from_utf8(bytes)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()))
    }

    fn value_type(&mut self) -> Result<ValueType, DecodeError> {
        let t = self.u8()?;
        ValueType::from_wire_tag(t).ok_or(DecodeError::UnknownValueType(t))
    }

    fn value(&mut self, value_type: ValueType, proto_rev: u16) -> Result<Value, DecodeError> {
        Ok(match value_type {
            ValueType::Boolean => Value::Boolean(self.u8()? != 0),
            ValueType::Double => Value::Double(self.f64()?),
            ValueType::String => Value::String(self.string(proto_rev)?),
            ValueType::Raw | ValueType::Rpc => {
                if proto_rev < PROTO_REV_CURRENT {
                    return Err(DecodeError::UnsupportedValue {
                        value_type,
                        proto_rev,
                    });
                }
                let bytes = self.bytes_string(proto_rev)?;
                if value_type == ValueType::Raw {
                    Value::Raw(bytes)
                } else {
                    Value::Rpc(bytes)
                }
            }
            ValueType::BooleanArray => {
                let n = usize::from(self.u8()?);
                Value::BooleanArray(self.take(n)?.iter().map(|b| *b != 0).collect())
            }
            ValueType::DoubleArray => {
                let n = usize::from(self.u8()?);
                let mut v = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push(self.f64()?);
                }
                Value::DoubleArray(v)
            }
            ValueType::StringArray => {
                let n = usize::from(self.u8()?);
                let mut v = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push(self.string(proto_rev)?);
                }
                Value::StringArray(v)
            }
            ValueType::Unassigned => return Err(DecodeError::UnknownValueType(0)),
        })
    }
}
