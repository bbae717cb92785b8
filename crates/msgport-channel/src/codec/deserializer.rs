use std::sync::Arc;

use tracing::{debug, trace};

use super::wire;
use crate::buffer::{ArrayBuffer, SharedArrayBuffer};
use crate::context::Context;
use crate::error::{PortError, Result};
use crate::mailbox::Mailbox;
use crate::message::{Message, MessageEvent};
use crate::port::MessagePort;
use crate::value::{Array, Object, Value};

/// Rebuild a [`Message`] in `context`.
///
/// `attach` creates the receiving port for every moved mailbox, in transfer
/// order. If it fails, the ports built so far are closed and the remaining
/// mailboxes are dropped. If the payload cannot be decoded, every port that
/// arrived with the message is closed.
pub fn deserialize<F>(message: Message, context: &Context, mut attach: F) -> Result<MessageEvent>
where
    F: FnMut(Arc<Mailbox>) -> Result<MessagePort>,
{
    let (payload, buffers, mailboxes, shared) = message.into_parts();

    let mut ports = Vec::with_capacity(mailboxes.len());
    for (index, mailbox) in mailboxes.into_iter().enumerate() {
        match attach(mailbox) {
            Ok(port) => ports.push(port),
            Err(source) => {
                debug!(index, error = %source, "failed to attach transferred port");
                close_all(&ports);
                return Err(PortError::PortAttachFailed {
                    index,
                    source: Box::new(source),
                });
            }
        }
    }

    let buffers: Vec<ArrayBuffer> = buffers.into_iter().map(ArrayBuffer::from_vec).collect();
    let shared: Vec<SharedArrayBuffer> = shared
        .into_iter()
        .map(|memory| context.attach_shared(memory))
        .collect();

    let mut decoder = Decoder {
        input: &payload,
        pos: 0,
        backrefs: Vec::new(),
        ports: &ports,
        buffers: &buffers,
        shared: &shared,
        max_depth: context.codec_config().max_depth,
    };
    match decoder.decode() {
        Ok(data) => {
            trace!(
                bytes = payload.len(),
                ports = ports.len(),
                "deserialized message"
            );
            Ok(MessageEvent { data, ports })
        }
        Err(err) => {
            close_all(&ports);
            Err(err)
        }
    }
}

fn close_all(ports: &[MessagePort]) {
    for port in ports {
        port.close();
    }
}

struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
    backrefs: Vec<Value>,
    ports: &'a [MessagePort],
    buffers: &'a [ArrayBuffer],
    shared: &'a [SharedArrayBuffer],
    max_depth: usize,
}

fn malformed<T>(reason: impl Into<String>) -> Result<T> {
    Err(PortError::Decode(reason.into()))
}

impl Decoder<'_> {
    fn decode(&mut self) -> Result<Value> {
        if self.read_u8()? != wire::MAGIC {
            return malformed("invalid header");
        }
        let version = self.read_u8()?;
        if version != wire::FORMAT_VERSION {
            return malformed(format!("unsupported format version {version}"));
        }
        let value = self.read_value(0)?;
        if self.pos != self.input.len() {
            return malformed(format!(
                "{} trailing bytes after value",
                self.input.len() - self.pos
            ));
        }
        Ok(value)
    }

    fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        if len > self.remaining() {
            return malformed(format!("unexpected end of payload at offset {}", self.pos));
        }
        let bytes = &self.input[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_u32(&mut self) -> Result<usize> {
        Ok(u32::from_le_bytes(self.read_array()?) as usize)
    }

    fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// Read a count of items that each take at least one byte.
    fn read_count(&mut self) -> Result<usize> {
        let count = self.read_u32()?;
        if count > self.remaining() {
            return malformed(format!("length {count} exceeds remaining payload"));
        }
        Ok(count)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()?;
        let bytes = self.take(len)?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_owned()),
            Err(err) => malformed(format!("invalid utf-8 string: {err}")),
        }
    }

    fn read_index<T: Clone>(&mut self, table: &[T], what: &str) -> Result<T> {
        let index = self.read_u32()?;
        match table.get(index) {
            Some(entry) => Ok(entry.clone()),
            None => malformed(format!("{what} id {index} out of range")),
        }
    }

    fn check_depth(&self, depth: usize) -> Result<()> {
        if depth >= self.max_depth {
            return malformed(format!("nesting exceeds {} levels", self.max_depth));
        }
        Ok(())
    }

    fn read_value(&mut self, depth: usize) -> Result<Value> {
        let at = self.pos;
        let tag = self.read_u8()?;
        let value = match tag {
            wire::UNDEFINED => Value::Undefined,
            wire::NULL => Value::Null,
            wire::TRUE => Value::Bool(true),
            wire::FALSE => Value::Bool(false),
            wire::NUMBER => Value::Number(self.read_f64()?),
            wire::BIGINT => Value::BigInt(i64::from_le_bytes(self.read_array()?)),
            wire::DATE => Value::Date(self.read_f64()?),
            wire::STRING => Value::String(self.read_string()?),
            wire::OBJECT => {
                self.check_depth(depth)?;
                let count = self.read_count()?;
                let object = Object::new();
                self.backrefs.push(Value::Object(object.clone()));
                for _ in 0..count {
                    let key = self.read_string()?;
                    let value = self.read_value(depth + 1)?;
                    object.set(key, value);
                }
                Value::Object(object)
            }
            wire::ARRAY => {
                self.check_depth(depth)?;
                let len = self.read_count()?;
                let array = Array::from_vec(Vec::with_capacity(len));
                self.backrefs.push(Value::Array(array.clone()));
                for _ in 0..len {
                    let item = self.read_value(depth + 1)?;
                    array.push(item);
                }
                Value::Array(array)
            }
            wire::BACKREF => {
                let id = self.read_u32()?;
                match self.backrefs.get(id) {
                    Some(value) => value.clone(),
                    None => return malformed(format!("back-reference id {id} out of range")),
                }
            }
            wire::ARRAY_BUFFER => {
                let len = self.read_u32()?;
                let buf = ArrayBuffer::from_vec(self.take(len)?.to_vec());
                self.backrefs.push(Value::ArrayBuffer(buf.clone()));
                Value::ArrayBuffer(buf)
            }
            wire::TRANSFERRED_BUFFER => {
                Value::ArrayBuffer(self.read_index(self.buffers, "transferred buffer")?)
            }
            wire::SHARED_BUFFER => {
                Value::SharedArrayBuffer(self.read_index(self.shared, "shared buffer")?)
            }
            wire::PORT => Value::Port(self.read_index(self.ports, "port")?),
            other => return malformed(format!("unknown tag 0x{other:02x} at offset {at}")),
        };
        Ok(value)
    }
}
