use std::collections::HashMap;
use std::ptr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use super::wire;
use super::CodecConfig;
use crate::buffer::{ArrayBuffer, SharedMemory};
use crate::error::{PortError, Result};
use crate::mailbox::Mailbox;
use crate::message::Message;
use crate::port::MessagePort;
use crate::value::{HostObject, Value};

/// Serialize `value` into a [`Message`], moving the resources in `transfer`.
///
/// `source` is the mailbox of the posting port, if any; neither it nor its
/// sibling may appear in the transfer list.
///
/// Non-detachable buffers in `transfer` are copied instead of moved. On error
/// nothing has been neutered or detached.
pub fn serialize(
    value: &Value,
    transfer: &[Value],
    source: Option<&Mailbox>,
    config: &CodecConfig,
) -> Result<Message> {
    let plan = TransferPlan::build(transfer, source)?;

    let mut serializer = Serializer {
        out: BytesMut::with_capacity(64),
        backrefs: HashMap::new(),
        shared: Vec::new(),
        shared_ids: HashMap::new(),
        plan: &plan,
        config,
    };
    serializer.out.put_u8(wire::MAGIC);
    serializer.out.put_u8(wire::FORMAT_VERSION);
    serializer.write_value(value, 0)?;

    let Serializer { out, shared, .. } = serializer;
    Ok(plan.commit(out.freeze(), shared))
}

/// Validated transfer list. Nothing is touched until [`commit`](Self::commit).
struct TransferPlan<'a> {
    buffers: Vec<&'a ArrayBuffer>,
    copied: Vec<&'a ArrayBuffer>,
    ports: Vec<(&'a MessagePort, Arc<Mailbox>)>,
}

impl<'a> TransferPlan<'a> {
    fn build(transfer: &'a [Value], source: Option<&Mailbox>) -> Result<Self> {
        let mut plan = TransferPlan {
            buffers: Vec::new(),
            copied: Vec::new(),
            ports: Vec::new(),
        };

        for (index, entry) in transfer.iter().enumerate() {
            match entry.as_host_object() {
                Some(HostObject::Exclusive(buf)) => {
                    if buf.is_detached() {
                        return Err(PortError::NotTransferable(format!(
                            "ArrayBuffer at index {index} is detached"
                        )));
                    }
                    if plan
                        .buffers
                        .iter()
                        .chain(&plan.copied)
                        .any(|listed| listed.ptr_eq(buf))
                    {
                        return Err(PortError::NotTransferable(format!(
                            "ArrayBuffer at index {index} is listed more than once"
                        )));
                    }
                    if buf.is_detachable() {
                        plan.buffers.push(buf);
                    } else {
                        trace!(index, "non-detachable buffer will be copied");
                        plan.copied.push(buf);
                    }
                }
                Some(HostObject::Port(port)) => {
                    let Some(mailbox) = port.mailbox() else {
                        return Err(PortError::NotTransferable(format!(
                            "MessagePort at index {index} is closed or detached"
                        )));
                    };
                    if plan.ports.iter().any(|(listed, _)| listed.ptr_eq(port)) {
                        return Err(PortError::NotTransferable(format!(
                            "MessagePort at index {index} is listed more than once"
                        )));
                    }
                    if let Some(source) = source {
                        if ptr::eq(source, &*mailbox) {
                            return Err(PortError::InvalidTransferEntry {
                                index,
                                reason: "a port cannot transfer itself".into(),
                            });
                        }
                        if source.is_entangled_with(&mailbox) {
                            return Err(PortError::InvalidTransferEntry {
                                index,
                                reason: "a port cannot transfer its own peer".into(),
                            });
                        }
                    }
                    plan.ports.push((port, mailbox));
                }
                Some(HostObject::Shared(_)) => {
                    return Err(PortError::InvalidTransferEntry {
                        index,
                        reason: "SharedArrayBuffer is shared, not transferred".into(),
                    });
                }
                None => {
                    return Err(PortError::InvalidTransferEntry {
                        index,
                        reason: format!("{} is not transferable", entry.type_name()),
                    });
                }
            }
        }
        Ok(plan)
    }

    fn buffer_index(&self, buf: &ArrayBuffer) -> Option<usize> {
        self.buffers.iter().position(|listed| listed.ptr_eq(buf))
    }

    fn port_index(&self, port: &MessagePort) -> Option<usize> {
        self.ports.iter().position(|(listed, _)| listed.ptr_eq(port))
    }

    fn commit(self, payload: Bytes, shared: Vec<Arc<SharedMemory>>) -> Message {
        let buffers = self
            .buffers
            .iter()
            .map(|buf| buf.take_contents())
            .collect();
        let ports = self
            .ports
            .into_iter()
            .map(|(port, mailbox)| {
                port.release_for_transfer();
                mailbox
            })
            .collect();
        Message::new(payload, buffers, ports, shared)
    }
}

struct Serializer<'p, 'a> {
    out: BytesMut,
    /// Container identity to back-reference id.
    backrefs: HashMap<usize, u32>,
    shared: Vec<Arc<SharedMemory>>,
    /// Shared region id to side-table index.
    shared_ids: HashMap<u64, u32>,
    plan: &'p TransferPlan<'a>,
    config: &'p CodecConfig,
}

impl Serializer<'_, '_> {
    fn write_value(&mut self, value: &Value, depth: usize) -> Result<()> {
        match value {
            Value::Undefined => self.out.put_u8(wire::UNDEFINED),
            Value::Null => self.out.put_u8(wire::NULL),
            Value::Bool(true) => self.out.put_u8(wire::TRUE),
            Value::Bool(false) => self.out.put_u8(wire::FALSE),
            Value::Number(n) => {
                self.out.put_u8(wire::NUMBER);
                self.out.put_f64_le(*n);
            }
            Value::BigInt(i) => {
                self.out.put_u8(wire::BIGINT);
                self.out.put_i64_le(*i);
            }
            Value::Date(ms) => {
                self.out.put_u8(wire::DATE);
                self.out.put_f64_le(*ms);
            }
            Value::String(s) => {
                self.out.put_u8(wire::STRING);
                self.write_str(s)?;
            }
            Value::Object(object) => {
                if self.write_backref(object.identity()) {
                    return Ok(());
                }
                self.check_depth(depth)?;
                let entries = object.entries();
                self.out.put_u8(wire::OBJECT);
                self.write_len(entries.len())?;
                for (key, value) in &entries {
                    self.write_str(key)?;
                    self.write_value(value, depth + 1)?;
                }
            }
            Value::Array(array) => {
                if self.write_backref(array.identity()) {
                    return Ok(());
                }
                self.check_depth(depth)?;
                let items = array.to_vec();
                self.out.put_u8(wire::ARRAY);
                self.write_len(items.len())?;
                for item in &items {
                    self.write_value(item, depth + 1)?;
                }
            }
            Value::ArrayBuffer(buf) => {
                if let Some(index) = self.plan.buffer_index(buf) {
                    self.out.put_u8(wire::TRANSFERRED_BUFFER);
                    self.write_len(index)?;
                    return Ok(());
                }
                if buf.is_detached() {
                    return Err(PortError::DataClone("ArrayBuffer is detached".into()));
                }
                if self.write_backref(buf.identity()) {
                    return Ok(());
                }
                self.out.put_u8(wire::ARRAY_BUFFER);
                buf.with_bytes(|bytes| self.write_bytes(bytes))?;
            }
            Value::SharedArrayBuffer(shared) => {
                let memory = shared.memory();
                let next = self.shared.len();
                let index = match self.shared_ids.get(&memory.id()) {
                    Some(index) => *index,
                    None => {
                        let index = self.to_u32(next)?;
                        self.shared_ids.insert(memory.id(), index);
                        self.shared.push(Arc::clone(memory));
                        index
                    }
                };
                self.out.put_u8(wire::SHARED_BUFFER);
                self.out.put_u32_le(index);
            }
            Value::Port(port) => {
                let index = self
                    .plan
                    .port_index(port)
                    .ok_or(PortError::PortNotInTransferList)?;
                self.out.put_u8(wire::PORT);
                self.write_len(index)?;
            }
        }
        self.check_size()
    }

    /// Write a back-reference if this container was seen before; otherwise
    /// assign it the next id and return false.
    fn write_backref(&mut self, identity: usize) -> bool {
        if let Some(id) = self.backrefs.get(&identity) {
            self.out.put_u8(wire::BACKREF);
            self.out.put_u32_le(*id);
            return true;
        }
        let id = self.backrefs.len() as u32;
        self.backrefs.insert(identity, id);
        false
    }

    fn check_depth(&self, depth: usize) -> Result<()> {
        if depth >= self.config.max_depth {
            return Err(PortError::DataClone(format!(
                "value nesting exceeds {} levels",
                self.config.max_depth
            )));
        }
        Ok(())
    }

    fn check_size(&self) -> Result<()> {
        if self.out.len() > self.config.max_payload_size {
            return Err(PortError::PayloadTooLarge {
                size: self.out.len(),
                max: self.config.max_payload_size,
            });
        }
        Ok(())
    }

    fn to_u32(&self, n: usize) -> Result<u32> {
        u32::try_from(n).map_err(|_| PortError::PayloadTooLarge {
            size: n,
            max: u32::MAX as usize,
        })
    }

    fn write_len(&mut self, len: usize) -> Result<()> {
        let len = self.to_u32(len)?;
        self.out.put_u32_le(len);
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let size = self.out.len().saturating_add(4 + bytes.len());
        if size > self.config.max_payload_size {
            return Err(PortError::PayloadTooLarge {
                size,
                max: self.config.max_payload_size,
            });
        }
        self.write_len(bytes.len())?;
        self.out.put_slice(bytes);
        Ok(())
    }

    fn write_str(&mut self, s: &str) -> Result<()> {
        self.write_bytes(s.as_bytes())
    }
}
