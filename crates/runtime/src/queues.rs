//! Input and output message queues
//!
//! Inbound packets are split per sending peer, one FIFO each, and
//! extracted round-robin so a chatty neighbor cannot starve the others.
//!
//! Outbound messages sit in six FIFOs, one per message type, drained in
//! priority order (broadcast first) at packet-assembly time. Queued
//! messages hold live heap handles, which the collector treats as roots
//! until the packet carrying them has been serialized.
//!
//! Packet framing: `sender_id:u16 || repeated (len:u16 || payload)`,
//! zero-padded to the radio MTU.

use std::collections::{BTreeMap, VecDeque};

use buzz_core::heap::{Heap, ObjRef};
use buzz_core::msg::{
    serialize_value, write_u16, write_u8, ByteReader, CodecError, MessageType,
    MESSAGE_TYPE_COUNT,
};
use buzz_core::value::{IStr, TableKey, TypeTag};

/// Per-peer FIFOs with round-robin extraction.
#[derive(Debug, Default)]
pub struct InMsgQueue {
    queues: BTreeMap<u16, VecDeque<Vec<u8>>>,
    /// Peers in arrival order; the cursor walks them fairly.
    order: Vec<u16>,
    cursor: usize,
}

impl InMsgQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(|q| q.is_empty())
    }

    /// Total queued payloads across all peers.
    pub fn len(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }

    /// Enqueue one payload from `robot`.
    pub fn push(&mut self, robot: u16, payload: Vec<u8>) {
        if !self.queues.contains_key(&robot) {
            self.order.push(robot);
        }
        self.queues.entry(robot).or_default().push_back(payload);
    }

    /// Split a framed packet into its payloads.
    pub fn receive_packet(&mut self, data: &[u8]) {
        let mut rd = ByteReader::new(data);
        let robot = match rd.read_u16() {
            Ok(r) => r,
            Err(_) => {
                tracing::warn!("received packet shorter than its sender header");
                return;
            }
        };
        loop {
            let len = match rd.read_u16() {
                Ok(0) | Err(_) => break,
                Ok(len) => len as usize,
            };
            if rd.remaining() < len {
                tracing::warn!(robot, "truncated payload in received packet");
                break;
            }
            let mut payload = vec![0u8; len];
            for b in payload.iter_mut() {
                *b = rd.read_u8().expect("length checked");
            }
            self.push(robot, payload);
        }
    }

    /// Pop one payload, cycling through the peers.
    pub fn extract(&mut self) -> Option<(u16, Vec<u8>)> {
        if self.order.is_empty() {
            return None;
        }
        for _ in 0..self.order.len() {
            let robot = self.order[self.cursor % self.order.len()];
            self.cursor = (self.cursor + 1) % self.order.len();
            if let Some(q) = self.queues.get_mut(&robot) {
                if let Some(payload) = q.pop_front() {
                    return Some((robot, payload));
                }
            }
        }
        None
    }
}

/// One queued outbound message, still holding live heap handles.
#[derive(Debug, Clone)]
pub enum OutMessage {
    Broadcast {
        topic: IStr,
        value: ObjRef,
    },
    SwarmList {
        swarms: Vec<u16>,
    },
    VStig {
        query: bool,
        id: u16,
        key: TableKey,
        data: ObjRef,
        timestamp: u16,
        robot: u16,
    },
    SwarmJoin {
        id: u16,
    },
    SwarmLeave {
        id: u16,
    },
}

impl OutMessage {
    fn message_type(&self) -> MessageType {
        match self {
            OutMessage::Broadcast { .. } => MessageType::Broadcast,
            OutMessage::SwarmList { .. } => MessageType::SwarmList,
            OutMessage::VStig { query: false, .. } => MessageType::VStigPut,
            OutMessage::VStig { query: true, .. } => MessageType::VStigQuery,
            OutMessage::SwarmJoin { .. } => MessageType::SwarmJoin,
            OutMessage::SwarmLeave { .. } => MessageType::SwarmLeave,
        }
    }

    /// Serialize into a payload (type byte first).
    fn serialize(&self, heap: &Heap) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        write_u8(&mut buf, self.message_type() as u8);
        match self {
            OutMessage::Broadcast { topic, value } => {
                write_u16(&mut buf, TypeTag::String as u16);
                buzz_core::msg::write_str(&mut buf, &topic.text);
                serialize_value(&mut buf, *value, heap)?;
            }
            OutMessage::SwarmList { swarms } => {
                write_u16(&mut buf, swarms.len() as u16);
                for id in swarms {
                    write_u16(&mut buf, *id);
                }
            }
            OutMessage::VStig {
                id,
                key,
                data,
                timestamp,
                robot,
                ..
            } => {
                write_u16(&mut buf, *id);
                serialize_table_key(&mut buf, key);
                serialize_value(&mut buf, *data, heap)?;
                write_u16(&mut buf, *timestamp);
                write_u16(&mut buf, *robot);
            }
            OutMessage::SwarmJoin { id } | OutMessage::SwarmLeave { id } => {
                write_u16(&mut buf, *id);
            }
        }
        Ok(buf)
    }
}

fn serialize_table_key(buf: &mut Vec<u8>, key: &TableKey) {
    match key {
        TableKey::Int(i) => {
            write_u16(buf, TypeTag::Int as u16);
            buzz_core::msg::write_i32(buf, *i);
        }
        TableKey::Float(f) => {
            write_u16(buf, TypeTag::Float as u16);
            buzz_core::msg::write_f32(buf, f.to_f32());
        }
        TableKey::String(s) => {
            write_u16(buf, TypeTag::String as u16);
            buzz_core::msg::write_str(buf, &s.text);
        }
    }
}

/// Six per-type FIFOs drained in priority order.
#[derive(Debug, Default)]
pub struct OutMsgQueue {
    queues: [VecDeque<OutMessage>; MESSAGE_TYPE_COUNT],
}

impl OutMsgQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn append(&mut self, msg: OutMessage) {
        self.queues[msg.message_type() as usize].push_back(msg);
    }

    /// All queued messages, highest priority first; used by the GC to
    /// root queued values.
    pub fn iter(&self) -> impl Iterator<Item = &OutMessage> {
        self.queues.iter().flat_map(|q| q.iter())
    }

    /// Assemble one radio packet of at most `mtu` bytes, consuming
    /// queued messages from the highest priority down. A payload that
    /// could never fit is dropped with a warning; the first payload that
    /// merely does not fit right now stops assembly and waits for the
    /// next step. The remainder of the MTU is zero-padded.
    pub fn assemble_packet(&mut self, robot: u16, mtu: usize, heap: &Heap) -> Vec<u8> {
        let mut packet = Vec::with_capacity(mtu);
        write_u16(&mut packet, robot);
        'outer: for priority in 0..MESSAGE_TYPE_COUNT {
            while let Some(msg) = self.queues[priority].front() {
                let payload = match msg.serialize(heap) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(robot, error = %e, "dropping unserializable message");
                        self.queues[priority].pop_front();
                        continue;
                    }
                };
                if payload.len() + 2 > mtu.saturating_sub(2) {
                    tracing::warn!(
                        robot,
                        size = payload.len(),
                        mtu,
                        "dropping oversize outbound message"
                    );
                    self.queues[priority].pop_front();
                    continue;
                }
                if packet.len() + 2 + payload.len() > mtu {
                    break 'outer;
                }
                write_u16(&mut packet, payload.len() as u16);
                packet.extend_from_slice(&payload);
                self.queues[priority].pop_front();
            }
        }
        packet.resize(mtu, 0);
        packet
    }
}
