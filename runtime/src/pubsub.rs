//! UADP `NetworkMessage` codec with precomputed `OffsetTable` for
//! fixed-layout real-time publish (§4.7), and the cascading PubSub
//! component state machine (§4.8).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use transport_support::logging::Logger;
use transport_support::time::DateTime;
use transport_support::StatusCode;

fn write_bytes_u32<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(bytes.len() as u32)?;
    w.write_all(bytes)
}

fn read_bytes_u32(cursor: &mut Cursor<&[u8]>) -> io::Result<Vec<u8>> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

/// Which optional sections are present in a `NetworkMessage`. Bit layout is
/// this crate's own and not the OPC UA wire-standard `UadpFlags` byte; only
/// `decode(encode(x)) == x` is required (§8 round-trip property), not
/// interop with the real UADP bitfield.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct NetworkMessageFlags {
    pub publisher_id: bool,
    pub group_header: bool,
    pub payload_header: bool,
    pub sequence_number: bool,
    pub timestamp: bool,
    pub picoseconds: bool,
    pub security_header: bool,
}

impl NetworkMessageFlags {
    fn to_byte(self) -> u8 {
        (self.publisher_id as u8)
            | (self.group_header as u8) << 1
            | (self.payload_header as u8) << 2
            | (self.sequence_number as u8) << 3
            | (self.timestamp as u8) << 4
            | (self.picoseconds as u8) << 5
            | (self.security_header as u8) << 6
    }

    fn from_byte(b: u8) -> Self {
        NetworkMessageFlags {
            publisher_id: b & 0x01 != 0,
            group_header: b & 0x02 != 0,
            payload_header: b & 0x04 != 0,
            sequence_number: b & 0x08 != 0,
            timestamp: b & 0x10 != 0,
            picoseconds: b & 0x20 != 0,
            security_header: b & 0x40 != 0,
        }
    }
}

/// A variant-typed publisher identifier (§4.7).
#[derive(Debug, Clone, PartialEq)]
pub enum PublisherId {
    Byte(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    String(String),
}

impl PublisherId {
    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            PublisherId::Byte(v) => {
                w.write_u8(0)?;
                w.write_u8(*v)
            }
            PublisherId::UInt16(v) => {
                w.write_u8(1)?;
                w.write_u16::<LittleEndian>(*v)
            }
            PublisherId::UInt32(v) => {
                w.write_u8(2)?;
                w.write_u32::<LittleEndian>(*v)
            }
            PublisherId::UInt64(v) => {
                w.write_u8(3)?;
                w.write_u64::<LittleEndian>(*v)
            }
            PublisherId::String(v) => {
                w.write_u8(4)?;
                write_bytes_u32(w, v.as_bytes())
            }
        }
    }

    fn decode(cursor: &mut Cursor<&[u8]>) -> io::Result<Self> {
        match cursor.read_u8()? {
            0 => Ok(PublisherId::Byte(cursor.read_u8()?)),
            1 => Ok(PublisherId::UInt16(cursor.read_u16::<LittleEndian>()?)),
            2 => Ok(PublisherId::UInt32(cursor.read_u32::<LittleEndian>()?)),
            3 => Ok(PublisherId::UInt64(cursor.read_u64::<LittleEndian>()?)),
            4 => {
                let bytes = read_bytes_u32(cursor)?;
                String::from_utf8(bytes)
                    .map(PublisherId::String)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 publisher id"))
            }
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, "unknown publisher id tag")),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct GroupHeader {
    pub writer_group_id: u16,
    pub group_version: u32,
    pub network_message_number: u16,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PayloadHeader {
    pub dataset_writer_ids: Vec<u16>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FieldEncoding {
    Variant,
    DataValue,
    RawData,
}

impl FieldEncoding {
    fn to_bits(self) -> u8 {
        match self {
            FieldEncoding::Variant => 0,
            FieldEncoding::DataValue => 1,
            FieldEncoding::RawData => 2,
        }
    }

    fn from_bits(bits: u8) -> Result<Self, StatusCode> {
        match bits {
            0 => Ok(FieldEncoding::Variant),
            1 => Ok(FieldEncoding::DataValue),
            2 => Ok(FieldEncoding::RawData),
            _ => Err(StatusCode::BadInvalidArgument),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSetMessage {
    pub field_encoding: FieldEncoding,
    pub sequence_number: Option<u16>,
    pub timestamp: Option<DateTime>,
    /// Already-serialized field bytes. What "serialized" means depends on
    /// `field_encoding`; the service layer owns field-level (de)serialization,
    /// this codec only frames the blob.
    pub payload: Vec<u8>,
}

impl DataSetMessage {
    fn flags_byte(&self) -> u8 {
        (self.sequence_number.is_some() as u8)
            | (self.timestamp.is_some() as u8) << 1
            | self.field_encoding.to_bits() << 2
    }
}

/// One entry in an [`OffsetTable`]: which mutable slot (`offset_type`) sits
/// at `byte_offset` in the baseline buffer, and which field/dataset-message
/// (`component`) it belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OffsetType {
    NetworkMessageSequenceNumber,
    DataSetMessageSequenceNumber,
    Timestamp,
    DataSetFieldRaw,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OffsetEntry {
    pub offset_type: OffsetType,
    pub byte_offset: usize,
    /// Index of the owning `DataSetMessage`, or 0 for a NetworkMessage-level
    /// slot.
    pub component: u32,
}

/// A `NetworkMessage`'s baseline serialized buffer plus the list of byte
/// ranges that change between publish cycles (§4.7). Computed once when a
/// `FIXED_SIZE` WriterGroup is enabled; each cycle after that patches only
/// the listed offsets.
#[derive(Debug, Clone)]
pub struct OffsetTable {
    pub baseline: Vec<u8>,
    pub entries: Vec<OffsetEntry>,
}

/// UADP NetworkMessage: a header mask gating optional sections, followed by
/// one or more [`DataSetMessage`]s and an optional security footer.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkMessage {
    pub flags: NetworkMessageFlags,
    pub publisher_id: Option<PublisherId>,
    pub group_header: Option<GroupHeader>,
    pub payload_header: Option<PayloadHeader>,
    pub sequence_number: Option<u16>,
    pub timestamp: Option<DateTime>,
    pub picoseconds: Option<u16>,
    pub security_header: Option<Vec<u8>>,
    pub dataset_messages: Vec<DataSetMessage>,
    pub security_footer: Option<Vec<u8>>,
}

/// Headers learnable without touching any `DataSetMessage` payload — enough
/// for a receiver to decide which reader(s), if any, a message belongs to
/// before committing to a full decode (§4.7).
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkMessageHeaders {
    pub publisher_id: Option<PublisherId>,
    pub writer_group_id: Option<u16>,
    pub dataset_writer_ids: Vec<u16>,
}

impl NetworkMessage {
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with_offsets().0
    }

    /// Encodes the message and records the byte offset of every field that
    /// may legitimately change between publish cycles — the raw material
    /// for an [`OffsetTable`]. Encoding and offset-recording share one code
    /// path so the two can never drift apart.
    pub fn encode_with_offsets(&self) -> (Vec<u8>, Vec<OffsetEntry>) {
        let mut out = Vec::new();
        let mut entries = Vec::new();

        out.write_u8(self.flags.to_byte()).unwrap();

        if let Some(publisher_id) = &self.publisher_id {
            publisher_id.encode(&mut out).unwrap();
        }
        if let Some(group_header) = &self.group_header {
            out.write_u16::<LittleEndian>(group_header.writer_group_id).unwrap();
            out.write_u32::<LittleEndian>(group_header.group_version).unwrap();
            out.write_u16::<LittleEndian>(group_header.network_message_number).unwrap();
        }
        if let Some(payload_header) = &self.payload_header {
            out.write_u8(payload_header.dataset_writer_ids.len() as u8).unwrap();
            for id in &payload_header.dataset_writer_ids {
                out.write_u16::<LittleEndian>(*id).unwrap();
            }
        }
        if self.flags.sequence_number {
            entries.push(OffsetEntry {
                offset_type: OffsetType::NetworkMessageSequenceNumber,
                byte_offset: out.len(),
                component: 0,
            });
            out.write_u16::<LittleEndian>(self.sequence_number.unwrap_or(0)).unwrap();
        }
        if self.flags.timestamp {
            out.write_i64::<LittleEndian>(self.timestamp.unwrap_or(0)).unwrap();
        }
        if self.flags.picoseconds {
            out.write_u16::<LittleEndian>(self.picoseconds.unwrap_or(0)).unwrap();
        }
        if self.flags.security_header {
            write_bytes_u32(&mut out, self.security_header.as_deref().unwrap_or(&[])).unwrap();
        }

        out.write_u8(self.dataset_messages.len() as u8).unwrap();
        for (index, dsm) in self.dataset_messages.iter().enumerate() {
            out.write_u8(dsm.flags_byte()).unwrap();
            if let Some(seq) = dsm.sequence_number {
                entries.push(OffsetEntry {
                    offset_type: OffsetType::DataSetMessageSequenceNumber,
                    byte_offset: out.len(),
                    component: index as u32,
                });
                out.write_u16::<LittleEndian>(seq).unwrap();
            }
            if let Some(ts) = dsm.timestamp {
                entries.push(OffsetEntry { offset_type: OffsetType::Timestamp, byte_offset: out.len(), component: index as u32 });
                out.write_i64::<LittleEndian>(ts).unwrap();
            }
            out.write_u32::<LittleEndian>(dsm.payload.len() as u32).unwrap();
            if dsm.field_encoding == FieldEncoding::RawData {
                entries.push(OffsetEntry { offset_type: OffsetType::DataSetFieldRaw, byte_offset: out.len(), component: index as u32 });
            }
            out.extend_from_slice(&dsm.payload);
        }

        if let Some(footer) = &self.security_footer {
            write_bytes_u32(&mut out, footer).unwrap();
        }

        (out, entries)
    }

    pub fn decode(data: &[u8]) -> Result<Self, StatusCode> {
        let mut cursor = Cursor::new(data);
        let flags = NetworkMessageFlags::from_byte(cursor.read_u8().map_err(StatusCode::from)?);

        let publisher_id =
            if flags.publisher_id { Some(PublisherId::decode(&mut cursor).map_err(StatusCode::from)?) } else { None };
        let group_header = if flags.group_header {
            Some(GroupHeader {
                writer_group_id: cursor.read_u16::<LittleEndian>().map_err(StatusCode::from)?,
                group_version: cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?,
                network_message_number: cursor.read_u16::<LittleEndian>().map_err(StatusCode::from)?,
            })
        } else {
            None
        };
        let payload_header = if flags.payload_header {
            let count = cursor.read_u8().map_err(StatusCode::from)?;
            let mut ids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                ids.push(cursor.read_u16::<LittleEndian>().map_err(StatusCode::from)?);
            }
            Some(PayloadHeader { dataset_writer_ids: ids })
        } else {
            None
        };
        let sequence_number =
            if flags.sequence_number { Some(cursor.read_u16::<LittleEndian>().map_err(StatusCode::from)?) } else { None };
        let timestamp = if flags.timestamp { Some(cursor.read_i64::<LittleEndian>().map_err(StatusCode::from)?) } else { None };
        let picoseconds =
            if flags.picoseconds { Some(cursor.read_u16::<LittleEndian>().map_err(StatusCode::from)?) } else { None };
        let security_header =
            if flags.security_header { Some(read_bytes_u32(&mut cursor).map_err(StatusCode::from)?) } else { None };

        let dataset_count = cursor.read_u8().map_err(StatusCode::from)?;
        let mut dataset_messages = Vec::with_capacity(dataset_count as usize);
        for _ in 0..dataset_count {
            let dsm_flags = cursor.read_u8().map_err(StatusCode::from)?;
            let has_sequence = dsm_flags & 0x01 != 0;
            let has_timestamp = dsm_flags & 0x02 != 0;
            let field_encoding = FieldEncoding::from_bits((dsm_flags >> 2) & 0x03)?;
            let sequence_number =
                if has_sequence { Some(cursor.read_u16::<LittleEndian>().map_err(StatusCode::from)?) } else { None };
            let timestamp = if has_timestamp { Some(cursor.read_i64::<LittleEndian>().map_err(StatusCode::from)?) } else { None };
            let payload = read_bytes_u32(&mut cursor).map_err(StatusCode::from)?;
            dataset_messages.push(DataSetMessage { field_encoding, sequence_number, timestamp, payload });
        }

        let security_footer = if cursor.position() < data.len() as u64 {
            Some(read_bytes_u32(&mut cursor).map_err(StatusCode::from)?)
        } else {
            None
        };

        Ok(NetworkMessage {
            flags,
            publisher_id,
            group_header,
            payload_header,
            sequence_number,
            timestamp,
            picoseconds,
            security_header,
            dataset_messages,
            security_footer,
        })
    }

    /// Learns `{publisherId, writerGroupId, dataSetWriterIds}` without
    /// decoding any `DataSetMessage`, so a receiver can route a message to
    /// the right reader(s) before committing to the (potentially larger)
    /// full decode.
    pub fn decode_headers(data: &[u8]) -> Result<NetworkMessageHeaders, StatusCode> {
        let mut cursor = Cursor::new(data);
        let flags = NetworkMessageFlags::from_byte(cursor.read_u8().map_err(StatusCode::from)?);

        let publisher_id =
            if flags.publisher_id { Some(PublisherId::decode(&mut cursor).map_err(StatusCode::from)?) } else { None };
        let writer_group_id = if flags.group_header {
            let writer_group_id = cursor.read_u16::<LittleEndian>().map_err(StatusCode::from)?;
            cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?;
            cursor.read_u16::<LittleEndian>().map_err(StatusCode::from)?;
            Some(writer_group_id)
        } else {
            None
        };
        let dataset_writer_ids = if flags.payload_header {
            let count = cursor.read_u8().map_err(StatusCode::from)?;
            let mut ids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                ids.push(cursor.read_u16::<LittleEndian>().map_err(StatusCode::from)?);
            }
            ids
        } else {
            Vec::new()
        };

        Ok(NetworkMessageHeaders { publisher_id, writer_group_id, dataset_writer_ids })
    }
}

/// Drives a single-`DataSetMessage`, `FIXED_SIZE` RT WriterGroup: a baseline
/// buffer plus offset table computed once, then patched in place every
/// cycle (§4.7, scenario S7).
pub struct FixedSizeWriter {
    sequence_number: u16,
    dataset_sequence_number: u16,
    field_size: usize,
    offset_table: OffsetTable,
}

impl FixedSizeWriter {
    pub fn new(writer_group_id: u16, dataset_writer_id: u16, field_size: usize) -> Self {
        let baseline_message = NetworkMessage {
            flags: NetworkMessageFlags {
                group_header: true,
                payload_header: true,
                sequence_number: true,
                ..Default::default()
            },
            publisher_id: None,
            group_header: Some(GroupHeader { writer_group_id, group_version: 1, network_message_number: 1 }),
            payload_header: Some(PayloadHeader { dataset_writer_ids: vec![dataset_writer_id] }),
            sequence_number: Some(1),
            timestamp: None,
            picoseconds: None,
            security_header: None,
            dataset_messages: vec![DataSetMessage {
                field_encoding: FieldEncoding::RawData,
                sequence_number: Some(1),
                timestamp: None,
                payload: vec![0u8; field_size],
            }],
            security_footer: None,
        };
        let (baseline, entries) = baseline_message.encode_with_offsets();

        FixedSizeWriter { sequence_number: 1, dataset_sequence_number: 1, field_size, offset_table: OffsetTable { baseline, entries } }
    }

    pub fn offset_table(&self) -> &OffsetTable {
        &self.offset_table
    }

    /// Produces the next cycle's buffer: starts from the baseline and
    /// patches only the offsets in the table — sequence numbers always,
    /// the raw field bytes with `field_value`. `field_value.len()` must
    /// equal the field size this writer was constructed with.
    pub fn publish_cycle(&mut self, field_value: &[u8]) -> Vec<u8> {
        assert_eq!(field_value.len(), self.field_size, "field value size must match writer's fixed field size");

        let mut buffer = self.offset_table.baseline.clone();
        for entry in &self.offset_table.entries {
            match entry.offset_type {
                OffsetType::NetworkMessageSequenceNumber => {
                    buffer[entry.byte_offset..entry.byte_offset + 2].copy_from_slice(&self.sequence_number.to_le_bytes());
                }
                OffsetType::DataSetMessageSequenceNumber => {
                    buffer[entry.byte_offset..entry.byte_offset + 2]
                        .copy_from_slice(&self.dataset_sequence_number.to_le_bytes());
                }
                OffsetType::Timestamp => {
                    let now = transport_support::time::now_utc();
                    buffer[entry.byte_offset..entry.byte_offset + 8].copy_from_slice(&now.to_le_bytes());
                }
                OffsetType::DataSetFieldRaw => {
                    buffer[entry.byte_offset..entry.byte_offset + self.field_size].copy_from_slice(field_value);
                }
            }
        }

        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.dataset_sequence_number = self.dataset_sequence_number.wrapping_add(1);
        buffer
    }
}

/// Cascading PubSub component state machine (§4.8): `DISABLED`, `PAUSED`,
/// `OPERATIONAL`, `ERROR`, `PREOPERATIONAL`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ComponentState {
    Disabled,
    Paused,
    Operational,
    Error,
    Preoperational,
}

impl ComponentState {
    pub fn is_enabled(self) -> bool {
        !matches!(self, ComponentState::Disabled | ComponentState::Error)
    }
}

pub type ComponentId = u64;

pub type StateChangeCallback = Box<dyn FnMut(ComponentId, ComponentState, StatusCode) + Send>;
/// Invoked on add (`adding = true`) and remove (`adding = false`). An error
/// returned from an add aborts it and the node is cleaned up.
pub type LifecycleCallback = Box<dyn FnMut(ComponentId, bool) -> Result<(), StatusCode> + Send>;
/// Replaces the default transition logic for one component. Receives the
/// id and the state the default logic computed; returns the state that
/// should actually be applied plus a status. A bad status forces `Error`.
pub type CustomStateMachine = Box<dyn FnMut(ComponentId, ComponentState) -> (ComponentState, StatusCode) + Send>;

struct ComponentNode {
    state: ComponentState,
    parent: Option<ComponentId>,
    children: Vec<ComponentId>,
    preoperational_ready: bool,
    custom_state_machine: Option<CustomStateMachine>,
}

/// Owns every PubSub component's state and parent/child relationships.
/// Components are added DISABLED; `enable`/`disable` drive the cascade.
pub struct PubSubComponentTree {
    logger: Logger,
    next_id: ComponentId,
    nodes: HashMap<ComponentId, ComponentNode>,
    state_change_callback: Option<StateChangeCallback>,
    lifecycle_callback: Option<LifecycleCallback>,
}

impl PubSubComponentTree {
    pub fn new(logger: Logger) -> Self {
        PubSubComponentTree { logger, next_id: 1, nodes: HashMap::new(), state_change_callback: None, lifecycle_callback: None }
    }

    fn alloc_id(&mut self) -> ComponentId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn set_state_change_callback(&mut self, cb: StateChangeCallback) {
        self.state_change_callback = Some(cb);
    }

    pub fn set_lifecycle_callback(&mut self, cb: LifecycleCallback) {
        self.lifecycle_callback = Some(cb);
    }

    pub fn set_custom_state_machine(&mut self, id: ComponentId, cb: CustomStateMachine) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.custom_state_machine = Some(cb);
        }
    }

    /// A component without a preoperational precondition (every component
    /// except a ReaderGroup waiting for its first matching message) starts
    /// ready; pass `false` for a ReaderGroup.
    pub fn add_component(&mut self, parent: Option<ComponentId>, starts_ready: bool) -> Result<ComponentId, StatusCode> {
        let id = self.alloc_id();
        if let Some(cb) = &mut self.lifecycle_callback {
            cb(id, true)?;
        }
        self.nodes.insert(
            id,
            ComponentNode {
                state: ComponentState::Disabled,
                parent,
                children: Vec::new(),
                preoperational_ready: starts_ready,
                custom_state_machine: None,
            },
        );
        if let Some(parent_id) = parent {
            if let Some(parent_node) = self.nodes.get_mut(&parent_id) {
                parent_node.children.push(id);
            }
        }
        Ok(id)
    }

    /// §9 design note: a ReaderGroup holds at most one DataSetReader in this
    /// implementation; a second `add_dataset_reader` is rejected rather than
    /// supported, since the observed source's own multi-reader path was
    /// `NotImplemented` and this spec leaves it optional.
    pub fn add_dataset_reader(&mut self, reader_group: ComponentId) -> Result<ComponentId, StatusCode> {
        if let Some(node) = self.nodes.get(&reader_group) {
            if !node.children.is_empty() {
                return Err(StatusCode::BadInvalidArgument);
            }
        }
        self.add_component(Some(reader_group), false)
    }

    pub fn remove_component(&mut self, id: ComponentId) {
        self.disable(id);
        if let Some(node) = self.nodes.remove(&id) {
            if let Some(parent_id) = node.parent {
                if let Some(parent_node) = self.nodes.get_mut(&parent_id) {
                    parent_node.children.retain(|child| *child != id);
                }
            }
        }
        if let Some(cb) = &mut self.lifecycle_callback {
            let _ = cb(id, false);
        }
    }

    fn set_state(&mut self, id: ComponentId, computed: ComponentState) {
        let (final_state, status) = if let Some(node) = self.nodes.get_mut(&id) {
            if let Some(custom) = &mut node.custom_state_machine {
                let (state, status) = custom(id, computed);
                if status.is_bad() {
                    (ComponentState::Error, status)
                } else {
                    (state, status)
                }
            } else {
                (computed, StatusCode::Good)
            }
        } else {
            return;
        };

        if let Some(node) = self.nodes.get_mut(&id) {
            node.state = final_state;
        }
        if let Some(cb) = &mut self.state_change_callback {
            cb(id, final_state, status);
        }
        if status.is_bad() {
            transport_support::logging::warn!(self.logger, "component forced into error by custom state machine"; "component" => id);
        }
        self.on_parent_state_changed(id);
    }

    /// `enable()` on a DISABLED component (§4.8): attempts PREOPERATIONAL or
    /// OPERATIONAL depending on the parent's state and whether the
    /// component's own precondition is already satisfied.
    pub fn enable(&mut self, id: ComponentId) -> Result<(), StatusCode> {
        let Some(node) = self.nodes.get(&id) else { return Err(StatusCode::BadNotFound) };
        let parent_operational = match node.parent {
            Some(parent_id) => self.nodes.get(&parent_id).map(|p| p.state == ComponentState::Operational).unwrap_or(false),
            None => true,
        };
        let ready = node.preoperational_ready;

        let target = if !parent_operational {
            ComponentState::Paused
        } else if ready {
            ComponentState::Operational
        } else {
            ComponentState::Preoperational
        };
        self.set_state(id, target);
        Ok(())
    }

    /// `disable()` sets DISABLED unconditionally, disabling children first
    /// (§4.8).
    pub fn disable(&mut self, id: ComponentId) {
        let children = self.nodes.get(&id).map(|n| n.children.clone()).unwrap_or_default();
        for child in children {
            self.disable(child);
        }
        self.set_state(id, ComponentState::Disabled);
    }

    /// A ReaderGroup's first matching message (§4.8): PREOPERATIONAL →
    /// OPERATIONAL. Idempotent.
    pub fn mark_first_match(&mut self, id: ComponentId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.preoperational_ready = true;
        }
        if self.nodes.get(&id).map(|n| n.state) == Some(ComponentState::Preoperational) {
            self.set_state(id, ComponentState::Operational);
        }
    }

    /// Cascades a parent's state change to its enabled children: PAUSED
    /// when the parent leaves OPERATIONAL, re-evaluated via `enable` when it
    /// (re-)enters OPERATIONAL.
    fn on_parent_state_changed(&mut self, parent: ComponentId) {
        let (parent_state, children) = match self.nodes.get(&parent) {
            Some(node) => (node.state, node.children.clone()),
            None => return,
        };
        for child in children {
            let child_enabled = self.nodes.get(&child).map(|n| n.state.is_enabled()).unwrap_or(false);
            if !child_enabled {
                continue;
            }
            if parent_state == ComponentState::Operational {
                let _ = self.enable(child);
            } else if self.nodes.get(&child).map(|n| n.state) != Some(ComponentState::Paused) {
                self.set_state(child, ComponentState::Paused);
            }
        }
    }

    pub fn state(&self, id: ComponentId) -> Option<ComponentState> {
        self.nodes.get(&id).map(|n| n.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport_support::logging::discard;

    fn sample_message() -> NetworkMessage {
        NetworkMessage {
            flags: NetworkMessageFlags {
                publisher_id: true,
                group_header: true,
                payload_header: true,
                sequence_number: true,
                timestamp: true,
                picoseconds: false,
                security_header: false,
            },
            publisher_id: Some(PublisherId::UInt32(42)),
            group_header: Some(GroupHeader { writer_group_id: 7, group_version: 1, network_message_number: 1 }),
            payload_header: Some(PayloadHeader { dataset_writer_ids: vec![1, 2] }),
            sequence_number: Some(10),
            timestamp: Some(1_700_000_000_000_000_000),
            picoseconds: None,
            security_header: None,
            dataset_messages: vec![DataSetMessage {
                field_encoding: FieldEncoding::RawData,
                sequence_number: Some(1),
                timestamp: None,
                payload: vec![1, 2, 3, 4],
            }],
            security_footer: None,
        }
    }

    #[test]
    fn network_message_round_trips() {
        let message = sample_message();
        let decoded = NetworkMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn network_message_with_security_footer_round_trips() {
        let mut message = sample_message();
        message.security_footer = Some(vec![0xDE, 0xAD, 0xBE, 0xEF]);
        let decoded = NetworkMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn decode_headers_does_not_require_dataset_messages() {
        let message = sample_message();
        let headers = NetworkMessage::decode_headers(&message.encode()).unwrap();
        assert_eq!(headers.publisher_id, Some(PublisherId::UInt32(42)));
        assert_eq!(headers.writer_group_id, Some(7));
        assert_eq!(headers.dataset_writer_ids, vec![1, 2]);
    }

    /// Scenario S7: a single RawData UInt32 field produces the three
    /// documented offset kinds.
    #[test]
    fn fixed_size_writer_offset_table_matches_scenario_s7() {
        let writer = FixedSizeWriter::new(7, 1, 4);
        let table = writer.offset_table();

        assert!(table.entries.iter().any(|e| e.offset_type == OffsetType::NetworkMessageSequenceNumber));
        assert!(table.entries.iter().any(|e| e.offset_type == OffsetType::DataSetMessageSequenceNumber));
        assert!(table.entries.iter().any(|e| e.offset_type == OffsetType::DataSetFieldRaw));
    }

    /// Invariant 6: two cycles with the same field value differ only at the
    /// sequence-number offsets.
    #[test]
    fn two_cycles_with_same_field_value_differ_only_at_sequence_offsets() {
        let mut writer = FixedSizeWriter::new(7, 1, 4);
        let field_value = [9u8, 9, 9, 9];

        let first = writer.publish_cycle(&field_value);
        let second = writer.publish_cycle(&field_value);
        assert_eq!(first.len(), second.len());

        let sequence_offsets: Vec<usize> = writer
            .offset_table()
            .entries
            .iter()
            .filter(|e| {
                matches!(e.offset_type, OffsetType::NetworkMessageSequenceNumber | OffsetType::DataSetMessageSequenceNumber)
            })
            .flat_map(|e| [e.byte_offset, e.byte_offset + 1])
            .collect();

        for (i, (a, b)) in first.iter().zip(second.iter()).enumerate() {
            if a != b {
                assert!(sequence_offsets.contains(&i), "unexpected byte difference at offset {}", i);
            }
        }
    }

    #[test]
    fn raw_field_offset_patches_correctly() {
        let mut writer = FixedSizeWriter::new(7, 1, 4);
        let buffer = writer.publish_cycle(&[1, 2, 3, 4]);
        let raw_offset = writer.offset_table().entries.iter().find(|e| e.offset_type == OffsetType::DataSetFieldRaw).unwrap().byte_offset;
        assert_eq!(&buffer[raw_offset..raw_offset + 4], &[1, 2, 3, 4]);
    }

    fn tree() -> PubSubComponentTree {
        PubSubComponentTree::new(discard())
    }

    #[test]
    fn enabling_a_top_level_component_reaches_operational() {
        let mut components = tree();
        let connection = components.add_component(None, true).unwrap();
        components.enable(connection).unwrap();
        assert_eq!(components.state(connection), Some(ComponentState::Operational));
    }

    #[test]
    fn child_stays_paused_while_parent_is_disabled() {
        let mut components = tree();
        let connection = components.add_component(None, true).unwrap();
        let writer_group = components.add_component(Some(connection), true).unwrap();

        components.enable(writer_group).unwrap();
        assert_eq!(components.state(writer_group), Some(ComponentState::Paused));

        components.enable(connection).unwrap();
        components.enable(writer_group).unwrap();
        assert_eq!(components.state(writer_group), Some(ComponentState::Operational));
    }

    #[test]
    fn parent_leaving_operational_pauses_enabled_children() {
        let mut components = tree();
        let connection = components.add_component(None, true).unwrap();
        let writer_group = components.add_component(Some(connection), true).unwrap();
        components.enable(connection).unwrap();
        components.enable(writer_group).unwrap();
        assert_eq!(components.state(writer_group), Some(ComponentState::Operational));

        components.disable(connection);
        assert_eq!(components.state(writer_group), Some(ComponentState::Paused));
    }

    #[test]
    fn reader_group_starts_preoperational_until_first_match() {
        let mut components = tree();
        let connection = components.add_component(None, true).unwrap();
        components.enable(connection).unwrap();

        let reader_group = components.add_component(Some(connection), false).unwrap();
        components.enable(reader_group).unwrap();
        assert_eq!(components.state(reader_group), Some(ComponentState::Preoperational));

        components.mark_first_match(reader_group);
        assert_eq!(components.state(reader_group), Some(ComponentState::Operational));
    }

    #[test]
    fn disable_is_unconditional_and_recursive() {
        let mut components = tree();
        let connection = components.add_component(None, true).unwrap();
        let writer_group = components.add_component(Some(connection), true).unwrap();
        components.enable(connection).unwrap();
        components.enable(writer_group).unwrap();

        components.disable(connection);
        assert_eq!(components.state(connection), Some(ComponentState::Disabled));
        assert_eq!(components.state(writer_group), Some(ComponentState::Disabled));
    }

    #[test]
    fn custom_state_machine_can_force_error() {
        let mut components = tree();
        let connection = components.add_component(None, true).unwrap();
        components.set_custom_state_machine(connection, Box::new(|_id, _target| (ComponentState::Operational, StatusCode::BadInternalError)));

        components.enable(connection).unwrap();
        assert_eq!(components.state(connection), Some(ComponentState::Error));
    }

    #[test]
    fn second_dataset_reader_is_rejected() {
        let mut components = tree();
        let connection = components.add_component(None, true).unwrap();
        let reader_group = components.add_component(Some(connection), true).unwrap();

        assert!(components.add_dataset_reader(reader_group).is_ok());
        assert_eq!(components.add_dataset_reader(reader_group).unwrap_err(), StatusCode::BadInvalidArgument);
    }

    #[test]
    fn lifecycle_callback_can_abort_an_add() {
        let mut components = tree();
        components.set_lifecycle_callback(Box::new(|_id, adding| {
            if adding {
                Err(StatusCode::BadOutOfMemory)
            } else {
                Ok(())
            }
        }));

        assert!(components.add_component(None, true).is_err());
    }
}
