//! Chunk framer and SecureChannel state machine (§4.6): the connection-level
//! HEL/ACK handshake, OPN token issue/renew, and the per-MSG sequence and
//! request-id discipline that gates dispatch to the service layer.
//!
//! Wire layout shared by every chunk: a 3-byte ASCII message type, a 1-byte
//! finality marker (`F`inal/`C`ontinuation/`A`bort), a 4-byte little-endian
//! total size, then — for every type except HEL/ACK/ERR — a 4-byte
//! `secureChannelId`. What follows the common header depends on the message
//! type and is handled by the functions below rather than a single struct,
//! since OPN carries an asymmetric security header and MSG/CLO a symmetric
//! one.

use crate::connection::ConnectionId;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;
use transport_support::crypto::{EncryptionKeys, SecurityMode, SecurityPolicy};
use transport_support::logging::{warn, Logger};
use transport_support::time::{now_utc, DateTime};
use transport_support::StatusCode;

pub const COMMON_HEADER_SIZE: usize = 8;
pub const CHANNEL_ID_SIZE: usize = 4;

/// A sequence number is allowed to wrap from near `u32::MAX` back down to a
/// small value without being treated as out-of-order.
const SEQUENCE_WRAP_WINDOW: u32 = 1024;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageType {
    Hel,
    Ack,
    Err,
    Opn,
    Msg,
    Clo,
}

impl MessageType {
    fn code(self) -> &'static [u8; 3] {
        match self {
            MessageType::Hel => b"HEL",
            MessageType::Ack => b"ACK",
            MessageType::Err => b"ERR",
            MessageType::Opn => b"OPN",
            MessageType::Msg => b"MSG",
            MessageType::Clo => b"CLO",
        }
    }

    fn from_code(code: [u8; 3]) -> Option<Self> {
        match &code {
            b"HEL" => Some(MessageType::Hel),
            b"ACK" => Some(MessageType::Ack),
            b"ERR" => Some(MessageType::Err),
            b"OPN" => Some(MessageType::Opn),
            b"MSG" => Some(MessageType::Msg),
            b"CLO" => Some(MessageType::Clo),
            _ => None,
        }
    }

    /// HEL/ACK/ERR precede any channel; every other type is channel-scoped.
    fn carries_channel_id(self) -> bool {
        !matches!(self, MessageType::Hel | MessageType::Ack | MessageType::Err)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Finality {
    Final,
    Intermediate,
    Abort,
}

impl Finality {
    fn to_byte(self) -> u8 {
        match self {
            Finality::Final => b'F',
            Finality::Intermediate => b'C',
            Finality::Abort => b'A',
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'F' => Some(Finality::Final),
            b'C' => Some(Finality::Intermediate),
            b'A' => Some(Finality::Abort),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct ChunkHeader {
    pub message_type: MessageType,
    pub finality: Finality,
    pub message_size: u32,
    pub secure_channel_id: Option<u32>,
}

impl ChunkHeader {
    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(self.message_type.code())?;
        w.write_u8(self.finality.to_byte())?;
        w.write_u32::<LittleEndian>(self.message_size)?;
        if self.message_type.carries_channel_id() {
            w.write_u32::<LittleEndian>(self.secure_channel_id.unwrap_or(0))?;
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<(Self, usize), StatusCode> {
        if data.len() < COMMON_HEADER_SIZE {
            return Err(StatusCode::BadInvalidArgument);
        }
        let mut cursor = Cursor::new(data);
        let mut code = [0u8; 3];
        cursor.read_exact(&mut code).map_err(StatusCode::from)?;
        let message_type = MessageType::from_code(code).ok_or(StatusCode::BadInvalidArgument)?;
        let finality_byte = cursor.read_u8().map_err(StatusCode::from)?;
        let finality = Finality::from_byte(finality_byte).ok_or(StatusCode::BadInvalidArgument)?;
        let message_size = cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?;

        let secure_channel_id = if message_type.carries_channel_id() {
            if data.len() < COMMON_HEADER_SIZE + CHANNEL_ID_SIZE {
                return Err(StatusCode::BadInvalidArgument);
            }
            Some(cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?)
        } else {
            None
        };

        Ok((
            ChunkHeader { message_type, finality, message_size, secure_channel_id },
            cursor.position() as usize,
        ))
    }

    fn header_len(&self) -> usize {
        COMMON_HEADER_SIZE + if self.message_type.carries_channel_id() { CHANNEL_ID_SIZE } else { 0 }
    }
}

fn write_opcua_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_i32::<LittleEndian>(s.len() as i32)?;
    w.write_all(s.as_bytes())
}

fn read_opcua_string(cursor: &mut Cursor<&[u8]>) -> io::Result<String> {
    let len = cursor.read_i32::<LittleEndian>()?;
    if len < 0 {
        return Ok(String::new());
    }
    let mut buf = vec![0u8; len as usize];
    cursor.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 string"))
}

fn write_opcua_bytes<W: Write>(w: &mut W, b: &[u8]) -> io::Result<()> {
    w.write_i32::<LittleEndian>(b.len() as i32)?;
    w.write_all(b)
}

fn read_opcua_bytes(cursor: &mut Cursor<&[u8]>) -> io::Result<Vec<u8>> {
    let len = cursor.read_i32::<LittleEndian>()?;
    if len < 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; len as usize];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

/// Client's opening handshake message (§4.6).
#[derive(Debug, Clone, PartialEq)]
pub struct HelloMessage {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
    pub endpoint_url: String,
}

impl HelloMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u32::<LittleEndian>(self.protocol_version).unwrap();
        body.write_u32::<LittleEndian>(self.receive_buffer_size).unwrap();
        body.write_u32::<LittleEndian>(self.send_buffer_size).unwrap();
        body.write_u32::<LittleEndian>(self.max_message_size).unwrap();
        body.write_u32::<LittleEndian>(self.max_chunk_count).unwrap();
        write_opcua_string(&mut body, &self.endpoint_url).unwrap();

        let header = ChunkHeader {
            message_type: MessageType::Hel,
            finality: Finality::Final,
            message_size: (COMMON_HEADER_SIZE + body.len()) as u32,
            secure_channel_id: None,
        };
        let mut out = Vec::with_capacity(header.header_len() + body.len());
        header.encode(&mut out).unwrap();
        out.extend_from_slice(&body);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, StatusCode> {
        let (header, offset) = ChunkHeader::decode(data)?;
        if header.message_type != MessageType::Hel {
            return Err(StatusCode::BadInvalidArgument);
        }
        let mut cursor = Cursor::new(&data[offset..]);
        Ok(HelloMessage {
            protocol_version: cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?,
            receive_buffer_size: cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?,
            send_buffer_size: cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?,
            max_message_size: cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?,
            max_chunk_count: cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?,
            endpoint_url: read_opcua_string(&mut cursor).map_err(StatusCode::from)?,
        })
    }
}

/// Server's reply to HEL, mirroring its own transport limits. Carries no
/// `endpointUrl`.
#[derive(Debug, Clone, PartialEq)]
pub struct AckMessage {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
}

impl AckMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u32::<LittleEndian>(self.protocol_version).unwrap();
        body.write_u32::<LittleEndian>(self.receive_buffer_size).unwrap();
        body.write_u32::<LittleEndian>(self.send_buffer_size).unwrap();
        body.write_u32::<LittleEndian>(self.max_message_size).unwrap();
        body.write_u32::<LittleEndian>(self.max_chunk_count).unwrap();

        let header = ChunkHeader {
            message_type: MessageType::Ack,
            finality: Finality::Final,
            message_size: (COMMON_HEADER_SIZE + body.len()) as u32,
            secure_channel_id: None,
        };
        let mut out = Vec::with_capacity(header.header_len() + body.len());
        header.encode(&mut out).unwrap();
        out.extend_from_slice(&body);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, StatusCode> {
        let (header, offset) = ChunkHeader::decode(data)?;
        if header.message_type != MessageType::Ack {
            return Err(StatusCode::BadInvalidArgument);
        }
        let mut cursor = Cursor::new(&data[offset..]);
        Ok(AckMessage {
            protocol_version: cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?,
            receive_buffer_size: cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?,
            send_buffer_size: cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?,
            max_message_size: cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?,
            max_chunk_count: cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?,
        })
    }
}

/// Precedes an OPN payload.
#[derive(Debug, Clone, PartialEq)]
pub struct AsymmetricSecurityHeader {
    pub security_policy_uri: String,
    pub sender_certificate: Vec<u8>,
    pub receiver_certificate_thumbprint: Vec<u8>,
}

impl AsymmetricSecurityHeader {
    pub fn encode(&self, w: &mut Vec<u8>) {
        write_opcua_string(w, &self.security_policy_uri).unwrap();
        write_opcua_bytes(w, &self.sender_certificate).unwrap();
        write_opcua_bytes(w, &self.receiver_certificate_thumbprint).unwrap();
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>) -> Result<Self, StatusCode> {
        Ok(AsymmetricSecurityHeader {
            security_policy_uri: read_opcua_string(cursor).map_err(StatusCode::from)?,
            sender_certificate: read_opcua_bytes(cursor).map_err(StatusCode::from)?,
            receiver_certificate_thumbprint: read_opcua_bytes(cursor).map_err(StatusCode::from)?,
        })
    }
}

/// Precedes an MSG/CLO payload.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SymmetricSecurityHeader {
    pub token_id: u32,
}

impl SymmetricSecurityHeader {
    pub fn encode(&self, w: &mut Vec<u8>) {
        w.write_u32::<LittleEndian>(self.token_id).unwrap();
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>) -> Result<Self, StatusCode> {
        Ok(SymmetricSecurityHeader { token_id: cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)? })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SequenceHeader {
    pub sequence_number: u32,
    pub request_id: u32,
}

impl SequenceHeader {
    pub fn encode(&self, w: &mut Vec<u8>) {
        w.write_u32::<LittleEndian>(self.sequence_number).unwrap();
        w.write_u32::<LittleEndian>(self.request_id).unwrap();
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>) -> Result<Self, StatusCode> {
        Ok(SequenceHeader {
            sequence_number: cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?,
            request_id: cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?,
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RequestType {
    Issue,
    Renew,
}

#[derive(Debug, Clone)]
pub struct OpenSecureChannelRequest {
    pub request_type: RequestType,
    pub security_mode: SecurityMode,
    pub client_nonce: Vec<u8>,
    pub requested_lifetime_ms: u32,
}

#[derive(Debug, Clone)]
pub struct OpenSecureChannelResponse {
    pub channel_id: u32,
    pub token_id: u32,
    pub created_at: DateTime,
    pub revised_lifetime_ms: u32,
    pub server_nonce: Vec<u8>,
}

fn security_mode_to_wire(mode: SecurityMode) -> u32 {
    match mode {
        SecurityMode::Invalid => 0,
        SecurityMode::Sign => 1,
        SecurityMode::SignAndEncrypt => 2,
    }
}

fn security_mode_from_wire(value: u32) -> Result<SecurityMode, StatusCode> {
    match value {
        0 => Ok(SecurityMode::Invalid),
        1 => Ok(SecurityMode::Sign),
        2 => Ok(SecurityMode::SignAndEncrypt),
        _ => Err(StatusCode::BadInvalidArgument),
    }
}

impl OpenSecureChannelRequest {
    /// Encodes a full OPN chunk: common header, `AsymmetricSecurityHeader`,
    /// `SequenceHeader`, then the request body.
    pub fn encode(&self, security_header: &AsymmetricSecurityHeader, sequence: SequenceHeader) -> Vec<u8> {
        let mut body = Vec::new();
        security_header.encode(&mut body);
        sequence.encode(&mut body);
        body.write_u32::<LittleEndian>(match self.request_type {
            RequestType::Issue => 0,
            RequestType::Renew => 1,
        })
        .unwrap();
        body.write_u32::<LittleEndian>(security_mode_to_wire(self.security_mode)).unwrap();
        write_opcua_bytes(&mut body, &self.client_nonce).unwrap();
        body.write_u32::<LittleEndian>(self.requested_lifetime_ms).unwrap();

        let header = ChunkHeader {
            message_type: MessageType::Opn,
            finality: Finality::Final,
            message_size: (COMMON_HEADER_SIZE + CHANNEL_ID_SIZE + body.len()) as u32,
            secure_channel_id: Some(0),
        };
        let mut out = Vec::with_capacity(header.header_len() + body.len());
        header.encode(&mut out).unwrap();
        out.extend_from_slice(&body);
        out
    }

    /// Decodes an OPN chunk, returning the security header, sequence header
    /// and request body.
    pub fn decode(data: &[u8]) -> Result<(AsymmetricSecurityHeader, SequenceHeader, Self), StatusCode> {
        let (header, offset) = ChunkHeader::decode(data)?;
        if header.message_type != MessageType::Opn {
            return Err(StatusCode::BadInvalidArgument);
        }
        let mut cursor = Cursor::new(&data[offset..]);
        let security_header = AsymmetricSecurityHeader::decode(&mut cursor)?;
        let sequence = SequenceHeader::decode(&mut cursor)?;

        let request_type = match cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)? {
            0 => RequestType::Issue,
            1 => RequestType::Renew,
            _ => return Err(StatusCode::BadInvalidArgument),
        };
        let security_mode = security_mode_from_wire(cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?)?;
        let client_nonce = read_opcua_bytes(&mut cursor).map_err(StatusCode::from)?;
        let requested_lifetime_ms = cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?;

        Ok((
            security_header,
            sequence,
            OpenSecureChannelRequest { request_type, security_mode, client_nonce, requested_lifetime_ms },
        ))
    }
}

impl OpenSecureChannelResponse {
    pub fn encode(&self, symmetric_header: SymmetricSecurityHeader, sequence: SequenceHeader) -> Vec<u8> {
        let mut body = Vec::new();
        symmetric_header.encode(&mut body);
        sequence.encode(&mut body);
        body.write_u32::<LittleEndian>(self.channel_id).unwrap();
        body.write_u32::<LittleEndian>(self.token_id).unwrap();
        body.write_i64::<LittleEndian>(self.created_at).unwrap();
        body.write_u32::<LittleEndian>(self.revised_lifetime_ms).unwrap();
        write_opcua_bytes(&mut body, &self.server_nonce).unwrap();

        let header = ChunkHeader {
            message_type: MessageType::Opn,
            finality: Finality::Final,
            message_size: (COMMON_HEADER_SIZE + CHANNEL_ID_SIZE + body.len()) as u32,
            secure_channel_id: Some(self.channel_id),
        };
        let mut out = Vec::with_capacity(header.header_len() + body.len());
        header.encode(&mut out).unwrap();
        out.extend_from_slice(&body);
        out
    }

    pub fn decode(data: &[u8]) -> Result<(SymmetricSecurityHeader, SequenceHeader, Self), StatusCode> {
        let (header, offset) = ChunkHeader::decode(data)?;
        if header.message_type != MessageType::Opn {
            return Err(StatusCode::BadInvalidArgument);
        }
        let mut cursor = Cursor::new(&data[offset..]);
        let symmetric_header = SymmetricSecurityHeader::decode(&mut cursor)?;
        let sequence = SequenceHeader::decode(&mut cursor)?;

        Ok((
            symmetric_header,
            sequence,
            OpenSecureChannelResponse {
                channel_id: cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?,
                token_id: cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?,
                created_at: cursor.read_i64::<LittleEndian>().map_err(StatusCode::from)?,
                revised_lifetime_ms: cursor.read_u32::<LittleEndian>().map_err(StatusCode::from)?,
                server_nonce: read_opcua_bytes(&mut cursor).map_err(StatusCode::from)?,
            },
        ))
    }
}

/// Handshake-level failure, sent in place of ACK/OPN when the transport or
/// channel negotiation cannot proceed.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    pub status: StatusCode,
    pub reason: String,
}

impl ErrorMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u32::<LittleEndian>(status_code_to_wire(self.status)).unwrap();
        write_opcua_string(&mut body, &self.reason).unwrap();

        let header = ChunkHeader {
            message_type: MessageType::Err,
            finality: Finality::Final,
            message_size: (COMMON_HEADER_SIZE + body.len()) as u32,
            secure_channel_id: None,
        };
        let mut out = Vec::with_capacity(header.header_len() + body.len());
        header.encode(&mut out).unwrap();
        out.extend_from_slice(&body);
        out
    }
}

fn status_code_to_wire(status: StatusCode) -> u32 {
    match status {
        StatusCode::Good => 0,
        StatusCode::BadInvalidArgument => 1,
        StatusCode::BadConnectionRejected => 2,
        StatusCode::BadConnectionClosed => 3,
        StatusCode::BadOutOfMemory => 4,
        StatusCode::BadNotFound => 5,
        StatusCode::BadSecurityPolicyRejected => 6,
        StatusCode::BadSequenceNumberInvalid => 7,
        StatusCode::BadTokenUnknown => 8,
        StatusCode::BadInternalError => 9,
    }
}

#[derive(Clone)]
pub struct SecurityToken {
    pub channel_id: u32,
    pub token_id: u32,
    pub created_at: DateTime,
    pub revised_lifetime_ms: u32,
    pub keys: EncryptionKeys,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    Closed,
    Open,
}

/// Per-connection SecureChannel bookkeeping: transport handshake state,
/// token bookkeeping (current plus one grace-period previous token), and
/// the sequence/request-id counters §4.6 demands be checked on every MSG.
pub struct SecureChannel {
    pub transport_established: bool,
    pub hel_received: bool,
    pub channel_id: u32,
    pub state: ChannelState,
    pub security_mode: SecurityMode,
    pub current_token: Option<SecurityToken>,
    pub previous_token: Option<SecurityToken>,
    last_sequence_number: Option<u32>,
    last_request_id: Option<u32>,
    next_send_sequence_number: u32,
}

impl SecureChannel {
    fn new() -> Self {
        SecureChannel {
            transport_established: false,
            hel_received: false,
            channel_id: 0,
            state: ChannelState::Closed,
            security_mode: SecurityMode::Invalid,
            current_token: None,
            previous_token: None,
            last_sequence_number: None,
            last_request_id: None,
            next_send_sequence_number: 1,
        }
    }

    /// Strictly-increasing-modulo-wraparound check (invariant 5 / §4.6 MSG
    /// path). The very first observed sequence number is always accepted.
    fn validate_incoming_sequence(&mut self, sequence_number: u32) -> bool {
        let ok = match self.last_sequence_number {
            None => true,
            Some(last) => {
                sequence_number == last.wrapping_add(1)
                    || (last > u32::MAX - SEQUENCE_WRAP_WINDOW && sequence_number < SEQUENCE_WRAP_WINDOW)
            }
        };
        if ok {
            self.last_sequence_number = Some(sequence_number);
        }
        ok
    }

    fn validate_request_id(&mut self, request_id: u32) -> bool {
        let ok = match self.last_request_id {
            None => true,
            Some(last) => {
                request_id == last.wrapping_add(1)
                    || (last > u32::MAX - SEQUENCE_WRAP_WINDOW && request_id < SEQUENCE_WRAP_WINDOW)
            }
        };
        if ok {
            self.last_request_id = Some(request_id);
        }
        ok
    }

    fn next_send_sequence(&mut self) -> u32 {
        let n = self.next_send_sequence_number;
        self.next_send_sequence_number = self.next_send_sequence_number.wrapping_add(1);
        if self.next_send_sequence_number == 0 {
            self.next_send_sequence_number = 1;
        }
        n
    }

    fn token_id_valid(&self, token_id: u32) -> bool {
        self.current_token.as_ref().map(|t| t.token_id) == Some(token_id)
            || self.previous_token.as_ref().map(|t| t.token_id) == Some(token_id)
    }
}

/// Owns every connection's [`SecureChannel`] plus the strictly-increasing
/// channel-id counter shared across the manager (§4.6: "a fresh channelId,
/// strictly increasing within the manager").
pub struct ChannelManager {
    logger: Logger,
    next_channel_id: u32,
    channel_lifetime_ms: u32,
    policy: Arc<dyn SecurityPolicy>,
    channels: HashMap<ConnectionId, SecureChannel>,
}

impl ChannelManager {
    pub fn new(logger: Logger, channel_lifetime_ms: u32, policy: Arc<dyn SecurityPolicy>) -> Self {
        ChannelManager { logger, next_channel_id: 1, channel_lifetime_ms, policy, channels: HashMap::new() }
    }

    fn alloc_channel_id(&mut self) -> u32 {
        let id = self.next_channel_id;
        self.next_channel_id += 1;
        id
    }

    /// Processes a HEL for `connection_id`. A second HEL on an
    /// already-established transport is rejected as `MultipleHel` — callers
    /// should close the connection and emit the terminal `Closing` callback.
    pub fn on_hello(&mut self, connection_id: ConnectionId, _hello: &HelloMessage) -> Result<AckMessage, StatusCode> {
        let channel = self.channels.entry(connection_id).or_insert_with(SecureChannel::new);
        if channel.transport_established {
            warn!(self.logger, "multiple HEL on one connection"; "connection" => connection_id.0);
            return Err(StatusCode::BadConnectionRejected);
        }
        channel.transport_established = true;
        channel.hel_received = true;

        Ok(AckMessage {
            protocol_version: 0,
            receive_buffer_size: 65536,
            send_buffer_size: 65536,
            max_message_size: 0,
            max_chunk_count: 0,
        })
    }

    /// OPN Issue/Renew (§4.6). Issue assigns a fresh channelId and token;
    /// Renew keeps the channelId and mints a new tokenId, moving the old one
    /// into the grace-period `previous_token` slot.
    pub fn on_open(
        &mut self,
        connection_id: ConnectionId,
        request: &OpenSecureChannelRequest,
    ) -> Result<OpenSecureChannelResponse, StatusCode> {
        let channel = self.channels.get_mut(&connection_id).ok_or(StatusCode::BadInternalError)?;
        if !channel.transport_established {
            return Err(StatusCode::BadInternalError);
        }

        let revised_lifetime_ms = request.requested_lifetime_ms.min(self.channel_lifetime_ms);
        let mut server_nonce = vec![0u8; 32];
        transport_support::crypto::random_bytes(&mut server_nonce);

        match request.request_type {
            RequestType::Issue => {
                let channel_id = self.alloc_channel_id();
                let keys = self.policy.new_key_context(request.security_mode);
                let token = SecurityToken {
                    channel_id,
                    token_id: 1,
                    created_at: now_utc(),
                    revised_lifetime_ms,
                    keys,
                };
                channel.channel_id = channel_id;
                channel.security_mode = request.security_mode;
                channel.state = ChannelState::Open;
                channel.current_token = Some(token.clone());
                channel.previous_token = None;

                Ok(OpenSecureChannelResponse {
                    channel_id,
                    token_id: token.token_id,
                    created_at: token.created_at,
                    revised_lifetime_ms,
                    server_nonce,
                })
            }
            RequestType::Renew => {
                if channel.state != ChannelState::Open {
                    return Err(StatusCode::BadInternalError);
                }
                let previous = channel.current_token.take();
                let next_token_id = previous.as_ref().map(|t| t.token_id.wrapping_add(1)).unwrap_or(1);
                let keys = self.policy.new_key_context(channel.security_mode);
                let token = SecurityToken {
                    channel_id: channel.channel_id,
                    token_id: next_token_id,
                    created_at: now_utc(),
                    revised_lifetime_ms,
                    keys,
                };
                channel.current_token = Some(token.clone());
                channel.previous_token = previous;
                server_nonce.clear();
                transport_support::crypto::random_bytes(&mut server_nonce);

                Ok(OpenSecureChannelResponse {
                    channel_id: channel.channel_id,
                    token_id: token.token_id,
                    created_at: token.created_at,
                    revised_lifetime_ms,
                    server_nonce,
                })
            }
        }
    }

    /// Validates an incoming MSG's channel/token/sequence/request-id
    /// discipline and returns the policy-decrypted payload. A failure here
    /// means the caller must close the channel and emit `Closing`.
    pub fn on_message(
        &mut self,
        connection_id: ConnectionId,
        secure_channel_id: u32,
        symmetric_header: &SymmetricSecurityHeader,
        sequence_header: &SequenceHeader,
        cipher_payload: &[u8],
    ) -> Result<Vec<u8>, StatusCode> {
        let channel = self.channels.get_mut(&connection_id).ok_or(StatusCode::BadInternalError)?;
        if channel.state != ChannelState::Open || channel.channel_id != secure_channel_id {
            return Err(StatusCode::BadTokenUnknown);
        }
        if !channel.token_id_valid(symmetric_header.token_id) {
            return Err(StatusCode::BadTokenUnknown);
        }
        if !channel.validate_incoming_sequence(sequence_header.sequence_number) {
            return Err(StatusCode::BadSequenceNumberInvalid);
        }
        if !channel.validate_request_id(sequence_header.request_id) {
            return Err(StatusCode::BadSequenceNumberInvalid);
        }

        let token = if channel.current_token.as_ref().map(|t| t.token_id) == Some(symmetric_header.token_id) {
            channel.current_token.as_ref()
        } else {
            channel.previous_token.as_ref()
        }
        .ok_or(StatusCode::BadTokenUnknown)?;

        self.policy
            .decrypt(&token.keys, sequence_header.sequence_number as u64, cipher_payload, &[])
            .ok_or(StatusCode::BadSecurityPolicyRejected)
    }

    /// Encrypts/signs `plain` under the channel's current token and prepends
    /// the symmetric security header and a freshly allocated sequence
    /// number, ready for `ConnectionManager::send`.
    pub fn encode_message(
        &mut self,
        connection_id: ConnectionId,
        request_id: u32,
        plain: &[u8],
    ) -> Result<Vec<u8>, StatusCode> {
        let channel = self.channels.get_mut(&connection_id).ok_or(StatusCode::BadInternalError)?;
        let token = channel.current_token.clone().ok_or(StatusCode::BadInternalError)?;
        let sequence_number = channel.next_send_sequence();
        let cipher = self.policy.encrypt(&token.keys, sequence_number as u64, plain, &[]);

        let mut body = Vec::new();
        SymmetricSecurityHeader { token_id: token.token_id }.encode(&mut body);
        SequenceHeader { sequence_number, request_id }.encode(&mut body);
        body.extend_from_slice(&cipher);

        let header = ChunkHeader {
            message_type: MessageType::Msg,
            finality: Finality::Final,
            message_size: (COMMON_HEADER_SIZE + CHANNEL_ID_SIZE + body.len()) as u32,
            secure_channel_id: Some(channel.channel_id),
        };
        let mut out = Vec::with_capacity(header.header_len() + body.len());
        header.encode(&mut out).unwrap();
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// `CLO`: transitions the channel to `Closed` and drops its token
    /// material. Resources are freed; the caller is responsible for tearing
    /// down the underlying connection via the event loop's delayed-callback
    /// path.
    pub fn on_close(&mut self, connection_id: ConnectionId) {
        if let Some(channel) = self.channels.get_mut(&connection_id) {
            channel.state = ChannelState::Closed;
            channel.current_token = None;
            channel.previous_token = None;
        }
    }

    pub fn remove(&mut self, connection_id: ConnectionId) {
        self.channels.remove(&connection_id);
    }

    pub fn channel_state(&self, connection_id: ConnectionId) -> Option<ChannelState> {
        self.channels.get(&connection_id).map(|c| c.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport_support::crypto::PolicyChaCha20Poly1305;
    use transport_support::logging::discard;

    fn manager() -> ChannelManager {
        ChannelManager::new(discard(), 60_000, Arc::new(PolicyChaCha20Poly1305))
    }

    fn hello() -> HelloMessage {
        HelloMessage {
            protocol_version: 0,
            receive_buffer_size: 65536,
            send_buffer_size: 65536,
            max_message_size: 0,
            max_chunk_count: 0,
            endpoint_url: "opc.tcp://localhost:4840".into(),
        }
    }

    #[test]
    fn hello_round_trips_through_encode_decode() {
        let hel = hello();
        let encoded = hel.encode();
        let decoded = HelloMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, hel);
    }

    #[test]
    fn ack_round_trips_through_encode_decode() {
        let ack = AckMessage {
            protocol_version: 0,
            receive_buffer_size: 32768,
            send_buffer_size: 32768,
            max_message_size: 1 << 20,
            max_chunk_count: 16,
        };
        let decoded = AckMessage::decode(&ack.encode()).unwrap();
        assert_eq!(decoded, ack);
    }

    #[test]
    fn open_request_chunk_round_trips() {
        let security_header = AsymmetricSecurityHeader {
            security_policy_uri: "http://opcfoundation.org/UA/SecurityPolicy#None".into(),
            sender_certificate: vec![],
            receiver_certificate_thumbprint: vec![],
        };
        let request = OpenSecureChannelRequest {
            request_type: RequestType::Issue,
            security_mode: SecurityMode::SignAndEncrypt,
            client_nonce: vec![0xAA],
            requested_lifetime_ms: 120_000,
        };
        let sequence = SequenceHeader { sequence_number: 1, request_id: 1 };
        let chunk = request.encode(&security_header, sequence);

        let (decoded_header, decoded_sequence, decoded_request) = OpenSecureChannelRequest::decode(&chunk).unwrap();
        assert_eq!(decoded_header, security_header);
        assert_eq!(decoded_sequence, sequence);
        assert_eq!(decoded_request.request_type, request.request_type);
        assert_eq!(decoded_request.security_mode, request.security_mode);
        assert_eq!(decoded_request.client_nonce, request.client_nonce);
        assert_eq!(decoded_request.requested_lifetime_ms, request.requested_lifetime_ms);
    }

    #[test]
    fn error_message_encodes_a_single_final_chunk() {
        let err = ErrorMessage { status: StatusCode::BadSecurityPolicyRejected, reason: "policy mismatch".into() };
        let encoded = err.encode();
        let (header, _) = ChunkHeader::decode(&encoded).unwrap();
        assert_eq!(header.message_type, MessageType::Err);
        assert_eq!(header.finality, Finality::Final);
    }

    /// Scenario S4: HEL then a second HEL fails as `MultipleHel`.
    #[test]
    fn second_hello_on_same_connection_is_rejected() {
        let mut mgr = manager();
        let id = ConnectionId(1);
        assert!(mgr.on_hello(id, &hello()).is_ok());
        assert_eq!(mgr.on_hello(id, &hello()).unwrap_err(), StatusCode::BadConnectionRejected);
    }

    /// Scenario S5: Issue then Renew keeps channelId, mints a new tokenId.
    #[test]
    fn issue_then_renew_keeps_channel_id_and_bumps_token_id() {
        let mut mgr = manager();
        let id = ConnectionId(1);
        mgr.on_hello(id, &hello()).unwrap();

        let issue = OpenSecureChannelRequest {
            request_type: RequestType::Issue,
            security_mode: SecurityMode::SignAndEncrypt,
            client_nonce: vec![0xAA],
            requested_lifetime_ms: 120_000,
        };
        let response = mgr.on_open(id, &issue).unwrap();
        assert_eq!(response.token_id, 1);
        assert_eq!(response.revised_lifetime_ms, 60_000);
        let channel_id = response.channel_id;

        let renew = OpenSecureChannelRequest {
            request_type: RequestType::Renew,
            security_mode: SecurityMode::SignAndEncrypt,
            client_nonce: vec![0xAA],
            requested_lifetime_ms: 120_000,
        };
        let renewed = mgr.on_open(id, &renew).unwrap();
        assert_eq!(renewed.channel_id, channel_id);
        assert_eq!(renewed.token_id, 2);
    }

    #[test]
    fn renew_before_issue_is_rejected() {
        let mut mgr = manager();
        let id = ConnectionId(1);
        mgr.on_hello(id, &hello()).unwrap();

        let renew = OpenSecureChannelRequest {
            request_type: RequestType::Renew,
            security_mode: SecurityMode::SignAndEncrypt,
            client_nonce: vec![],
            requested_lifetime_ms: 1000,
        };
        assert!(mgr.on_open(id, &renew).is_err());
    }

    #[test]
    fn message_round_trips_and_sequence_advances() {
        let mut mgr = manager();
        let id = ConnectionId(1);
        mgr.on_hello(id, &hello()).unwrap();
        mgr.on_open(
            id,
            &OpenSecureChannelRequest {
                request_type: RequestType::Issue,
                security_mode: SecurityMode::SignAndEncrypt,
                client_nonce: vec![0xAA],
                requested_lifetime_ms: 60_000,
            },
        )
        .unwrap();

        let chunk = mgr.encode_message(id, 1, b"payload").unwrap();
        let (header, offset) = ChunkHeader::decode(&chunk).unwrap();
        assert_eq!(header.message_type, MessageType::Msg);

        let mut cursor = Cursor::new(&chunk[offset..]);
        let symmetric = SymmetricSecurityHeader::decode(&mut cursor).unwrap();
        let sequence = SequenceHeader::decode(&mut cursor).unwrap();
        let cipher = &chunk[offset + cursor.position() as usize..];

        let plain = mgr.on_message(id, header.secure_channel_id.unwrap(), &symmetric, &sequence, cipher).unwrap();
        assert_eq!(plain, b"payload");
    }

    #[test]
    fn out_of_order_sequence_number_is_rejected() {
        let mut channel = SecureChannel::new();
        assert!(channel.validate_incoming_sequence(5));
        assert!(!channel.validate_incoming_sequence(5));
        assert!(!channel.validate_incoming_sequence(100));
        assert!(channel.validate_incoming_sequence(6));
    }

    /// Invariant 5: a sequence number may wrap from near `u32::MAX` back to
    /// a small value without being rejected as out-of-order.
    #[test]
    fn sequence_number_wraps_around_near_u32_max() {
        let mut channel = SecureChannel::new();
        assert!(channel.validate_incoming_sequence(u32::MAX - 1));
        assert!(channel.validate_incoming_sequence(u32::MAX));
        assert!(channel.validate_incoming_sequence(0));
    }
}
