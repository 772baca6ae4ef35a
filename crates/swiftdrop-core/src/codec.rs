//! The length-prefixed wire envelope and its thirteen payload variants.
//!
//! Envelope: 4-byte big-endian length `L` covering everything after the
//! length field, 1-byte type, 4-byte big-endian sequence number, then
//! `L - 5` bytes of payload. `encode` produces exactly these bytes;
//! `decode` consumes a growable receive buffer and returns `Ok(None)`
//! when it doesn't yet hold one complete frame.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

const LEN_FIELD_SIZE: usize = 4;
const TYPE_FIELD_SIZE: usize = 1;
const SEQ_FIELD_SIZE: usize = 4;
const HEADER_AFTER_LEN: usize = TYPE_FIELD_SIZE + SEQ_FIELD_SIZE;

const TYPE_HANDSHAKE_INIT: u8 = 0x01;
const TYPE_HANDSHAKE_REPLY: u8 = 0x02;
const TYPE_HANDSHAKE_CONFIRM: u8 = 0x03;
const TYPE_FILE_META: u8 = 0x10;
const TYPE_FILE_ACCEPT: u8 = 0x11;
const TYPE_FILE_REJECT: u8 = 0x12;
const TYPE_CHUNK_DATA: u8 = 0x20;
const TYPE_CHUNK_ACK: u8 = 0x21;
const TYPE_CHUNK_NACK: u8 = 0x22;
const TYPE_TRANSFER_COMPLETE: u8 = 0x30;
const TYPE_TRANSFER_VERIFIED: u8 = 0x31;
const TYPE_ERROR: u8 = 0xF0;
const TYPE_CANCEL: u8 = 0xFF;

pub const DEVICE_ID_LEN: usize = 16;
pub const PAIRING_HASH_LEN: usize = 32;
pub const CHECKSUM_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackCode {
    Checksum,
    Decryption,
    OutOfSequence,
}

impl NackCode {
    fn to_byte(self) -> u8 {
        match self {
            NackCode::Checksum => 0x01,
            NackCode::Decryption => 0x02,
            NackCode::OutOfSequence => 0x03,
        }
    }

    fn from_byte(b: u8) -> Result<Self, CodecError> {
        match b {
            0x01 => Ok(NackCode::Checksum),
            0x02 => Ok(NackCode::Decryption),
            0x03 => Ok(NackCode::OutOfSequence),
            _ => Err(CodecError::Malformed("unknown NACK code")),
        }
    }
}

/// Protocol error codes. Unknown codes decode to `InternalError` so that
/// future versions can add codes without breaking older peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoErrorCode {
    VersionMismatch,
    PairingRejected,
    StorageFull,
    PermissionDenied,
    InternalError,
}

impl ProtoErrorCode {
    fn to_u16(self) -> u16 {
        match self {
            ProtoErrorCode::VersionMismatch => 0x0001,
            ProtoErrorCode::PairingRejected => 0x0002,
            ProtoErrorCode::StorageFull => 0x0003,
            ProtoErrorCode::PermissionDenied => 0x0004,
            ProtoErrorCode::InternalError => 0x0005,
        }
    }

    fn from_u16(code: u16) -> Self {
        match code {
            0x0001 => ProtoErrorCode::VersionMismatch,
            0x0002 => ProtoErrorCode::PairingRejected,
            0x0003 => ProtoErrorCode::StorageFull,
            0x0004 => ProtoErrorCode::PermissionDenied,
            _ => ProtoErrorCode::InternalError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePayload {
    pub version: u16,
    pub public_key: Vec<u8>,
    pub name: String,
    pub device_id: [u8; DEVICE_ID_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    HandshakeInit(HandshakePayload),
    HandshakeReply(HandshakePayload),
    HandshakeConfirm { hash: [u8; PAIRING_HASH_LEN] },
    FileMeta {
        name: String,
        size: u64,
        chunk_size: u32,
        chunk_count: u32,
        checksum: [u8; CHECKSUM_LEN],
    },
    FileAccept,
    FileReject { reason: String },
    ChunkData {
        index: u32,
        iv: [u8; IV_LEN],
        ciphertext: Vec<u8>,
        tag: [u8; TAG_LEN],
        plaintext_sha256: [u8; CHECKSUM_LEN],
    },
    ChunkAck { index: u32 },
    ChunkNack { index: u32, code: NackCode },
    TransferComplete { total_chunks: u32 },
    TransferVerified,
    Error { code: ProtoErrorCode, message: String },
    Cancel,
}

impl Message {
    fn type_byte(&self) -> u8 {
        match self {
            Message::HandshakeInit(_) => TYPE_HANDSHAKE_INIT,
            Message::HandshakeReply(_) => TYPE_HANDSHAKE_REPLY,
            Message::HandshakeConfirm { .. } => TYPE_HANDSHAKE_CONFIRM,
            Message::FileMeta { .. } => TYPE_FILE_META,
            Message::FileAccept => TYPE_FILE_ACCEPT,
            Message::FileReject { .. } => TYPE_FILE_REJECT,
            Message::ChunkData { .. } => TYPE_CHUNK_DATA,
            Message::ChunkAck { .. } => TYPE_CHUNK_ACK,
            Message::ChunkNack { .. } => TYPE_CHUNK_NACK,
            Message::TransferComplete { .. } => TYPE_TRANSFER_COMPLETE,
            Message::TransferVerified => TYPE_TRANSFER_VERIFIED,
            Message::Error { .. } => TYPE_ERROR,
            Message::Cancel => TYPE_CANCEL,
        }
    }

    fn encode_payload(&self, out: &mut BytesMut) {
        match self {
            Message::HandshakeInit(p) | Message::HandshakeReply(p) => {
                out.put_u16(p.version);
                out.put_u16(p.public_key.len() as u16);
                out.put_slice(&p.public_key);
                out.put_u8(p.name.len() as u8);
                out.put_slice(p.name.as_bytes());
                out.put_slice(&p.device_id);
            }
            Message::HandshakeConfirm { hash } => out.put_slice(hash),
            Message::FileMeta {
                name,
                size,
                chunk_size,
                chunk_count,
                checksum,
            } => {
                out.put_u16(name.len() as u16);
                out.put_slice(name.as_bytes());
                out.put_u64(*size);
                out.put_u32(*chunk_size);
                out.put_u32(*chunk_count);
                out.put_slice(checksum);
            }
            Message::FileAccept => {}
            Message::FileReject { reason } => {
                out.put_u16(reason.len() as u16);
                out.put_slice(reason.as_bytes());
            }
            Message::ChunkData {
                index,
                iv,
                ciphertext,
                tag,
                plaintext_sha256,
            } => {
                out.put_u32(*index);
                out.put_slice(iv);
                out.put_u32(ciphertext.len() as u32);
                out.put_slice(ciphertext);
                out.put_slice(tag);
                out.put_slice(plaintext_sha256);
            }
            Message::ChunkAck { index } => out.put_u32(*index),
            Message::ChunkNack { index, code } => {
                out.put_u32(*index);
                out.put_u8(code.to_byte());
            }
            Message::TransferComplete { total_chunks } => out.put_u32(*total_chunks),
            Message::TransferVerified => {}
            Message::Error { code, message } => {
                out.put_u16(code.to_u16());
                out.put_u16(message.len() as u16);
                out.put_slice(message.as_bytes());
            }
            Message::Cancel => {}
        }
    }
}

/// Encode `msg` as a complete frame with sequence number `seq`.
pub fn encode(msg: &Message, seq: u32) -> Vec<u8> {
    let mut payload = BytesMut::new();
    msg.encode_payload(&mut payload);

    let length = (HEADER_AFTER_LEN + payload.len()) as u32;

    let mut frame = BytesMut::with_capacity(LEN_FIELD_SIZE + length as usize);
    frame.put_u32(length);
    frame.put_u8(msg.type_byte());
    frame.put_u32(seq);
    frame.put_slice(&payload);
    frame.to_vec()
}

/// Attempt to decode one frame from the front of `buf`. Returns `Ok(None)`
/// when `buf` does not yet hold a complete frame; otherwise the decoded
/// message, its sequence number, and the number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<Option<(Message, u32, usize)>, CodecError> {
    if buf.len() < LEN_FIELD_SIZE {
        return Ok(None);
    }
    let length = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    if length < HEADER_AFTER_LEN {
        return Err(CodecError::Malformed("length prefix shorter than header"));
    }
    let total = LEN_FIELD_SIZE + length;
    if buf.len() < total {
        return Ok(None);
    }

    let mut cursor = &buf[LEN_FIELD_SIZE..total];
    let type_byte = cursor.get_u8();
    let seq = cursor.get_u32();
    let msg = decode_payload(type_byte, cursor)?;
    Ok(Some((msg, seq, total)))
}

fn decode_payload(type_byte: u8, mut p: &[u8]) -> Result<Message, CodecError> {
    match type_byte {
        TYPE_HANDSHAKE_INIT | TYPE_HANDSHAKE_REPLY => {
            let payload = decode_handshake_payload(&mut p)?;
            Ok(if type_byte == TYPE_HANDSHAKE_INIT {
                Message::HandshakeInit(payload)
            } else {
                Message::HandshakeReply(payload)
            })
        }
        TYPE_HANDSHAKE_CONFIRM => {
            require(p.len() == PAIRING_HASH_LEN, "bad HANDSHAKE_CONFIRM length")?;
            let mut hash = [0u8; PAIRING_HASH_LEN];
            hash.copy_from_slice(p);
            Ok(Message::HandshakeConfirm { hash })
        }
        TYPE_FILE_META => {
            require(p.len() >= 2, "truncated FILE_META")?;
            let name_len = p.get_u16() as usize;
            require(p.len() >= name_len, "truncated FILE_META name")?;
            let name = take_utf8(&mut p, name_len)?;
            require(p.len() >= 8 + 4 + 4 + CHECKSUM_LEN, "truncated FILE_META tail")?;
            let size = p.get_u64();
            let chunk_size = p.get_u32();
            let chunk_count = p.get_u32();
            let mut checksum = [0u8; CHECKSUM_LEN];
            checksum.copy_from_slice(&p[..CHECKSUM_LEN]);
            p.advance(CHECKSUM_LEN);
            require(p.is_empty(), "trailing bytes after FILE_META")?;
            Ok(Message::FileMeta {
                name,
                size,
                chunk_size,
                chunk_count,
                checksum,
            })
        }
        TYPE_FILE_ACCEPT => {
            require(p.is_empty(), "FILE_ACCEPT must be empty")?;
            Ok(Message::FileAccept)
        }
        TYPE_FILE_REJECT => {
            require(p.len() >= 2, "truncated FILE_REJECT")?;
            let reason_len = p.get_u16() as usize;
            let reason = take_utf8(&mut p, reason_len)?;
            require(p.is_empty(), "trailing bytes after FILE_REJECT")?;
            Ok(Message::FileReject { reason })
        }
        TYPE_CHUNK_DATA => {
            require(p.len() >= 4 + IV_LEN + 4, "truncated CHUNK_DATA header")?;
            let index = p.get_u32();
            let mut iv = [0u8; IV_LEN];
            iv.copy_from_slice(&p[..IV_LEN]);
            p.advance(IV_LEN);
            let data_len = p.get_u32() as usize;
            require(p.len() == data_len + TAG_LEN + CHECKSUM_LEN, "CHUNK_DATA length mismatch")?;
            let ciphertext = p[..data_len].to_vec();
            p.advance(data_len);
            let mut tag = [0u8; TAG_LEN];
            tag.copy_from_slice(&p[..TAG_LEN]);
            p.advance(TAG_LEN);
            let mut plaintext_sha256 = [0u8; CHECKSUM_LEN];
            plaintext_sha256.copy_from_slice(&p[..CHECKSUM_LEN]);
            p.advance(CHECKSUM_LEN);
            Ok(Message::ChunkData {
                index,
                iv,
                ciphertext,
                tag,
                plaintext_sha256,
            })
        }
        TYPE_CHUNK_ACK => {
            require(p.len() == 4, "bad CHUNK_ACK length")?;
            Ok(Message::ChunkAck { index: p.get_u32() })
        }
        TYPE_CHUNK_NACK => {
            require(p.len() == 5, "bad CHUNK_NACK length")?;
            let index = p.get_u32();
            let code = NackCode::from_byte(p.get_u8())?;
            Ok(Message::ChunkNack { index, code })
        }
        TYPE_TRANSFER_COMPLETE => {
            require(p.len() == 4, "bad TRANSFER_COMPLETE length")?;
            Ok(Message::TransferComplete {
                total_chunks: p.get_u32(),
            })
        }
        TYPE_TRANSFER_VERIFIED => {
            require(p.is_empty(), "TRANSFER_VERIFIED must be empty")?;
            Ok(Message::TransferVerified)
        }
        TYPE_ERROR => {
            require(p.len() >= 4, "truncated ERROR header")?;
            let code = ProtoErrorCode::from_u16(p.get_u16());
            let msg_len = p.get_u16() as usize;
            let message = take_utf8(&mut p, msg_len)?;
            require(p.is_empty(), "trailing bytes after ERROR")?;
            Ok(Message::Error { code, message })
        }
        TYPE_CANCEL => {
            require(p.is_empty(), "CANCEL must be empty")?;
            Ok(Message::Cancel)
        }
        _ => Err(CodecError::Malformed("unknown message type")),
    }
}

fn decode_handshake_payload(p: &mut &[u8]) -> Result<HandshakePayload, CodecError> {
    require(p.len() >= 2, "truncated handshake version")?;
    let version = p.get_u16();
    require(p.len() >= 2, "truncated handshake pk_len")?;
    let pk_len = p.get_u16() as usize;
    require(p.len() >= pk_len, "truncated handshake public key")?;
    let public_key = p[..pk_len].to_vec();
    p.advance(pk_len);
    require(!p.is_empty(), "truncated handshake name_len")?;
    let name_len = p.get_u8() as usize;
    require(p.len() >= name_len, "truncated handshake name")?;
    let name = take_utf8(p, name_len)?;
    require(p.len() == DEVICE_ID_LEN, "bad handshake device_id length")?;
    let mut device_id = [0u8; DEVICE_ID_LEN];
    device_id.copy_from_slice(p);
    p.advance(DEVICE_ID_LEN);
    Ok(HandshakePayload {
        version,
        public_key,
        name,
        device_id,
    })
}

fn require(cond: bool, what: &'static str) -> Result<(), CodecError> {
    if cond {
        Ok(())
    } else {
        Err(CodecError::Malformed(what))
    }
}

fn take_utf8(p: &mut &[u8], len: usize) -> Result<String, CodecError> {
    require(p.len() >= len, "truncated UTF-8 field")?;
    let bytes = &p[..len];
    let s = std::str::from_utf8(bytes)
        .map_err(|_| CodecError::Malformed("invalid UTF-8"))?
        .to_string();
    p.advance(len);
    Ok(s)
}

/// Right-pad a short id (or any short ASCII identifier) into the 16-byte
/// device-id wire field.
pub fn pack_device_id(short_id: &str) -> [u8; DEVICE_ID_LEN] {
    let mut out = [0u8; DEVICE_ID_LEN];
    let bytes = short_id.as_bytes();
    let n = bytes.len().min(DEVICE_ID_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Recover the logical short id: the leading non-NUL prefix of the field.
pub fn unpack_device_id(field: &[u8; DEVICE_ID_LEN]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(DEVICE_ID_LEN);
    String::from_utf8_lossy(&field[..end]).to_string()
}
