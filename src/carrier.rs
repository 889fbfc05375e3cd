//! The carrier envelope: the gateway's sole wire message (C1).
//!
//! The wire layout is a sequence of tagged fields using the same varint
//! tag/wire-type scheme this crate's WebSocket framing already favours over a
//! schema-compiler dependency: each field is `(tag << 3 | wire_type)` followed by a
//! wire-type-specific payload. Field 1 is `seq` (varint), field 2 is `service` (varint),
//! field 3 is `message` (length-delimited). Any other field number is preserved verbatim,
//! in its original wire position, so a hop that does not understand it still forwards it
//! byte-for-byte.

use std::io;
use thiserror::Error;

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LENGTH_DELIMITED: u8 = 2;
const WIRE_FIXED32: u8 = 5;

const TAG_SEQ: u32 = 1;
const TAG_SERVICE: u32 = 2;
const TAG_MESSAGE: u32 = 3;

#[derive(Error, Debug)]
pub enum Error {
    #[error("truncated carrier envelope")]
    Truncated,
    #[error("unsupported wire type {0}")]
    UnsupportedWireType(u8),
    #[error("varint overflowed 64 bits")]
    VarintOverflow,
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        io::Error::other(value)
    }
}

/// One field as it appeared on the wire, in encounter order. `Seq`/`Service`/`Message`
/// are the fields the gateway understands and may rewrite; `Unknown` is an opaque
/// passthrough field preserved byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Seq(u32),
    Service(u32),
    Message(Vec<u8>),
    Unknown { tag: u32, wire_type: u8, payload: Vec<u8> },
}

/// The carrier envelope. Preserves field order and any field the gateway does not know
/// about, so only `seq`/`service` rewrites are ever visible to a downstream hop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    fields: Vec<Field>,
}

impl Envelope {
    pub fn new(seq: u32, service: u32, message: impl Into<Vec<u8>>) -> Self {
        Self {
            fields: vec![Field::Seq(seq), Field::Service(service), Field::Message(message.into())],
        }
    }

    pub fn seq(&self) -> u32 {
        self.fields
            .iter()
            .find_map(|f| match f {
                Field::Seq(v) => Some(*v),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn set_seq(&mut self, seq: u32) {
        for field in &mut self.fields {
            if let Field::Seq(v) = field {
                *v = seq;
                return;
            }
        }
        self.fields.push(Field::Seq(seq));
    }

    pub fn service(&self) -> u32 {
        self.fields
            .iter()
            .find_map(|f| match f {
                Field::Service(v) => Some(*v),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn message(&self) -> &[u8] {
        self.fields
            .iter()
            .find_map(|f| match f {
                Field::Message(v) => Some(v.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    /// Clears `buffer` then writes the encoded envelope into it.
    pub fn encode(&self, buffer: &mut Vec<u8>) {
        buffer.clear();
        for field in &self.fields {
            match field {
                Field::Seq(v) => {
                    write_tag(buffer, TAG_SEQ, WIRE_VARINT);
                    write_varint(buffer, *v as u64);
                }
                Field::Service(v) => {
                    write_tag(buffer, TAG_SERVICE, WIRE_VARINT);
                    write_varint(buffer, *v as u64);
                }
                Field::Message(bytes) => {
                    write_tag(buffer, TAG_MESSAGE, WIRE_LENGTH_DELIMITED);
                    write_varint(buffer, bytes.len() as u64);
                    buffer.extend_from_slice(bytes);
                }
                Field::Unknown { tag, wire_type, payload } => {
                    write_tag(buffer, *tag, *wire_type);
                    match *wire_type {
                        WIRE_VARINT | WIRE_FIXED64 | WIRE_FIXED32 => buffer.extend_from_slice(payload),
                        WIRE_LENGTH_DELIMITED => {
                            write_varint(buffer, payload.len() as u64);
                            buffer.extend_from_slice(payload);
                        }
                        _ => unreachable!("unsupported wire types are rejected on decode"),
                    }
                }
            }
        }
    }

    /// Parses `bytes` into `self`, replacing any previous contents. Fails cleanly on
    /// truncation or an unsupported wire type; never panics on attacker-controlled input.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut fields = Vec::new();
        let mut cursor = 0usize;
        while cursor < bytes.len() {
            let (key, consumed) = read_varint(bytes, cursor)?;
            cursor += consumed;
            let tag = (key >> 3) as u32;
            let wire_type = (key & 0x7) as u8;
            match wire_type {
                WIRE_VARINT => {
                    let (value, consumed) = read_varint(bytes, cursor)?;
                    cursor += consumed;
                    match tag {
                        TAG_SEQ => fields.push(Field::Seq(value as u32)),
                        TAG_SERVICE => fields.push(Field::Service(value as u32)),
                        _ => fields.push(Field::Unknown {
                            tag,
                            wire_type,
                            payload: encode_varint_bytes(value),
                        }),
                    }
                }
                WIRE_FIXED64 => {
                    let payload = read_fixed(bytes, cursor, 8)?;
                    cursor += 8;
                    fields.push(Field::Unknown { tag, wire_type, payload });
                }
                WIRE_FIXED32 => {
                    let payload = read_fixed(bytes, cursor, 4)?;
                    cursor += 4;
                    fields.push(Field::Unknown { tag, wire_type, payload });
                }
                WIRE_LENGTH_DELIMITED => {
                    let (len, consumed) = read_varint(bytes, cursor)?;
                    cursor += consumed;
                    let payload = read_fixed(bytes, cursor, len as usize)?;
                    cursor += len as usize;
                    match tag {
                        TAG_MESSAGE => fields.push(Field::Message(payload)),
                        _ => fields.push(Field::Unknown { tag, wire_type, payload }),
                    }
                }
                other => return Err(Error::UnsupportedWireType(other)),
            }
        }
        Ok(Self { fields })
    }
}

fn write_tag(buffer: &mut Vec<u8>, tag: u32, wire_type: u8) {
    write_varint(buffer, ((tag as u64) << 3) | wire_type as u64);
}

fn write_varint(buffer: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buffer.push(byte);
            break;
        }
        buffer.push(byte | 0x80);
    }
}

fn encode_varint_bytes(value: u64) -> Vec<u8> {
    let mut buffer = Vec::new();
    write_varint(&mut buffer, value);
    buffer
}

fn read_varint(bytes: &[u8], mut cursor: usize) -> Result<(u64, usize), Error> {
    let start = cursor;
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(cursor).ok_or(Error::Truncated)?;
        cursor += 1;
        if shift >= 64 {
            return Err(Error::VarintOverflow);
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok((value, cursor - start))
}

fn read_fixed(bytes: &[u8], cursor: usize, len: usize) -> Result<Vec<u8>, Error> {
    let end = cursor.checked_add(len).ok_or(Error::Truncated)?;
    bytes.get(cursor..end).map(|s| s.to_vec()).ok_or(Error::Truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_fields() {
        let envelope = Envelope::new(42, 1, b"hi".to_vec());
        let mut buffer = Vec::new();
        envelope.encode(&mut buffer);

        let decoded = Envelope::decode(&buffer).unwrap();
        assert_eq!(decoded.seq(), 42);
        assert_eq!(decoded.service(), 1);
        assert_eq!(decoded.message(), b"hi");
    }

    #[test]
    fn preserves_unknown_fields_byte_for_byte_across_a_hop() {
        let mut original = Envelope::new(7, 2, b"payload".to_vec());
        // simulate a field the gateway does not know about, inserted between service and message
        original.fields.insert(
            2,
            Field::Unknown {
                tag: 99,
                wire_type: WIRE_LENGTH_DELIMITED,
                payload: b"trace-id-xyz".to_vec(),
            },
        );

        let mut buffer = Vec::new();
        original.encode(&mut buffer);
        let mut decoded = Envelope::decode(&buffer).unwrap();

        // gateway rewrites seq, as it would when forwarding upstream
        decoded.set_seq(9001);

        let mut reencoded = Vec::new();
        decoded.encode(&mut reencoded);
        let roundtripped = Envelope::decode(&reencoded).unwrap();

        assert_eq!(roundtripped.seq(), 9001);
        assert_eq!(roundtripped.service(), 2);
        assert_eq!(roundtripped.message(), b"payload");
        assert!(roundtripped.fields.iter().any(|f| matches!(
            f,
            Field::Unknown { tag: 99, payload, .. } if payload == b"trace-id-xyz"
        )));
    }

    #[test]
    fn decode_fails_cleanly_on_truncated_input() {
        // a length-delimited tag announcing more bytes than are present
        let mut buffer = Vec::new();
        write_tag(&mut buffer, TAG_MESSAGE, WIRE_LENGTH_DELIMITED);
        write_varint(&mut buffer, 10);
        buffer.extend_from_slice(b"short");

        assert!(matches!(Envelope::decode(&buffer), Err(Error::Truncated)));
    }

    #[test]
    fn decode_fails_on_malformed_bytes_without_panicking() {
        let garbage = [0xffu8, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        assert!(Envelope::decode(&garbage).is_err());
    }

    #[test]
    fn set_seq_on_envelope_without_one_appends_it() {
        let mut envelope = Envelope {
            fields: vec![Field::Service(1), Field::Message(b"x".to_vec())],
        };
        envelope.set_seq(5);
        assert_eq!(envelope.seq(), 5);
    }
}

