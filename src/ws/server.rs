//! Server-role (accept) WebSocket handshake and framing.
//!
//! Mirrors the client-role `handshake`/`decoder`/`encoder` trio in this module's parent but
//! flips every rule the RFC imposes on the accepting side: inbound frames must be masked and
//! are unmasked on decode; outbound frames must never be masked.

use std::io;
use std::io::ErrorKind::WouldBlock;
use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose;
use httparse::Request;
use sha1::{Digest, Sha1};

use crate::util::into_array;
use crate::ws::{ReadBuffer, WebsocketFrame, protocol};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes `Sec-WebSocket-Accept` from a client's `Sec-WebSocket-Key` per RFC 6455 §1.3.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    let digest = hasher.finalize();
    general_purpose::STANDARD.encode(digest)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum HandshakeState {
    PendingRequest,
    PendingResponse,
    Completed,
}

/// Accepts an inbound WebSocket upgrade request and writes the `101` response.
#[derive(Debug)]
pub struct ServerHandshaker {
    inbound_buffer: ReadBuffer,
    outbound_buffer: Vec<u8>,
    bytes_sent: usize,
    state: HandshakeState,
    /// Bytes the client pipelined past the request's terminating `\r\n\r\n` in the same
    /// read, e.g. the first WS frame sent without waiting for the `101` response. Handed to
    /// the `ServerDecoder` that replaces this handshaker once it completes.
    pipelined: Vec<u8>,
}

impl ServerHandshaker {
    pub fn new() -> Self {
        Self {
            inbound_buffer: ReadBuffer::new(),
            outbound_buffer: Vec::new(),
            bytes_sent: 0,
            state: HandshakeState::PendingRequest,
            pipelined: Vec::new(),
        }
    }

    #[cold]
    pub fn read<S: Read>(&mut self, stream: &mut S) -> io::Result<()> {
        if self.state == HandshakeState::PendingRequest {
            self.inbound_buffer.read_all_from(stream)?;
        }
        Ok(())
    }

    /// Takes any bytes the client pipelined past the handshake request, leaving this
    /// handshaker's copy empty. Meant to be called once, right after the handshake completes.
    pub fn take_pipelined(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pipelined)
    }

    #[cold]
    pub fn perform_handshake<S: Read + Write>(&mut self, stream: &mut S) -> io::Result<()> {
        match self.state {
            HandshakeState::PendingRequest => {
                let view = self.inbound_buffer.view();
                let mut headers = [httparse::EMPTY_HEADER; 64];
                let mut request = Request::new(&mut headers);
                let consumed = match request.parse(view).map_err(io::Error::other)? {
                    httparse::Status::Complete(n) => n,
                    httparse::Status::Partial => return Err(io::Error::from(WouldBlock)),
                };

                let client_key = request
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("Sec-WebSocket-Key"))
                    .map(|h| String::from_utf8_lossy(h.value).to_string())
                    .ok_or_else(|| io::Error::other("missing Sec-WebSocket-Key header"))?;

                let accept_key = compute_accept_key(&client_key);
                self.outbound_buffer = format!(
                    "HTTP/1.1 101 Switching Protocols\r\n\
                     Upgrade: websocket\r\n\
                     Connection: Upgrade\r\n\
                     Sec-WebSocket-Accept: {accept_key}\r\n\
                     \r\n"
                )
                .into_bytes();
                self.pipelined = view[consumed..].to_vec();
                self.state = HandshakeState::PendingResponse;
                Err(io::Error::from(WouldBlock))
            }
            HandshakeState::PendingResponse => {
                let from = self.bytes_sent;
                let remaining = &self.outbound_buffer[from..];
                if !remaining.is_empty() {
                    self.bytes_sent += stream.write(remaining)?;
                    Err(io::Error::from(WouldBlock))
                } else {
                    self.state = HandshakeState::Completed;
                    Ok(())
                }
            }
            HandshakeState::Completed => Ok(()),
        }
    }
}

impl Default for ServerHandshaker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
enum DecodeState {
    ReadingHeader,
    ReadingPayloadLength,
    ReadingExtendedPayloadLength2,
    ReadingExtendedPayloadLength8,
    ReadingMaskingKey,
    ReadingPayload,
}

/// Decodes frames sent by a client. Every client frame must carry the mask bit; the payload
/// is unmasked in place before being handed back to the caller.
#[derive(Debug)]
pub struct ServerDecoder {
    buffer: ReadBuffer,
    decode_state: DecodeState,
    fin: bool,
    payload_length: usize,
    op_code: u8,
    masking_key: [u8; 4],
    needs_more_data: bool,
}

impl ServerDecoder {
    pub fn new() -> Self {
        Self {
            buffer: ReadBuffer::new(),
            decode_state: DecodeState::ReadingHeader,
            fin: false,
            op_code: 0,
            payload_length: 0,
            masking_key: [0; 4],
            needs_more_data: true,
        }
    }

    #[inline]
    pub fn read<S: Read>(&mut self, stream: &mut S) -> io::Result<()> {
        if self.needs_more_data {
            self.buffer.read_all_from(stream)?;
            self.needs_more_data = false;
        }
        Ok(())
    }

    #[inline]
    pub fn decode_next(&mut self) -> Result<Option<WebsocketFrame>, crate::ws::Error> {
        loop {
            let available = self.buffer.available();
            match self.decode_state {
                DecodeState::ReadingHeader => {
                    if available == 0 {
                        break;
                    }
                    let b = unsafe { self.buffer.consume_next_byte_unchecked() };
                    let fin = ((b & protocol::FIN_MASK) >> 7) == 1;
                    let rsv = b & (protocol::RSV1_MASK | protocol::RSV2_MASK | protocol::RSV3_MASK);
                    if rsv != 0 {
                        return Err(crate::ws::Error::Protocol("non zero RSV value received"));
                    }
                    self.fin = fin;
                    self.op_code = b & protocol::OP_CODE_MASK;
                    self.decode_state = DecodeState::ReadingPayloadLength;
                }
                DecodeState::ReadingPayloadLength => {
                    if available == 0 {
                        break;
                    }
                    let b = unsafe { self.buffer.consume_next_byte_unchecked() };
                    let mask = (b & protocol::MASK_MASK) >> 7;
                    if mask != 1 {
                        return Err(crate::ws::Error::Protocol("client frame received without masking bit set"));
                    }
                    let payload_length = b & protocol::PAYLOAD_LENGTH_MASK;
                    self.payload_length = payload_length as usize;
                    match payload_length {
                        0..=125 => self.decode_state = DecodeState::ReadingMaskingKey,
                        126 => self.decode_state = DecodeState::ReadingExtendedPayloadLength2,
                        127 => self.decode_state = DecodeState::ReadingExtendedPayloadLength8,
                        _ => unsafe { std::hint::unreachable_unchecked() },
                    }
                }
                DecodeState::ReadingExtendedPayloadLength2 => {
                    if available < 2 {
                        break;
                    }
                    let bytes = unsafe { self.buffer.consume_next_unchecked(2) };
                    self.payload_length = u16::from_be_bytes(unsafe { into_array(bytes) }) as usize;
                    self.decode_state = DecodeState::ReadingMaskingKey;
                }
                DecodeState::ReadingExtendedPayloadLength8 => {
                    if available < 8 {
                        break;
                    }
                    let bytes = unsafe { self.buffer.consume_next_unchecked(8) };
                    self.payload_length = u64::from_be_bytes(unsafe { into_array(bytes) }) as usize;
                    self.decode_state = DecodeState::ReadingMaskingKey;
                }
                DecodeState::ReadingMaskingKey => {
                    if available < 4 {
                        break;
                    }
                    let bytes = unsafe { self.buffer.consume_next_unchecked(4) };
                    self.masking_key = unsafe { into_array(bytes) };
                    self.decode_state = DecodeState::ReadingPayload;
                }
                DecodeState::ReadingPayload => {
                    let payload_length = self.payload_length;
                    if available < payload_length {
                        break;
                    }
                    // SAFETY: `consume_next_unchecked` hands back a `'static` view into the
                    // underlying buffer storage; unmasking in place is sound because nothing
                    // else reads this slice until it is consumed again on the next header.
                    let payload = unsafe { self.buffer.consume_next_unchecked(payload_length) };
                    let payload_ptr = payload.as_ptr() as *mut u8;
                    for i in 0..payload.len() {
                        unsafe {
                            *payload_ptr.add(i) ^= self.masking_key[i % 4];
                        }
                    }
                    let frame = match self.op_code {
                        protocol::op::TEXT_FRAME => WebsocketFrame::Text(self.fin, payload),
                        protocol::op::BINARY_FRAME => WebsocketFrame::Binary(self.fin, payload),
                        protocol::op::CONTINUATION_FRAME => WebsocketFrame::Continuation(self.fin, payload),
                        protocol::op::PING => WebsocketFrame::Ping(payload),
                        protocol::op::PONG => WebsocketFrame::Pong(payload),
                        protocol::op::CONNECTION_CLOSE => WebsocketFrame::Close(payload),
                        _ => return Err(crate::ws::Error::Protocol("unknown op_code")),
                    };
                    self.decode_state = DecodeState::ReadingHeader;
                    return Ok(Some(frame));
                }
            }
        }

        self.needs_more_data = true;
        Ok(None)
    }
}

impl Default for ServerDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes frames sent to a client. Per RFC 6455, a server must never mask its frames.
pub(crate) fn send<S: Write>(stream: &mut S, fin: bool, op_code: u8, body: Option<&[u8]>) -> io::Result<()> {
    let mut header = 0u8;
    if fin {
        header |= protocol::FIN_MASK;
    }
    header |= op_code;
    stream.write_all(&header.to_be_bytes())?;

    let body = body.unwrap_or(&[]);
    if body.len() <= 125 {
        stream.write_all(&(body.len() as u8).to_be_bytes())?;
    } else if body.len() <= u16::MAX as usize {
        stream.write_all(&126u8.to_be_bytes())?;
        stream.write_all(&(body.len() as u16).to_be_bytes())?;
    } else {
        stream.write_all(&127u8.to_be_bytes())?;
        stream.write_all(&(body.len() as u64).to_be_bytes())?;
    }
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_worked_example() {
        // RFC 6455 section 1.3
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn decodes_masked_client_frame_and_unmasks_payload() {
        let masking_key = [0x12, 0x34, 0x56, 0x78];
        let payload = b"hello";
        let masked: Vec<u8> = payload
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ masking_key[i % 4])
            .collect();

        let mut frame = Vec::new();
        frame.push(protocol::FIN_MASK | protocol::op::BINARY_FRAME);
        frame.push(protocol::MASK_MASK | payload.len() as u8);
        frame.extend_from_slice(&masking_key);
        frame.extend_from_slice(&masked);

        let mut decoder = ServerDecoder::new();
        decoder.read(&mut frame.as_slice()).unwrap();
        match decoder.decode_next().unwrap() {
            Some(WebsocketFrame::Binary(true, body)) => assert_eq!(body, payload),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn rejects_unmasked_client_frame() {
        let mut frame = vec![protocol::FIN_MASK | protocol::op::BINARY_FRAME, 5u8];
        frame.extend_from_slice(b"hello");

        let mut decoder = ServerDecoder::new();
        decoder.read(&mut frame.as_slice()).unwrap();
        assert!(decoder.decode_next().is_err());
    }
}
