use std::collections::VecDeque;
use std::io;
use std::io::ErrorKind::WouldBlock;
use std::io::{Cursor, Read, Write};

use crate::ws::ReadBuffer;
use base64::Engine;
use base64::engine::general_purpose;
use httparse::Response;
use rand::{Rng, rng};

const SWITCHING_PROTOCOLS: u16 = 101;

/// Client-role WebSocket handshake: generates the request, drives it to completion once the
/// socket is writable, then waits for and validates the `101 Switching Protocols` response.
#[derive(Debug)]
pub struct Handshaker {
    inbound_buffer: ReadBuffer,
    outbound_buffer: Cursor<[u8; 256]>,
    bytes_sent: usize,
    state: HandshakeState,
    server_name: String,
    endpoint: String,
    pending_msg_buffer: VecDeque<(u8, bool, Option<Vec<u8>>)>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HandshakeState {
    NotStarted,
    PendingRequest,
    PendingResponse,
    Completed,
}

use HandshakeState::{Completed, NotStarted, PendingRequest, PendingResponse};

impl Handshaker {
    pub fn new(server_name: &str, endpoint: &str) -> Self {
        Self {
            inbound_buffer: ReadBuffer::new(),
            outbound_buffer: Cursor::new([0; 256]),
            bytes_sent: 0,
            state: NotStarted,
            server_name: server_name.to_string(),
            endpoint: endpoint.to_string(),
            pending_msg_buffer: VecDeque::with_capacity(256),
        }
    }

    #[cold]
    pub fn read<S: Read>(&mut self, stream: &mut S) -> io::Result<()> {
        if self.state == PendingResponse {
            self.inbound_buffer.read_all_from(stream)?;
        }
        Ok(())
    }

    #[cold]
    pub fn perform_handshake<S: Read + Write>(&mut self, stream: &mut S) -> io::Result<()> {
        match self.state {
            NotStarted => {
                self.prepare_handshake_request()?;
                Err(io::Error::from(WouldBlock))
            }
            PendingRequest => {
                let from = self.bytes_sent;
                let position = self.outbound_buffer.position();
                let remaining = &self.outbound_buffer.get_ref()[from..position as usize];
                if !remaining.is_empty() {
                    self.bytes_sent += stream.write(remaining)?;
                } else {
                    self.state = PendingResponse;
                }
                Err(io::Error::from(WouldBlock))
            }
            PendingResponse => {
                let view = self.inbound_buffer.view();
                if view.len() >= 4 && &view[view.len() - 4..] == b"\r\n\r\n" {
                    let mut headers = [httparse::EMPTY_HEADER; 64];
                    let mut response = Response::new(&mut headers);
                    response.parse(view).map_err(io::Error::other)?;
                    if response.code != Some(SWITCHING_PROTOCOLS) {
                        return Err(io::Error::other("unable to switch protocols"));
                    }
                    self.state = Completed;
                    return Ok(());
                }
                Err(io::Error::from(WouldBlock))
            }
            Completed => Ok(()),
        }
    }

    #[cold]
    pub fn buffer_message(&mut self, fin: bool, op: u8, body: Option<&[u8]>) {
        let body = body.map(|body| body.to_vec());
        self.pending_msg_buffer.push_back((op, fin, body))
    }

    #[cold]
    pub fn drain_pending_message_buffer<S, F>(&mut self, stream: &mut S, mut send: F) -> io::Result<()>
    where
        S: Write,
        F: FnMut(&mut S, bool, u8, Option<&[u8]>) -> io::Result<()>,
    {
        while let Some((op, fin, body)) = self.pending_msg_buffer.pop_front() {
            send(stream, fin, op, body.as_deref())?;
        }
        Ok(())
    }

    fn prepare_handshake_request(&mut self) -> io::Result<()> {
        let outbound = &mut self.outbound_buffer;
        outbound.write_all(format!("GET {} HTTP/1.1\r\n", self.endpoint).as_bytes())?;
        outbound.write_all(format!("Host: {}\r\n", self.server_name).as_bytes())?;
        outbound.write_all(b"Upgrade: websocket\r\n")?;
        outbound.write_all(b"Connection: upgrade\r\n")?;
        outbound.write_all(format!("Sec-WebSocket-Key: {}\r\n", generate_nonce()).as_bytes())?;
        outbound.write_all(b"Sec-WebSocket-Version: 13\r\n")?;
        outbound.write_all(b"\r\n")?;
        self.state = PendingRequest;
        Ok(())
    }
}

fn generate_nonce() -> String {
    let mut rng = rng();
    let nonce_bytes: [u8; 16] = rng.random();
    general_purpose::STANDARD.encode(nonce_bytes)
}
