//! Outbound session (C4): the gateway's persistent client-role WebSocket connection to one
//! upstream service. Requests are written into it by whichever inbound session dispatched
//! them; responses are read here and handed to the correlator for delivery back to the client.

use std::cell::RefCell;
use std::io;

use log::debug;
use mio::event::Source;
use mio::{Interest, Registry, Token};

use crate::gateway::OutboundHandle;
use crate::stream::mio::MioStream;
use crate::stream::tls::TlsStream;
use crate::stream::Selectable;
use crate::ws::{IntoWebsocket, Websocket, WebsocketFrame};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Phase {
    Connecting,
    Ready,
    Closed,
}

struct Inner {
    ws: Websocket<TlsStream<MioStream>>,
    phase: Phase,
}

pub struct OutboundSession {
    service_id: u32,
    inner: RefCell<Inner>,
}

impl OutboundSession {
    pub fn new(service_id: u32, stream: TlsStream<MioStream>) -> Self {
        Self {
            service_id,
            inner: RefCell::new(Inner {
                ws: stream.into_websocket("/"),
                phase: Phase::Connecting,
            }),
        }
    }

    pub const fn service_id(&self) -> u32 {
        self.service_id
    }

    pub fn closed(&self) -> bool {
        let inner = self.inner.borrow();
        inner.phase == Phase::Closed || inner.ws.closed()
    }

    pub fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        Source::register(&mut self.inner.borrow_mut().ws, registry, token, Interest::READABLE | Interest::WRITABLE)
    }

    pub fn deregister(&self, registry: &Registry) -> io::Result<()> {
        Source::deregister(&mut self.inner.borrow_mut().ws, registry)
    }

    /// Unblocks the underlying `MioStream` per the readiness mio just reported: `connected()`
    /// flips the non-blocking connect over once the socket proves writable, after which reads
    /// and writes are allowed through (§C4). Must run before `poll_response` on every event for
    /// this session, or a freshly connecting session's `MioStream` never leaves its initial
    /// `can_read = can_write = false` state and every byte gets buffered forever.
    pub fn drive_readiness(&self, readable: bool, writable: bool) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if writable && inner.ws.connected()? {
            inner.ws.make_writable()?;
        }
        if readable {
            inner.ws.make_readable()?;
        }
        Ok(())
    }

    /// Drives connect/TLS/WS-handshake progress and decodes the next full response frame, if
    /// any has arrived. The handshake stages are invisible here: `Websocket::receive_next`
    /// already folds "still handshaking" into `Ok(None)`.
    pub fn poll_response(&self) -> io::Result<Option<Vec<u8>>> {
        let mut inner = self.inner.borrow_mut();
        if inner.phase == Phase::Closed {
            return Ok(None);
        }
        loop {
            match inner.ws.receive_next() {
                Ok(Some(WebsocketFrame::Binary(true, payload))) => {
                    inner.phase = Phase::Ready;
                    return Ok(Some(payload.to_vec()));
                }
                Ok(Some(frame)) => {
                    debug!("ignoring non-response frame on outbound session {}: {frame:?}", self.service_id);
                    continue;
                }
                Ok(None) => return Ok(None),
                Err(err) => {
                    inner.phase = Phase::Closed;
                    return Err(err.into());
                }
            }
        }
    }
}

impl OutboundHandle for OutboundSession {
    fn write(&self, bytes: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        if inner.ws.send_binary(true, Some(bytes)).is_err() {
            inner.phase = Phase::Closed;
        }
    }
}
