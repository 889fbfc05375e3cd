//! Inbound session (C5): one accepted, TLS-terminated, server-role WebSocket connection from
//! a client. Reads one request at a time; does not read the next one until the matched
//! response has been written back (§4.5).

use std::cell::RefCell;
use std::io;

use log::debug;
use mio::event::Source;
use mio::{Interest, Registry, Token};

use crate::gateway::InboundHandle;
use crate::stream::tls_server::TlsStream;
use crate::stream::mio::MioStream;
use crate::ws::{ServerWebsocket, WebsocketFrame};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Phase {
    Reading,
    AwaitingResponse,
    Closed,
}

struct Inner {
    ws: ServerWebsocket<TlsStream<MioStream>>,
    phase: Phase,
}

pub struct InboundSession {
    inner: RefCell<Inner>,
}

impl InboundSession {
    pub fn new(stream: TlsStream<MioStream>) -> Self {
        Self {
            inner: RefCell::new(Inner {
                ws: ServerWebsocket::new(stream),
                phase: Phase::Reading,
            }),
        }
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

    /// Drives the accept handshake and decodes the next full request frame, if the session is
    /// not still waiting on a previous request's response.
    pub fn poll_request(&self) -> io::Result<Option<Vec<u8>>> {
        let mut inner = self.inner.borrow_mut();
        if inner.phase != Phase::Reading {
            return Ok(None);
        }
        loop {
            match inner.ws.receive_next() {
                Ok(Some(WebsocketFrame::Binary(true, payload))) => {
                    inner.phase = Phase::AwaitingResponse;
                    return Ok(Some(payload.to_vec()));
                }
                Ok(Some(frame)) => {
                    debug!("ignoring non-request frame on inbound session: {frame:?}");
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

impl InboundHandle for InboundSession {
    fn write(&self, bytes: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        if inner.ws.send_binary(true, Some(bytes)).is_err() {
            inner.phase = Phase::Closed;
            return;
        }
        inner.phase = Phase::Reading;
    }

    /// Marks the session closed; the reactor's idle sweep (`Executor::sweep_closed`) picks it
    /// up on the next loop iteration and tears it down even without a readiness event.
    fn close(&self) {
        self.inner.borrow_mut().phase = Phase::Closed;
    }
}
