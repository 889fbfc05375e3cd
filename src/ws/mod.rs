//! WebSocket framing for both connection roles the gateway plays: a client-role connection
//! to each upstream service (outbound session) and a server-role (accepting) connection to
//! each client (inbound session). The two roles share header parsing rules but apply
//! opposite masking: client frames are always masked, server frames never are.
//!
//! ## Examples
//!
//! Wrap a TLS-terminated upstream connection as a client-role websocket.
//! ```no_run
//! use boomnet::stream::ConnectionInfoProvider;
//! use boomnet::stream::tls::{IntoTlsStream, TlsClientContext};
//! use boomnet::ws::IntoWebsocket;
//!
//! # fn doc<S: std::io::Read + std::io::Write + ConnectionInfoProvider>(stream: S, ctx: &TlsClientContext) -> std::io::Result<()> {
//! let tls = stream.into_tls_stream(ctx)?;
//! let ws = tls.into_websocket("/");
//! # Ok(()) }
//! ```

use std::io;
use std::io::ErrorKind::WouldBlock;
use std::io::{Read, Write};

use mio::{Interest, Registry, Token, event::Source};

use crate::buffer;
use crate::stream::Selectable;
use crate::util::NoBlock;
use crate::ws::Error::{Closed, ReceivedCloseFrame};
use crate::ws::decoder::Decoder;
use crate::ws::handshake::Handshaker;
use crate::ws::server::{ServerDecoder, ServerHandshaker};

// re-export
pub use crate::ws::error::Error;

mod decoder;
mod encoder;
mod error;
mod handshake;
pub mod protocol;
pub mod server;

type ReadBuffer = buffer::ReadBuffer<4096>;

/// Supported WebSocket frame variants, shared by both connection roles.
#[derive(Debug)]
pub enum WebsocketFrame {
    Ping(&'static [u8]),
    Pong(&'static [u8]),
    Text(bool, &'static [u8]),
    Binary(bool, &'static [u8]),
    Continuation(bool, &'static [u8]),
    Close(&'static [u8]),
}

/// Client-role websocket, used for the gateway's persistent outbound connection to each
/// upstream service (C4).
#[derive(Debug)]
pub struct Websocket<S> {
    stream: S,
    closed: bool,
    state: ClientState,
}

impl<S> Websocket<S> {
    pub const fn closed(&self) -> bool {
        self.closed
    }

    pub const fn handshake_complete(&self) -> bool {
        matches!(self.state, ClientState::Connection(_))
    }

    fn new(stream: S, server_name: &str, endpoint: &str) -> Self {
        Self {
            stream,
            closed: false,
            state: ClientState::Handshake(Handshaker::new(server_name, endpoint)),
        }
    }
}

impl<S: Read + Write> Websocket<S> {
    #[inline]
    pub fn batch_iter(&mut self) -> Result<BatchIter<'_, S>, Error> {
        match self.state.read(&mut self.stream).no_block() {
            Ok(()) => Ok(BatchIter { websocket: self }),
            Err(err) => {
                self.closed = true;
                Err(err)?
            }
        }
    }

    #[inline]
    pub fn receive_next(&mut self) -> Result<Option<WebsocketFrame>, Error> {
        self.batch_iter()?.next().transpose()
    }

    #[inline]
    pub fn send_binary(&mut self, fin: bool, body: Option<&[u8]>) -> Result<(), Error> {
        self.send(fin, protocol::op::BINARY_FRAME, body)
    }

    #[inline]
    pub fn send_pong(&mut self, body: Option<&[u8]>) -> Result<(), Error> {
        self.send(true, protocol::op::PONG, body)
    }

    #[inline]
    fn next(&mut self) -> Result<Option<WebsocketFrame>, Error> {
        self.ensure_not_closed()?;
        match self.state.next(&mut self.stream) {
            Ok(frame) => Ok(frame),
            Err(err) => {
                self.closed = true;
                Err(err)?
            }
        }
    }

    #[inline]
    fn send(&mut self, fin: bool, op_code: u8, body: Option<&[u8]>) -> Result<(), Error> {
        self.ensure_not_closed()?;
        match self.state.send(&mut self.stream, fin, op_code, body) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.closed = true;
                Err(err)?
            }
        }
    }

    #[inline]
    const fn ensure_not_closed(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Closed);
        }
        Ok(())
    }
}

impl<S: Source> Source for Websocket<S> {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        registry.register(&mut self.stream, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        registry.reregister(&mut self.stream, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }
}

impl<S: Selectable> Selectable for Websocket<S> {
    fn connected(&mut self) -> io::Result<bool> {
        self.stream.connected()
    }

    fn make_writable(&mut self) -> io::Result<()> {
        self.stream.make_writable()
    }

    fn make_readable(&mut self) -> io::Result<()> {
        self.stream.make_readable()
    }
}

#[derive(Debug)]
enum ClientState {
    Handshake(Handshaker),
    Connection(Decoder),
}

impl ClientState {
    #[inline]
    fn read<S: Read>(&mut self, stream: &mut S) -> io::Result<()> {
        match self {
            ClientState::Handshake(handshake) => handshake.read(stream),
            ClientState::Connection(decoder) => decoder.read(stream),
        }
    }

    #[inline]
    fn next<S: Read + Write>(&mut self, stream: &mut S) -> Result<Option<WebsocketFrame>, Error> {
        match self {
            ClientState::Handshake(handshake) => match handshake.perform_handshake(stream) {
                Ok(()) => {
                    handshake.drain_pending_message_buffer(stream, encoder::send)?;
                    *self = ClientState::Connection(Decoder::new());
                    Ok(None)
                }
                Err(err) if err.kind() == WouldBlock => Ok(None),
                Err(err) => Err(err)?,
            },
            ClientState::Connection(decoder) => match decoder.decode_next() {
                Ok(Some(WebsocketFrame::Ping(payload))) => {
                    self.send(stream, true, protocol::op::PONG, Some(payload))?;
                    Ok(None)
                }
                Ok(Some(WebsocketFrame::Close(payload))) => {
                    let _ = self.send(stream, true, protocol::op::CONNECTION_CLOSE, Some(payload));
                    if payload.len() < 2 {
                        return Err(ReceivedCloseFrame(1005, String::new()));
                    }
                    let (status_code, body) = payload.split_at(2);
                    let status_code = u16::from_be_bytes(status_code.try_into()?);
                    let body = String::from_utf8_lossy(body).to_string();
                    Err(ReceivedCloseFrame(status_code, body))
                }
                Ok(frame) => Ok(frame),
                Err(err) => Err(err)?,
            },
        }
    }

    #[inline]
    fn send<S: Write>(&mut self, stream: &mut S, fin: bool, op_code: u8, body: Option<&[u8]>) -> Result<(), Error> {
        match self {
            ClientState::Handshake(handshake) => {
                handshake.buffer_message(fin, op_code, body);
                Ok(())
            }
            ClientState::Connection(_) => {
                encoder::send(stream, fin, op_code, body)?;
                Ok(())
            }
        }
    }
}

pub struct BatchIter<'a, S> {
    websocket: &'a mut Websocket<S>,
}

impl<S: Read + Write> Iterator for BatchIter<'_, S> {
    type Item = Result<WebsocketFrame, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.websocket.next().transpose()
    }
}

pub trait IntoWebsocket {
    /// Wraps `self` in a client-role websocket that will perform the upgrade handshake
    /// against `endpoint` (e.g. `/`) using the stream's own connection info for the `Host`
    /// header.
    fn into_websocket(self, endpoint: &str) -> Websocket<Self>
    where
        Self: Sized + crate::stream::ConnectionInfoProvider;
}

impl<T> IntoWebsocket for T
where
    T: Read + Write,
{
    fn into_websocket(self, endpoint: &str) -> Websocket<Self>
    where
        Self: Sized + crate::stream::ConnectionInfoProvider,
    {
        let server_name = self.connection_info().host().to_owned();
        Websocket::new(self, &server_name, endpoint)
    }
}

/// Server-role websocket, used for each accepted client connection (C5).
#[derive(Debug)]
pub struct ServerWebsocket<S> {
    stream: S,
    closed: bool,
    state: ServerState,
}

impl<S> ServerWebsocket<S> {
    pub const fn closed(&self) -> bool {
        self.closed
    }

    pub const fn handshake_complete(&self) -> bool {
        matches!(self.state, ServerState::Connection(_))
    }

    pub fn new(stream: S) -> Self {
        Self {
            stream,
            closed: false,
            state: ServerState::Handshake(ServerHandshaker::new()),
        }
    }
}

impl<S: Read + Write> ServerWebsocket<S> {
    #[inline]
    pub fn batch_iter(&mut self) -> Result<ServerBatchIter<'_, S>, Error> {
        match self.state.read(&mut self.stream).no_block() {
            Ok(()) => Ok(ServerBatchIter { websocket: self }),
            Err(err) => {
                self.closed = true;
                Err(err)?
            }
        }
    }

    #[inline]
    pub fn receive_next(&mut self) -> Result<Option<WebsocketFrame>, Error> {
        self.batch_iter()?.next().transpose()
    }

    #[inline]
    pub fn send_binary(&mut self, fin: bool, body: Option<&[u8]>) -> Result<(), Error> {
        self.send(fin, protocol::op::BINARY_FRAME, body)
    }

    #[inline]
    fn next(&mut self) -> Result<Option<WebsocketFrame>, Error> {
        self.ensure_not_closed()?;
        match self.state.next(&mut self.stream) {
            Ok(frame) => Ok(frame),
            Err(err) => {
                self.closed = true;
                Err(err)?
            }
        }
    }

    #[inline]
    fn send(&mut self, fin: bool, op_code: u8, body: Option<&[u8]>) -> Result<(), Error> {
        self.ensure_not_closed()?;
        match self.state.send(&mut self.stream, fin, op_code, body) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.closed = true;
                Err(err)?
            }
        }
    }

    #[inline]
    const fn ensure_not_closed(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Closed);
        }
        Ok(())
    }
}

impl<S: Source> Source for ServerWebsocket<S> {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        registry.register(&mut self.stream, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        registry.reregister(&mut self.stream, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }
}

impl<S: Selectable> Selectable for ServerWebsocket<S> {
    fn connected(&mut self) -> io::Result<bool> {
        self.stream.connected()
    }

    fn make_writable(&mut self) -> io::Result<()> {
        self.stream.make_writable()
    }

    fn make_readable(&mut self) -> io::Result<()> {
        self.stream.make_readable()
    }
}

#[derive(Debug)]
enum ServerState {
    Handshake(ServerHandshaker),
    Connection(ServerDecoder),
}

impl ServerState {
    #[inline]
    fn read<S: Read>(&mut self, stream: &mut S) -> io::Result<()> {
        match self {
            ServerState::Handshake(handshake) => handshake.read(stream),
            ServerState::Connection(decoder) => decoder.read(stream),
        }
    }

    #[inline]
    fn next<S: Read + Write>(&mut self, stream: &mut S) -> Result<Option<WebsocketFrame>, Error> {
        match self {
            ServerState::Handshake(handshake) => match handshake.perform_handshake(stream) {
                Ok(()) => {
                    let pipelined = handshake.take_pipelined();
                    let mut decoder = ServerDecoder::new();
                    if !pipelined.is_empty() {
                        decoder.read(&mut pipelined.as_slice())?;
                    }
                    *self = ServerState::Connection(decoder);
                    Ok(None)
                }
                Err(err) if err.kind() == WouldBlock => Ok(None),
                Err(err) => Err(err)?,
            },
            ServerState::Connection(decoder) => match decoder.decode_next() {
                Ok(Some(WebsocketFrame::Ping(payload))) => {
                    self.send(stream, true, protocol::op::PONG, Some(payload))?;
                    Ok(None)
                }
                Ok(Some(WebsocketFrame::Close(payload))) => {
                    let _ = self.send(stream, true, protocol::op::CONNECTION_CLOSE, Some(payload));
                    Err(Error::ReceivedCloseFrame(1000, String::new()))
                }
                Ok(frame) => Ok(frame),
                Err(err) => Err(err)?,
            },
        }
    }

    #[inline]
    fn send<S: Write>(&mut self, stream: &mut S, fin: bool, op_code: u8, body: Option<&[u8]>) -> Result<(), Error> {
        match self {
            ServerState::Handshake(_) => Err(Error::Protocol("cannot send before the handshake completes")),
            ServerState::Connection(_) => {
                server::send(stream, fin, op_code, body)?;
                Ok(())
            }
        }
    }
}

pub struct ServerBatchIter<'a, S> {
    websocket: &'a mut ServerWebsocket<S>,
}

impl<S: Read + Write> Iterator for ServerBatchIter<'_, S> {
    type Item = Result<WebsocketFrame, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.websocket.next().transpose()
    }
}
