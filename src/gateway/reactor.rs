//! The executor (C7): a single mio `Poll` driving the listener, every outbound session and
//! every inbound session off one thread. Because nothing else ever touches session or
//! correlator state, the serialization guarantees in §5 hold structurally (see DESIGN.md).

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, error, info, warn};
use mio::net::{TcpListener, TcpStream as MioTcpStream};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::ServiceRegistry;
use crate::gateway::{Correlator, InboundHandle, OutboundHandle};
use crate::gateway::inbound::InboundSession;
use crate::gateway::outbound::OutboundSession;
use crate::idle::IdleStrategy;
use crate::stream::mio::{self as mio_stream};
use crate::stream::tcp;
use crate::stream::tls::{IntoTlsStream, TlsClientContext};
use crate::stream::tls_server::{IntoTlsServerStream, TlsServerContext};
use crate::stream::{Connect, ConnectionInfo};

const LISTENER_TOKEN: Token = Token(0);
const FIRST_SESSION_TOKEN: usize = 1;

enum Session {
    Inbound(Rc<InboundSession>),
    Outbound(Rc<OutboundSession>),
}

/// Owns the reactor loop. Built once at startup from a bound listener, the loaded TLS
/// contexts and the service registry; runs forever (§9(d)).
pub struct Executor {
    poll: Poll,
    listener: TcpListener,
    tls_server: TlsServerContext,
    tls_client: TlsClientContext,
    correlator: Correlator<InboundSession, Rc<OutboundSession>>,
    sessions: HashMap<Token, Session>,
    next_token: usize,
    idle: IdleStrategy,
}

impl Executor {
    pub fn start(
        bind_addr: SocketAddr,
        services: &ServiceRegistry,
        tls_server: TlsServerContext,
        tls_client: TlsClientContext,
        eager_upstream_drop: bool,
        idle: IdleStrategy,
    ) -> Result<Self, crate::gateway::error::Error> {
        let poll = Poll::new()?;
        let mut listener = bind_listener(bind_addr)?;
        poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let mut correlator = Correlator::new(eager_upstream_drop);
        let mut sessions = HashMap::new();
        let mut next_token = FIRST_SESSION_TOKEN;

        for service in services.iter() {
            let token = Token(next_token);
            next_token += 1;
            match connect_outbound(service.id, &service.connection_info, &tls_client) {
                Ok(outbound) => {
                    let outbound = Rc::new(outbound);
                    outbound.register(poll.registry(), token)?;
                    correlator.register_outbound(service.id, outbound.clone());
                    sessions.insert(token, Session::Outbound(outbound));
                    info!("started outbound session for service {} -> {}", service.id, service.connection_info);
                }
                Err(err) => error!("failed to start outbound session for service {}: {err}", service.id),
            }
        }

        info!("gateway listening on {bind_addr}, {} service(s) configured", services.len());

        Ok(Self {
            poll,
            listener,
            tls_server,
            tls_client,
            correlator,
            sessions,
            next_token,
            idle,
        })
    }

    /// Runs the reactor loop. Never returns on success; per §9(d) there is no shutdown path.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        loop {
            match self.poll.poll(&mut events, Some(Duration::ZERO)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }

            let mut work_count = 0usize;
            for event in events.iter() {
                work_count += 1;
                if event.token() == LISTENER_TOKEN {
                    self.accept_loop();
                    continue;
                }
                self.dispatch(event.token(), event.is_readable(), event.is_writable());
            }

            self.sweep_closed();
            self.idle.idle(work_count);
        }
    }

    /// Tears down sessions that were closed outside of a readiness event, e.g. an inbound
    /// session asked to close by `eager_upstream_drop` (§9(a)) whose socket is otherwise idle
    /// and will not generate another event on its own.
    fn sweep_closed(&mut self) {
        let mut dead_outbound_services = Vec::new();
        let dead: Vec<Token> = self
            .sessions
            .iter()
            .filter_map(|(token, session)| match session {
                Session::Inbound(inbound) if inbound.closed() => Some(*token),
                Session::Outbound(outbound) if outbound.closed() => {
                    dead_outbound_services.push(outbound.service_id());
                    Some(*token)
                }
                _ => None,
            })
            .collect();

        for service_id in dead_outbound_services {
            self.correlator.on_upstream_closed(service_id);
        }
        for token in dead {
            self.teardown(token);
        }
    }

    fn accept_loop(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = self.spawn_inbound(stream, peer) {
                        warn!("failed to accept inbound connection from {peer}: {err}");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!("accept failed: {err}");
                    return;
                }
            }
        }
    }

    fn spawn_inbound(&mut self, stream: MioTcpStream, peer: SocketAddr) -> io::Result<()> {
        let connection_info = ConnectionInfo::new(peer.ip().to_string(), peer.port());
        let accepted = mio_stream::from_accepted(stream, connection_info);
        let tls_stream = accepted.into_tls_server_stream(&self.tls_server)?;
        let session = Rc::new(InboundSession::new(tls_stream));

        let token = Token(self.next_token);
        self.next_token += 1;
        session.register(self.poll.registry(), token)?;
        self.sessions.insert(token, Session::Inbound(session));
        Ok(())
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        let inbound = match self.sessions.get(&token) {
            Some(Session::Inbound(inbound)) => Some(inbound.clone()),
            _ => None,
        };
        if let Some(inbound) = inbound {
            self.dispatch_inbound(token, inbound);
            return;
        }

        let outbound = match self.sessions.get(&token) {
            Some(Session::Outbound(outbound)) => Some(outbound.clone()),
            _ => None,
        };
        if let Some(outbound) = outbound {
            self.dispatch_outbound(token, outbound, readable, writable);
        }
    }

    fn dispatch_inbound(&mut self, token: Token, inbound: Rc<InboundSession>) {
        match inbound.poll_request() {
            Ok(Some(bytes)) => {
                if let Some((outbound, forwarded)) = self.correlator.parse_request(&bytes, &inbound) {
                    outbound.write(&forwarded);
                }
            }
            Ok(None) => {}
            Err(err) => debug!("inbound session closed: {err}"),
        }

        if inbound.closed() {
            self.teardown(token);
        }
    }

    fn dispatch_outbound(&mut self, token: Token, outbound: Rc<OutboundSession>, readable: bool, writable: bool) {
        if let Err(err) = outbound.drive_readiness(readable, writable) {
            warn!("outbound session for service {} failed: {err}", outbound.service_id());
            self.correlator.on_upstream_closed(outbound.service_id());
            self.teardown(token);
            return;
        }

        match outbound.poll_response() {
            Ok(Some(bytes)) => {
                if let Some((inbound, response)) = self.correlator.parse_response(&bytes) {
                    inbound.write(&response);
                }
            }
            Ok(None) => {}
            Err(err) => warn!("outbound session for service {} failed: {err}", outbound.service_id()),
        }

        if outbound.closed() {
            self.correlator.on_upstream_closed(outbound.service_id());
            self.teardown(token);
        }
    }

    fn teardown(&mut self, token: Token) {
        if let Some(session) = self.sessions.remove(&token) {
            match session {
                Session::Inbound(inbound) => {
                    let _ = inbound.deregister(self.poll.registry());
                }
                Session::Outbound(outbound) => {
                    let _ = outbound.deregister(self.poll.registry());
                }
            }
        }
    }
}

fn connect_outbound(service_id: u32, connection_info: &ConnectionInfo, tls: &TlsClientContext) -> io::Result<OutboundSession> {
    let std_stream = std::net::TcpStream::connect_nonblocking(connection_info)?;
    let tcp_stream = tcp::TcpStream::new(std_stream, connection_info.clone());
    let mio_stream = mio_stream::IntoMioStream::into_mio_stream(tcp_stream);
    let tls_stream = mio_stream.into_tls_stream(tls)?;
    Ok(OutboundSession::new(service_id, tls_stream))
}

/// Binds with `SO_REUSEADDR` and a backlog large enough that the OS clamps it to its own
/// platform maximum, matching the "listen at the platform maximum backlog" contract in §4.6
/// without depending on a libc constant.
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::MAX)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}
