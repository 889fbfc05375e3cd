//! Various stream implementations on top of which protocol can be applied.

use socket2::{Domain, Protocol, Socket, Type};
use std::fmt::{Display, Formatter};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::{io, vec};

pub mod mio;
pub mod tcp;
pub mod tls;
pub mod tls_server;

/// Marks a stream that participates in the gateway's mio reactor: connect-in-progress
/// detection and readiness gating share this contract across plain TCP, client TLS and
/// server TLS streams.
pub trait Selectable {
    fn connected(&mut self) -> io::Result<bool>;

    fn make_writable(&mut self) -> io::Result<()>;

    fn make_readable(&mut self) -> io::Result<()>;
}

#[cfg(target_os = "linux")]
const EINPROGRESS: i32 = 115;
#[cfg(target_os = "macos")]
const EINPROGRESS: i32 = 36;

/// Creates a non-blocking `TcpStream` and initiates the connection without waiting for it
/// to complete.
pub trait Connect {
    fn connect_nonblocking<A: ToSocketAddrs>(addr: A) -> io::Result<TcpStream> {
        Self::connect_nonblocking_with_socket_config(addr, |_| Ok(()))
    }

    fn connect_nonblocking_with_socket_config<A, F>(addr: A, socket_config: F) -> io::Result<TcpStream>
    where
        A: ToSocketAddrs,
        F: FnOnce(&Socket) -> io::Result<()>;
}

impl Connect for TcpStream {
    fn connect_nonblocking_with_socket_config<A, F>(addr: A, socket_config: F) -> io::Result<TcpStream>
    where
        A: ToSocketAddrs,
        F: FnOnce(&Socket) -> io::Result<()>,
    {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        socket.set_keepalive(true)?;

        socket_config(&socket)?;

        // connect to the remote endpoint; we can ignore EINPROGRESS due to the non-blocking socket
        match socket.connect(
            &addr
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| io::Error::other("unable to resolve socket address"))?
                .into(),
        ) {
            Ok(()) => Ok(socket.into()),
            Err(err) if err.raw_os_error() == Some(EINPROGRESS) => Ok(socket.into()),
            Err(err) => Err(err),
        }
    }
}

impl Selectable for TcpStream {
    fn connected(&mut self) -> io::Result<bool> {
        // a non-blocking connect is considered established once the peer address resolves
        match self.peer_addr() {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn make_writable(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn make_readable(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// TCP stream connection info: the remote host/port pair a session was built from, kept
/// around for logging, the `Host` header and TLS server name validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    host: String,
    port: u16,
}

impl ToSocketAddrs for ConnectionInfo {
    type Iter = vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> io::Result<Self::Iter> {
        format!("{}:{}", self.host, self.port).to_socket_addrs()
    }
}

impl Display for ConnectionInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl ConnectionInfo {
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        Self {
            host: host.as_ref().to_string(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn into_tcp_stream(self) -> io::Result<tcp::TcpStream> {
        let stream = TcpStream::connect_nonblocking(&self)?;
        Ok(tcp::TcpStream::new(stream, self))
    }
}

pub trait ConnectionInfoProvider {
    fn connection_info(&self) -> &ConnectionInfo;
}
