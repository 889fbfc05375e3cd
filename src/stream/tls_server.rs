//! Server-role TLS stream used for client-facing (inbound) connections.
//!
//! Mirrors [`crate::stream::tls`] but wraps `rustls::ServerConnection` instead of
//! `ClientConnection`: the gateway's certificate chain and private key are loaded once and
//! shared by reference across every accepted connection (C2's server leg).

use crate::stream::{ConnectionInfo, ConnectionInfoProvider, Selectable};
use crate::util::NoBlock;
use mio::event::Source;
use mio::{Interest, Registry, Token};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection};
use std::io;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

/// Shared, immutable server-role TLS context: the gateway's identity (certificate chain +
/// private key). Cloning is cheap; every inbound session wraps its accepted socket with the
/// same `Arc<ServerConfig>`.
#[derive(Clone)]
pub struct TlsServerContext {
    config: Arc<ServerConfig>,
}

impl TlsServerContext {
    /// Loads a PEM certificate chain and PEM private key from disk and builds a context that
    /// accepts clients presenting no certificate, per this gateway's server-role contract.
    pub fn from_pem_files(cert_chain_path: impl AsRef<Path>, private_key_path: impl AsRef<Path>) -> io::Result<Self> {
        let cert_chain = load_cert_chain(cert_chain_path.as_ref())?;
        let private_key = load_private_key(private_key_path.as_ref())?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(io::Error::other)?;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn wrap<S: Read + Write>(&self, stream: S) -> io::Result<TlsStream<S>> {
        let tls = ServerConnection::new(self.config.clone()).map_err(io::Error::other)?;
        Ok(TlsStream { inner: stream, tls })
    }
}

fn load_cert_chain(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()
}

fn load_private_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| io::Error::other("no private key found in file"))
}

pub struct TlsStream<S> {
    inner: S,
    tls: ServerConnection,
}

impl<S: Source> Source for TlsStream<S> {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        registry.register(&mut self.inner, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        registry.reregister(&mut self.inner, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.inner)
    }
}

impl<S: Selectable> Selectable for TlsStream<S> {
    fn connected(&mut self) -> io::Result<bool> {
        self.inner.connected()
    }

    fn make_writable(&mut self) -> io::Result<()> {
        self.inner.make_writable()
    }

    fn make_readable(&mut self) -> io::Result<()> {
        self.inner.make_readable()
    }
}

impl<S: Read + Write> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.complete_io()?;
        self.tls.reader().read(buf)
    }
}

impl<S: Read + Write> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tls.writer().write(buf)
    }

    /// Drains any TLS records buffered by a prior `write()` onto the underlying socket.
    /// Unlike `read()`'s `complete_io`, this never attempts `read_tls`: nothing here should
    /// consume bytes the caller hasn't asked for. Backpressure on the socket is not an error;
    /// the remaining records stay buffered in `self.tls` until the next `flush()` or `read()`.
    fn flush(&mut self) -> io::Result<()> {
        self.tls.writer().flush()?;
        self.write_tls()?;
        Ok(())
    }
}

impl<S: Read + Write> TlsStream<S> {
    fn write_tls(&mut self) -> io::Result<usize> {
        if !self.tls.wants_write() {
            return Ok(0);
        }
        match self.tls.write_tls(&mut self.inner) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn complete_io(&mut self) -> io::Result<(usize, usize)> {
        let wrote = self.write_tls()?;

        let read = if self.tls.wants_read() {
            let read = self.tls.read_tls(&mut self.inner).no_block()?;
            if read > 0 {
                self.tls.process_new_packets().map_err(io::Error::other)?;
            }
            read
        } else {
            0
        };

        Ok((read, wrote))
    }
}

impl<S: ConnectionInfoProvider> ConnectionInfoProvider for TlsStream<S> {
    fn connection_info(&self) -> &ConnectionInfo {
        self.inner.connection_info()
    }
}

pub trait IntoTlsServerStream {
    fn into_tls_server_stream(self, context: &TlsServerContext) -> io::Result<TlsStream<Self>>
    where
        Self: Sized;
}

impl<T> IntoTlsServerStream for T
where
    T: Read + Write,
{
    fn into_tls_server_stream(self, context: &TlsServerContext) -> io::Result<TlsStream<Self>>
    where
        Self: Sized,
    {
        context.wrap(self)
    }
}
