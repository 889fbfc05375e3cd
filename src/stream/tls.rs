//! Client-role TLS stream used for upstream (outbound) connections.

use crate::stream::{ConnectionInfo, ConnectionInfoProvider, Selectable};
use crate::util::NoBlock;
use mio::event::Source;
use mio::{Interest, Registry, Token};
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use std::io;
use std::io::{Read, Write};
use std::sync::Arc;

/// Shared, immutable client-role TLS context (C2's client leg). Cloning is cheap: the
/// inner `Arc<ClientConfig>` is shared across every outbound session.
#[derive(Clone)]
pub struct TlsClientContext {
    config: Arc<ClientConfig>,
}

impl TlsClientContext {
    /// Builds a client context trusting the platform/webpki root store selected by feature
    /// flag, mirroring how this crate's TLS backend selection already works.
    pub fn with_platform_roots() -> io::Result<Self> {
        let mut root_store = RootCertStore::empty();

        #[cfg(feature = "rustls-webpki")]
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        #[cfg(feature = "rustls-native")]
        for cert in rustls_native_certs::load_native_certs().map_err(io::Error::other)? {
            root_store.add(cert).map_err(io::Error::other)?;
        }

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn wrap<S: Read + Write>(&self, stream: S, server_name: &str) -> io::Result<TlsStream<S>> {
        let server_name = server_name.to_owned().try_into().map_err(io::Error::other)?;
        let tls = ClientConnection::new(self.config.clone(), server_name).map_err(io::Error::other)?;
        Ok(TlsStream { inner: stream, tls })
    }
}

pub struct TlsStream<S> {
    inner: S,
    tls: ClientConnection,
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

pub trait IntoTlsStream {
    fn into_tls_stream(self, context: &TlsClientContext) -> io::Result<TlsStream<Self>>
    where
        Self: Sized;
}

impl<T> IntoTlsStream for T
where
    T: Read + Write + ConnectionInfoProvider,
{
    fn into_tls_stream(self, context: &TlsClientContext) -> io::Result<TlsStream<Self>>
    where
        Self: Sized,
    {
        let server_name = self.connection_info().host().to_owned();
        context.wrap(self, &server_name)
    }
}
