use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{bail, Error};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use confidante_core::xmpp::stream::Connection;

/// A client-facing TCP socket, plain until `STARTTLS` upgrades it in
/// place. `is_authenticated` is always `false` here: this server accepts
/// unauthenticated client certificates (`spec.md`'s SASL EXTERNAL/
/// channel-binding variants are a non-goal), so the transport itself never
/// establishes identity.
pub enum TcpConnection {
    Plain {
        stream: TcpStream,
        server_config: Arc<ServerConfig>,
    },
    Tls(TlsStream<TcpStream>),
}

impl TcpConnection {
    pub fn new(stream: TcpStream, server_config: Arc<ServerConfig>) -> Self {
        TcpConnection::Plain {
            stream,
            server_config,
        }
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TcpConnection::Plain { stream, .. } => Pin::new(stream).poll_read(cx, buf),
            TcpConnection::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TcpConnection::Plain { stream, .. } => Pin::new(stream).poll_write(cx, buf),
            TcpConnection::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TcpConnection::Plain { stream, .. } => Pin::new(stream).poll_flush(cx),
            TcpConnection::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TcpConnection::Plain { stream, .. } => Pin::new(stream).poll_shutdown(cx),
            TcpConnection::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl Connection for TcpConnection {
    type Upgrade = Pin<Box<dyn Future<Output = Result<Self, Error>> + Send>>;

    fn upgrade(self) -> Result<Self::Upgrade, Error> {
        match self {
            TcpConnection::Plain {
                stream,
                server_config,
            } => {
                let acceptor = TlsAcceptor::from(server_config);
                Ok(Box::pin(async move {
                    let tls_stream = acceptor.accept(stream).await?;
                    Ok(TcpConnection::Tls(tls_stream))
                }))
            }
            TcpConnection::Tls(_) => bail!("connection is already using TLS"),
        }
    }

    fn is_starttls_allowed(&self) -> bool {
        matches!(self, TcpConnection::Plain { .. })
    }

    fn is_secure(&self) -> bool {
        matches!(self, TcpConnection::Tls(_))
    }

    fn is_authenticated(&self) -> bool {
        false
    }
}
