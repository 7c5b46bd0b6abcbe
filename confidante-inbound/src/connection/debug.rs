use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use uuid::Uuid;

use confidante_core::utils::recorder::StreamRecorder;
use confidante_core::xmpp::stream::Connection;

/// Wraps a connection in `StreamRecorder` so every byte in and out of this
/// stream is mirrored to `log/<id>.{in,out}.xml`, for reproducing client
/// interop issues offline. Enabled per-connection by the caller, not a
/// permanent production path.
pub struct DebugConnection<C> {
    recorder: StreamRecorder<C>,
    id: Uuid,
}

impl<C> DebugConnection<C>
where
    C: Connection,
{
    pub async fn new(inner: C) -> std::io::Result<Self> {
        let id = Uuid::new_v4();
        let recorder = StreamRecorder::try_new(inner, id).await?;
        Ok(Self { recorder, id })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl<C> AsyncRead for DebugConnection<C>
where
    C: Connection,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().recorder).poll_read(cx, buf)
    }
}

impl<C> AsyncWrite for DebugConnection<C>
where
    C: Connection,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().recorder).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().recorder).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().recorder).poll_shutdown(cx)
    }
}

impl<C> Connection for DebugConnection<C>
where
    C: Connection + Send + 'static,
{
    type Upgrade = Pin<Box<dyn Future<Output = Result<Self, Error>> + Send>>;

    fn upgrade(self) -> Result<Self::Upgrade, Error> {
        let id = self.id;
        let inner = self.recorder.into_inner();
        let upgrade = inner.upgrade()?;

        Ok(Box::pin(async move {
            let upgraded = upgrade.await?;
            let recorder = StreamRecorder::try_new(upgraded, id).await?;
            Ok(DebugConnection { recorder, id })
        }))
    }

    fn is_starttls_allowed(&self) -> bool {
        self.recorder.get_ref().is_starttls_allowed()
    }

    fn is_secure(&self) -> bool {
        self.recorder.get_ref().is_secure()
    }

    fn is_authenticated(&self) -> bool {
        self.recorder.get_ref().is_authenticated()
    }
}
