//! Byte-stream connections and how they are opened.
//!
//! The node only needs an ordered, reliable byte stream to a peer plus the
//! peer's address. [`Dialer`] is the seam that lets the supervisor run over
//! TCP in production and over in-memory pipes in tests.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// A bidirectional byte stream to one peer.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {
    fn remote_endpoint(&self) -> io::Result<SocketAddr>;
}

impl Connection for TcpStream {
    fn remote_endpoint(&self) -> io::Result<SocketAddr> {
        self.peer_addr()
    }
}

/// Opens outbound connections.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: Connection + 'static;

    async fn dial(&self, addr: SocketAddr) -> io::Result<Self::Conn>;
}

/// Plain TCP with a connect deadline.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Conn = TcpStream;

    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// One end of an in-memory pipe, labelled with the address the other end
/// pretends to have.
#[derive(Debug)]
pub struct MemoryConnection {
    io: DuplexStream,
    remote: SocketAddr,
}

impl MemoryConnection {
    /// Connected pair: `a` sees `b_addr` as its remote and vice versa.
    pub fn pair(a_addr: SocketAddr, b_addr: SocketAddr, buffer: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(buffer);
        (
            Self { io: a, remote: b_addr },
            Self { io: b, remote: a_addr },
        )
    }
}

impl Connection for MemoryConnection {
    fn remote_endpoint(&self) -> io::Result<SocketAddr> {
        Ok(self.remote)
    }
}

impl AsyncRead for MemoryConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_dialer_connects_and_reports_remote() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let dialer = TcpDialer::new(Duration::from_secs(5));
        let conn = dialer.dial(addr).await.unwrap();
        assert_eq!(conn.remote_endpoint().unwrap(), addr);

        accept.await.unwrap();
    }

    #[tokio::test]
    async fn memory_pair_carries_bytes_both_ways() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let a_addr: SocketAddr = "10.0.0.1:8444".parse().unwrap();
        let b_addr: SocketAddr = "10.0.0.2:8444".parse().unwrap();
        let (mut a, mut b) = MemoryConnection::pair(a_addr, b_addr, 64);

        assert_eq!(a.remote_endpoint().unwrap(), b_addr);
        assert_eq!(b.remote_endpoint().unwrap(), a_addr);

        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn tcp_dialer_reports_refused_connection() {
        // bind then drop to get a port nothing listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let dialer = TcpDialer::new(Duration::from_secs(5));
        assert!(dialer.dial(addr).await.is_err());
    }
}
