//! External collaborators (§6): clock, datagram IO, and filesystem access,
//! modeled as narrow async traits so the session/demux/registry core never
//! names `tokio::fs`/`tokio::net` directly. Grounded in the `IOAdapter`
//! trait of the reference `jeffvandyke-tftp-server` TFTP implementation,
//! which decouples protocol logic from `std::fs` the same way.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Monotonic time source, consumed by the retransmit/timeout engine (C7).
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock `Instant::now`, the production clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// One bound UDP endpoint (C3). Always unconnected: callers supply the
/// peer address on every send and learn the source address on every recv,
/// so TID enforcement (§4.5.3) can be done in application code rather than
/// relying on the kernel filtering a `connect()`ed socket.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> std::io::Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

/// Factory for bound datagram sockets.
#[async_trait]
pub trait DatagramIo: Send + Sync {
    async fn bind(&self, local_addr: SocketAddr) -> std::io::Result<Box<dyn DatagramSocket>>;
}

/// `tokio::net::UdpSocket`-backed implementation.
pub struct TokioUdpSocket(tokio::net::UdpSocket);

#[async_trait]
impl DatagramSocket for TokioUdpSocket {
    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> std::io::Result<usize> {
        self.0.send_to(buf, peer).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.0.recv_from(buf).await
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.0.local_addr()
    }
}

/// Binds real OS UDP sockets, picking an ephemeral port bound to the same
/// local address family as the request that spawned the session.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioDatagramIo;

#[async_trait]
impl DatagramIo for TokioDatagramIo {
    async fn bind(&self, local_addr: SocketAddr) -> std::io::Result<Box<dyn DatagramSocket>> {
        let sock = tokio::net::UdpSocket::bind(local_addr).await?;
        Ok(Box::new(TokioUdpSocket(sock)))
    }
}

/// Pick the "any" bind address matching `peer`'s address family, on an
/// OS-assigned ephemeral port.
pub fn ephemeral_bind_addr(peer: SocketAddr) -> SocketAddr {
    if peer.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Filesystem primitives the session state machine needs (§6): existence
/// and readability checks, opening a source/staging file, and the
/// rename/unlink pair that implements atomic WRQ completion.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;
    async fn readable(&self, path: &Path) -> bool;
    async fn open_read(&self, path: &Path) -> std::io::Result<BoxedReader>;
    async fn open_write(&self, path: &Path) -> std::io::Result<BoxedWriter>;
    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()>;
    async fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()>;
    async fn unlink(&self, path: &Path) -> std::io::Result<()>;
}

/// `tokio::fs`-backed implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioFileSystem;

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }

    async fn readable(&self, path: &Path) -> bool {
        tokio::fs::File::open(path).await.is_ok()
    }

    async fn open_read(&self, path: &Path) -> std::io::Result<BoxedReader> {
        let f = tokio::fs::File::open(path).await?;
        Ok(Box::new(f))
    }

    async fn open_write(&self, path: &Path) -> std::io::Result<BoxedWriter> {
        let f = tokio::fs::File::create(path).await?;
        Ok(Box::new(f))
    }

    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn unlink(&self, path: &Path) -> std::io::Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::FakeClock;
    use super::*;

    #[test]
    fn fake_clock_advances_monotonically() {
        let clock = FakeClock::new();
        let t0 = clock.now();
        clock.advance(4000);
        let t1 = clock.now();
        assert!(t1 - t0 >= std::time::Duration::from_secs(4));
    }

    #[test]
    fn ephemeral_bind_addr_matches_family() {
        let v4: SocketAddr = "1.2.3.4:69".parse().unwrap();
        let v6: SocketAddr = "[::1]:69".parse().unwrap();
        assert!(!ephemeral_bind_addr(v4).is_ipv6());
        assert!(ephemeral_bind_addr(v6).is_ipv6());
    }
}
