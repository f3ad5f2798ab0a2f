//! Session state machine (C5) and retransmit/timeout engine (C7).
//!
//! A session is the "stop-and-wait as an explicit state" quartet from
//! Design Notes §9: `outstanding` is a tagged variant (`Data` or `Ack`)
//! holding the fully-serialized last-sent packet, so timeouts and re-sends
//! share the single `resend()` code path instead of parallel fields.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

use crate::codec::{BLOCK_SIZE, Mode, Packet};
use crate::errors::{ErrorCode, send_error};
use crate::io::{BoxedReader, BoxedWriter, DatagramIo, DatagramSocket, FileSystem, ephemeral_bind_addr};
use crate::registry::{FileRegistry, ReadGuard, WriteGuard, acquire_read, acquire_write};

/// Why a session stopped running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    ProtocolError(ErrorCode),
    PeerAborted,
    RetriesExhausted,
}

/// Result of feeding a datagram to a live session.
pub enum PacketAction {
    Continue,
    Terminate(Outcome),
}

/// Result of a timeout-engine tick.
pub enum TickAction {
    Idle,
    Terminate(Outcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutstandingKind {
    Data,
    Ack,
}

/// The last-sent outbound packet, fully serialized and retained for
/// retransmission (§3 Data Model).
struct Outstanding {
    kind: OutstandingKind,
    block: u16,
    bytes: Vec<u8>,
}

impl Outstanding {
    fn data(block: u16, payload: Vec<u8>) -> Self {
        let bytes = Packet::DATA {
            block_num: block,
            data: payload,
        }
        .encode();
        Self {
            kind: OutstandingKind::Data,
            block,
            bytes,
        }
    }

    fn ack(block: u16) -> Self {
        let bytes = Packet::ACK { block_num: block }.encode();
        Self {
            kind: OutstandingKind::Ack,
            block,
            bytes,
        }
    }

    /// Length of the DATA payload last sent. Only meaningful for `Data`.
    fn payload_len(&self) -> usize {
        self.bytes.len().saturating_sub(4)
    }
}

enum RegGuard {
    Read(ReadGuard),
    Write(WriteGuard),
}

enum Role {
    Read {
        reader: BoxedReader,
    },
    Write {
        writer: BoxedWriter,
        tmp_path: PathBuf,
        final_path: PathBuf,
    },
}

/// One RRQ/WRQ transfer bound to one remote TID.
pub struct Session {
    pub id: u64,
    socket: Arc<dyn DatagramSocket>,
    peer: SocketAddr,
    pub filename: String,
    pub mode: Mode,
    block: u16,
    outstanding: Outstanding,
    last_sent: Instant,
    retries: u32,
    reg_guard: RegGuard,
    role: Role,
    pub span: tracing::Span,
}

impl Session {
    pub fn is_read(&self) -> bool {
        matches!(self.role, Role::Read { .. })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn socket(&self) -> Arc<dyn DatagramSocket> {
        Arc::clone(&self.socket)
    }

    /// Handle a datagram already known to originate from `from`. If `from`
    /// doesn't match the session's bound TID, an ERR(UnknownTransferID) is
    /// sent to the stray source and the session is left completely
    /// untouched (§4.5.3): no state mutation, no timer reset.
    pub async fn on_datagram(&mut self, from: SocketAddr, buf: &[u8], now: Instant) -> PacketAction {
        if from != self.peer {
            tracing::warn!(parent: &self.span, %from, expected = %self.peer, "datagram from unknown TID");
            let _ = send_error(self.socket.as_ref(), from, ErrorCode::UnknownTransferId, None).await;
            return PacketAction::Continue;
        }

        let pkt = match Packet::decode(buf) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(parent: &self.span, error = %e, "malformed packet");
                let _ = send_error(self.socket.as_ref(), self.peer, ErrorCode::IllegalOperation, None).await;
                return PacketAction::Terminate(Outcome::ProtocolError(ErrorCode::IllegalOperation));
            }
        };

        match pkt {
            Packet::ERROR { code, msg } => {
                tracing::info!(parent: &self.span, code, %msg, "peer sent ERROR, aborting");
                PacketAction::Terminate(Outcome::PeerAborted)
            }
            Packet::ACK { block_num } if self.is_read() => self.handle_ack(block_num, now).await,
            Packet::DATA { block_num, data } if !self.is_read() => {
                self.handle_data(block_num, data, now).await
            }
            other => {
                tracing::warn!(parent: &self.span, ?other, "unexpected opcode for this transfer direction");
                let _ = send_error(self.socket.as_ref(), self.peer, ErrorCode::IllegalOperation, None).await;
                PacketAction::Terminate(Outcome::ProtocolError(ErrorCode::IllegalOperation))
            }
        }
    }

    async fn handle_ack(&mut self, block_num: u16, now: Instant) -> PacketAction {
        if block_num != self.block {
            tracing::debug!(parent: &self.span, block_num, expected = self.block, "stale ACK ignored");
            return PacketAction::Continue;
        }

        if self.outstanding.payload_len() < BLOCK_SIZE {
            tracing::info!(parent: &self.span, "RRQ transfer complete");
            return PacketAction::Terminate(Outcome::Completed);
        }

        let next_block = self.block.wrapping_add(1);
        let Role::Read { reader } = &mut self.role else {
            unreachable!("handle_ack only runs on a read session")
        };

        let payload = match read_block(reader.as_mut(), BLOCK_SIZE).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(parent: &self.span, error = %e, "read failed mid-transfer");
                let _ = send_error(
                    self.socket.as_ref(),
                    self.peer,
                    ErrorCode::NotDefined,
                    Some(&e.to_string()),
                )
                .await;
                return PacketAction::Terminate(Outcome::ProtocolError(ErrorCode::NotDefined));
            }
        };

        self.block = next_block;
        self.outstanding = Outstanding::data(self.block, payload);
        if let Err(e) = self.socket.send_to(&self.outstanding.bytes, self.peer).await {
            tracing::warn!(parent: &self.span, error = %e, "failed to send DATA");
        }
        self.last_sent = now;
        self.retries = 0;
        PacketAction::Continue
    }

    async fn handle_data(&mut self, block_num: u16, data: Vec<u8>, now: Instant) -> PacketAction {
        let expected = self.block.wrapping_add(1);

        if block_num == expected {
            let is_final = data.len() < BLOCK_SIZE;
            let Role::Write { writer, .. } = &mut self.role else {
                unreachable!("handle_data only runs on a write session")
            };
            if let Err(e) = writer.write_all(&data).await {
                tracing::warn!(parent: &self.span, error = %e, "write failed, disk full?");
                let _ = send_error(
                    self.socket.as_ref(),
                    self.peer,
                    ErrorCode::DiskFullOrAllocExceeded,
                    Some(&e.to_string()),
                )
                .await;
                return PacketAction::Terminate(Outcome::ProtocolError(
                    ErrorCode::DiskFullOrAllocExceeded,
                ));
            }

            self.block = block_num;
            self.outstanding = Outstanding::ack(self.block);
            if let Err(e) = self.socket.send_to(&self.outstanding.bytes, self.peer).await {
                tracing::warn!(parent: &self.span, error = %e, "failed to send ACK");
            }
            self.last_sent = now;
            self.retries = 0;

            if is_final {
                tracing::info!(parent: &self.span, "WRQ transfer complete");
                PacketAction::Terminate(Outcome::Completed)
            } else {
                PacketAction::Continue
            }
        } else if self.block != 0 && block_num == self.block {
            // Duplicate of the block we just ACKed: the client's ACK was
            // lost. Re-send the ACK without advancing (P5).
            tracing::debug!(parent: &self.span, block_num, "duplicate DATA, re-ACKing");
            self.outstanding = Outstanding::ack(self.block);
            let _ = self.socket.send_to(&self.outstanding.bytes, self.peer).await;
            self.last_sent = now;
            self.retries = 0;
            PacketAction::Continue
        } else {
            tracing::warn!(parent: &self.span, block_num, expected, "out-of-sequence DATA block");
            let _ = send_error(
                self.socket.as_ref(),
                self.peer,
                ErrorCode::NotDefined,
                Some("unexpected block number"),
            )
            .await;
            PacketAction::Terminate(Outcome::ProtocolError(ErrorCode::NotDefined))
        }
    }

    /// Retransmit/timeout engine (C7): re-send the outstanding packet past
    /// `retry_timeout`, bounded by `max_retries`.
    pub async fn on_tick(&mut self, now: Instant, retry_timeout: Duration, max_retries: u32) -> TickAction {
        if now.saturating_duration_since(self.last_sent) < retry_timeout {
            return TickAction::Idle;
        }
        if self.retries >= max_retries {
            tracing::warn!(parent: &self.span, retries = self.retries, "retries exhausted, aborting session");
            return TickAction::Terminate(Outcome::RetriesExhausted);
        }
        self.retries += 1;
        tracing::debug!(parent: &self.span, retry = self.retries, kind = ?self.outstanding.kind, block = self.outstanding.block, "retransmitting");
        if let Err(e) = self.socket.send_to(&self.outstanding.bytes, self.peer).await {
            tracing::warn!(parent: &self.span, error = %e, "retransmit send failed");
        }
        self.last_sent = now;
        TickAction::Idle
    }

    /// Perform the outcome-dependent filesystem wrap-up (WRQ rename on
    /// success, temp unlink on failure) and drop the session, releasing
    /// its file-registry reservation.
    pub async fn finalize(self, outcome: &Outcome, fs: &dyn FileSystem) {
        if let Role::Write {
            tmp_path,
            final_path,
            ..
        } = &self.role
        {
            if matches!(outcome, Outcome::Completed) {
                let _ = fs.unlink(final_path).await;
                if let Err(e) = fs.rename(tmp_path, final_path).await {
                    tracing::warn!(parent: &self.span, error = %e, "rename of staged upload failed");
                }
            } else {
                let _ = fs.unlink(tmp_path).await;
            }
        }
        // `self` (and its `reg_guard`) is dropped here, releasing the
        // file-registry reservation unconditionally.
    }
}

async fn read_block(reader: &mut (dyn tokio::io::AsyncRead + Unpin + Send), blksize: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; blksize];
    let mut filled = 0;
    while filled < blksize {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

fn tmp_path_for(path: &std::path::Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Handle the initial RRQ (§4.5.1): bind an ephemeral endpoint, validate,
/// acquire a read reservation, open the file, and send the first DATA
/// block. Any failure along the way sends the appropriate ERR from the
/// newly bound endpoint and returns `None` — the caller never inserts a
/// session into the demux map for a request that failed here.
#[allow(clippy::too_many_arguments)]
pub async fn start_rrq(
    id: u64,
    peer: SocketAddr,
    filename: String,
    path: PathBuf,
    mode: Mode,
    registry: &Rc<RefCell<FileRegistry>>,
    io: &dyn DatagramIo,
    fs: &dyn FileSystem,
    now: Instant,
) -> Option<Session> {
    let span = tracing::info_span!("session", id, %peer, filename = %filename, mode = ?mode, direction = "read");
    let _enter = span.enter();

    let socket: Arc<dyn DatagramSocket> = match io.bind(ephemeral_bind_addr(peer)).await {
        Ok(s) => Arc::from(s),
        Err(e) => {
            tracing::warn!(error = %e, "failed to bind transfer endpoint");
            return None;
        }
    };

    if filename.trim().is_empty() {
        let _ = send_error(socket.as_ref(), peer, ErrorCode::IllegalOperation, Some("empty filename")).await;
        return None;
    }

    if !fs.exists(&path).await {
        let _ = send_error(socket.as_ref(), peer, ErrorCode::FileNotFound, None).await;
        return None;
    }
    if !fs.readable(&path).await {
        let _ = send_error(socket.as_ref(), peer, ErrorCode::AccessViolation, None).await;
        return None;
    }

    let guard = match acquire_read(registry, &filename) {
        Some(g) => g,
        None => {
            let _ = send_error(
                socket.as_ref(),
                peer,
                ErrorCode::NotDefined,
                Some("The file is currently in use"),
            )
            .await;
            return None;
        }
    };

    let mut reader = match fs.open_read(&path).await {
        Ok(r) => r,
        Err(e) => {
            let _ = send_error(socket.as_ref(), peer, ErrorCode::NotDefined, Some(&e.to_string())).await;
            return None;
        }
    };

    let payload = match read_block(reader.as_mut(), BLOCK_SIZE).await {
        Ok(p) => p,
        Err(e) => {
            let _ = send_error(socket.as_ref(), peer, ErrorCode::NotDefined, Some(&e.to_string())).await;
            return None;
        }
    };
    let block = 1u16;
    let outstanding = Outstanding::data(block, payload);

    if let Err(e) = socket.send_to(&outstanding.bytes, peer).await {
        tracing::warn!(error = %e, "failed to send initial DATA");
        return None;
    }

    drop(_enter);
    Some(Session {
        id,
        socket,
        peer,
        filename,
        mode,
        block,
        outstanding,
        last_sent: now,
        retries: 0,
        reg_guard: RegGuard::Read(guard),
        role: Role::Read { reader },
        span,
    })
}

/// Handle the initial WRQ (§4.5.2): bind, validate, acquire a write
/// reservation, open the `.tmp` staging file, and send ACK(0).
#[allow(clippy::too_many_arguments)]
pub async fn start_wrq(
    id: u64,
    peer: SocketAddr,
    filename: String,
    path: PathBuf,
    mode: Mode,
    registry: &Rc<RefCell<FileRegistry>>,
    io: &dyn DatagramIo,
    fs: &dyn FileSystem,
    now: Instant,
) -> Option<Session> {
    let span = tracing::info_span!("session", id, %peer, filename = %filename, mode = ?mode, direction = "write");
    let _enter = span.enter();

    let socket: Arc<dyn DatagramSocket> = match io.bind(ephemeral_bind_addr(peer)).await {
        Ok(s) => Arc::from(s),
        Err(e) => {
            tracing::warn!(error = %e, "failed to bind transfer endpoint");
            return None;
        }
    };

    if filename.trim().is_empty() {
        let _ = send_error(socket.as_ref(), peer, ErrorCode::IllegalOperation, Some("empty filename")).await;
        return None;
    }

    let guard = match acquire_write(registry, &filename) {
        Some(g) => g,
        None => {
            let _ = send_error(
                socket.as_ref(),
                peer,
                ErrorCode::NotDefined,
                Some("The file is currently in use"),
            )
            .await;
            return None;
        }
    };

    if let Some(parent) = path.parent()
        && let Err(e) = fs.create_dir_all(parent).await
    {
        tracing::warn!(error = %e, "failed to create parent directory");
        let _ = send_error(socket.as_ref(), peer, ErrorCode::AccessViolation, Some(&e.to_string())).await;
        return None;
    }

    let tmp_path = tmp_path_for(&path);
    let writer = match fs.open_write(&tmp_path).await {
        Ok(w) => w,
        Err(e) => {
            let _ = send_error(socket.as_ref(), peer, ErrorCode::NotDefined, Some(&e.to_string())).await;
            return None;
        }
    };

    let block = 0u16;
    let outstanding = Outstanding::ack(block);
    if let Err(e) = socket.send_to(&outstanding.bytes, peer).await {
        tracing::warn!(error = %e, "failed to send ACK(0)");
        let _ = fs.unlink(&tmp_path).await;
        return None;
    }

    drop(_enter);
    Some(Session {
        id,
        socket,
        peer,
        filename,
        mode,
        block,
        outstanding,
        last_sent: now,
        retries: 0,
        reg_guard: RegGuard::Write(guard),
        role: Role::Write {
            writer,
            tmp_path,
            final_path: path,
        },
    span,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::fakes::FakeClock;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// An in-memory datagram socket pair used to unit-test the session
    /// state machine without real sockets.
    struct LoopbackSocket {
        local: SocketAddr,
        inbox: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    #[async_trait::async_trait]
    impl DatagramSocket for LoopbackSocket {
        async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> std::io::Result<usize> {
            self.sent.lock().unwrap().push((buf.to_vec(), peer));
            Ok(buf.len())
        }

        async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
            match self.inbox.lock().unwrap().pop_front() {
                Some((bytes, from)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok((n, from))
                }
                None => std::future::pending().await,
            }
        }

        fn local_addr(&self) -> std::io::Result<SocketAddr> {
            Ok(self.local)
        }
    }

    struct FixedIo {
        bind_addr: SocketAddr,
    }

    #[async_trait::async_trait]
    impl DatagramIo for FixedIo {
        async fn bind(&self, _local_addr: SocketAddr) -> std::io::Result<Box<dyn DatagramSocket>> {
            Ok(Box::new(LoopbackSocket {
                local: self.bind_addr,
                inbox: Mutex::new(VecDeque::new()),
                sent: Mutex::new(Vec::new()),
            }))
        }
    }

    fn peer_addr() -> SocketAddr {
        "127.0.0.1:6000".parse().unwrap()
    }

    #[tokio::test]
    async fn rrq_retransmit_never_advances_block() {
        let registry = FileRegistry::new();
        let io = FixedIo {
            bind_addr: "127.0.0.1:7000".parse().unwrap(),
        };
        let fs = crate::io::TokioFileSystem;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"HELLO").await.unwrap();

        let clock = FakeClock::new();
        let mut session = start_rrq(
            1,
            peer_addr(),
            "hello.txt".to_string(),
            path,
            Mode::Octet,
            &registry,
            &io,
            &fs,
            clock.now(),
        )
        .await
        .expect("session should start");

        assert_eq!(session.block, 1);
        clock.advance(4100);
        let action = session.on_tick(clock.now(), Duration::from_secs(4), 3).await;
        assert!(matches!(action, TickAction::Idle));
        // Retransmission must not change the expected block number.
        assert_eq!(session.block, 1);
    }

    #[tokio::test]
    async fn rrq_exhausts_retries_and_terminates() {
        let registry = FileRegistry::new();
        let io = FixedIo {
            bind_addr: "127.0.0.1:7001".parse().unwrap(),
        };
        let fs = crate::io::TokioFileSystem;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"HELLO").await.unwrap();

        let clock = FakeClock::new();
        let mut session = start_rrq(
            1,
            peer_addr(),
            "hello.txt".to_string(),
            path,
            Mode::Octet,
            &registry,
            &io,
            &fs,
            clock.now(),
        )
        .await
        .unwrap();

        for _ in 0..3 {
            clock.advance(4100);
            let action = session.on_tick(clock.now(), Duration::from_secs(4), 3).await;
            assert!(matches!(action, TickAction::Idle));
        }
        clock.advance(4100);
        let action = session.on_tick(clock.now(), Duration::from_secs(4), 3).await;
        assert!(matches!(action, TickAction::Terminate(Outcome::RetriesExhausted)));
    }

    #[tokio::test]
    async fn rrq_stale_ack_is_ignored_without_resetting_timer() {
        let registry = FileRegistry::new();
        let io = FixedIo {
            bind_addr: "127.0.0.1:7002".parse().unwrap(),
        };
        let fs = crate::io::TokioFileSystem;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"HELLO").await.unwrap();

        let clock = FakeClock::new();
        let mut session = start_rrq(
            1,
            peer_addr(),
            "hello.txt".to_string(),
            path,
            Mode::Octet,
            &registry,
            &io,
            &fs,
            clock.now(),
        )
        .await
        .unwrap();

        let action = session.on_datagram(peer_addr(), &Packet::ACK { block_num: 0 }.encode(), clock.now()).await;
        assert!(matches!(action, PacketAction::Continue));
        assert_eq!(session.block, 1);
    }

    #[tokio::test]
    async fn rrq_small_file_completes_on_first_ack() {
        let registry = FileRegistry::new();
        let io = FixedIo {
            bind_addr: "127.0.0.1:7003".parse().unwrap(),
        };
        let fs = crate::io::TokioFileSystem;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"HELLO").await.unwrap();

        let clock = FakeClock::new();
        let mut session = start_rrq(
            1,
            peer_addr(),
            "hello.txt".to_string(),
            path,
            Mode::Octet,
            &registry,
            &io,
            &fs,
            clock.now(),
        )
        .await
        .unwrap();

        let action = session.on_datagram(peer_addr(), &Packet::ACK { block_num: 1 }.encode(), clock.now()).await;
        assert!(matches!(action, PacketAction::Terminate(Outcome::Completed)));
    }

    #[tokio::test]
    async fn wrq_duplicate_data_re_acks_without_advancing() {
        let registry = FileRegistry::new();
        let io = FixedIo {
            bind_addr: "127.0.0.1:7004".parse().unwrap(),
        };
        let fs = crate::io::TokioFileSystem;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let clock = FakeClock::new();
        let mut session = start_wrq(
            1,
            peer_addr(),
            "out.bin".to_string(),
            path,
            Mode::Octet,
            &registry,
            &io,
            &fs,
            clock.now(),
        )
        .await
        .unwrap();

        let block1 = vec![b'A'; BLOCK_SIZE];
        let action = session
            .on_datagram(
                peer_addr(),
                &Packet::DATA { block_num: 1, data: block1.clone() }.encode(),
                clock.now(),
            )
            .await;
        assert!(matches!(action, PacketAction::Continue));
        assert_eq!(session.block, 1);

        // Client didn't see our ACK(1) and resends block 1.
        let action = session
            .on_datagram(
                peer_addr(),
                &Packet::DATA { block_num: 1, data: block1 }.encode(),
                clock.now(),
            )
            .await;
        assert!(matches!(action, PacketAction::Continue));
        assert_eq!(session.block, 1);
    }

    #[tokio::test]
    async fn unknown_tid_does_not_mutate_session() {
        let registry = FileRegistry::new();
        let io = FixedIo {
            bind_addr: "127.0.0.1:7005".parse().unwrap(),
        };
        let fs = crate::io::TokioFileSystem;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"HELLO").await.unwrap();

        let clock = FakeClock::new();
        let mut session = start_rrq(
            1,
            peer_addr(),
            "hello.txt".to_string(),
            path,
            Mode::Octet,
            &registry,
            &io,
            &fs,
            clock.now(),
        )
        .await
        .unwrap();

        let stray: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        let action = session.on_datagram(stray, &Packet::ACK { block_num: 1 }.encode(), clock.now()).await;
        assert!(matches!(action, PacketAction::Continue));
        assert_eq!(session.block, 1);
        assert_eq!(session.peer(), peer_addr());
    }
}
