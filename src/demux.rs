//! Event loop / demultiplexer (C6).
//!
//! Single cooperative task: owns the listening endpoint, every live
//! session's endpoint, and the readiness set that multiplexes them. The
//! teacher's `server.rs::run` drives one `tokio::select!` over the
//! listening socket and spawns a task per transfer; here there is no
//! per-session task (spec.md §5 mandates one thread, one in-flight packet
//! processed to completion at a time). Dynamic per-session readiness is
//! modeled with a `FuturesUnordered` of single-shot `recv_from` futures —
//! the async analogue of the teacher's tokio::select!, generalized to an
//! unbounded, changing number of endpoints instead of a fixed two.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};

use crate::codec::Packet;
use crate::config::Config;
use crate::errors::{ErrorCode, send_error};
use crate::events::{ServerEvent, TransferKind};
use crate::io::{Clock, DatagramIo, DatagramSocket, FileSystem, ephemeral_bind_addr};
use crate::paths;
use crate::registry::FileRegistry;
use crate::session::{self, Outcome, PacketAction, Session, TickAction};

const LISTEN_BUF: usize = 1024;
const SESSION_BUF: usize = 516;

type RecvResult = (u64, std::io::Result<(SocketAddr, Vec<u8>)>);
type RecvFuture = Pin<Box<dyn Future<Output = RecvResult>>>;

pub struct Demux {
    listening: Box<dyn DatagramSocket>,
    sessions: HashMap<u64, Session>,
    pending: FuturesUnordered<RecvFuture>,
    registry: Rc<RefCell<FileRegistry>>,
    dir: PathBuf,
    next_id: u64,
    io: Arc<dyn DatagramIo>,
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    config: Config,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl Demux {
    pub fn new(
        listening: Box<dyn DatagramSocket>,
        dir: PathBuf,
        io: Arc<dyn DatagramIo>,
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
        config: Config,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            listening,
            sessions: HashMap::new(),
            pending: FuturesUnordered::new(),
            registry: FileRegistry::new(),
            dir,
            next_id: 1,
            io,
            fs,
            clock,
            config,
            events,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Run the event loop until `shutdown` is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut listen_buf = vec![0u8; LISTEN_BUF];
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = self.listening.recv_from(&mut listen_buf) => {
                    match result {
                        Ok((n, peer)) => {
                            let data = listen_buf[..n].to_vec();
                            self.handle_initial(peer, &data).await;
                        }
                        Err(e) => tracing::warn!(error = %e, "listening socket recv failed"),
                    }
                }
                Some((id, result)) = self.pending.next(), if !self.pending.is_empty() => {
                    self.handle_session_io(id, result).await;
                }
                _ = ticker.tick() => {
                    self.sweep_timeouts().await;
                }
                _ = shutdown.changed() => {
                    let _ = self.events.send(ServerEvent::Log("shutting down".into()));
                    break;
                }
            }
        }
    }

    async fn handle_initial(&mut self, peer: SocketAddr, data: &[u8]) {
        let pkt = match Packet::decode(data) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "malformed initial packet");
                self.reject(peer, ErrorCode::IllegalOperation, Some("malformed packet")).await;
                return;
            }
        };

        let (filename, mode, is_read) = match pkt {
            Packet::RRQ { filename, mode } => (filename, mode, true),
            Packet::WRQ { filename, mode } => (filename, mode, false),
            other => {
                tracing::warn!(%peer, ?other, "unexpected packet on listening endpoint");
                self.reject(peer, ErrorCode::IllegalOperation, Some("unsupported opcode")).await;
                return;
            }
        };

        if filename.trim().is_empty() {
            self.reject(peer, ErrorCode::IllegalOperation, Some("empty filename"))
                .await;
            return;
        }

        let path = match paths::sanitize(&self.dir, &filename) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(%peer, filename, error = %e, "rejected unsafe filename");
                self.reject(peer, ErrorCode::AccessViolation, Some(&e.to_string()))
                    .await;
                return;
            }
        };

        let id = self.next_id;
        self.next_id += 1;
        let now = self.clock.now();

        let session = if is_read {
            session::start_rrq(
                id,
                peer,
                filename.clone(),
                path,
                mode,
                &self.registry,
                self.io.as_ref(),
                self.fs.as_ref(),
                now,
            )
            .await
        } else {
            session::start_wrq(
                id,
                peer,
                filename.clone(),
                path,
                mode,
                &self.registry,
                self.io.as_ref(),
                self.fs.as_ref(),
                now,
            )
            .await
        };

        let Some(session) = session else { return };

        let kind = if is_read { TransferKind::Read } else { TransferKind::Write };
        let _ = self.events.send(ServerEvent::TransferStarted {
            id,
            peer,
            filename,
            mode,
            kind,
        });

        let socket = session.socket();
        self.sessions.insert(id, session);
        self.pending.push(recv_future(id, socket));
    }

    async fn handle_session_io(&mut self, id: u64, result: std::io::Result<(SocketAddr, Vec<u8>)>) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };

        match result {
            Ok((from, data)) => {
                let now = self.clock.now();
                let action = session.on_datagram(from, &data, now).await;
                match action {
                    PacketAction::Continue => {
                        let socket = session.socket();
                        self.pending.push(recv_future(id, socket));
                    }
                    PacketAction::Terminate(outcome) => self.finish_session(id, outcome).await,
                }
            }
            Err(e) => {
                tracing::warn!(id, error = %e, "session endpoint recv failed");
                self.finish_session(id, Outcome::ProtocolError(ErrorCode::NotDefined)).await;
            }
        }
    }

    async fn sweep_timeouts(&mut self) {
        let now = self.clock.now();
        let ids: Vec<u64> = self.sessions.keys().copied().collect();
        for id in ids {
            let action = match self.sessions.get_mut(&id) {
                Some(session) => {
                    session
                        .on_tick(now, self.config.retry_timeout, self.config.max_retries)
                        .await
                }
                None => continue,
            };
            if let TickAction::Terminate(outcome) = action {
                self.finish_session(id, outcome).await;
            }
        }
    }

    async fn finish_session(&mut self, id: u64, outcome: Outcome) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        let event = match &outcome {
            Outcome::Completed => ServerEvent::TransferComplete { id },
            other => ServerEvent::TransferFailed {
                id,
                error: format!("{other:?}"),
            },
        };
        let _ = self.events.send(event);
        session.finalize(&outcome, self.fs.as_ref()).await;
    }

    /// Send an ERR from a throwaway ephemeral endpoint, matching the
    /// convention that even error replies originate from a fresh TID.
    async fn reject(&self, peer: SocketAddr, code: ErrorCode, extra: Option<&str>) {
        match self.io.bind(ephemeral_bind_addr(peer)).await {
            Ok(sock) => {
                let _ = send_error(sock.as_ref(), peer, code, extra).await;
            }
            Err(e) => tracing::warn!(error = %e, "failed to bind rejection endpoint"),
        }
    }
}

fn recv_future(id: u64, socket: Arc<dyn DatagramSocket>) -> RecvFuture {
    Box::pin(async move {
        let mut buf = vec![0u8; SESSION_BUF];
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => (id, Ok((from, buf[..n].to_vec()))),
            Err(e) => (id, Err(e)),
        }
    })
}
