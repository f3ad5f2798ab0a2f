//! Transfer lifecycle events, in the shape of the teacher's `ServerEvent`
//! bus (`ui.rs`/`server.rs`): kept as a public channel so a future UI or
//! metrics consumer can subscribe, but the default consumer (`main.rs`)
//! just forwards each event into `tracing`.

use std::net::SocketAddr;

use crate::codec::Mode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Read,
    Write,
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Log(String),
    TransferStarted {
        id: u64,
        peer: SocketAddr,
        filename: String,
        mode: Mode,
        kind: TransferKind,
    },
    TransferComplete {
        id: u64,
    },
    TransferFailed {
        id: u64,
        error: String,
    },
}

/// Forward every event to `tracing` at an appropriate level. This is the
/// default `ServerEvent` consumer; tests and alternate front-ends can
/// instead read from the channel directly.
pub fn log_event(ev: &ServerEvent) {
    match ev {
        ServerEvent::Log(msg) => tracing::info!("{msg}"),
        ServerEvent::TransferStarted {
            id,
            peer,
            filename,
            mode,
            kind,
        } => {
            let dir = match kind {
                TransferKind::Read => "RRQ",
                TransferKind::Write => "WRQ",
            };
            tracing::info!(id, %peer, filename, mode = ?mode, dir, "transfer started");
        }
        ServerEvent::TransferComplete { id } => tracing::info!(id, "transfer complete"),
        ServerEvent::TransferFailed { id, error } => tracing::warn!(id, error, "transfer failed"),
    }
}
