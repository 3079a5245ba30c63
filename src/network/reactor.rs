//! Tokio readiness driver for one connection.
//!
//! Stands in for the external reactor: waits for the socket to become
//! readable (and writable while output is pending), calls the matching engine
//! entry point, and runs the flush tick. Accepting connections is left to
//! the caller.

use std::io;
use std::sync::Arc;

use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;

use super::connection::{ConnectionEngine, SocketStatus};

enum Wake {
    Ready(io::Result<Ready>),
    Tick,
}

/// Run `engine` over `stream` until the connection closes.
pub async fn drive(engine: Arc<ConnectionEngine>, mut stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    tracing::info!("[world] [accept] conn={} peer={}", engine.id(), peer);

    if engine.open(&mut stream) == SocketStatus::Closed {
        return;
    }

    let mut ticker = tokio::time::interval(engine.config().tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let interest = if engine.has_pending_output() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };

        let wake = tokio::select! {
            ready = stream.ready(interest) => Wake::Ready(ready),
            _ = ticker.tick() => Wake::Tick,
        };

        let status = match wake {
            Wake::Ready(Ok(ready)) => {
                let mut status = SocketStatus::Open;
                if ready.is_readable() || ready.is_read_closed() {
                    status = engine.on_readable(&mut stream);
                }
                if status == SocketStatus::Open && ready.is_writable() {
                    status = engine.on_writable(&mut stream);
                }
                status
            }
            Wake::Ready(Err(e)) => {
                tracing::warn!("[world] [readiness] conn={} error={}", engine.id(), e);
                engine.close_socket();
                engine.tick(&mut stream)
            }
            Wake::Tick => engine.tick(&mut stream),
        };

        if status == SocketStatus::Closed {
            break;
        }
    }

    tracing::info!(
        "[world] [disconnect] conn={} peer={} reason={:?}",
        engine.id(),
        peer,
        engine.close_reason()
    );
}
