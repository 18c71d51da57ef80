//! UDP listener: receives datagrams, dispatches them to the protocol
//! handler, and writes replies back to the source address.
//!
//! Datagrams are processed in parallel — each one runs on the blocking
//! pool, since the SRP modular exponentiation dominates handling cost and
//! must not stall the reactor. A handler panic is contained by the task
//! boundary: the datagram is treated as malformed and the worker keeps
//! serving.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::UdpSocket;

use crate::handler::{handle_datagram, HandlerContext};
use crate::store::SessionStore;

/// Largest datagram accepted; anything longer is truncated by the socket
/// and fails decode.
const MAX_DATAGRAM: usize = 4096;

/// How often the background sweep removes expired sessions.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Serve the socket until an I/O error ends the loop.
pub async fn run(socket: UdpSocket, ctx: Arc<HandlerContext>) -> anyhow::Result<()> {
    let socket = Arc::new(socket);
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let (len, src) = socket
            .recv_from(&mut buf)
            .await
            .context("udp receive failed")?;
        let payload = buf[..len].to_vec();
        let socket = socket.clone();
        let ctx = ctx.clone();

        tokio::spawn(async move {
            let handled = tokio::task::spawn_blocking(move || {
                handle_datagram(&ctx, &payload, src.ip(), Instant::now())
            })
            .await;

            let reply = match handled {
                Ok(reply) => reply,
                Err(err) => {
                    // A panicked handler must never take the worker down.
                    tracing::error!(%src, %err, "handler panicked; datagram dropped");
                    None
                }
            };
            if let Some(bytes) = reply {
                if let Err(err) = socket.send_to(&bytes, src).await {
                    tracing::warn!(%src, %err, "failed to send reply");
                }
            }
        });
    }
}

/// Periodically drop expired sessions so an idle id returns NO_EXIST and
/// the map does not grow without bound.
pub async fn sweep_expired(sessions: Arc<SessionStore>) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        let removed = sessions.sweep(Instant::now());
        if removed > 0 {
            tracing::debug!(removed, remaining = sessions.len(), "swept sessions");
        }
    }
}
