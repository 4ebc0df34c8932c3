//! Tokio driver for a [`Host`].

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use super::host::Host;
use super::simulation::Simulation;
use crate::core::HostError;
use crate::transport::HostSocket;

/// Drive `host` on `socket` until `shutdown` resolves or a tick fails
/// fatally.
///
/// Datagrams are processed as they arrive; [`Host::run_frame`] runs every
/// [`frame_msec`](super::HostConfig::frame_msec). On shutdown every
/// participant is dropped and the final messages are flushed before the
/// host is handed back.
pub async fn run<S, F>(mut host: Host<S>, mut socket: HostSocket, shutdown: F) -> Result<Host<S>, HostError>
where
    S: Simulation,
    F: Future<Output = ()>,
{
    let start = Instant::now();
    let now = move || start.elapsed().as_millis() as u64;

    let mut ticker = interval(Duration::from_millis(host.config().frame_msec()));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    info!(addr = ?socket.local_addr().ok(), "host running");
    loop {
        tokio::select! {
            received = socket.recv_from() => match received {
                Ok((packet, from)) => host.process_packet(from, packet, now()),
                Err(e) => debug!(error = %e, "receive failed"),
            },
            _ = ticker.tick() => {
                if let Err(e) = host.run_frame(now()) {
                    if e.is_fatal() {
                        error!(error = %e, "host frame failed");
                        return Err(e);
                    }
                    warn!(error = %e, "host frame error");
                }
            }
            () = &mut shutdown => break,
        }
        flush(&mut host, &socket).await;
    }

    host.shutdown("Host quit", now());
    flush(&mut host, &socket).await;
    info!("host stopped");
    Ok(host)
}

async fn flush<S: Simulation>(host: &mut Host<S>, socket: &HostSocket) {
    for datagram in host.drain_outgoing() {
        if let Err(e) = socket.send(&datagram).await {
            debug!(to = %datagram.addr, error = %e, "send failed");
        }
    }
}
