//! Listening socket and accept/dispatch loop

use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::connection::{ClientGuard, ConnectionHandler, Feed};
use super::{Distribution, Shared};
use crate::error::{Error, Result};

/// Pause after a failed accept so a persistent error (e.g. EMFILE) cannot spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// A bound listener plus its accept thread
pub(crate) struct Listener {
    /// Clone of the accepting socket, used to unblock `accept` on stop
    socket: TcpListener,
    local_addr: SocketAddr,
    session: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl Listener {
    /// Bind `bind_address:port` and start accepting in the background.
    ///
    /// Socket setup errors are returned here; nothing is spawned on failure.
    /// std enables `SO_REUSEADDR` on Unix listeners, so a restart does not
    /// trip over connections left in `TIME_WAIT`.
    pub fn start(bind_address: &str, port: u16, shared: Arc<Shared>) -> Result<Self> {
        let addr = (bind_address, port)
            .to_socket_addrs()
            .map_err(|_| Error::InvalidAddress(bind_address.to_string()))?
            .next()
            .ok_or_else(|| Error::InvalidAddress(bind_address.to_string()))?;

        let socket = TcpListener::bind(addr).map_err(|source| Error::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;
        let accept_socket = socket.try_clone()?;

        let session = Arc::new(AtomicBool::new(true));
        let accept_session = Arc::clone(&session);
        let accept_thread = thread::Builder::new()
            .name("frame-accept".to_string())
            .spawn(move || accept_loop(accept_socket, accept_session, shared))?;

        Ok(Self {
            socket,
            local_addr,
            session,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the accept thread.
    ///
    /// Connection handlers are not joined; they notice the cleared session
    /// flag on their next iteration.
    pub fn stop(mut self) {
        self.session.store(false, Ordering::Release);
        self.unblock_accept();

        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                error!("Accept thread panicked");
            }
        }
    }

    fn unblock_accept(&self) {
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;

            // Shutting down a listening socket makes a blocked accept() return
            // with an error on Linux.
            let rc = unsafe { libc::shutdown(self.socket.as_raw_fd(), libc::SHUT_RDWR) };
            if rc == 0 {
                return;
            }
            debug!(
                "Listener shutdown failed ({}), waking accept with a connection",
                std::io::Error::last_os_error()
            );
        }

        let mut wake = self.local_addr;
        if wake.ip().is_unspecified() {
            let loopback = match wake {
                SocketAddr::V4(_) => std::net::Ipv4Addr::LOCALHOST.into(),
                SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
            };
            wake.set_ip(loopback);
        }
        if let Err(e) = TcpStream::connect_timeout(&wake, Duration::from_secs(1)) {
            warn!("Failed to wake accept loop on {}: {}", wake, e);
        }
    }
}

fn accept_loop(socket: TcpListener, session: Arc<AtomicBool>, shared: Arc<Shared>) {
    debug!("Accept loop running");

    while session.load(Ordering::Acquire) {
        match socket.accept() {
            Ok((stream, peer)) => {
                if !session.load(Ordering::Acquire) {
                    let _ = stream.shutdown(Shutdown::Both);
                    break;
                }
                dispatch(stream, peer, &session, &shared);
            }
            Err(_) if !session.load(Ordering::Acquire) => break,
            Err(e) => {
                warn!("Failed to accept client connection: {}", e);
                thread::sleep(ACCEPT_BACKOFF);
            }
        }
    }

    debug!("Accept loop exited");
}

/// Start a handler thread for `stream`, fire-and-forget
fn dispatch(
    stream: TcpStream,
    peer: SocketAddr,
    session: &Arc<AtomicBool>,
    shared: &Arc<Shared>,
) {
    let tunables = shared.tunables.load();

    if let Some(limit) = tunables.max_clients {
        if shared.clients.load(Ordering::Acquire) >= limit {
            info!(%peer, limit, "Rejecting client, connection limit reached");
            shared.stats.record_rejected();
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    }

    // Count the client before its thread starts so the limit check above
    // sees connections that are still spinning up.
    let slot = ClientGuard::acquire(shared);
    shared.stats.record_accepted();

    let feed = match tunables.distribution {
        Distribution::Shared => Feed::Shared(Arc::clone(&shared.buffer)),
        Distribution::Broadcast => Feed::Dedicated(shared.fanout.subscribe()),
    };

    let handler = ConnectionHandler::new(stream, peer, feed, Arc::clone(session), slot);
    let spawned = thread::Builder::new()
        .name(format!("frame-client-{peer}"))
        .spawn(move || {
            handler.run();
        });

    if let Err(e) = spawned {
        // The handler (and its socket and client slot) was dropped with the closure
        warn!(%peer, "Failed to spawn client thread: {}", e);
    }
}
