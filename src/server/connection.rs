//! Per-client send loop

use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, info_span, trace, warn};

use super::Shared;
use crate::codec;
use crate::pipeline::{FrameBuffer, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Closing,
    Closed,
}

/// Why a connection left the `Active` state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ServerStopped,
    PeerClosed,
    WriteTimeout,
    Io(ErrorKind),
}

impl From<&std::io::Error> for CloseReason {
    fn from(err: &std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
            | ErrorKind::WriteZero => CloseReason::PeerClosed,
            ErrorKind::WouldBlock | ErrorKind::TimedOut => CloseReason::WriteTimeout,
            kind => CloseReason::Io(kind),
        }
    }
}

/// Where a connection takes its frames from
pub(crate) enum Feed {
    /// The server-wide queue; each frame goes to whichever client pops it first
    Shared(Arc<FrameBuffer>),
    /// A queue of its own, fed with every ingested frame
    Dedicated(Subscription),
}

impl Feed {
    fn queue(&self) -> &FrameBuffer {
        match self {
            Feed::Shared(queue) => queue,
            Feed::Dedicated(sub) => sub.queue(),
        }
    }
}

/// Holds one slot of the connected-client count for as long as it lives
pub(crate) struct ClientGuard {
    shared: Arc<Shared>,
}

impl ClientGuard {
    pub fn acquire(shared: &Arc<Shared>) -> Self {
        let count = shared.clients.fetch_add(1, Ordering::AcqRel) + 1;
        shared.stats.record_connected_clients(count);
        Self {
            shared: Arc::clone(shared),
        }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let count = self.shared.clients.fetch_sub(1, Ordering::AcqRel) - 1;
        self.shared.stats.record_connected_clients(count);
    }
}

pub(crate) struct ConnectionHandler {
    stream: TcpStream,
    peer: SocketAddr,
    feed: Feed,
    session: Arc<AtomicBool>,
    shared: Arc<Shared>,
    state: ConnectionState,
    write_timeout: Option<Duration>,
    frames_sent: u64,
    _slot: ClientGuard,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        feed: Feed,
        session: Arc<AtomicBool>,
        slot: ClientGuard,
    ) -> Self {
        let shared = Arc::clone(&slot.shared);
        Self {
            stream,
            peer,
            feed,
            session,
            shared,
            state: ConnectionState::Active,
            write_timeout: None,
            frames_sent: 0,
            _slot: slot,
        }
    }

    /// Stream frames until the peer goes away or the session stops
    pub fn run(mut self) -> CloseReason {
        let span = info_span!("client", peer = %self.peer);
        let _enter = span.enter();

        if let Err(e) = self.stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        info!("Client connected");

        let reason = self.send_loop();
        self.transition(ConnectionState::Closing);
        let _ = self.stream.shutdown(Shutdown::Both);
        self.transition(ConnectionState::Closed);

        info!(
            frames_sent = self.frames_sent,
            ?reason,
            "Client disconnected"
        );
        reason
    }

    fn send_loop(&mut self) -> CloseReason {
        while self.state == ConnectionState::Active {
            if !self.session.load(Ordering::Acquire) {
                return CloseReason::ServerStopped;
            }

            let tunables = self.shared.tunables.load();
            self.apply_write_timeout(tunables.write_timeout());

            let Some(frame) = self.feed.queue().pop_timeout(tunables.idle_wait()) else {
                continue;
            };

            let started = Instant::now();
            match codec::write_frame(&mut self.stream, &frame) {
                Ok(bytes) => {
                    self.frames_sent += 1;
                    self.shared.stats.record_sent(bytes, started.elapsed());
                    trace!(frame_id = frame.frame_id, bytes, "Sent frame");
                }
                Err(e) => {
                    debug!(frame_id = frame.frame_id, "Send failed: {}", e);
                    return CloseReason::from(&e);
                }
            }
        }
        CloseReason::ServerStopped
    }

    fn apply_write_timeout(&mut self, timeout: Option<Duration>) {
        if timeout == self.write_timeout {
            return;
        }
        match self.stream.set_write_timeout(timeout) {
            Ok(()) => self.write_timeout = timeout,
            Err(e) => warn!("Failed to set write timeout {:?}: {}", timeout, e),
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        trace!("Connection {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}
