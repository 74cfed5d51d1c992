//! Frame streaming server.
//!
//! ```text
//! capture callback ─► push_frame ─► normalize ─► FrameBuffer ─┬─► client thread ─► socket
//!                                                             ├─► client thread ─► socket
//!                                                             └─► ...
//! ```
//!
//! One thread accepts connections and one thread per client drains frames
//! and writes them out. `push_frame` runs on the caller's thread and never
//! blocks on network activity.

mod connection;
mod listener;
mod stats;

pub use connection::{CloseReason, ConnectionState};
pub use stats::ServerStats;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace};

use crate::capture::{NormalizedFrame, RawFrame};
use crate::codec::{self, FrameSequencer};
use crate::error::Result;
use crate::pipeline::{FanOut, FrameBuffer};
use listener::Listener;
use stats::StatsRecorder;

/// Default TCP port
pub const DEFAULT_PORT: u16 = 8888;

/// How ingested frames are spread across connected clients
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    /// All clients pop from one queue; each frame reaches at most one client
    #[default]
    Shared,
    /// Every client gets its own queue and sees every frame
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Frames retained by the shared queue (and each broadcast queue)
    pub queue_capacity: usize,
    /// How long an idle client waits for a frame before re-checking state
    pub idle_wait_ms: u64,
    /// Drop clients whose socket blocks a write for longer than this
    pub write_timeout_ms: Option<u64>,
    pub max_clients: Option<usize>,
    pub distribution: Distribution,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            queue_capacity: crate::pipeline::ringbuf::DEFAULT_CAPACITY,
            idle_wait_ms: 10,
            write_timeout_ms: None,
            max_clients: None,
            distribution: Distribution::Shared,
        }
    }
}

impl ServerConfig {
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms.max(1))
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
    }
}

/// State shared by the facade, the accept loop and every client thread
pub(crate) struct Shared {
    buffer: Arc<FrameBuffer>,
    fanout: Arc<FanOut>,
    tunables: ArcSwap<ServerConfig>,
    clients: AtomicUsize,
    stats: StatsRecorder,
}

/// Frame streaming server facade.
///
/// All methods take `&self`, so the server can sit in an `Arc` shared with
/// the capture callback.
pub struct StreamServer {
    shared: Arc<Shared>,
    sequencer: FrameSequencer,
    running: AtomicBool,
    session: Mutex<Option<Listener>>,
}

impl StreamServer {
    pub fn new(config: ServerConfig) -> Self {
        let capacity = config.queue_capacity;
        let buffer = Arc::new(FrameBuffer::new(capacity));
        Self {
            shared: Arc::new(Shared {
                fanout: Arc::new(FanOut::new(Arc::clone(&buffer), capacity)),
                buffer,
                tunables: ArcSwap::from_pointee(config),
                clients: AtomicUsize::new(0),
                stats: StatsRecorder::default(),
            }),
            sequencer: FrameSequencer::new(),
            running: AtomicBool::new(false),
            session: Mutex::new(None),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Listener>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `port` and start accepting clients. Port 0 picks an ephemeral port.
    ///
    /// Returns `Ok` immediately when already running, whatever `port` is.
    #[instrument(skip(self))]
    pub fn start(&self, port: u16) -> Result<()> {
        let mut session = self.lock_session();
        if session.is_some() {
            debug!("Frame server already running");
            return Ok(());
        }

        let bind_address = self.shared.tunables.load().bind_address.clone();
        let listener = Listener::start(&bind_address, port, Arc::clone(&self.shared))?;
        let stale = self.shared.buffer.clear();
        if stale > 0 {
            debug!(stale, "Discarded frames left over from the previous session");
        }
        info!("Frame server listening on {}", listener.local_addr());

        *session = Some(listener);
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop accepting and signal client threads to exit. No-op when stopped.
    ///
    /// Client threads are not joined; a send already in flight completes or
    /// fails on its own.
    #[instrument(skip(self))]
    pub fn stop(&self) {
        let mut session = self.lock_session();
        let Some(listener) = session.take() else {
            return;
        };

        self.running.store(false, Ordering::Release);
        listener.stop();
        let discarded = self.shared.buffer.clear();

        info!(discarded, "Frame server stopped");
    }

    /// Ingest one driver frame. Called from the capture callback.
    ///
    /// Copies the planes out before returning. Does nothing when the server
    /// is stopped or `raw` is `None`; frames that cannot be copied are
    /// dropped without reporting an error to the caller.
    pub fn push_frame(&self, raw: Option<&RawFrame<'_>>) {
        if !self.is_running() {
            return;
        }
        let Some(raw) = raw else {
            trace!("Ignoring empty frame");
            return;
        };

        let frame = match codec::normalize(raw, &self.sequencer) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Dropping frame: {}", e);
                self.shared.stats.record_ingest_failure();
                return;
            }
        };

        // Holding the session lock keeps a concurrent stop() from clearing
        // the buffer between the running check and the enqueue.
        let session = self.lock_session();
        if session.is_none() {
            trace!(frame_id = frame.frame_id, "Server stopped during ingest");
            return;
        }
        self.enqueue(frame);
    }

    fn enqueue(&self, frame: NormalizedFrame) {
        let published = self.shared.fanout.publish(frame);

        // Broadcast clients never pop the staging buffer, so its evictions
        // only cost a frame in shared mode.
        let mut evicted = published.dedicated_evicted;
        if published.staged_evicted
            && self.shared.tunables.load().distribution == Distribution::Shared
        {
            evicted += 1;
        }
        self.shared.stats.record_ingested(evicted);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn connected_client_count(&self) -> usize {
        self.shared.clients.load(Ordering::Acquire)
    }

    /// Address actually bound, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_session().as_ref().map(Listener::local_addr)
    }

    /// Frames waiting in the shared queue
    pub fn buffered_frames(&self) -> usize {
        self.shared.buffer.len()
    }

    pub fn stats(&self) -> ServerStats {
        self.shared
            .stats
            .snapshot(self.connected_client_count(), self.buffered_frames())
    }

    pub fn config(&self) -> ServerConfig {
        ServerConfig::clone(&self.shared.tunables.load())
    }

    /// Swap in new tunables.
    ///
    /// `idle_wait_ms` and `write_timeout_ms` apply to running clients on
    /// their next iteration; `max_clients` and `distribution` to the next
    /// accepted connection; `bind_address` to the next `start`.
    /// `queue_capacity` is fixed when the server is created.
    pub fn update_config(&self, config: ServerConfig) {
        info!(?config, "Updating server configuration");
        self.shared.tunables.store(Arc::new(config));
    }
}

impl Default for StreamServer {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.stop();
    }
}
