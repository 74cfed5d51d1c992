//! Synthetic depth/RGB/IR source for running without camera hardware

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{FrameSource, RawFrame, RawPlane};
use crate::{Result, SourceConfig};

/// Produces moving test patterns at a fixed rate.
///
/// Plane buffers are reused between frames, the same way driver memory is
/// recycled once the callback returns.
pub struct SyntheticSource {
    config: SourceConfig,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.config.fps.max(1)
    }
}

/// Pattern buffers for one frame
struct Patterns {
    width: u32,
    height: u32,
    depth: Vec<u8>,
    rgb: Vec<u8>,
    ir: Vec<u8>,
}

impl Patterns {
    fn new(config: &SourceConfig) -> Self {
        let pixels = config.width as usize * config.height as usize;
        Self {
            width: config.width,
            height: config.height,
            depth: if config.depth { vec![0; pixels * 2] } else { Vec::new() },
            rgb: if config.rgb { vec![0; pixels * 3] } else { Vec::new() },
            ir: if config.ir { vec![0; pixels] } else { Vec::new() },
        }
    }

    fn render(&mut self, tick: u32) {
        let width = self.width.max(1) as usize;

        // 16-bit depth ramp in millimetres, scrolling horizontally
        for (i, px) in self.depth.chunks_exact_mut(2).enumerate() {
            let x = (i % width) as u32;
            let mm = 500 + (x.wrapping_add(tick) % width as u32) * 4000 / width as u32;
            px.copy_from_slice(&(mm as u16).to_le_bytes());
        }

        for (i, px) in self.rgb.chunks_exact_mut(3).enumerate() {
            let x = i % width;
            let y = i / width;
            px[0] = (x as u32).wrapping_add(tick) as u8;
            px[1] = (y as u32).wrapping_add(tick) as u8;
            px[2] = tick as u8;
        }

        for (i, px) in self.ir.iter_mut().enumerate() {
            *px = ((i / width) as u32).wrapping_add(tick) as u8;
        }
    }

    fn raw_frame(&self) -> RawFrame<'_> {
        RawFrame {
            depth: pattern_plane(self.width, self.height, &self.depth),
            rgb: pattern_plane(self.width, self.height, &self.rgb),
            ir: pattern_plane(self.width, self.height, &self.ir),
            ..RawFrame::default()
        }
    }
}

fn pattern_plane(width: u32, height: u32, data: &[u8]) -> RawPlane<'_> {
    if data.is_empty() {
        RawPlane::default()
    } else {
        RawPlane::new(width, height, data)
    }
}

impl FrameSource for SyntheticSource {
    fn start<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(&RawFrame<'_>) + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let interval = self.frame_interval();
        let running = Arc::clone(&self.running);
        let mut patterns = Patterns::new(&self.config);

        let spawned = thread::Builder::new()
            .name("synthetic-source".to_string())
            .spawn(move || {
                let mut tick = 0u32;
                let mut next = Instant::now();
                while running.load(Ordering::Relaxed) {
                    patterns.render(tick);
                    callback(&patterns.raw_frame());
                    tick = tick.wrapping_add(1);

                    next += interval;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        // Running behind, resync instead of bursting
                        next = now;
                    }
                }
                debug!("Synthetic source produced {} frames", tick);
            });

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                info!(
                    "Synthetic source started: {}x{} @ {} fps",
                    self.config.width, self.config.height, self.config.fps
                );
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Synthetic source thread panicked");
            }
            info!("Synthetic source stopped");
        }
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
