//! Boundary between the renderer loop and the rendering engine it drives.
//!
//! The loop talks to the engine only through [`RenderEngine`]. The engine
//! hands finished frames back through a [`FrameSink`], which publishes them
//! straight into the region from whatever thread the engine rasterises on.
//! The sink never touches the mailbox, so an engine callback cannot re-enter
//! command processing.

use crate::config::RegionConfig;
use crate::error::{RelayError, Result};
use crate::frame::publish_frame;
use crate::layout::{PointerPhase, SharedRegionHandle};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Where the engine finds its bundle and runtime data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineAssets {
    pub assets_path: PathBuf,
    pub data_path: PathBuf,
}

/// Physical surface size pushed to the engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowMetrics {
    pub width: usize,
    pub height: usize,
    pub pixel_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerSignalKind {
    None,
    Scroll,
}

/// Pointer event in physical coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerEvent {
    pub phase: PointerPhase,
    pub x: f64,
    pub y: f64,
    /// Mouse device id; the relay forwards a single mouse
    pub device: i32,
    pub buttons: i64,
    pub signal_kind: PointerSignalKind,
    /// Engine clock, microseconds
    pub timestamp: u64,
}

/// Discrete scroll in physical coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollEvent {
    pub phase: PointerPhase,
    pub x: f64,
    pub y: f64,
    pub device: i32,
    pub signal_kind: PointerSignalKind,
    pub delta_x: f64,
    pub delta_y: f64,
    pub timestamp: u64,
}

/// A rendering engine the renderer subprocess can drive.
pub trait RenderEngine {
    /// Start the engine. Frames go to `sink` from then on.
    fn start(&mut self, assets: &EngineAssets, sink: FrameSink) -> Result<()>;

    fn send_window_metrics(&mut self, metrics: WindowMetrics) -> Result<()>;

    fn send_pointer_event(&mut self, event: PointerEvent) -> Result<()>;

    fn send_scroll_event(&mut self, event: ScrollEvent) -> Result<()>;

    /// The engine's own monotonic clock in microseconds
    fn current_time_micros(&self) -> u64;

    fn shutdown(&mut self);
}

struct SinkInner {
    region: Arc<SharedRegionHandle>,
    publish: Mutex<()>,
    published: AtomicU64,
    dropped: AtomicU64,
}

/// Frame-ready callback object handed to the engine
#[derive(Clone)]
pub struct FrameSink {
    inner: Arc<SinkInner>,
}

impl FrameSink {
    pub fn new(region: Arc<SharedRegionHandle>) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                region,
                publish: Mutex::new(()),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Publish a frame of `height` rows, `row_bytes` apart.
    ///
    /// Returns `false` if the frame was dropped (too large or malformed).
    pub fn present(&self, pixels: &[u8], row_bytes: usize, height: usize) -> bool {
        // Clones may present from several threads; the region has one writer.
        let _guard = self
            .inner
            .publish
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match publish_frame(&self.inner.region, pixels, row_bytes, height) {
            Ok(frame_number) => {
                self.inner.published.fetch_add(1, Ordering::Relaxed);
                trace!(frame_number, row_bytes, height, "published frame");
                true
            }
            Err(e) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "dropped frame");
                false
            }
        }
    }

    /// Largest frame the region accepts
    pub fn capacity(&self) -> RegionConfig {
        self.inner.region.capacity()
    }

    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// RGBA used by [`SolidFillEngine`] unless told otherwise
pub const DEFAULT_FILL: [u8; 4] = [0x20, 0x80, 0xE0, 0xFF];

struct Raster {
    jobs: mpsc::Sender<WindowMetrics>,
    thread: JoinHandle<()>,
}

/// Headless engine that paints every frame a single colour.
///
/// Each window-metrics event produces one frame of the new physical size,
/// rasterised on a dedicated thread. Used by the bundled renderer binary and
/// for exercising hosts without a real engine.
pub struct SolidFillEngine {
    color: [u8; 4],
    epoch: Instant,
    raster: Option<Raster>,
}

impl Default for SolidFillEngine {
    fn default() -> Self {
        Self::new(DEFAULT_FILL)
    }
}

impl SolidFillEngine {
    pub fn new(color: [u8; 4]) -> Self {
        Self {
            color,
            epoch: Instant::now(),
            raster: None,
        }
    }

    fn raster(&self) -> Result<&Raster> {
        self.raster
            .as_ref()
            .ok_or_else(|| RelayError::Engine("engine not started".into()))
    }
}

impl RenderEngine for SolidFillEngine {
    fn start(&mut self, assets: &EngineAssets, sink: FrameSink) -> Result<()> {
        if !assets.assets_path.is_dir() {
            return Err(RelayError::EngineStart(format!(
                "asset directory {} not found",
                assets.assets_path.display()
            )));
        }

        let (jobs, rx) = mpsc::channel::<WindowMetrics>();
        let color = self.color;
        let thread = std::thread::Builder::new()
            .name("solid-fill-raster".into())
            .spawn(move || {
                for metrics in rx {
                    let WindowMetrics { width, height, .. } = metrics;
                    if width == 0 || height == 0 {
                        continue;
                    }
                    let area = width
                        .checked_mul(height)
                        .filter(|_| sink.capacity().fits(width, height));
                    let Some(area) = area else {
                        warn!(width, height, "surface larger than region, not painting");
                        continue;
                    };
                    let pixels = color.repeat(area);
                    sink.present(&pixels, width * 4, height);
                }
            })
            .map_err(|e| RelayError::EngineStart(format!("failed to spawn raster thread: {e}")))?;

        info!(assets = %assets.assets_path.display(), "solid fill engine started");
        self.epoch = Instant::now();
        self.raster = Some(Raster { jobs, thread });
        Ok(())
    }

    fn send_window_metrics(&mut self, metrics: WindowMetrics) -> Result<()> {
        self.raster()?
            .jobs
            .send(metrics)
            .map_err(|_| RelayError::Engine("raster thread exited".into()))
    }

    fn send_pointer_event(&mut self, event: PointerEvent) -> Result<()> {
        self.raster()?;
        info!(
            phase = ?event.phase,
            x = event.x,
            y = event.y,
            buttons = event.buttons,
            timestamp = event.timestamp,
            "pointer event"
        );
        Ok(())
    }

    fn send_scroll_event(&mut self, event: ScrollEvent) -> Result<()> {
        self.raster()?;
        debug!(
            phase = ?event.phase,
            x = event.x,
            y = event.y,
            dx = event.delta_x,
            dy = event.delta_y,
            "scroll event"
        );
        Ok(())
    }

    fn current_time_micros(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn shutdown(&mut self) {
        if let Some(Raster { jobs, thread }) = self.raster.take() {
            drop(jobs);
            if thread.join().is_err() {
                warn!("raster thread panicked");
            }
            info!("solid fill engine shut down");
        }
    }
}

impl Drop for SolidFillEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionConfig;
    use crate::frame::FrameReader;
    use std::time::Duration;

    fn region(name: &str) -> Arc<SharedRegionHandle> {
        Arc::new(
            SharedRegionHandle::create(
                name,
                RegionConfig {
                    max_width: 32,
                    max_height: 32,
                },
            )
            .unwrap(),
        )
    }

    fn here() -> EngineAssets {
        EngineAssets {
            assets_path: PathBuf::from(env!("CARGO_MANIFEST_DIR")),
            data_path: PathBuf::from(env!("CARGO_MANIFEST_DIR")),
        }
    }

    #[test]
    fn test_sink_counts_published_and_dropped() {
        let region = region("relay_test_engine_sink");
        let sink = FrameSink::new(region.clone());

        assert!(sink.present(&[1u8; 16 * 16 * 4], 64, 16));
        assert!(!sink.present(&[1u8; 33 * 4], 33 * 4, 1));
        assert_eq!(sink.published(), 1);
        assert_eq!(sink.dropped(), 1);
        assert_eq!(region.frame_number(), 1);
    }

    #[test]
    fn test_solid_fill_paints_requested_size() {
        let region = region("relay_test_engine_fill");
        let mut engine = SolidFillEngine::new([1, 2, 3, 4]);
        engine.start(&here(), FrameSink::new(region.clone())).unwrap();

        engine
            .send_window_metrics(WindowMetrics {
                width: 20,
                height: 10,
                pixel_ratio: 1.0,
            })
            .unwrap();

        let mut reader = FrameReader::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let frame = loop {
            if let Some(frame) = reader.poll(&region) {
                break frame;
            }
            assert!(Instant::now() < deadline, "no frame published");
            std::thread::sleep(Duration::from_millis(1));
        };

        assert_eq!((frame.width, frame.height), (20, 10));
        assert!(frame.pixels.chunks(4).all(|px| px == [1, 2, 3, 4]));

        engine.shutdown();
        assert!(engine.send_window_metrics(WindowMetrics {
            width: 1,
            height: 1,
            pixel_ratio: 1.0
        })
        .is_err());
    }

    #[test]
    fn test_solid_fill_survives_oversized_metrics() {
        let region = region("relay_test_engine_oversized");
        let mut engine = SolidFillEngine::default();
        engine.start(&here(), FrameSink::new(region.clone())).unwrap();

        for (width, height) in [(usize::MAX, usize::MAX), (33, 1), (5, 4)] {
            engine
                .send_window_metrics(WindowMetrics {
                    width,
                    height,
                    pixel_ratio: 1.0,
                })
                .unwrap();
        }

        let mut reader = FrameReader::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let frame = loop {
            if let Some(frame) = reader.poll(&region) {
                break frame;
            }
            assert!(Instant::now() < deadline, "no frame published");
            std::thread::sleep(Duration::from_millis(1));
        };

        assert_eq!((frame.width, frame.height, frame.frame_number), (5, 4, 1));
    }

    #[test]
    fn test_solid_fill_requires_assets() {
        let region = region("relay_test_engine_assets");
        let mut engine = SolidFillEngine::default();
        let assets = EngineAssets {
            assets_path: PathBuf::from("/nonexistent/relay/assets"),
            data_path: PathBuf::from("/nonexistent/relay/data"),
        };

        let err = engine.start(&assets, FrameSink::new(region)).unwrap_err();
        assert!(matches!(err, RelayError::EngineStart(_)));
    }

    #[test]
    fn test_clock_is_monotonic() {
        let engine = SolidFillEngine::default();
        let a = engine.current_time_micros();
        std::thread::sleep(Duration::from_millis(2));
        assert!(engine.current_time_micros() > a);
    }
}
