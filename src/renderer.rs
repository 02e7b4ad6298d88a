//! Renderer subprocess loop
//!
//! Opens the region, starts the engine, then drains at most one mailbox
//! command per iteration until Shutdown (or SIGINT/SIGTERM/SIGHUP) arrives.
//! Frame cadence belongs to the engine; the loop only sleeps between polls.

use crate::config::{RegionConfig, RendererConfig};
use crate::engine::{
    EngineAssets, FrameSink, PointerEvent, PointerSignalKind, RenderEngine,
    ScrollEvent, WindowMetrics,
};
use crate::error::{RelayError, Result};
use crate::layout::{PointerPhase, SharedRegionHandle, Status};
use crate::mailbox::{self, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Process exit codes of the renderer binary
pub mod exit_code {
    pub const OK: u8 = 0;
    pub const REGION: u8 = 1;
    pub const ENGINE: u8 = 2;
    pub const USAGE: u8 = 64;
}

/// Map a fatal error to the renderer's exit code.
pub fn exit_code_for(err: &RelayError) -> u8 {
    match err {
        RelayError::EngineStart(_) => exit_code::ENGINE,
        _ => exit_code::REGION,
    }
}

/// Route SIGINT, SIGTERM and SIGHUP to `stop`.
///
/// Only one handler can be registered per process; later calls log and
/// leave the first one in place.
pub fn install_signal_handlers(stop: Arc<AtomicBool>) {
    if let Err(e) = ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst)) {
        warn!(error = %e, "failed to install signal handler");
    }
}

/// Command-line surface of the renderer subprocess
#[derive(Debug, Clone)]
pub struct RendererArgs {
    pub region_name: String,
    pub assets: EngineAssets,
}

/// What a finished run did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub commands: u64,
    pub frames: u64,
    pub dropped_frames: u64,
}

/// Logical surface the engine is told about
#[derive(Debug, Clone, Copy, PartialEq)]
struct Viewport {
    width: u32,
    height: u32,
    pixel_ratio: f64,
}

impl Viewport {
    /// Physical size; float-to-int casts saturate, so huge ratios cannot wrap.
    fn metrics(&self) -> WindowMetrics {
        WindowMetrics {
            width: (self.width as f64 * self.pixel_ratio) as usize,
            height: (self.height as f64 * self.pixel_ratio) as usize,
            pixel_ratio: self.pixel_ratio,
        }
    }

    fn fits(&self, capacity: RegionConfig) -> bool {
        let m = self.metrics();
        capacity.fits(m.width, m.height)
    }
}

/// Renderer side of one region, driving one engine
pub struct Renderer<E: RenderEngine> {
    region: Arc<SharedRegionHandle>,
    engine: E,
    config: RendererConfig,
    sink: FrameSink,
    viewport: Viewport,
    stop: Arc<AtomicBool>,
    running: bool,
    commands: u64,
}

impl<E: RenderEngine> Renderer<E> {
    /// Open the named region and mark it `Initializing`.
    pub fn open(region_name: &str, engine: E, config: RendererConfig) -> Result<Self> {
        let region = SharedRegionHandle::open(region_name)?;
        Ok(Self::attach(Arc::new(region), engine, config))
    }

    /// Drive an already opened region and mark it `Initializing`.
    pub fn attach(region: Arc<SharedRegionHandle>, engine: E, config: RendererConfig) -> Self {
        region.set_status(Status::Initializing);
        let viewport = Viewport {
            width: config.initial_width,
            height: config.initial_height,
            pixel_ratio: 1.0,
        };
        Self {
            sink: FrameSink::new(region.clone()),
            region,
            engine,
            config,
            viewport,
            stop: Arc::new(AtomicBool::new(false)),
            running: true,
            commands: 0,
        }
    }

    /// Start the engine and publish `Ready`, or `Error` on failure.
    pub fn start(&mut self, assets: &EngineAssets) -> Result<()> {
        info!(
            assets = %assets.assets_path.display(),
            data = %assets.data_path.display(),
            "starting engine"
        );

        if let Err(e) = self.engine.start(assets, self.sink.clone()) {
            error!(error = %e, "engine failed to start");
            self.region.set_status(Status::Error);
            return Err(e);
        }

        self.push_metrics();
        self.region.set_status(Status::Ready);
        info!(region = self.region.name(), "renderer ready");
        Ok(())
    }

    /// Run until Shutdown or a stop signal.
    pub fn run_loop(&mut self) {
        while self.running && !self.stop_requested() {
            self.process_command();
            std::thread::sleep(self.config.idle_sleep);
        }
    }

    /// Drain at most one pending command. Returns whether one was handled.
    pub fn process_command(&mut self) -> bool {
        let Some(decoded) = mailbox::take_command(&self.region) else {
            return false;
        };

        match decoded {
            Ok(cmd) => self.dispatch(cmd),
            Err(e) => warn!(error = %e, "ignoring malformed command"),
        }

        mailbox::ack_command(&self.region);
        self.commands += 1;
        true
    }

    /// Publish `Shutdown`, stop the engine and release the region.
    pub fn finish(mut self) -> RunSummary {
        info!("renderer shutting down");
        self.region.set_status(Status::Shutdown);
        self.engine.shutdown();

        RunSummary {
            commands: self.commands,
            frames: self.sink.published(),
            dropped_frames: self.sink.dropped(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Flag that ends [`run_loop`](Self::run_loop) when set
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    fn stop_requested(&self) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            info!("stop requested");
            return true;
        }
        false
    }

    fn dispatch(&mut self, cmd: Command) {
        debug!(command = ?cmd, "command");
        match cmd {
            Command::Resize {
                width,
                height,
                pixel_ratio,
            } => {
                if width <= 0 || height <= 0 || !pixel_ratio.is_finite() || pixel_ratio <= 0.0 {
                    warn!(width, height, pixel_ratio, "ignoring invalid resize");
                    return;
                }
                let viewport = Viewport {
                    width: width as u32,
                    height: height as u32,
                    pixel_ratio,
                };
                let capacity = self.region.capacity();
                if !viewport.fits(capacity) {
                    warn!(
                        width,
                        height,
                        pixel_ratio,
                        max_width = capacity.max_width,
                        max_height = capacity.max_height,
                        "ignoring resize beyond region capacity"
                    );
                    return;
                }
                self.viewport = viewport;
                info!(width, height, pixel_ratio, "resize");
                self.push_metrics();
            }
            Command::Pointer {
                x,
                y,
                phase,
                buttons,
            } => {
                let event = PointerEvent {
                    phase,
                    x: x * self.viewport.pixel_ratio,
                    y: y * self.viewport.pixel_ratio,
                    device: 0,
                    buttons,
                    signal_kind: PointerSignalKind::None,
                    timestamp: self.engine.current_time_micros(),
                };
                if let Err(e) = self.engine.send_pointer_event(event) {
                    error!(error = %e, "pointer event rejected");
                }
            }
            Command::Scroll { x, y, dx, dy } => {
                let event = ScrollEvent {
                    phase: PointerPhase::Hover,
                    x: x * self.viewport.pixel_ratio,
                    y: y * self.viewport.pixel_ratio,
                    device: 0,
                    signal_kind: PointerSignalKind::Scroll,
                    delta_x: dx,
                    delta_y: dy,
                    timestamp: self.engine.current_time_micros(),
                };
                if let Err(e) = self.engine.send_scroll_event(event) {
                    error!(error = %e, "scroll event rejected");
                }
            }
            Command::Shutdown => {
                info!("received shutdown command");
                self.running = false;
            }
            Command::Init => info!("received init command"),
            Command::None => {}
        }
    }

    fn push_metrics(&mut self) {
        if let Err(e) = self.engine.send_window_metrics(self.viewport.metrics()) {
            error!(error = %e, "window metrics rejected");
        }
    }
}

/// Subprocess entry point: open, start, loop, tear down.
pub fn run<E: RenderEngine>(
    args: &RendererArgs,
    engine: E,
    config: RendererConfig,
) -> Result<RunSummary> {
    let handle_signals = config.install_signal_handlers;
    let mut renderer = Renderer::open(&args.region_name, engine, config)?;
    if handle_signals {
        install_signal_handlers(renderer.stop_flag());
    }
    renderer.start(&args.assets)?;
    renderer.run_loop();
    let summary = renderer.finish();

    info!(
        commands = summary.commands,
        frames = summary.frames,
        dropped_frames = summary.dropped_frames,
        "renderer exited"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::engine::SolidFillEngine;
    use crate::frame::FrameReader;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Started,
        Metrics(WindowMetrics),
        Pointer(PointerEvent),
        Scroll(ScrollEvent),
        Shutdown,
    }

    /// Records every engine call and paints a grey frame per metrics event.
    struct RecordingEngine {
        log: Arc<Mutex<Vec<Seen>>>,
        sink: Option<FrameSink>,
        clock: std::cell::Cell<u64>,
        fail_start: bool,
    }

    impl RecordingEngine {
        fn new(log: Arc<Mutex<Vec<Seen>>>) -> Self {
            Self {
                log,
                sink: None,
                clock: std::cell::Cell::new(0),
                fail_start: false,
            }
        }

        fn record(&self, seen: Seen) {
            self.log.lock().unwrap().push(seen);
        }
    }

    impl RenderEngine for RecordingEngine {
        fn start(&mut self, _assets: &EngineAssets, sink: FrameSink) -> Result<()> {
            if self.fail_start {
                return Err(RelayError::EngineStart("no bundle".into()));
            }
            self.sink = Some(sink);
            self.record(Seen::Started);
            Ok(())
        }

        fn send_window_metrics(&mut self, metrics: WindowMetrics) -> Result<()> {
            self.record(Seen::Metrics(metrics));
            if let Some(sink) = &self.sink {
                let pixels = vec![0x7Fu8; metrics.width * metrics.height * 4];
                sink.present(&pixels, metrics.width * 4, metrics.height);
            }
            Ok(())
        }

        fn send_pointer_event(&mut self, event: PointerEvent) -> Result<()> {
            self.record(Seen::Pointer(event));
            Ok(())
        }

        fn send_scroll_event(&mut self, event: ScrollEvent) -> Result<()> {
            self.record(Seen::Scroll(event));
            Ok(())
        }

        fn current_time_micros(&self) -> u64 {
            let next = self.clock.get() + 10;
            self.clock.set(next);
            next
        }

        fn shutdown(&mut self) {
            self.record(Seen::Shutdown);
        }
    }

    fn assets() -> EngineAssets {
        EngineAssets {
            assets_path: PathBuf::from("assets"),
            data_path: PathBuf::from("data"),
        }
    }

    fn config() -> RendererConfig {
        RendererConfig {
            install_signal_handlers: false,
            initial_width: 40,
            initial_height: 30,
            ..RendererConfig::default()
        }
    }

    fn host(name: &str) -> SharedRegionHandle {
        SharedRegionHandle::create(
            name,
            RegionConfig {
                max_width: 256,
                max_height: 256,
            },
        )
        .unwrap()
    }

    fn patient() -> RetryPolicy {
        RetryPolicy::with_timeout(Duration::from_secs(5))
    }

    fn wait_for_status(region: &SharedRegionHandle, want: Status) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while region.status().unwrap() != want {
            assert!(Instant::now() < deadline, "status never became {want:?}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_lifecycle_and_pointer_echo() {
        let name = "relay_test_renderer_echo";
        let host = host(name);
        let log = Arc::new(Mutex::new(Vec::new()));

        let engine = RecordingEngine::new(log.clone());
        let worker = thread::spawn(move || {
            let args = RendererArgs {
                region_name: name.to_string(),
                assets: assets(),
            };
            run(&args, engine, config()).unwrap()
        });

        wait_for_status(&host, Status::Ready);

        mailbox::send_command(
            &host,
            &Command::Pointer {
                x: 10.0,
                y: 20.0,
                phase: PointerPhase::Down,
                buttons: 1,
            },
            &patient(),
        );
        mailbox::send_command(
            &host,
            &Command::Pointer {
                x: 11.0,
                y: 21.0,
                phase: PointerPhase::Up,
                buttons: 0,
            },
            &patient(),
        );
        mailbox::send_command(&host, &Command::Shutdown, &patient());

        let summary = worker.join().unwrap();
        assert_eq!(host.status().unwrap(), Status::Shutdown);
        assert_eq!(summary.commands, 3);
        assert_eq!(summary.frames, 1);

        let log = log.lock().unwrap();
        assert_eq!(log[0], Seen::Started);
        assert_eq!(
            log[1],
            Seen::Metrics(WindowMetrics {
                width: 40,
                height: 30,
                pixel_ratio: 1.0
            })
        );

        let pointers: Vec<PointerEvent> = log
            .iter()
            .filter_map(|s| match s {
                Seen::Pointer(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(pointers.len(), 2);
        assert_eq!(pointers[0].phase, PointerPhase::Down);
        assert_eq!((pointers[0].x, pointers[0].y), (10.0, 20.0));
        assert_eq!(pointers[0].buttons, 1);
        assert_eq!(pointers[0].device, 0);
        assert_eq!(pointers[0].signal_kind, PointerSignalKind::None);
        assert_eq!(pointers[1].phase, PointerPhase::Up);
        assert!(pointers[1].timestamp > pointers[0].timestamp);

        assert_eq!(log.last(), Some(&Seen::Shutdown));
    }

    #[test]
    fn test_resize_scales_metrics_and_input() {
        let name = "relay_test_renderer_resize";
        let host = host(name);
        let log = Arc::new(Mutex::new(Vec::new()));
        let region = Arc::new(SharedRegionHandle::open(name).unwrap());

        let mut renderer = Renderer::attach(region, RecordingEngine::new(log.clone()), config());
        assert_eq!(host.status().unwrap(), Status::Initializing);
        renderer.start(&assets()).unwrap();
        assert_eq!(host.status().unwrap(), Status::Ready);

        let mut reader = FrameReader::new();
        assert_eq!(reader.poll(&host).map(|f| (f.width, f.height)), Some((40, 30)));

        mailbox::send_command(
            &host,
            &Command::Resize {
                width: 100,
                height: 50,
                pixel_ratio: 2.0,
            },
            &RetryPolicy::default(),
        );
        assert!(renderer.process_command());

        // Metrics went out before the ack, so the frame is already there
        let frame = reader.poll(&host).unwrap();
        assert_eq!((frame.width, frame.height), (200, 100));
        assert!(frame.pixels.iter().all(|b| *b == 0x7F));

        mailbox::send_command(
            &host,
            &Command::Scroll {
                x: 5.0,
                y: 6.0,
                dx: 0.0,
                dy: -3.0,
            },
            &RetryPolicy::default(),
        );
        assert!(renderer.process_command());
        assert!(!renderer.process_command());

        let log = log.lock().unwrap();
        match log.last() {
            Some(Seen::Scroll(s)) => {
                assert_eq!((s.x, s.y), (10.0, 12.0));
                assert_eq!((s.delta_x, s.delta_y), (0.0, -3.0));
                assert_eq!(s.phase, PointerPhase::Hover);
                assert_eq!(s.signal_kind, PointerSignalKind::Scroll);
                assert_eq!(s.device, 0);
            }
            other => panic!("expected scroll, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_resize_is_ignored_but_acked() {
        let name = "relay_test_renderer_bad_resize";
        let host = host(name);
        let log = Arc::new(Mutex::new(Vec::new()));
        let region = Arc::new(SharedRegionHandle::open(name).unwrap());
        let mut renderer = Renderer::attach(region, RecordingEngine::new(log.clone()), config());
        renderer.start(&assets()).unwrap();

        for bad in [(0, 10, 1.0), (10, -1, 1.0), (10, 10, f64::NAN), (10, 10, 0.0)] {
            mailbox::send_command(
                &host,
                &Command::Resize {
                    width: bad.0,
                    height: bad.1,
                    pixel_ratio: bad.2,
                },
                &RetryPolicy::default(),
            );
            assert!(renderer.process_command());
            assert!(!mailbox::has_command(&host));
        }

        let metrics = log
            .lock()
            .unwrap()
            .iter()
            .filter(|s| matches!(s, Seen::Metrics(_)))
            .count();
        assert_eq!(metrics, 1);
        assert!(renderer.is_running());
    }

    #[test]
    fn test_resize_beyond_capacity_keeps_engine_alive() {
        let name = "relay_test_renderer_oversized";
        let host = host(name);
        let region = Arc::new(SharedRegionHandle::open(name).unwrap());
        let assets = EngineAssets {
            assets_path: PathBuf::from(env!("CARGO_MANIFEST_DIR")),
            data_path: PathBuf::from(env!("CARGO_MANIFEST_DIR")),
        };

        let mut renderer = Renderer::attach(region, SolidFillEngine::default(), config());
        renderer.start(&assets).unwrap();

        let resizes = [
            (i32::MAX, i32::MAX, 1.0),
            (200, 100, 1e300),
            (257, 1, 1.0),
            (20, 10, 1.0),
        ];
        for (width, height, pixel_ratio) in resizes {
            mailbox::send_command(
                &host,
                &Command::Resize {
                    width,
                    height,
                    pixel_ratio,
                },
                &RetryPolicy::default(),
            );
            assert!(renderer.process_command());
        }

        let mut reader = FrameReader::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(frame) = reader.poll(&host) {
                if (frame.width, frame.height) == (20, 10) {
                    break;
                }
                assert_eq!((frame.width, frame.height), (40, 30));
            }
            assert!(Instant::now() < deadline, "no frame after valid resize");
            thread::sleep(Duration::from_millis(1));
        }

        let summary = renderer.finish();
        assert_eq!(summary.dropped_frames, 0);
        assert_eq!(summary.commands, 4);
    }

    #[test]
    fn test_stop_flag_ends_loop_with_shutdown() {
        let name = "relay_test_renderer_stop";
        let host = host(name);
        let log = Arc::new(Mutex::new(Vec::new()));
        let region = Arc::new(SharedRegionHandle::open(name).unwrap());

        let mut renderer = Renderer::attach(region, RecordingEngine::new(log.clone()), config());
        renderer.start(&assets()).unwrap();

        let stop = renderer.stop_flag();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            stop.store(true, Ordering::SeqCst);
        });
        renderer.run_loop();
        stopper.join().unwrap();

        assert!(renderer.is_running());
        let summary = renderer.finish();
        assert_eq!(summary.commands, 0);
        assert_eq!(host.status().unwrap(), Status::Shutdown);
        assert_eq!(log.lock().unwrap().last(), Some(&Seen::Shutdown));
    }

    #[test]
    fn test_engine_start_failure_sets_error() {
        let name = "relay_test_renderer_fail";
        let host = host(name);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut engine = RecordingEngine::new(log);
        engine.fail_start = true;

        let args = RendererArgs {
            region_name: name.to_string(),
            assets: assets(),
        };
        let err = run(&args, engine, config()).unwrap_err();

        assert_eq!(exit_code_for(&err), exit_code::ENGINE);
        assert_eq!(host.status().unwrap(), Status::Error);
    }

    #[test]
    fn test_missing_region_fails_fast() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let args = RendererArgs {
            region_name: "relay_test_renderer_nowhere".to_string(),
            assets: assets(),
        };
        let err = run(&args, RecordingEngine::new(log.clone()), config()).unwrap_err();

        assert!(err.is_region_unavailable());
        assert_eq!(exit_code_for(&err), exit_code::REGION);
        assert!(log.lock().unwrap().is_empty());
    }
}
