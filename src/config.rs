//! Tunables for the region, the mailbox and both processes

use std::path::PathBuf;
use std::time::Duration;

/// Default pixel capacity: 4096 x 4096 RGBA (64 MiB)
pub const DEFAULT_MAX_WIDTH: u32 = 4096;
pub const DEFAULT_MAX_HEIGHT: u32 = 4096;

/// Environment variable consulted for the renderer executable
pub const RENDERER_PATH_ENV: &str = "SURFACE_RELAY_RENDERER";

/// Executable name looked up on `PATH` when nothing else is configured
pub const DEFAULT_RENDERER_BIN: &str = "surface-renderer";

/// Fixed pixel capacity of a region, chosen once by the creator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionConfig {
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            max_width: DEFAULT_MAX_WIDTH,
            max_height: DEFAULT_MAX_HEIGHT,
        }
    }
}

impl RegionConfig {
    /// Bytes reserved for pixels, `None` if that does not fit in `usize`
    pub const fn pixel_capacity(&self) -> Option<usize> {
        match (self.max_width as usize).checked_mul(self.max_height as usize) {
            Some(pixels) => pixels.checked_mul(4),
            None => None,
        }
    }

    /// Whether a `width` x `height` frame fits the pixel buffer
    pub fn fits(&self, width: usize, height: usize) -> bool {
        width <= self.max_width as usize && height <= self.max_height as usize
    }
}

/// Bounded wait used by the mailbox sender before it overwrites a pending
/// command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of times the slot is re-checked
    pub attempts: u32,
    /// Sleep between checks; zero spins instead
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 100,
            backoff: Duration::from_micros(100),
        }
    }
}

impl RetryPolicy {
    /// Policy whose total wait is roughly `timeout` at the default backoff.
    pub fn with_timeout(timeout: Duration) -> Self {
        let backoff = Self::default().backoff;
        let attempts = (timeout.as_micros() / backoff.as_micros().max(1)).max(1);
        Self {
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            backoff,
        }
    }
}

/// Renderer subprocess settings
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Sleep at the end of every loop iteration
    pub idle_sleep: Duration,
    /// Route SIGINT/SIGTERM/SIGHUP to a clean shutdown
    pub install_signal_handlers: bool,
    /// Logical size assumed before the first resize
    pub initial_width: u32,
    pub initial_height: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            idle_sleep: Duration::from_millis(1),
            install_signal_handlers: true,
            initial_width: 800,
            initial_height: 600,
        }
    }
}

/// Host side settings
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub renderer_path: PathBuf,
    pub region: RegionConfig,
    pub retry: RetryPolicy,
    /// Hard bound on waiting for a free slot before Shutdown overwrites it
    pub shutdown_send_timeout: Duration,
    pub startup_poll_interval: Duration,
    pub shutdown_poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL on forced termination
    pub terminate_grace: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        let renderer_path = std::env::var_os(RENDERER_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RENDERER_BIN));

        Self {
            renderer_path,
            region: RegionConfig::default(),
            retry: RetryPolicy::default(),
            shutdown_send_timeout: Duration::from_millis(500),
            startup_poll_interval: Duration::from_millis(5),
            shutdown_poll_interval: Duration::from_millis(10),
            terminate_grace: Duration::from_millis(500),
        }
    }
}

impl HostConfig {
    pub fn with_renderer_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.renderer_path = path.into();
        self
    }

    pub fn with_region(mut self, region: RegionConfig) -> Self {
        self.region = region;
        self
    }
}
