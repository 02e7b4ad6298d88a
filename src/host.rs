//! Host side of a relay: owns the region and the renderer subprocess.

use crate::config::{HostConfig, RetryPolicy};
use crate::engine::EngineAssets;
use crate::error::{RelayError, Result};
use crate::frame::{Frame, FrameReader};
use crate::layout::{PointerPhase, SharedRegionHandle, Status};
use crate::mailbox::{self, Command, SendOutcome};
use rustix::process::{kill_process, Pid, Signal};
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How a graceful shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Renderer exit code, `None` when no subprocess was launched
    pub exit_code: Option<i32>,
    /// Commands overwritten during the channel's lifetime
    pub dropped_commands: u64,
}

/// Host handle for one renderer instance
#[derive(Debug)]
pub struct HostChannel {
    region: SharedRegionHandle,
    child: Option<Child>,
    config: HostConfig,
    reader: FrameReader,
    closed: bool,
}

impl HostChannel {
    /// Create the region without launching anything.
    pub fn create(name: &str, config: HostConfig) -> Result<Self> {
        let region = SharedRegionHandle::create(name, config.region)?;
        Ok(Self {
            region,
            child: None,
            config,
            reader: FrameReader::new(),
            closed: false,
        })
    }

    /// Create the region and spawn the renderer on it.
    ///
    /// Returns as soon as the process is spawned; poll [`status`](Self::status)
    /// or call [`wait_until_ready`](Self::wait_until_ready) before relying on
    /// commands being processed.
    pub fn create_and_launch(
        name: &str,
        assets: &EngineAssets,
        config: HostConfig,
    ) -> Result<Self> {
        let mut channel = Self::create(name, config)?;
        channel.launch(assets)?;
        Ok(channel)
    }

    fn launch(&mut self, assets: &EngineAssets) -> Result<()> {
        let path = &self.config.renderer_path;
        info!(
            renderer = %path.display(),
            region = self.region.name(),
            "spawning renderer"
        );

        let child = std::process::Command::new(path)
            .arg(self.region.name())
            .arg(&assets.assets_path)
            .arg(&assets.data_path)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| RelayError::Spawn {
                path: path.display().to_string(),
                source,
            })?;

        info!(pid = child.id(), "renderer started");
        self.child = Some(child);
        Ok(())
    }

    pub fn region(&self) -> &SharedRegionHandle {
        &self.region
    }

    pub fn status(&self) -> Result<Status> {
        self.region.status()
    }

    /// Block until the renderer reports `Ready`.
    pub fn wait_until_ready(&mut self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            match self.status()? {
                Status::Ready => {
                    info!(elapsed = ?started.elapsed(), "renderer ready");
                    return Ok(());
                }
                Status::Error => return Err(RelayError::EngineStartFailed),
                _ => {}
            }

            if let Some(code) = self.try_reap()? {
                return Err(RelayError::RendererExited { code });
            }
            if started.elapsed() >= timeout {
                return Err(RelayError::StartupTimeout(timeout));
            }
            std::thread::sleep(self.config.startup_poll_interval);
        }
    }

    /// OS process id of the launched renderer
    pub fn renderer_pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Whether the launched renderer is still alive
    pub fn is_renderer_running(&mut self) -> bool {
        matches!(self.child.as_mut().map(Child::try_wait), Some(Ok(None)))
    }

    pub fn send_resize(&self, width: i32, height: i32, pixel_ratio: f64) -> Result<SendOutcome> {
        self.send(Command::Resize {
            width,
            height,
            pixel_ratio,
        })
    }

    pub fn send_pointer(
        &self,
        x: f64,
        y: f64,
        phase: PointerPhase,
        buttons: i64,
    ) -> Result<SendOutcome> {
        self.send(Command::Pointer {
            x,
            y,
            phase,
            buttons,
        })
    }

    pub fn send_scroll(&self, x: f64, y: f64, dx: f64, dy: f64) -> Result<SendOutcome> {
        self.send(Command::Scroll { x, y, dx, dy })
    }

    pub fn send_init(&self) -> Result<SendOutcome> {
        self.send(Command::Init)
    }

    /// Send Shutdown and refuse every later send.
    ///
    /// Waits for a free slot longer than ordinary commands do.
    pub fn send_shutdown(&mut self) -> Result<SendOutcome> {
        if self.closed {
            return Err(RelayError::ChannelClosed);
        }
        self.closed = true;
        let policy = RetryPolicy::with_timeout(self.config.shutdown_send_timeout);
        Ok(mailbox::send_command(&self.region, &Command::Shutdown, &policy))
    }

    fn send(&self, cmd: Command) -> Result<SendOutcome> {
        if self.closed {
            return Err(RelayError::ChannelClosed);
        }
        Ok(mailbox::send_command(&self.region, &cmd, &self.config.retry))
    }

    /// Latest frame, if one was published since the previous call.
    pub fn poll_frame(&mut self) -> Option<Frame> {
        self.reader.poll(&self.region)
    }

    pub fn dropped_commands(&self) -> u64 {
        self.region.dropped_commands()
    }

    /// Shut the renderer down and release the region.
    ///
    /// Succeeds if the renderer reports `Shutdown` and exits within
    /// `timeout`. Otherwise the process is terminated, the region is still
    /// unlinked, and `ForcedTermination` is returned.
    pub fn shutdown_and_join(mut self, timeout: Duration) -> Result<ShutdownReport> {
        if !self.closed {
            self.send_shutdown()?;
        }

        let deadline = Instant::now() + timeout;
        let mut exit_code = None;
        loop {
            // Reap first: Shutdown is published before the process exits.
            if let Some(code) = self.try_reap()? {
                exit_code = code;
                if !matches!(self.status(), Ok(Status::Shutdown)) {
                    warn!(code, "renderer exited without acknowledging shutdown");
                    return Err(RelayError::RendererExited { code });
                }
            }

            let acknowledged = matches!(self.status(), Ok(Status::Shutdown));
            let exited = self.child.is_none();
            if acknowledged && exited {
                let report = ShutdownReport {
                    exit_code,
                    dropped_commands: self.dropped_commands(),
                };
                info!(?report, region = self.region.name(), "renderer shut down cleanly");
                return Ok(report);
            }

            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(self.config.shutdown_poll_interval);
        }

        warn!(
            ?timeout,
            region = self.region.name(),
            "renderer did not shut down in time, terminating"
        );
        if let Some(child) = self.child.take() {
            terminate(child, self.config.terminate_grace);
        }
        Err(RelayError::ForcedTermination(timeout))
    }

    /// Reap the child if it has exited. `Some(code)` once it is gone.
    fn try_reap(&mut self) -> Result<Option<Option<i32>>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        match child.try_wait().map_err(RelayError::Wait)? {
            Some(status) => {
                debug!(%status, "renderer exited");
                self.child = None;
                Ok(Some(status.code()))
            }
            None => Ok(None),
        }
    }
}

impl Drop for HostChannel {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        warn!(
            region = self.region.name(),
            "host channel dropped with renderer still attached"
        );

        if !self.closed {
            self.closed = true;
            let policy = RetryPolicy::with_timeout(self.config.shutdown_send_timeout);
            mailbox::send_command(&self.region, &Command::Shutdown, &policy);
        }

        let deadline = Instant::now() + self.config.terminate_grace;
        while Instant::now() < deadline {
            if !matches!(child.try_wait(), Ok(None)) {
                return;
            }
            std::thread::sleep(self.config.shutdown_poll_interval);
        }
        terminate(child, self.config.terminate_grace);
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Always reaps.
fn terminate(mut child: Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    if let Err(e) = kill_process(Pid::from_child(&child), Signal::Term) {
        debug!(error = %e, "SIGTERM failed");
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Ok(Some(status)) = child.try_wait() {
            info!(%status, "renderer terminated");
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    warn!(pid = child.id(), "renderer ignored SIGTERM, killing");
    let _ = child.kill();
    let _ = child.wait();
}
