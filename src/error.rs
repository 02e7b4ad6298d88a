//! Error types for surface_relay

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for surface_relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while creating, driving or tearing down a relay
#[derive(Debug, Error)]
pub enum RelayError {
    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Invalid region magic number
    #[error("Invalid region magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Mapped object is smaller than the layout its header describes
    #[error("Shared memory too small: need {needed} bytes, object has {actual}")]
    RegionTooSmall { needed: usize, actual: usize },

    /// Header capacity does not describe a mappable pixel buffer
    #[error("Invalid region capacity {max_width}x{max_height}")]
    InvalidCapacity { max_width: u32, max_height: u32 },

    /// Region name is not usable as a POSIX shared memory name
    #[error("Invalid region name '{0}'")]
    InvalidName(String),

    /// Region name too long
    #[error("Region name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },

    /// Frame does not fit the fixed pixel buffer
    #[error("Frame too large: {width}x{height} exceeds capacity {max_width}x{max_height}")]
    FrameTooLarge {
        width: usize,
        height: usize,
        max_width: u32,
        max_height: u32,
    },

    /// Frame geometry is inconsistent with the bytes supplied
    #[error("Malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// Mailbox carried a tag this build does not know
    #[error("Unknown command type: {0}")]
    UnknownCommand(u32),

    /// Pointer command carried a phase this build does not know
    #[error("Unknown pointer phase: {0}")]
    UnknownPointerPhase(i32),

    /// Status word carried a value this build does not know
    #[error("Unknown renderer status: {0}")]
    UnknownStatus(u32),

    /// The rendering engine failed to start (renderer side)
    #[error("Rendering engine failed to start: {0}")]
    EngineStart(String),

    /// The rendering engine rejected an event or is not running
    #[error("Rendering engine error: {0}")]
    Engine(String),

    /// The renderer reported `Error` status (host side)
    #[error("Renderer reported an engine start failure")]
    EngineStartFailed,

    /// Failed to launch the renderer subprocess
    #[error("Failed to spawn renderer '{path}': {source}")]
    Spawn {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The renderer subprocess exited while the host was waiting on it
    #[error("Renderer exited unexpectedly (exit code {code:?})")]
    RendererExited { code: Option<i32> },

    /// The renderer never reached `Ready`
    #[error("Renderer not ready after {0:?}")]
    StartupTimeout(Duration),

    /// The renderer did not acknowledge shutdown and was killed
    #[error("Renderer did not shut down within {0:?}; terminated forcibly")]
    ForcedTermination(Duration),

    /// The channel already sent Shutdown
    #[error("Channel is closed")]
    ChannelClosed,

    /// Waiting on the renderer process failed
    #[error("Failed to wait on renderer: {0}")]
    Wait(#[source] io::Error),
}

impl RelayError {
    /// The region could not be created, opened or mapped at the OS level.
    pub fn is_region_unavailable(&self) -> bool {
        matches!(
            self,
            RelayError::ShmCreate { .. }
                | RelayError::ShmOpen { .. }
                | RelayError::Mmap(_)
                | RelayError::Truncate(_)
                | RelayError::InvalidName(_)
                | RelayError::NameTooLong { .. }
        )
    }

    /// The region exists but its contents do not describe a valid layout.
    pub fn is_region_invalid(&self) -> bool {
        matches!(
            self,
            RelayError::InvalidMagic { .. }
                | RelayError::RegionTooSmall { .. }
                | RelayError::InvalidCapacity { .. }
        )
    }
}
