//! surface_relay - Cross-process UI surface relay over shared memory
//!
//! A host process that owns a native graphics surface delegates UI rendering
//! to a renderer subprocess and composites the frames it produces. The two
//! processes share one fixed-size region and coordinate only through atomics.
//!
//! # Architecture
//!
//! - **Host**: creates the region, launches the renderer, sends commands,
//!   polls frames ([`HostChannel`])
//! - **Renderer**: opens the region, drives a [`RenderEngine`], publishes
//!   frames ([`renderer::run`])
//!
//! # Protocols
//!
//! - Commands: single-slot mailbox, latest command wins ([`mailbox`])
//! - Frames: counter-based publication into one pixel buffer ([`frame`])

pub mod error;
pub mod config;
pub mod shm;
pub mod layout;
pub mod mailbox;
pub mod frame;
pub mod engine;
pub mod renderer;
pub mod host;
pub mod bindings;

pub use config::{HostConfig, RegionConfig, RendererConfig, RetryPolicy};
pub use engine::{EngineAssets, FrameSink, RenderEngine, SolidFillEngine};
pub use error::{RelayError, Result};
pub use frame::{Frame, FrameReader};
pub use host::{HostChannel, ShutdownReport};
pub use layout::{unique_region_name, PointerPhase, SharedRegionHandle, Status};
pub use mailbox::{Command, SendOutcome};
