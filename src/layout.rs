//! Shared region layout contract.
//!
//! Both processes map the same object and view its first [`HEADER_SIZE`]
//! bytes as a [`RegionHeader`]; the RGBA pixel buffer follows immediately.
//! The byte offsets match the C layout used by non-Rust peers:
//!
//! ```text
//!   0  magic            u32   renderer/host handshake, "FLTR" little-endian
//!   4  width            u32   last published frame
//!   8  height           u32
//!  16  frame_number     u64   bumped once per published frame
//!  24  status           u32   Status
//!  28  max_width        u32   pixel capacity, fixed at creation
//!  32  max_height       u32
//!  64  cmd_type         u32   mailbox tag (see `cmd_tag`)
//!  68  cmd_ready        u32   1 = command pending
//!  72  command payload        flat union of every command's arguments
//! 176  pixels           [u8; max_width * max_height * 4]
//! ```
//!
//! Ownership of the words is split: the renderer writes the frame fields and
//! `status`, the host writes the command fields, and `cmd_ready` is set by
//! the host and cleared by the renderer.

use crate::config::RegionConfig;
use crate::error::{RelayError, Result};
use crate::shm::ShmSegment;
use std::mem::offset_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use tracing::info;

/// `b"FLTR"` as a little-endian `u32`.
pub const REGION_MAGIC: u32 = 0x5254_4C46;

/// Bytes before the pixel buffer.
pub const HEADER_SIZE: usize = 176;

/// Mailbox tags stored in `cmd_type`.
pub mod cmd_tag {
    pub const NONE: u32 = 0;
    pub const RESIZE: u32 = 1;
    pub const POINTER: u32 = 2;
    pub const SCROLL: u32 = 3;
    pub const SHUTDOWN: u32 = 4;
    pub const INIT: u32 = 5;
}

/// Renderer lifecycle, written only by the renderer.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    NotReady = 0,
    Initializing = 1,
    Ready = 2,
    Error = 3,
    Shutdown = 4,
}

impl Status {
    /// No further transition will happen
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Error | Status::Shutdown)
    }
}

impl TryFrom<u32> for Status {
    type Error = RelayError;

    fn try_from(value: u32) -> std::result::Result<Self, RelayError> {
        Ok(match value {
            0 => Status::NotReady,
            1 => Status::Initializing,
            2 => Status::Ready,
            3 => Status::Error,
            4 => Status::Shutdown,
            other => return Err(RelayError::UnknownStatus(other)),
        })
    }
}

/// Kind of pointer transition, numbered like the engine's own phases.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerPhase {
    Cancel = 0,
    Up = 1,
    Down = 2,
    Move = 3,
    Add = 4,
    Remove = 5,
    Hover = 6,
    PanZoomStart = 7,
    PanZoomUpdate = 8,
    PanZoomEnd = 9,
}

impl TryFrom<i32> for PointerPhase {
    type Error = RelayError;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            0 => PointerPhase::Cancel,
            1 => PointerPhase::Up,
            2 => PointerPhase::Down,
            3 => PointerPhase::Move,
            4 => PointerPhase::Add,
            5 => PointerPhase::Remove,
            6 => PointerPhase::Hover,
            7 => PointerPhase::PanZoomStart,
            8 => PointerPhase::PanZoomUpdate,
            9 => PointerPhase::PanZoomEnd,
            other => return Err(RelayError::UnknownPointerPhase(other)),
        })
    }
}

/// Mailbox words. Floats travel as their IEEE-754 bit patterns.
#[repr(C)]
pub(crate) struct CommandBlock {
    pub(crate) cmd_type: AtomicU32,
    pub(crate) cmd_ready: AtomicU32,
    pub(crate) width: AtomicI32,
    pub(crate) height: AtomicI32,
    pub(crate) pixel_ratio: AtomicU64,
    pub(crate) pointer_x: AtomicU64,
    pub(crate) pointer_y: AtomicU64,
    pub(crate) pointer_phase: AtomicI32,
    _pad0: u32,
    pub(crate) pointer_buttons: AtomicI64,
    pub(crate) scroll_x: AtomicU64,
    pub(crate) scroll_y: AtomicU64,
    pub(crate) scroll_delta_x: AtomicU64,
    pub(crate) scroll_delta_y: AtomicU64,
    _pad1: [u8; 24],
}

/// Header at the start of every region
#[repr(C)]
pub struct RegionHeader {
    pub(crate) magic: AtomicU32,
    pub(crate) width: AtomicU32,
    pub(crate) height: AtomicU32,
    _pad0: u32,
    pub(crate) frame_number: AtomicU64,
    pub(crate) status: AtomicU32,
    pub(crate) max_width: AtomicU32,
    pub(crate) max_height: AtomicU32,
    _pad1: [u32; 7],
    pub(crate) cmd: CommandBlock,
}

const _: () = {
    assert!(std::mem::size_of::<RegionHeader>() == HEADER_SIZE);
    assert!(offset_of!(RegionHeader, frame_number) == 16);
    assert!(offset_of!(RegionHeader, status) == 24);
    assert!(offset_of!(RegionHeader, max_width) == 28);
    assert!(offset_of!(RegionHeader, cmd) == 64);
    assert!(offset_of!(CommandBlock, width) == 8);
    assert!(offset_of!(CommandBlock, pixel_ratio) == 16);
    assert!(offset_of!(CommandBlock, pointer_phase) == 40);
    assert!(offset_of!(CommandBlock, pointer_buttons) == 48);
    assert!(offset_of!(CommandBlock, scroll_delta_y) == 80);
};

/// Total object size for a given capacity, `None` on overflow
pub const fn region_size(config: &RegionConfig) -> Option<usize> {
    match config.pixel_capacity() {
        Some(pixels) => pixels.checked_add(HEADER_SIZE),
        None => None,
    }
}

fn checked_region_size(config: &RegionConfig) -> Result<usize> {
    region_size(config).ok_or(RelayError::InvalidCapacity {
        max_width: config.max_width,
        max_height: config.max_height,
    })
}

/// A name unique to this process and call, e.g. `surface_4242_0`.
pub fn unique_region_name(prefix: &str) -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!(
        "{}_{}_{}",
        prefix,
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

/// One process's view of a region.
///
/// Every protocol operation takes this handle explicitly, so a single process
/// can hold several regions at once.
pub struct SharedRegionHandle {
    shm: ShmSegment,
    header: NonNull<RegionHeader>,
    capacity: RegionConfig,
    dropped_commands: AtomicU64,
}

// SAFETY: header words are atomics; the pixel buffer has a single writer
// process and readers tolerate tearing.
unsafe impl Send for SharedRegionHandle {}
unsafe impl Sync for SharedRegionHandle {}

impl std::fmt::Debug for SharedRegionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegionHandle")
            .field("name", &self.name())
            .field("owner", &self.is_owner())
            .field("capacity", &self.capacity)
            .field("dropped_commands", &self.dropped_commands())
            .finish()
    }
}

impl SharedRegionHandle {
    /// Create and initialise a region (host side, owner).
    pub fn create(name: &str, config: RegionConfig) -> Result<Self> {
        let shm = ShmSegment::create(name, checked_region_size(&config)?)?;
        let header = header_ptr(&shm);

        unsafe {
            std::ptr::write_bytes(shm.as_ptr(), 0, HEADER_SIZE);
        }
        let handle = Self {
            shm,
            header,
            capacity: config,
            dropped_commands: AtomicU64::new(0),
        };

        let h = handle.header();
        h.max_width.store(config.max_width, Ordering::Relaxed);
        h.max_height.store(config.max_height, Ordering::Relaxed);
        h.status.store(Status::NotReady as u32, Ordering::Relaxed);
        h.magic.store(REGION_MAGIC, Ordering::Release);

        info!(
            name = handle.name(),
            bytes = handle.shm.size(),
            max_width = config.max_width,
            max_height = config.max_height,
            "created region"
        );
        Ok(handle)
    }

    /// Open a region created by another process (renderer side).
    pub fn open(name: &str) -> Result<Self> {
        let shm = ShmSegment::open(name, HEADER_SIZE)?;
        let header = header_ptr(&shm);
        let h = unsafe { header.as_ref() };

        let magic = h.magic.load(Ordering::Acquire);
        if magic != REGION_MAGIC {
            return Err(RelayError::InvalidMagic {
                expected: REGION_MAGIC,
                got: magic,
            });
        }

        let capacity = RegionConfig {
            max_width: h.max_width.load(Ordering::Relaxed),
            max_height: h.max_height.load(Ordering::Relaxed),
        };
        let needed = checked_region_size(&capacity)?;
        if shm.size() < needed {
            return Err(RelayError::RegionTooSmall {
                needed,
                actual: shm.size(),
            });
        }

        info!(name = shm.name(), "opened region");
        Ok(Self {
            shm,
            header,
            capacity,
            dropped_commands: AtomicU64::new(0),
        })
    }

    /// Unmap, and unlink if this handle created the region.
    pub fn close(self) {
        info!(name = self.name(), owner = self.is_owner(), "closing region");
    }

    #[inline(always)]
    pub(crate) fn header(&self) -> &RegionHeader {
        unsafe { self.header.as_ref() }
    }

    #[inline(always)]
    pub(crate) fn pixels_ptr(&self) -> *mut u8 {
        unsafe { self.shm.as_ptr().add(HEADER_SIZE) }
    }

    /// Current renderer status.
    pub fn status(&self) -> Result<Status> {
        Status::try_from(self.header().status.load(Ordering::Acquire))
    }

    /// Publish a lifecycle transition (renderer side).
    pub fn set_status(&self, status: Status) {
        self.header()
            .status
            .store(status as u32, Ordering::Release);
    }

    /// Counter of published frames.
    pub fn frame_number(&self) -> u64 {
        self.header().frame_number.load(Ordering::Acquire)
    }

    /// Fixed pixel capacity of this region.
    pub fn capacity(&self) -> RegionConfig {
        self.capacity
    }

    /// OS-level name, with leading `/`
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    pub fn is_owner(&self) -> bool {
        self.shm.is_owner()
    }

    /// Commands this handle overwrote after exhausting its retry budget.
    pub fn dropped_commands(&self) -> u64 {
        self.dropped_commands.load(Ordering::Relaxed)
    }

    pub(crate) fn count_dropped_command(&self) -> u64 {
        self.dropped_commands.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn header_ptr(shm: &ShmSegment) -> NonNull<RegionHeader> {
    // SAFETY: mmap results are page aligned and non-null.
    unsafe { NonNull::new_unchecked(shm.as_ptr().cast::<RegionHeader>()) }
}
