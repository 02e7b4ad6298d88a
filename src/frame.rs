//! Frame publication (renderer -> host)
//!
//! The renderer copies a finished frame into the pixel buffer, stores its
//! dimensions, then bumps `frame_number` with release ordering. A host that
//! observes a new counter value with acquire ordering therefore sees
//! dimensions matching the pixels written for that value.
//!
//! The buffer is not double-buffered: a host reading while the next frame is
//! being copied in may see a torn image. The next counter change repairs it.

use crate::error::{RelayError, Result};
use crate::layout::SharedRegionHandle;
use std::sync::atomic::Ordering;

/// An owned copy of a published frame, tightly packed RGBA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub frame_number: u64,
    pub pixels: Vec<u8>,
}

impl Frame {
    #[inline]
    pub fn row_bytes(&self) -> usize {
        self.width as usize * 4
    }
}

/// Publish one frame given as `height` rows of `row_bytes` each.
///
/// Width is `row_bytes / 4`. Frames larger than the region's capacity are
/// rejected before anything is written, and the counter does not move.
/// Returns the new frame number.
pub fn publish_frame(
    region: &SharedRegionHandle,
    pixels: &[u8],
    row_bytes: usize,
    height: usize,
) -> Result<u64> {
    if row_bytes == 0 || height == 0 {
        return Err(RelayError::MalformedFrame("empty frame"));
    }
    if row_bytes % 4 != 0 {
        return Err(RelayError::MalformedFrame(
            "row stride is not a whole number of RGBA pixels",
        ));
    }

    let width = row_bytes / 4;
    let cap = region.capacity();
    if !cap.fits(width, height) {
        return Err(RelayError::FrameTooLarge {
            width,
            height,
            max_width: cap.max_width,
            max_height: cap.max_height,
        });
    }

    // Bounded by capacity above, cannot overflow
    let len = row_bytes * height;
    if pixels.len() < len {
        return Err(RelayError::MalformedFrame(
            "pixel buffer shorter than stride * height",
        ));
    }

    unsafe {
        std::ptr::copy_nonoverlapping(pixels.as_ptr(), region.pixels_ptr(), len);
    }

    let header = region.header();
    header.width.store(width as u32, Ordering::Relaxed);
    header.height.store(height as u32, Ordering::Relaxed);
    Ok(header.frame_number.fetch_add(1, Ordering::Release) + 1)
}

/// Host-side cursor over published frames
#[derive(Debug, Default)]
pub struct FrameReader {
    last_seen: u64,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame number of the last frame this reader consumed
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Copy out the latest frame if the counter moved since the last call.
    pub fn poll(&mut self, region: &SharedRegionHandle) -> Option<Frame> {
        let header = region.header();
        let frame_number = header.frame_number.load(Ordering::Acquire);
        if frame_number == self.last_seen {
            return None;
        }
        self.last_seen = frame_number;

        let width = header.width.load(Ordering::Acquire);
        let height = header.height.load(Ordering::Acquire);
        let cap = region.capacity();
        if width == 0 || height == 0 || width > cap.max_width || height > cap.max_height {
            return None;
        }

        let len = width as usize * height as usize * 4;
        let mut pixels = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(region.pixels_ptr(), pixels.as_mut_ptr(), len);
        }

        Some(Frame {
            width,
            height,
            frame_number,
            pixels,
        })
    }
}
