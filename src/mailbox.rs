//! Single-slot command mailbox (host -> renderer)
//!
//! The host writes payload words, then `cmd_type`, then raises `cmd_ready`
//! with release ordering. The renderer observes `cmd_ready` with acquire
//! ordering, copies the command out and only then clears the flag.
//!
//! There is exactly one slot. If the renderer has not drained the previous
//! command within the sender's [`RetryPolicy`], the sender overwrites it:
//! the latest command always lands, intermediate ones may be lost. Callers
//! that need every scroll delta must accumulate them before sending.

use crate::config::RetryPolicy;
use crate::error::{RelayError, Result};
use crate::layout::{cmd_tag, CommandBlock, PointerPhase, SharedRegionHandle};
use std::sync::atomic::Ordering;
use tracing::warn;

/// A decoded mailbox command
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    None,
    /// Logical size plus device pixel ratio
    Resize {
        width: i32,
        height: i32,
        pixel_ratio: f64,
    },
    /// Pointer transition in logical coordinates
    Pointer {
        x: f64,
        y: f64,
        phase: PointerPhase,
        buttons: i64,
    },
    /// Discrete scroll at a logical position
    Scroll { x: f64, y: f64, dx: f64, dy: f64 },
    Shutdown,
    Init,
}

impl Command {
    /// Wire tag written to `cmd_type`
    pub fn tag(&self) -> u32 {
        match self {
            Command::None => cmd_tag::NONE,
            Command::Resize { .. } => cmd_tag::RESIZE,
            Command::Pointer { .. } => cmd_tag::POINTER,
            Command::Scroll { .. } => cmd_tag::SCROLL,
            Command::Shutdown => cmd_tag::SHUTDOWN,
            Command::Init => cmd_tag::INIT,
        }
    }
}

/// Whether a send landed in a free slot or replaced a pending command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Overwrote,
}

/// Write `cmd` into the mailbox.
///
/// Waits up to `policy` for the slot to drain, then writes regardless.
/// Overwrites are counted on the handle and logged.
pub fn send_command(
    region: &SharedRegionHandle,
    cmd: &Command,
    policy: &RetryPolicy,
) -> SendOutcome {
    let free = wait_for_free_slot(region, policy);
    let block = &region.header().cmd;

    write_payload(block, cmd);
    block.cmd_type.store(cmd.tag(), Ordering::Release);
    block.cmd_ready.store(1, Ordering::Release);

    if free {
        SendOutcome::Delivered
    } else {
        let dropped = region.count_dropped_command();
        warn!(
            region = region.name(),
            command = ?cmd,
            dropped,
            "mailbox busy, overwrote pending command"
        );
        SendOutcome::Overwrote
    }
}

/// Non-blocking check for a pending command.
#[inline]
pub fn has_command(region: &SharedRegionHandle) -> bool {
    region.header().cmd.cmd_ready.load(Ordering::Acquire) == 1
}

/// Copy out the pending command, if any, without acknowledging it.
///
/// A malformed command is still pending afterwards; the caller must ack it
/// like any other.
pub fn take_command(region: &SharedRegionHandle) -> Option<Result<Command>> {
    if !has_command(region) {
        return None;
    }
    Some(read_command(&region.header().cmd))
}

/// Release the slot. Must follow the payload read.
#[inline]
pub fn ack_command(region: &SharedRegionHandle) {
    region.header().cmd.cmd_ready.store(0, Ordering::Release);
}

fn wait_for_free_slot(region: &SharedRegionHandle, policy: &RetryPolicy) -> bool {
    let ready = &region.header().cmd.cmd_ready;
    for _ in 0..policy.attempts {
        if ready.load(Ordering::Acquire) == 0 {
            return true;
        }
        if policy.backoff.is_zero() {
            core::hint::spin_loop();
        } else {
            std::thread::sleep(policy.backoff);
        }
    }
    ready.load(Ordering::Acquire) == 0
}

fn write_payload(block: &CommandBlock, cmd: &Command) {
    match *cmd {
        Command::Resize {
            width,
            height,
            pixel_ratio,
        } => {
            block.width.store(width, Ordering::Relaxed);
            block.height.store(height, Ordering::Relaxed);
            block.pixel_ratio.store(pixel_ratio.to_bits(), Ordering::Relaxed);
        }
        Command::Pointer {
            x,
            y,
            phase,
            buttons,
        } => {
            block.pointer_phase.store(phase as i32, Ordering::Relaxed);
            block.pointer_x.store(x.to_bits(), Ordering::Relaxed);
            block.pointer_y.store(y.to_bits(), Ordering::Relaxed);
            block.pointer_buttons.store(buttons, Ordering::Relaxed);
        }
        Command::Scroll { x, y, dx, dy } => {
            block.scroll_x.store(x.to_bits(), Ordering::Relaxed);
            block.scroll_y.store(y.to_bits(), Ordering::Relaxed);
            block.scroll_delta_x.store(dx.to_bits(), Ordering::Relaxed);
            block.scroll_delta_y.store(dy.to_bits(), Ordering::Relaxed);
        }
        Command::None | Command::Shutdown | Command::Init => {}
    }
}

fn read_command(block: &CommandBlock) -> Result<Command> {
    let f64_at = |word: &std::sync::atomic::AtomicU64| f64::from_bits(word.load(Ordering::Relaxed));

    Ok(match block.cmd_type.load(Ordering::Acquire) {
        cmd_tag::NONE => Command::None,
        cmd_tag::RESIZE => Command::Resize {
            width: block.width.load(Ordering::Relaxed),
            height: block.height.load(Ordering::Relaxed),
            pixel_ratio: f64_at(&block.pixel_ratio),
        },
        cmd_tag::POINTER => Command::Pointer {
            x: f64_at(&block.pointer_x),
            y: f64_at(&block.pointer_y),
            phase: PointerPhase::try_from(block.pointer_phase.load(Ordering::Relaxed))?,
            buttons: block.pointer_buttons.load(Ordering::Relaxed),
        },
        cmd_tag::SCROLL => Command::Scroll {
            x: f64_at(&block.scroll_x),
            y: f64_at(&block.scroll_y),
            dx: f64_at(&block.scroll_delta_x),
            dy: f64_at(&block.scroll_delta_y),
        },
        cmd_tag::SHUTDOWN => Command::Shutdown,
        cmd_tag::INIT => Command::Init,
        other => return Err(RelayError::UnknownCommand(other)),
    })
}
