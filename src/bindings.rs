//! C Bindings for surface_relay
//!
//! Exposes the host side to embedders that are not written in Rust.

use crate::config::HostConfig;
use crate::engine::EngineAssets;
use crate::error::RelayError;
use crate::frame::Frame;
use crate::host::HostChannel;
use crate::layout::PointerPhase;
use crate::mailbox::SendOutcome;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::path::PathBuf;
use std::ptr;
use std::time::Duration;

/// Opaque host handle
pub struct SurfaceRelayHost {
    channel: HostChannel,
    /// Frame consumed from the region but not yet copied out
    pending: Option<Frame>,
}

unsafe fn opt_str<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    CStr::from_ptr(s).to_str().ok()
}

fn send_result(result: crate::Result<SendOutcome>) -> c_int {
    match result {
        Ok(SendOutcome::Delivered) => 0,
        Ok(SendOutcome::Overwrote) => 1,
        Err(_) => -1,
    }
}

/// Create a region and launch the renderer on it
///
/// `renderer_path` may be null to use the default lookup.
/// Returns null on failure.
///
/// # Safety
/// All non-null pointers must be valid null-terminated strings
#[no_mangle]
pub unsafe extern "C" fn surface_relay_host_create_and_launch(
    name: *const c_char,
    renderer_path: *const c_char,
    assets_path: *const c_char,
    data_path: *const c_char,
) -> *mut SurfaceRelayHost {
    let (Some(name), Some(assets_path), Some(data_path)) =
        (opt_str(name), opt_str(assets_path), opt_str(data_path))
    else {
        return ptr::null_mut();
    };

    let mut config = HostConfig::default();
    if let Some(path) = opt_str(renderer_path) {
        config.renderer_path = PathBuf::from(path);
    }

    let assets = EngineAssets {
        assets_path: PathBuf::from(assets_path),
        data_path: PathBuf::from(data_path),
    };

    match HostChannel::create_and_launch(name, &assets, config) {
        Ok(channel) => Box::into_raw(Box::new(SurfaceRelayHost {
            channel,
            pending: None,
        })),
        Err(e) => {
            tracing::error!(error = %e, "surface_relay_host_create_and_launch failed");
            ptr::null_mut()
        }
    }
}

/// Destroy a host handle, terminating the renderer if it is still running
///
/// # Safety
/// `handle` must be null or a live pointer from `surface_relay_host_create_and_launch`
#[no_mangle]
pub unsafe extern "C" fn surface_relay_host_destroy(handle: *mut SurfaceRelayHost) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Returns 0 delivered, 1 overwrote a pending command, -1 error
///
/// # Safety
/// `handle` must be null or a live pointer from `surface_relay_host_create_and_launch`
#[no_mangle]
pub unsafe extern "C" fn surface_relay_host_send_resize(
    handle: *mut SurfaceRelayHost,
    width: i32,
    height: i32,
    pixel_ratio: f64,
) -> c_int {
    let Some(host) = handle.as_ref() else {
        return -1;
    };
    send_result(host.channel.send_resize(width, height, pixel_ratio))
}

/// Returns 0 delivered, 1 overwrote a pending command, -1 error or unknown phase
///
/// # Safety
/// `handle` must be null or a live pointer from `surface_relay_host_create_and_launch`
#[no_mangle]
pub unsafe extern "C" fn surface_relay_host_send_pointer(
    handle: *mut SurfaceRelayHost,
    phase: i32,
    x: f64,
    y: f64,
    buttons: i64,
) -> c_int {
    let Some(host) = handle.as_ref() else {
        return -1;
    };
    let Ok(phase) = PointerPhase::try_from(phase) else {
        return -1;
    };
    send_result(host.channel.send_pointer(x, y, phase, buttons))
}

/// Returns 0 delivered, 1 overwrote a pending command, -1 error
///
/// # Safety
/// `handle` must be null or a live pointer from `surface_relay_host_create_and_launch`
#[no_mangle]
pub unsafe extern "C" fn surface_relay_host_send_scroll(
    handle: *mut SurfaceRelayHost,
    x: f64,
    y: f64,
    delta_x: f64,
    delta_y: f64,
) -> c_int {
    let Some(host) = handle.as_ref() else {
        return -1;
    };
    send_result(host.channel.send_scroll(x, y, delta_x, delta_y))
}

/// Renderer status word, or -1
///
/// # Safety
/// `handle` must be null or a live pointer from `surface_relay_host_create_and_launch`
#[no_mangle]
pub unsafe extern "C" fn surface_relay_host_status(handle: *mut SurfaceRelayHost) -> c_int {
    match handle.as_ref().map(|h| h.channel.status()) {
        Some(Ok(status)) => status as c_int,
        _ => -1,
    }
}

/// Whether the renderer process is still alive
///
/// # Safety
/// `handle` must be null or a live pointer from `surface_relay_host_create_and_launch`
#[no_mangle]
pub unsafe extern "C" fn surface_relay_host_is_renderer_running(
    handle: *mut SurfaceRelayHost,
) -> bool {
    match handle.as_mut() {
        Some(host) => host.channel.is_renderer_running(),
        None => false,
    }
}

/// Copy the latest frame into `buf` as tightly packed RGBA
///
/// Returns 1 when a new frame was copied, 0 when there is none, -2 when
/// `buf` is too small (the frame is kept and `out_width`/`out_height` report
/// its size so the caller can retry), -1 on invalid arguments.
///
/// # Safety
/// `handle` as for the other calls; `buf` must be valid for `capacity`
/// bytes; out pointers may be null
#[no_mangle]
pub unsafe extern "C" fn surface_relay_host_poll_frame(
    handle: *mut SurfaceRelayHost,
    buf: *mut u8,
    capacity: usize,
    out_width: *mut u32,
    out_height: *mut u32,
) -> c_int {
    let Some(host) = handle.as_mut() else {
        return -1;
    };

    if host.pending.is_none() {
        host.pending = host.channel.poll_frame();
    }
    let Some(frame) = host.pending.as_ref() else {
        return 0;
    };

    if !out_width.is_null() {
        *out_width = frame.width;
    }
    if !out_height.is_null() {
        *out_height = frame.height;
    }

    if buf.is_null() || capacity < frame.pixels.len() {
        return -2;
    }

    ptr::copy_nonoverlapping(frame.pixels.as_ptr(), buf, frame.pixels.len());
    host.pending = None;
    1
}

/// Shut the renderer down and free the handle
///
/// Returns 0 on a clean shutdown, 1 if the renderer had to be terminated,
/// -1 on any other failure. The handle is invalid afterwards in every case.
///
/// # Safety
/// `handle` must be null or a live pointer from `surface_relay_host_create_and_launch`
#[no_mangle]
pub unsafe extern "C" fn surface_relay_host_shutdown(
    handle: *mut SurfaceRelayHost,
    timeout_ms: u64,
) -> c_int {
    if handle.is_null() {
        return -1;
    }
    let host = Box::from_raw(handle);
    match host.channel.shutdown_and_join(Duration::from_millis(timeout_ms)) {
        Ok(_) => 0,
        Err(RelayError::ForcedTermination(_)) => 1,
        Err(_) => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_null_handles_are_tolerated() {
        unsafe {
            assert_eq!(surface_relay_host_send_resize(ptr::null_mut(), 1, 1, 1.0), -1);
            assert_eq!(surface_relay_host_status(ptr::null_mut()), -1);
            assert!(!surface_relay_host_is_renderer_running(ptr::null_mut()));
            assert_eq!(
                surface_relay_host_poll_frame(
                    ptr::null_mut(),
                    ptr::null_mut(),
                    0,
                    ptr::null_mut(),
                    ptr::null_mut()
                ),
                -1
            );
            assert_eq!(surface_relay_host_shutdown(ptr::null_mut(), 0), -1);
            surface_relay_host_destroy(ptr::null_mut());
        }
    }

    #[test]
    fn test_poll_frame_keeps_frame_until_buffer_fits() {
        use crate::config::RegionConfig;
        use crate::frame::publish_frame;
        use crate::layout::{unique_region_name, SharedRegionHandle};

        let name = unique_region_name("relay_test_bindings_poll");
        let config = HostConfig::default().with_region(RegionConfig {
            max_width: 16,
            max_height: 16,
        });
        let channel = HostChannel::create(&name, config).unwrap();
        let renderer = SharedRegionHandle::open(&name).unwrap();
        let handle = Box::into_raw(Box::new(SurfaceRelayHost {
            channel,
            pending: None,
        }));

        let (mut width, mut height) = (0u32, 0u32);
        let mut buf = vec![0u8; 4 * 3 * 4];
        unsafe {
            let got = surface_relay_host_poll_frame(
                handle,
                buf.as_mut_ptr(),
                buf.len(),
                &mut width,
                &mut height,
            );
            assert_eq!(got, 0);
        }

        let pixels: Vec<u8> = (0..4 * 3 * 4).map(|i| i as u8).collect();
        publish_frame(&renderer, &pixels, 4 * 4, 3).unwrap();

        unsafe {
            let got = surface_relay_host_poll_frame(
                handle,
                buf.as_mut_ptr(),
                8,
                &mut width,
                &mut height,
            );
            assert_eq!(got, -2);
            assert_eq!((width, height), (4, 3));

            let got = surface_relay_host_poll_frame(
                handle,
                buf.as_mut_ptr(),
                buf.len(),
                &mut width,
                &mut height,
            );
            assert_eq!(got, 1);
            assert_eq!(buf, pixels);

            let got = surface_relay_host_poll_frame(
                handle,
                buf.as_mut_ptr(),
                buf.len(),
                ptr::null_mut(),
                ptr::null_mut(),
            );
            assert_eq!(got, 0);

            surface_relay_host_destroy(handle);
        }
        assert!(SharedRegionHandle::open(&name).is_err());
    }

    #[test]
    fn test_create_with_missing_renderer_returns_null() {
        let name = CString::new("relay_test_bindings_spawn").unwrap();
        let renderer = CString::new("/nonexistent/surface-renderer").unwrap();
        let dir = CString::new(".").unwrap();

        let handle = unsafe {
            surface_relay_host_create_and_launch(
                name.as_ptr(),
                renderer.as_ptr(),
                dir.as_ptr(),
                dir.as_ptr(),
            )
        };
        assert!(handle.is_null());

        let handle = unsafe {
            surface_relay_host_create_and_launch(
                ptr::null(),
                ptr::null(),
                dir.as_ptr(),
                dir.as_ptr(),
            )
        };
        assert!(handle.is_null());
    }
}
