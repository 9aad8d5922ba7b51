//! Video mode negotiation types.
//!
//! The firmware backend owns mode enumeration and the actual mode switch;
//! the core only reasons about the reported geometry and derives the
//! protocol's pixel format tags from the firmware-reported mask shifts.

use bytemuck::{Pod, Zeroable};

use crate::errors::VideoError;

pub const FB_FORMAT_INVALID: u16 = 0;
pub const FB_FORMAT_RGB888: u16 = 1;
pub const FB_FORMAT_BGR888: u16 = 2;
pub const FB_FORMAT_RGBX8888: u16 = 3;
pub const FB_FORMAT_XRGB8888: u16 = 4;

pub fn fb_format_as_str(format: u16) -> &'static str {
    match format {
        FB_FORMAT_RGB888 => "rgb888",
        FB_FORMAT_BGR888 => "bgr888",
        FB_FORMAT_RGBX8888 => "rgbx8888",
        FB_FORMAT_XRGB8888 => "xrgb8888",
        _ => "<invalid>",
    }
}

/// Derives the format tag from firmware-reported 8-bit component shifts.
pub fn fb_format_from_mask_shifts_8888(
    r_shift: u8,
    g_shift: u8,
    b_shift: u8,
    x_shift: u8,
    bpp: u8,
) -> u16 {
    if bpp == 24 {
        if b_shift == 0 && g_shift == 8 && r_shift == 16 {
            return FB_FORMAT_RGB888;
        }
        if r_shift == 0 && g_shift == 8 && b_shift == 16 {
            return FB_FORMAT_BGR888;
        }
    } else if bpp == 32 {
        if x_shift == 0 && b_shift == 8 && g_shift == 16 && r_shift == 24 {
            return FB_FORMAT_RGBX8888;
        }
        if b_shift == 0 && g_shift == 8 && r_shift == 16 && x_shift == 24 {
            return FB_FORMAT_XRGB8888;
        }
    }

    FB_FORMAT_INVALID
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoMode {
    pub width: u32,
    pub height: u32,
    pub bpp: u16,
    pub format: u16,
    pub id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// The linear framebuffer of a mode that has been set. This is exactly
/// the protocol's on-wire framebuffer layout.
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Framebuffer {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u16,
    pub format: u16,
    pub physical_address: u64,
}

/// Firmware-provided video services.
pub trait VideoServices {
    /// Number of modes that can be queried.
    fn mode_count(&self) -> usize;

    /// Information about the mode at `idx`.
    fn query_mode(&self, idx: usize) -> Option<VideoMode>;

    /// The main display's native resolution, when the firmware knows it.
    fn query_native_resolution(&self) -> Option<Resolution>;

    /// Switches to a mode returned by [`query_mode`](Self::query_mode).
    /// Legacy TTY output is dead after this succeeds.
    fn set_mode(&mut self, id: u32) -> Result<Framebuffer, VideoError>;
}
