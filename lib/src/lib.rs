//! This library provides a bounded queue of graphics buffers shared between
//! producers (rendering clients) and a single consumer (typically a
//! compositor):
//!
//! * The `queue` module contains the `BufferQueue`, which owns the buffer
//!   slots and moves them between the free and dirty lists as they are
//!   requested, flushed, acquired and released. It is the only place where
//!   the pool state is modified.
//!
//! * The `producer` and `consumer` modules provide the two endpoints through
//!   which the queue is used. The producer endpoint can be driven by remote
//!   clients through the typed messages of the `rpc` module.
//!
//! * The `fence` module provides the one-shot completion signals that tell
//!   each side when the memory of a buffer can safely be accessed.
//!
//! * The `memory` module describes buffer memory and the `Allocator` trait
//!   that produces it, with a shared-memory implementation usable everywhere.
//!
//! A `ConsumerSurface` ties all these together and is the usual entry point.
//!
// Calls a libc function and turns a negative return value into the current
// `Errno`.
macro_rules! syscall {
    ($f: ident ( $($args: expr),* $(,)* ) ) => {{
        match unsafe { ::nix::libc::$f($($args, )*) } {
            err if err < 0 => Err(::nix::errno::Errno::last()),
            res => Ok(res)
        }
    }};
}

pub mod consumer;
pub mod error;
pub mod extra_data;
pub mod fence;
pub mod memory;
pub mod producer;
pub mod queue;
pub mod rpc;
pub mod surface;

pub use error::SurfaceError;

use std::fmt;
use std::fmt::{Debug, Display};

use enumn::N;

/// Maximum number of buffers a queue can hold.
pub const MAX_QUEUE_SIZE: u32 = 32;
/// Number of buffers a queue holds unless told otherwise.
pub const DEFAULT_QUEUE_SIZE: u32 = 3;
/// Bounds of the stride alignment a buffer can be requested with. The
/// alignment must also be a power of two.
pub const MIN_STRIDE_ALIGNMENT: i32 = 4;
pub const MAX_STRIDE_ALIGNMENT: i32 = 32;
pub const DEFAULT_STRIDE_ALIGNMENT: i32 = 4;
/// Largest surface, in pixels, that can be allocated (8K * 8K).
pub const MAX_SURFACE_SIZE: u64 = 58982400;
/// Maximum number of entries in the user data of a surface, or the extra data
/// of a buffer.
pub const MAX_USER_DATA_COUNT: usize = 1000;

/// Pixel formats a buffer can be requested with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, N)]
#[repr(u32)]
pub enum PixelFormat {
    Clut8 = 0,
    Clut1,
    Clut4,
    Rgb565,
    Rgba5658,
    Rgbx4444,
    Rgba4444,
    Rgb444,
    Rgbx5551,
    Rgba5551,
    Rgb555,
    Rgbx8888,
    Rgba8888,
    Rgb888,
    Bgr565,
    Bgrx4444,
    Bgra4444,
    Bgrx5551,
    Bgra5551,
    Bgrx8888,
    Bgra8888,
    Yuv422I,
    YCbCr422Sp,
    YCrCb422Sp,
    YCbCr420Sp,
    YCrCb420Sp,
    YCbCr422P,
    YCrCb422P,
    YCbCr420P,
    YCrCb420P,
    Yuyv422Pkg,
    Uyvy422Pkg,
    Yvyu422Pkg,
    Vyuy422Pkg,
}

impl Default for PixelFormat {
    fn default() -> Self {
        PixelFormat::Rgba8888
    }
}

/// Describes how a format lays out its pixels in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatLayout {
    /// Bits per pixel of the first (or only) plane.
    pub bits_per_pixel: u32,
    /// Size of the chroma planes relative to the first one, in sixteenths of
    /// its size. Zero for packed formats.
    pub chroma_sixteenths: u32,
}

impl PixelFormat {
    /// Returns the memory layout of this format.
    ///
    /// # Examples
    ///
    /// ```
    /// # use bufferq::PixelFormat;
    /// let nv12 = PixelFormat::YCbCr420Sp.layout();
    /// assert_eq!(nv12.bits_per_pixel, 8);
    /// assert_eq!(nv12.chroma_sixteenths, 8);
    /// ```
    pub fn layout(&self) -> FormatLayout {
        use PixelFormat::*;
        let (bits_per_pixel, chroma_sixteenths) = match self {
            Clut1 => (1, 0),
            Clut4 => (4, 0),
            Clut8 => (8, 0),
            Rgb565 | Rgbx4444 | Rgba4444 | Rgb444 | Rgbx5551 | Rgba5551 | Rgb555 | Bgr565
            | Bgrx4444 | Bgra4444 | Bgrx5551 | Bgra5551 => (16, 0),
            Rgba5658 | Rgb888 => (24, 0),
            Rgbx8888 | Rgba8888 | Bgrx8888 | Bgra8888 => (32, 0),
            Yuv422I | Yuyv422Pkg | Uyvy422Pkg | Yvyu422Pkg | Vyuy422Pkg => (16, 0),
            YCbCr420Sp | YCrCb420Sp | YCbCr420P | YCrCb420P => (8, 8),
            YCbCr422Sp | YCrCb422Sp | YCbCr422P | YCrCb422P => (8, 16),
        };

        FormatLayout {
            bits_per_pixel,
            chroma_sixteenths,
        }
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Color gamut of the content of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(i32)]
pub enum ColorGamut {
    Invalid = -1,
    Native = 0,
    StandardBt601 = 1,
    StandardBt709 = 2,
    DciP3 = 3,
    Srgb = 4,
    AdobeRgb = 5,
    DisplayP3 = 6,
    Bt2020 = 7,
    Bt2100Pq = 8,
    Bt2100Hlg = 9,
    DisplayBt2020 = 10,
}

impl Default for ColorGamut {
    fn default() -> Self {
        ColorGamut::Srgb
    }
}

/// Transform to apply to the content of a buffer when it is displayed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum Transform {
    RotateNone = 0,
    Rotate90,
    Rotate180,
    Rotate270,
    FlipH,
    FlipV,
    FlipHRot90,
    FlipVRot90,
    FlipHRot180,
    FlipVRot180,
    FlipHRot270,
    FlipVRot270,
}

impl Default for Transform {
    fn default() -> Self {
        Transform::RotateNone
    }
}

/// How the consumer should fit a buffer into its destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum ScalingMode {
    Freeze = 0,
    ScaleToWindow,
    ScaleCrop,
    NoScaleCrop,
}

impl Default for ScalingMode {
    fn default() -> Self {
        ScalingMode::ScaleToWindow
    }
}

/// A rectangle in buffer coordinates. Width and height are signed so that
/// invalid damage regions coming from clients can be represented and
/// rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Rect {
        Rect { x, y, w, h }
    }
}

impl Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}), {}x{}", self.x, self.y, self.w, self.h)
    }
}

/// Parameters a producer requests a buffer with. Two buffers are
/// interchangeable only if they were requested with equal configs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferRequestConfig {
    pub width: i32,
    pub height: i32,
    pub stride_alignment: i32,
    pub format: PixelFormat,
    pub usage: memory::BufferUsage,
    /// How long to wait for a buffer to become available, in milliseconds.
    pub timeout: i32,
    pub color_gamut: ColorGamut,
    pub transform: Transform,
}

impl Default for BufferRequestConfig {
    fn default() -> Self {
        BufferRequestConfig {
            width: 0,
            height: 0,
            stride_alignment: DEFAULT_STRIDE_ALIGNMENT,
            format: Default::default(),
            usage: memory::BufferUsage::empty(),
            timeout: 0,
            color_gamut: Default::default(),
            transform: Default::default(),
        }
    }
}

/// Quickly build a usable `BufferRequestConfig` from a pixel format and
/// resolution.
///
/// # Examples
///
/// ```
/// # use bufferq::{BufferRequestConfig, PixelFormat};
/// let c = BufferRequestConfig::from((PixelFormat::Rgba8888, (640, 480)));
/// assert_eq!(c.width, 640);
/// assert_eq!(c.height, 480);
/// assert_eq!(c.stride_alignment, 4);
/// ```
impl From<(PixelFormat, (i32, i32))> for BufferRequestConfig {
    fn from((format, (width, height)): (PixelFormat, (i32, i32))) -> Self {
        BufferRequestConfig {
            width,
            height,
            format,
            ..Default::default()
        }
    }
}

impl Display for BufferRequestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} align {} {} usage 0x{:x} timeout {}ms {:?} {:?}",
            self.width,
            self.height,
            self.stride_alignment,
            self.format,
            self.usage.bits(),
            self.timeout,
            self.color_gamut,
            self.transform
        )
    }
}

/// Parameters a producer flushes a buffer with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlushConfig {
    /// Region of the buffer that changed since it was last flushed.
    pub damage: Rect,
    /// Content timestamp in microseconds. Zero means "now".
    pub timestamp: i64,
}

/// Parameters to ask the allocator whether it can satisfy an allocation,
/// without actually allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyAllocInfo {
    pub width: u32,
    pub height: u32,
    pub usage: memory::BufferUsage,
    pub format: PixelFormat,
}
