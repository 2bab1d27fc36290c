//! Abstracts the memory backing the buffers of a queue.
//!
//! The queue never allocates memory itself: it asks an `Allocator` for a
//! `BufferHandle` matching a `BufferRequestConfig`, and wraps it into a
//! `SurfaceBuffer` that is shared between the queue, the producer and the
//! consumer.
//!
//! A `BufferHandle` describes the memory of a buffer: its geometry, and the
//! file descriptors (one per plane) through which it can be shared with other
//! processes. How the memory is obtained is up to the allocator; the
//! `ShmAllocator` provided here uses anonymous shared memory and can be used
//! on any Linux system, while hardware-specific allocators (gralloc, DRM
//! dumb buffers, ...) can be plugged in by implementing the trait.
mod shm;

pub use shm::*;

use std::fmt::{self, Debug};
use std::fs::File;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use bitflags::bitflags;
use nix::libc;

use crate::error::{Result, SurfaceError};
use crate::extra_data::BufferExtraData;
use crate::{BufferRequestConfig, ColorGamut, PixelFormat, Transform, VerifyAllocInfo};

bitflags! {
    /// How a buffer is going to be accessed.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u64 {
        const CPU_READ = 1 << 0;
        const CPU_WRITE = 1 << 1;
        /// Media memory zone.
        const MEM_MMZ = 1 << 2;
        const MEM_DMA = 1 << 3;
        const MEM_SHARE = 1 << 4;
        const MEM_MMZ_CACHE = 1 << 5;
        /// Framebuffer.
        const MEM_FB = 1 << 6;
        const ASSIGN_SIZE = 1 << 7;
        /// Written by the GPU.
        const HW_RENDER = 1 << 8;
        /// Read by the GPU.
        const HW_TEXTURE = 1 << 9;
        const HW_COMPOSER = 1 << 10;
        const PROTECTED = 1 << 11;
        const CAMERA_READ = 1 << 12;
        const CAMERA_WRITE = 1 << 13;
        const VIDEO_ENCODER = 1 << 14;
        const VIDEO_DECODER = 1 << 15;
        const VENDOR_PRI0 = 1 << 44;
        const VENDOR_PRI1 = 1 << 45;
        const VENDOR_PRI2 = 1 << 46;
        const VENDOR_PRI3 = 1 << 47;
        const VENDOR_PRI4 = 1 << 48;
        const VENDOR_PRI5 = 1 << 49;
        const VENDOR_PRI6 = 1 << 50;
        const VENDOR_PRI7 = 1 << 51;
        const VENDOR_PRI8 = 1 << 52;
        const VENDOR_PRI9 = 1 << 53;
        const VENDOR_PRI10 = 1 << 54;
        const VENDOR_PRI11 = 1 << 55;
        const VENDOR_PRI12 = 1 << 56;
        const VENDOR_PRI13 = 1 << 57;
        const VENDOR_PRI14 = 1 << 58;
        const VENDOR_PRI15 = 1 << 59;
        const VENDOR_PRI16 = 1 << 60;
        const VENDOR_PRI17 = 1 << 61;
        const VENDOR_PRI18 = 1 << 62;
        const VENDOR_PRI19 = 1 << 63;
    }
}

/// One plane of memory, shareable with other processes through its file
/// descriptor.
#[derive(Debug)]
pub struct MemoryDescriptor {
    pub fd: File,
    /// Offset of the plane data within `fd`.
    pub offset: u64,
    pub size: u64,
}

/// Description of the memory of a buffer.
#[derive(Debug)]
pub struct BufferHandle {
    pub width: i32,
    pub height: i32,
    /// Bytes per line of the first plane.
    pub stride: i32,
    pub format: PixelFormat,
    pub usage: BufferUsage,
    /// Total size of the buffer memory, in bytes.
    pub size: u64,
    pub planes: Vec<MemoryDescriptor>,
    /// Allocator-specific integers, opaque to the queue.
    pub reserve: Vec<i32>,
}

/// Trait for the providers of buffer memory.
pub trait Allocator: Send + Sync {
    /// Allocate memory fitting `config`.
    fn alloc(&self, config: &BufferRequestConfig) -> Result<BufferHandle>;

    /// Make the memory of `handle` accessible to the CPU. Called once after
    /// each allocation, before the buffer is handed out.
    fn map(&self, _handle: &BufferHandle) -> Result<()> {
        Ok(())
    }

    /// Write back CPU caches so the content of `handle` is visible to other
    /// devices.
    fn flush_cache(&self, handle: &BufferHandle) -> Result<()>;

    /// Tell, for each entry of `infos`, whether an allocation with these
    /// parameters would succeed.
    fn is_supported_alloc(&self, infos: &[VerifyAllocInfo]) -> Vec<bool>;
}

// Sequence numbers are unique within the process, across all queues.
static NEXT_SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// A buffer as seen by the queue and its clients: memory, a unique sequence
/// number, and a side channel of extra data set by the producer.
pub struct SurfaceBuffer {
    seq_num: u32,
    handle: BufferHandle,
    color_gamut: ColorGamut,
    transform: Transform,
    extra_data: Mutex<BufferExtraData>,
}

impl SurfaceBuffer {
    /// Wrap `handle`, which has been allocated for `config`, into a new buffer
    /// with the next sequence number.
    pub fn new(handle: BufferHandle, config: &BufferRequestConfig) -> Self {
        SurfaceBuffer {
            seq_num: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            handle,
            color_gamut: config.color_gamut,
            transform: config.transform,
            extra_data: Mutex::new(Default::default()),
        }
    }

    pub fn seq_num(&self) -> u32 {
        self.seq_num
    }

    pub fn handle(&self) -> &BufferHandle {
        &self.handle
    }

    pub fn width(&self) -> i32 {
        self.handle.width
    }

    pub fn height(&self) -> i32 {
        self.handle.height
    }

    pub fn stride(&self) -> i32 {
        self.handle.stride
    }

    pub fn format(&self) -> PixelFormat {
        self.handle.format
    }

    pub fn usage(&self) -> BufferUsage {
        self.handle.usage
    }

    pub fn size(&self) -> u64 {
        self.handle.size
    }

    pub fn color_gamut(&self) -> ColorGamut {
        self.color_gamut
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// The config a buffer of this geometry would be requested with. Used to
    /// register buffers allocated outside of the queue.
    pub fn request_config(&self) -> BufferRequestConfig {
        BufferRequestConfig {
            width: self.handle.width,
            height: self.handle.height,
            stride_alignment: 8,
            format: self.handle.format,
            usage: self.handle.usage,
            timeout: 0,
            color_gamut: self.color_gamut,
            transform: self.transform,
        }
    }

    pub fn extra_data(&self) -> BufferExtraData {
        self.extra_data.lock().unwrap().clone()
    }

    pub fn set_extra_data(&self, extra_data: BufferExtraData) {
        *self.extra_data.lock().unwrap() = extra_data;
    }

    fn plane_range(&self, offset: u64, len: usize) -> Result<&MemoryDescriptor> {
        let plane = self.handle.planes.first().ok_or(SurfaceError::NoEntry)?;
        match offset.checked_add(len as u64) {
            Some(end) if end <= plane.size => Ok(plane),
            _ => Err(SurfaceError::OutOfRange),
        }
    }

    /// Write `data` into the first plane of the buffer, at `offset`. The
    /// buffer must have been allocated with `BufferUsage::CPU_WRITE`.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.usage().contains(BufferUsage::CPU_WRITE) {
            return Err(SurfaceError::InvalidOperating);
        }
        let plane = self.plane_range(offset, data.len())?;

        let mut written = 0;
        while written < data.len() {
            let n = syscall!(pwrite(
                plane.fd.as_raw_fd(),
                data[written..].as_ptr() as *const libc::c_void,
                data.len() - written,
                (plane.offset + offset + written as u64) as libc::off_t
            ))?;
            written += n as usize;
        }

        Ok(())
    }

    /// Read the first plane of the buffer from `offset` into `data`. The
    /// buffer must have been allocated with `BufferUsage::CPU_READ`.
    pub fn read_at(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        if !self.usage().contains(BufferUsage::CPU_READ) {
            return Err(SurfaceError::InvalidOperating);
        }
        let plane = self.plane_range(offset, data.len())?;

        let mut read = 0;
        while read < data.len() {
            let n = syscall!(pread(
                plane.fd.as_raw_fd(),
                data[read..].as_mut_ptr() as *mut libc::c_void,
                data.len() - read,
                (plane.offset + offset + read as u64) as libc::off_t
            ))?;
            if n == 0 {
                return Err(SurfaceError::OutOfRange);
            }
            read += n as usize;
        }

        Ok(())
    }
}

impl Debug for SurfaceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceBuffer")
            .field("seq_num", &self.seq_num)
            .field("width", &self.handle.width)
            .field("height", &self.handle.height)
            .field("stride", &self.handle.stride)
            .field("format", &self.handle.format)
            .field("usage", &self.handle.usage)
            .field("size", &self.handle.size)
            .finish()
    }
}
