//! Allocator backed by anonymous shared memory (memfd).
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd};

use log::{debug, error};
use nix::libc;

use super::*;
use crate::{MAX_STRIDE_ALIGNMENT, MAX_SURFACE_SIZE, MIN_STRIDE_ALIGNMENT};

/// Allocates buffers as memfd regions. Every format supported by
/// `PixelFormat::layout` can be allocated; all planes are stored contiguously
/// in a single file descriptor.
#[derive(Debug, Default)]
pub struct ShmAllocator;

struct ShmLayout {
    stride: i32,
    size: u64,
}

impl ShmAllocator {
    pub fn new() -> Self {
        ShmAllocator
    }

    fn layout(
        width: i32,
        height: i32,
        stride_alignment: i32,
        format: PixelFormat,
    ) -> Result<ShmLayout> {
        if width <= 0 || height <= 0 || (width as u64) * (height as u64) > MAX_SURFACE_SIZE {
            return Err(SurfaceError::InvalidArguments);
        }
        let alignment = stride_alignment.clamp(MIN_STRIDE_ALIGNMENT, MAX_STRIDE_ALIGNMENT) as u64;

        let layout = format.layout();
        let line = (width as u64 * layout.bits_per_pixel as u64 + 7) / 8;
        let stride = (line + alignment - 1) / alignment * alignment;
        let luma = stride * height as u64;
        let size = luma + luma * layout.chroma_sixteenths as u64 / 16;

        Ok(ShmLayout {
            stride: stride as i32,
            size,
        })
    }
}

impl Allocator for ShmAllocator {
    fn alloc(&self, config: &BufferRequestConfig) -> Result<BufferHandle> {
        let layout = Self::layout(
            config.width,
            config.height,
            config.stride_alignment,
            config.format,
        )?;

        let fd = syscall!(memfd_create(
            b"bufferq\0".as_ptr() as *const libc::c_char,
            libc::MFD_CLOEXEC
        ))
        .map_err(|e| {
            error!("memfd_create failed: {}", e);
            e
        })?;
        // Safe because memfd_create just gave us this descriptor.
        let file = unsafe { File::from_raw_fd(fd) };
        syscall!(ftruncate(file.as_raw_fd(), layout.size as libc::off_t))?;

        debug!(
            "Allocated {} bytes of shared memory for {}",
            layout.size, config
        );

        Ok(BufferHandle {
            width: config.width,
            height: config.height,
            stride: layout.stride,
            format: config.format,
            usage: config.usage,
            size: layout.size,
            planes: vec![MemoryDescriptor {
                fd: file,
                offset: 0,
                size: layout.size,
            }],
            reserve: Vec::new(),
        })
    }

    fn flush_cache(&self, handle: &BufferHandle) -> Result<()> {
        for plane in &handle.planes {
            syscall!(fdatasync(plane.fd.as_raw_fd()))?;
        }

        Ok(())
    }

    fn is_supported_alloc(&self, infos: &[VerifyAllocInfo]) -> Vec<bool> {
        infos
            .iter()
            .map(|info| {
                !info.usage.contains(BufferUsage::PROTECTED)
                    && i32::try_from(info.width).is_ok()
                    && i32::try_from(info.height).is_ok()
                    && Self::layout(
                        info.width as i32,
                        info.height as i32,
                        MIN_STRIDE_ALIGNMENT,
                        info.format,
                    )
                    .is_ok()
            })
            .collect()
    }
}
