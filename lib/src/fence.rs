//! One-shot completion signals exchanged along with buffers.
//!
//! A `Fence` tells whoever receives a buffer when its memory can safely be
//! accessed: after a producer's flush, the consumer must wait on the fence
//! before reading; after a release, the producer must wait on it before
//! writing again.
//!
//! A fence is made of zero or more fence points, each one being a file
//! descriptor that becomes readable once its work is done. A fence without any
//! point is the "invalid" sentinel, which is considered already signaled.
//! Merging two fences produces a fence that carries the points of both, and
//! thus signals once both have.
//!
//! Fence points are produced by a `FenceSignal`, a software signal source
//! backed by an eventfd, which is the only way fences can complete in this
//! crate. Drivers with their own sync files can wrap them the same way.
//!
//! Fences are usually shared as `Arc<Fence>`: the file descriptors of a fence
//! are closed exactly once, when the last reference is dropped.
mod timeline;

pub use timeline::*;

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error};
use nix::errno::Errno;
use nix::libc;
use nix::time::{clock_gettime, ClockId};
use thiserror::Error;

/// Timestamp returned by `read_timestamp` for the invalid fence.
pub const INVALID_TIMESTAMP: i64 = -1;
/// Timestamp returned by `read_timestamp` while a fence is not signaled yet.
pub const PENDING_TIMESTAMP: i64 = i64::MAX;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FenceError {
    #[error("timed out while waiting for the fence")]
    Timeout,
    #[error("fence is in an error state")]
    Invalid,
    #[error("system call failed: {0}")]
    Sys(Errno),
}

impl From<Errno> for FenceError {
    fn from(errno: Errno) -> Self {
        Self::Sys(errno)
    }
}

impl From<FenceError> for Errno {
    fn from(err: FenceError) -> Self {
        match err {
            FenceError::Timeout => Errno::ETIME,
            FenceError::Invalid => Errno::EINVAL,
            FenceError::Sys(e) => e,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Error,
    Active,
    Signaled,
}

/// Current value of `CLOCK_MONOTONIC`, in nanoseconds.
fn monotonic_ns() -> Result<i64, Errno> {
    let now = clock_gettime(ClockId::CLOCK_MONOTONIC)?;
    Ok(now.tv_sec() as i64 * 1_000_000_000 + now.tv_nsec() as i64)
}

fn dup_fd(fd: RawFd) -> Result<OwnedFd, Errno> {
    let new_fd = syscall!(fcntl(fd, libc::F_DUPFD_CLOEXEC, 0))?;
    // Safe because we just obtained this descriptor and nobody else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

#[derive(Debug)]
struct FencePoint {
    fd: OwnedFd,
    /// Shared with the `FenceSignal` this point comes from.
    signaled_at: Arc<AtomicI64>,
}

impl FencePoint {
    fn duplicate(&self) -> Result<Self, FenceError> {
        Ok(FencePoint {
            fd: dup_fd(self.fd.as_raw_fd())?,
            signaled_at: Arc::clone(&self.signaled_at),
        })
    }

    /// Wait until the point becomes readable. A negative `timeout_ms` waits
    /// forever.
    fn poll(&self, timeout_ms: i32) -> Result<(), FenceError> {
        let mut pollfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        let ret = loop {
            match syscall!(poll(&mut pollfd, 1, timeout_ms)) {
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                res => break res?,
            }
        };

        match ret {
            0 => Err(FenceError::Timeout),
            _ if pollfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 => Err(FenceError::Invalid),
            _ => Ok(()),
        }
    }

    fn status(&self) -> FenceStatus {
        match self.poll(0) {
            Ok(()) => FenceStatus::Signaled,
            Err(FenceError::Timeout) => FenceStatus::Active,
            Err(_) => FenceStatus::Error,
        }
    }
}

/// A one-shot completion signal. See the module documentation.
#[derive(Debug, Default)]
pub struct Fence {
    name: String,
    points: Vec<FencePoint>,
}

impl Fence {
    /// The sentinel fence, which is always considered signaled.
    pub fn invalid() -> Self {
        Default::default()
    }

    /// Returns `false` for the sentinel fence.
    pub fn is_valid(&self) -> bool {
        !self.points.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    /// Wait for the fence to be signaled, for at most `timeout_ms`
    /// milliseconds. A negative timeout waits forever. The sentinel fence
    /// returns immediately.
    pub fn wait(&self, timeout_ms: i32) -> Result<(), FenceError> {
        let deadline = if timeout_ms >= 0 {
            Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
        } else {
            None
        };

        for point in &self.points {
            let remaining = match deadline {
                None => -1,
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .as_millis() as i32,
            };
            point.poll(remaining)?;
        }

        Ok(())
    }

    pub fn status(&self) -> FenceStatus {
        let mut status = FenceStatus::Signaled;
        for point in &self.points {
            match point.status() {
                FenceStatus::Error => return FenceStatus::Error,
                FenceStatus::Active => status = FenceStatus::Active,
                FenceStatus::Signaled => (),
            }
        }

        status
    }

    /// Returns the time at which the fence was signaled, in nanoseconds of
    /// `CLOCK_MONOTONIC`, i.e. the time its last point was signaled.
    /// `PENDING_TIMESTAMP` is returned if the fence is not signaled yet, and
    /// `INVALID_TIMESTAMP` for the sentinel fence.
    pub fn read_timestamp(&self) -> i64 {
        if !self.is_valid() {
            return INVALID_TIMESTAMP;
        }

        let mut timestamp = 0;
        for point in &self.points {
            if point.status() != FenceStatus::Signaled {
                return PENDING_TIMESTAMP;
            }
            timestamp = timestamp.max(point.signaled_at.load(Ordering::Acquire));
        }

        timestamp
    }

    /// Build a fence that signals once both `fence1` and `fence2` have. If
    /// only one of them is valid, the result is a duplicate of it. If none is,
    /// the result is the sentinel fence.
    pub fn merge(name: &str, fence1: &Fence, fence2: &Fence) -> Result<Fence, FenceError> {
        let points = fence1
            .points
            .iter()
            .chain(fence2.points.iter())
            .map(|p| p.duplicate())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                error!("Failed to merge fence {}: {}", name, e);
                e
            })?;

        if points.is_empty() {
            return Ok(Fence::invalid());
        }

        Ok(Fence {
            name: name.to_owned(),
            points,
        })
    }

    /// Returns a new fence with freshly duplicated file descriptors, that
    /// signals at the same time as this one.
    pub fn duplicate(&self) -> Result<Fence, FenceError> {
        Ok(Fence {
            name: self.name.clone(),
            points: self
                .points
                .iter()
                .map(|p| p.duplicate())
                .collect::<Result<_, _>>()?,
        })
    }
}

/// A software signal source producing fences. All the fences obtained from a
/// `FenceSignal` signal when `signal()` is called.
#[derive(Debug)]
pub struct FenceSignal {
    fd: OwnedFd,
    signaled_at: Arc<AtomicI64>,
}

impl FenceSignal {
    pub fn new() -> Result<Self, FenceError> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;

        Ok(FenceSignal {
            // Safe because eventfd just gave us this descriptor.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            signaled_at: Arc::new(AtomicI64::new(PENDING_TIMESTAMP)),
        })
    }

    /// Returns a new fence that will signal along with this source.
    pub fn fence(&self, name: &str) -> Result<Fence, FenceError> {
        Ok(Fence {
            name: name.to_owned(),
            points: vec![FencePoint {
                fd: dup_fd(self.fd.as_raw_fd())?,
                signaled_at: Arc::clone(&self.signaled_at),
            }],
        })
    }

    /// Signal all the fences of this source. Signaling more than once has no
    /// further effect.
    pub fn signal(&self) -> Result<(), FenceError> {
        // The timestamp must be visible before the fences become readable.
        let now = monotonic_ns()?;
        if self
            .signaled_at
            .compare_exchange(PENDING_TIMESTAMP, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Fence source signaled more than once");
            return Ok(());
        }

        let buf = 1u64.to_ne_bytes();
        syscall!(write(
            self.fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len()
        ))?;

        Ok(())
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled_at.load(Ordering::Acquire) != PENDING_TIMESTAMP
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn invalid_fence() {
        let fence = Fence::invalid();
        assert!(!fence.is_valid());
        assert_eq!(fence.wait(0), Ok(()));
        assert_eq!(fence.wait(-1), Ok(()));
        assert_eq!(fence.status(), FenceStatus::Signaled);
        assert_eq!(fence.read_timestamp(), INVALID_TIMESTAMP);
    }

    #[test]
    fn signal_and_wait() {
        let source = FenceSignal::new().unwrap();
        let fence = source.fence("test").unwrap();
        assert!(fence.is_valid());
        assert_eq!(fence.name(), "test");
        assert_eq!(fence.status(), FenceStatus::Active);
        assert_eq!(fence.read_timestamp(), PENDING_TIMESTAMP);
        assert_eq!(fence.wait(10), Err(FenceError::Timeout));

        source.signal().unwrap();
        assert!(source.is_signaled());
        assert_eq!(fence.wait(0), Ok(()));
        assert_eq!(fence.status(), FenceStatus::Signaled);
        let timestamp = fence.read_timestamp();
        assert!(timestamp > 0 && timestamp != PENDING_TIMESTAMP);

        // Signaling again does not move the timestamp.
        source.signal().unwrap();
        assert_eq!(fence.read_timestamp(), timestamp);
    }

    #[test]
    fn signal_from_other_thread() {
        let source = FenceSignal::new().unwrap();
        let fence = source.fence("threaded").unwrap();

        let signaler = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            source.signal().unwrap();
        });

        assert_eq!(fence.wait(-1), Ok(()));
        signaler.join().unwrap();
    }

    #[test]
    fn merge() {
        let source1 = FenceSignal::new().unwrap();
        let source2 = FenceSignal::new().unwrap();
        let fence1 = source1.fence("f1").unwrap();
        let fence2 = source2.fence("f2").unwrap();

        let merged = Fence::merge("merged", &fence1, &fence2).unwrap();
        assert_eq!(merged.num_points(), 2);
        assert_eq!(merged.name(), "merged");

        source1.signal().unwrap();
        assert_eq!(merged.status(), FenceStatus::Active);
        assert_eq!(merged.wait(5), Err(FenceError::Timeout));
        assert_eq!(merged.read_timestamp(), PENDING_TIMESTAMP);

        source2.signal().unwrap();
        assert_eq!(merged.wait(0), Ok(()));
        assert_eq!(
            merged.read_timestamp(),
            fence1.read_timestamp().max(fence2.read_timestamp())
        );
    }

    #[test]
    fn merge_with_invalid() {
        let source = FenceSignal::new().unwrap();
        let fence = source.fence("valid").unwrap();

        let merged = Fence::merge("merged", &fence, &Fence::invalid()).unwrap();
        assert_eq!(merged.num_points(), 1);
        assert_eq!(merged.status(), FenceStatus::Active);
        source.signal().unwrap();
        assert_eq!(merged.status(), FenceStatus::Signaled);

        let merged = Fence::merge("merged", &Fence::invalid(), &Fence::invalid()).unwrap();
        assert!(!merged.is_valid());
    }

    #[test]
    fn duplicate() {
        let source = FenceSignal::new().unwrap();
        let fence = source.fence("orig").unwrap();
        let dup = fence.duplicate().unwrap();

        assert_ne!(
            fence.points[0].fd.as_raw_fd(),
            dup.points[0].fd.as_raw_fd()
        );
        drop(fence);
        source.signal().unwrap();
        assert_eq!(dup.wait(0), Ok(()));
        assert_eq!(dup.name(), "orig");
    }
}
