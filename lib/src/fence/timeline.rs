//! Bounded tracking of outstanding fences.
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use log::{debug, warn};

use super::{Fence, FenceError, FenceStatus};

/// A bounded FIFO of the fences a client has handed out and not seen signaled
/// yet. Fences are held weakly so the timeline never keeps a fence alive on
/// its own.
///
/// Pushing a fence into a full timeline blocks on the oldest outstanding
/// fence, which provides back-pressure to clients getting too far ahead of
/// the work they wait for.
pub struct FenceTimeline {
    capacity: usize,
    wait_timeout: i32,
    fences: VecDeque<Weak<Fence>>,
}

impl FenceTimeline {
    /// How long `push` waits for the oldest fence by default, in milliseconds.
    pub const DEFAULT_WAIT_TIMEOUT: i32 = 3000;

    pub fn new(capacity: usize) -> Self {
        FenceTimeline {
            capacity: capacity.max(1),
            wait_timeout: Self::DEFAULT_WAIT_TIMEOUT,
            fences: VecDeque::with_capacity(capacity),
        }
    }

    /// Set how long `push` may wait on the oldest fence. A negative value
    /// waits forever.
    pub fn with_wait_timeout(mut self, timeout_ms: i32) -> Self {
        self.wait_timeout = timeout_ms;
        self
    }

    pub fn len(&self) -> usize {
        self.fences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }

    /// Track `fence`. If the timeline is full after dropping the fences that
    /// already signaled, wait for the oldest one and drop it. If that wait
    /// fails, the error is returned and the timeline is left unchanged.
    pub fn push(&mut self, fence: &Arc<Fence>) -> Result<(), FenceError> {
        // Nothing to wait for.
        if !fence.is_valid() {
            return Ok(());
        }

        self.update_fence_timeline();

        while self.fences.len() >= self.capacity {
            if let Some(oldest) = self.fences.front().and_then(Weak::upgrade) {
                debug!("Fence timeline full, waiting on {}", oldest.name());
                oldest.wait(self.wait_timeout).map_err(|e| {
                    warn!("Failed to wait for fence {}: {}", oldest.name(), e);
                    e
                })?;
            }
            self.fences.pop_front();
        }

        self.fences.push_back(Arc::downgrade(fence));

        Ok(())
    }

    /// Drop the fences at the front of the timeline that have signaled, or
    /// that nobody holds anymore. Never blocks.
    pub fn update_fence_timeline(&mut self) {
        while let Some(oldest) = self.fences.front() {
            match oldest.upgrade() {
                Some(fence) if fence.status() != FenceStatus::Signaled => break,
                _ => {
                    self.fences.pop_front();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::FenceSignal;

    fn new_fence(name: &str) -> (FenceSignal, Arc<Fence>) {
        let source = FenceSignal::new().unwrap();
        let fence = Arc::new(source.fence(name).unwrap());
        (source, fence)
    }

    #[test]
    fn invalid_fences_are_not_tracked() {
        let mut timeline = FenceTimeline::new(2);
        timeline.push(&Arc::new(Fence::invalid())).unwrap();
        assert!(timeline.is_empty());
    }

    #[test]
    fn update_pops_signaled_prefix() {
        let mut timeline = FenceTimeline::new(4);
        let (s1, f1) = new_fence("f1");
        let (_s2, f2) = new_fence("f2");
        let (s3, f3) = new_fence("f3");
        timeline.push(&f1).unwrap();
        timeline.push(&f2).unwrap();
        timeline.push(&f3).unwrap();
        assert_eq!(timeline.len(), 3);

        // f3 is signaled but stuck behind f2.
        s1.signal().unwrap();
        s3.signal().unwrap();
        timeline.update_fence_timeline();
        assert_eq!(timeline.len(), 2);

        // Dropped fences do not hold the timeline back.
        drop(f2);
        timeline.update_fence_timeline();
        assert!(timeline.is_empty());
    }

    #[test]
    fn push_when_full_waits_for_oldest() {
        let mut timeline = FenceTimeline::new(2).with_wait_timeout(10);
        let (s1, f1) = new_fence("f1");
        let (_s2, f2) = new_fence("f2");
        let (_s3, f3) = new_fence("f3");
        timeline.push(&f1).unwrap();
        timeline.push(&f2).unwrap();

        // Oldest fence never signals: the push fails and nothing changes.
        assert_eq!(timeline.push(&f3), Err(FenceError::Timeout));
        assert_eq!(timeline.len(), 2);

        let signaler = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            s1.signal().unwrap();
        });
        let mut timeline = timeline.with_wait_timeout(-1);
        timeline.push(&f3).unwrap();
        signaler.join().unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(f1.status(), FenceStatus::Signaled);
    }
}
