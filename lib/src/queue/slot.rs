use std::fmt;
use std::sync::Arc;

use log::trace;

use super::metadata::*;
use crate::fence::Fence;
use crate::memory::SurfaceBuffer;
use crate::{BufferRequestConfig, Rect, ScalingMode};

/// Represents the current state of a buffer slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// The buffer is in the free list and can be requested.
    Released,
    /// The buffer has been handed to the producer, which is writing into it.
    Requested,
    /// The buffer has been filled by the producer and waits in the dirty list
    /// to be acquired.
    Flushed,
    /// The buffer is being read by the consumer.
    Acquired,
    /// The buffer has been injected into the queue from outside.
    Attached,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotState::Released => "RELEASED",
            SlotState::Requested => "REQUESTED",
            SlotState::Flushed => "FLUSHED",
            SlotState::Acquired => "ACQUIRED",
            SlotState::Attached => "ATTACHED",
        };
        f.write_str(s)
    }
}

/// Everything the queue knows about one of its buffers.
pub(super) struct BufferSlot {
    pub(super) buffer: Arc<SurfaceBuffer>,
    state: SlotState,
    /// Set when the queue shrank while this buffer was in use: it is deleted
    /// instead of going back to the free list.
    pub(super) is_deleting: bool,
    /// Config the buffer was requested (or attached) with.
    pub(super) config: BufferRequestConfig,
    pub(super) fence: Arc<Fence>,
    /// Content timestamp of the last flush, in microseconds.
    pub(super) timestamp: i64,
    pub(super) damage: Rect,
    pub(super) scaling_mode: ScalingMode,
    pub(super) hdr_type: HdrMetaDataType,
    pub(super) metadata: Vec<HdrMetaData>,
    pub(super) metadata_set_key: HdrMetadataKey,
    pub(super) metadata_set: Vec<u8>,
    pub(super) present_timestamp: PresentTimestamp,
}

impl BufferSlot {
    pub(super) fn new(
        buffer: Arc<SurfaceBuffer>,
        state: SlotState,
        config: BufferRequestConfig,
    ) -> Self {
        BufferSlot {
            buffer,
            state,
            is_deleting: false,
            config,
            fence: Arc::new(Fence::invalid()),
            timestamp: 0,
            damage: Default::default(),
            scaling_mode: Default::default(),
            hdr_type: Default::default(),
            metadata: Vec::new(),
            metadata_set_key: Default::default(),
            metadata_set: Vec::new(),
            present_timestamp: Default::default(),
        }
    }

    pub(super) fn state(&self) -> SlotState {
        self.state
    }

    /// Move the slot to `state`, returning the previous one.
    pub(super) fn update_state(&mut self, state: SlotState) -> SlotState {
        trace!(
            "Buffer {}: {} -> {}",
            self.buffer.seq_num(),
            self.state,
            state
        );
        std::mem::replace(&mut self.state, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Allocator, ShmAllocator};
    use crate::PixelFormat;

    #[test]
    fn slot_state_update() {
        let config = BufferRequestConfig::from((PixelFormat::Rgba8888, (8, 8)));
        let handle = ShmAllocator::new().alloc(&config).unwrap();
        let buffer = Arc::new(SurfaceBuffer::new(handle, &config));
        let mut slot = BufferSlot::new(buffer, SlotState::Requested, config);

        assert_eq!(slot.state(), SlotState::Requested);
        assert!(!slot.fence.is_valid());
        assert_eq!(slot.update_state(SlotState::Flushed), SlotState::Requested);
        assert_eq!(slot.update_state(SlotState::Acquired), SlotState::Flushed);
        assert_eq!(slot.state(), SlotState::Acquired);
        assert_eq!(SlotState::Acquired.to_string(), "ACQUIRED");
    }
}
