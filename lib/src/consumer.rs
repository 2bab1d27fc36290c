//! Consumer side of a buffer queue.
use std::sync::Arc;

use log::warn;

use crate::error::{Result, SurfaceError};
use crate::fence::Fence;
use crate::memory::{BufferUsage, SurfaceBuffer};
use crate::queue::*;
use crate::{ScalingMode, Transform};

/// Access to a queue for the process consuming its buffers.
///
/// # Examples
///
/// ```
/// # use std::sync::Arc;
/// # use bufferq::consumer::ConsumerEndpoint;
/// # use bufferq::memory::ShmAllocator;
/// # use bufferq::queue::BufferQueue;
/// # use bufferq::SurfaceError;
/// let queue = Arc::new(BufferQueue::new("doc", false, Arc::new(ShmAllocator::new())));
/// let consumer = ConsumerEndpoint::new(queue);
/// consumer.register_consumer_listener(Arc::new(|| println!("new buffer!")));
/// assert_eq!(consumer.acquire_buffer().unwrap_err(), SurfaceError::NoBuffer);
/// ```
pub struct ConsumerEndpoint {
    queue: Arc<BufferQueue>,
}

impl ConsumerEndpoint {
    pub fn new(queue: Arc<BufferQueue>) -> Self {
        ConsumerEndpoint { queue }
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn unique_id(&self) -> u64 {
        self.queue.unique_id()
    }

    pub fn acquire_buffer(&self) -> Result<AcquiredBuffer> {
        self.queue.acquire_buffer()
    }

    pub fn release_buffer(&self, sequence: u32, fence: Arc<Fence>) -> Result<()> {
        self.queue.release_buffer(sequence, fence)
    }

    pub fn attach_buffer(&self, buffer: Arc<SurfaceBuffer>) -> Result<()> {
        self.queue.attach_buffer(buffer)
    }

    pub fn detach_buffer(&self, sequence: u32) -> Result<()> {
        self.queue.detach_buffer(sequence)
    }

    pub fn register_consumer_listener(&self, listener: Arc<dyn ConsumerListener>) {
        self.queue.register_consumer_listener(listener)
    }

    pub fn unregister_consumer_listener(&self) {
        self.queue.unregister_consumer_listener()
    }

    pub fn register_release_listener(&self, listener: ReleaseListener) {
        self.queue.register_release_listener(listener)
    }

    pub fn register_delete_buffer_listener(&self, listener: DeleteBufferListener) {
        self.queue.register_delete_buffer_listener(listener)
    }

    pub fn get_queue_size(&self) -> u32 {
        self.queue.get_queue_size()
    }

    pub fn set_queue_size(&self, queue_size: u32) -> Result<()> {
        self.queue.set_queue_size(queue_size)
    }

    pub fn set_default_width_and_height(&self, width: i32, height: i32) -> Result<()> {
        self.queue.set_default_width_and_height(width, height)
    }

    pub fn get_default_width(&self) -> i32 {
        self.queue.get_default_width()
    }

    pub fn get_default_height(&self) -> i32 {
        self.queue.get_default_height()
    }

    pub fn set_default_usage(&self, usage: BufferUsage) {
        self.queue.set_default_usage(usage)
    }

    pub fn get_default_usage(&self) -> BufferUsage {
        self.queue.get_default_usage()
    }

    pub fn get_transform(&self) -> Transform {
        self.queue.get_transform()
    }

    pub fn get_scaling_mode(&self, sequence: u32) -> Result<ScalingMode> {
        self.queue.get_scaling_mode(sequence)
    }

    pub fn query_metadata_type(&self, sequence: u32) -> Result<HdrMetaDataType> {
        self.queue.query_metadata_type(sequence)
    }

    pub fn get_metadata(&self, sequence: u32) -> Result<Vec<HdrMetaData>> {
        self.queue.get_metadata(sequence)
    }

    pub fn get_metadata_set(&self, sequence: u32) -> Result<(HdrMetadataKey, Vec<u8>)> {
        self.queue.get_metadata_set(sequence)
    }

    pub fn get_tunnel_handle(&self) -> Option<Arc<TunnelHandle>> {
        self.queue.get_tunnel_handle()
    }

    /// Record when a buffer was presented.
    pub fn set_present_timestamp(&self, sequence: u32, timestamp: PresentTimestamp) -> Result<()> {
        if timestamp.type_ == PresentTimestampType::Unsupported {
            warn!("Unsupported present timestamp for buffer {}", sequence);
            return Err(SurfaceError::InvalidArguments);
        }
        self.queue.set_present_timestamp(sequence, timestamp)
    }

    pub fn go_background(&self) -> Result<()> {
        self.queue.go_background()
    }

    pub fn on_consumer_died(&self) -> Result<()> {
        self.queue.on_consumer_died()
    }

    pub fn set_status(&self, status: bool) {
        self.queue.set_status(status)
    }

    pub fn get_status(&self) -> bool {
        self.queue.get_status()
    }

    pub fn dump(&self) -> String {
        self.queue.dump()
    }
}
