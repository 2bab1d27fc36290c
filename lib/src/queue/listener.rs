//! Callbacks through which the queue notifies its clients.
use std::sync::Arc;

use crate::memory::SurfaceBuffer;

/// Trait implemented by the consumer of a queue to be notified of its events.
///
/// Callbacks are invoked synchronously from the thread performing the
/// operation, with only the listener lock held. They must not call back into
/// the queue: work that needs to do so must be deferred, typically to the
/// consumer's own thread.
pub trait ConsumerListener: Send + Sync {
    /// A buffer has been flushed and can be acquired.
    fn on_buffer_available(&self);

    /// The producer went to the background; all buffers are about to be freed.
    fn on_go_background(&self) {}

    /// The producer asked for all buffers to be freed.
    fn on_clean_cache(&self) {}

    /// The tunnel handle of the queue changed.
    fn on_tunnel_handle_change(&self) {}
}

/// Any closure can be used as a consumer listener that is only interested in
/// new buffers.
impl<F: Fn() + Send + Sync> ConsumerListener for F {
    fn on_buffer_available(&self) {
        self()
    }
}

/// Called with a buffer being released by the consumer. If it returns `Ok`,
/// the buffer is considered taken care of and does not go back to the free
/// list.
pub type ReleaseListener = Box<dyn Fn(&Arc<SurfaceBuffer>) -> anyhow::Result<()> + Send + Sync>;

/// Called with the sequence number of every buffer removed from the queue.
/// Invoked with the queue lock held: must not call back into the queue.
pub type DeleteBufferListener = Box<dyn Fn(u32) + Send + Sync>;
