//! The consumer-side owner of a buffer queue.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::consumer::ConsumerEndpoint;
use crate::error::{Result, SurfaceError};
use crate::memory::Allocator;
use crate::producer::ProducerEndpoint;
use crate::queue::BufferQueue;
use crate::MAX_USER_DATA_COUNT;

/// Creates a queue along with its two endpoints. The consumer keeps the
/// surface; the producer endpoint is handed to whoever produces buffers.
///
/// Dropping the surface frees all the buffers of the queue and marks it dead,
/// so that producers still holding the producer endpoint get `NoConsumer`
/// errors.
///
/// # Examples
///
/// ```
/// # use std::sync::Arc;
/// # use bufferq::extra_data::BufferExtraData;
/// # use bufferq::memory::ShmAllocator;
/// # use bufferq::surface::ConsumerSurface;
/// # use bufferq::{BufferRequestConfig, PixelFormat, SurfaceError};
/// # use nix::unistd::getpid;
/// let surface = ConsumerSurface::new("doc", false, Arc::new(ShmAllocator::new()));
/// surface.consumer().register_consumer_listener(Arc::new(|| ()));
/// let producer = surface.producer();
///
/// let config = BufferRequestConfig::from((PixelFormat::Rgba8888, (64, 64)));
/// let mut extra_data = BufferExtraData::new();
/// assert!(producer.request_buffer(getpid(), &config, &mut extra_data).is_ok());
///
/// drop(surface);
/// assert_eq!(
///     producer.request_buffer(getpid(), &config, &mut extra_data).unwrap_err(),
///     SurfaceError::NoConsumer
/// );
/// ```
pub struct ConsumerSurface {
    queue: Arc<BufferQueue>,
    producer: Arc<ProducerEndpoint>,
    consumer: ConsumerEndpoint,
    user_data: Mutex<BTreeMap<String, String>>,
}

impl ConsumerSurface {
    pub fn new(name: &str, is_shared: bool, allocator: Arc<dyn Allocator>) -> Self {
        let queue = Arc::new(BufferQueue::new(name, is_shared, allocator));

        ConsumerSurface {
            producer: Arc::new(ProducerEndpoint::new(Arc::clone(&queue))),
            consumer: ConsumerEndpoint::new(Arc::clone(&queue)),
            queue,
            user_data: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn unique_id(&self) -> u64 {
        self.queue.unique_id()
    }

    pub fn is_shared(&self) -> bool {
        self.queue.is_shared()
    }

    pub fn producer(&self) -> Arc<ProducerEndpoint> {
        Arc::clone(&self.producer)
    }

    pub fn consumer(&self) -> &ConsumerEndpoint {
        &self.consumer
    }

    pub fn set_user_data(&self, key: &str, value: &str) -> Result<()> {
        let mut user_data = self.user_data.lock().unwrap();
        if !user_data.contains_key(key) && user_data.len() >= MAX_USER_DATA_COUNT {
            warn!("Too much user data on surface {}", self.name());
            return Err(SurfaceError::OutOfRange);
        }
        user_data.insert(key.to_owned(), value.to_owned());

        Ok(())
    }

    pub fn get_user_data(&self, key: &str) -> Option<String> {
        self.user_data.lock().unwrap().get(key).cloned()
    }
}

impl Drop for ConsumerSurface {
    fn drop(&mut self) {
        debug!("Tearing down surface {}", self.name());
        // Mark the queue dead first so blocked requests cannot allocate into
        // it once it is cleared.
        self.queue.set_status(false);
        if let Err(e) = self.queue.on_consumer_died() {
            warn!("Failed to free buffers of {}: {}", self.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extra_data::BufferExtraData;
    use crate::memory::ShmAllocator;
    use crate::{BufferRequestConfig, PixelFormat};

    use nix::unistd::Pid;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn user_data() {
        let surface = ConsumerSurface::new("user", false, Arc::new(ShmAllocator::new()));
        for i in 0..MAX_USER_DATA_COUNT {
            surface.set_user_data(&i.to_string(), "v").unwrap();
        }
        assert_eq!(
            surface.set_user_data("extra", "v"),
            Err(SurfaceError::OutOfRange)
        );
        surface.set_user_data("0", "updated").unwrap();
        assert_eq!(surface.get_user_data("0").as_deref(), Some("updated"));
        assert_eq!(surface.get_user_data("extra"), None);
    }

    #[test]
    fn drop_wakes_blocked_producer() {
        let surface = ConsumerSurface::new("drop", false, Arc::new(ShmAllocator::new()));
        surface.consumer().register_consumer_listener(Arc::new(|| ()));
        surface.consumer().set_queue_size(1).unwrap();
        let producer = surface.producer();
        let pid = Pid::from_raw(42);
        let config = BufferRequestConfig {
            timeout: 5000,
            ..BufferRequestConfig::from((PixelFormat::Rgba8888, (16, 16)))
        };
        producer
            .request_buffer(pid, &config, &mut BufferExtraData::new())
            .unwrap();

        let blocked = thread::spawn(move || {
            producer.request_buffer(pid, &config, &mut BufferExtraData::new())
        });
        thread::sleep(Duration::from_millis(30));
        drop(surface);

        assert_eq!(blocked.join().unwrap().unwrap_err(), SurfaceError::NoConsumer);
    }
}
