//! Messages exchanged between a remote producer and the producer endpoint of
//! a queue.
//!
//! Each request is identified by a `CallCode` and carries a `Parcel`; the
//! endpoint answers with a `Reply` or an error. The transport itself is not
//! part of this crate: `RemoteProducer` talks to an endpoint living in the
//! same process, but goes through exactly the same path as a request coming
//! from another process.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use enumn::N;
use log::{debug, error};
use nix::unistd::Pid;

use crate::error::{Result, SurfaceError};
use crate::extra_data::BufferExtraData;
use crate::fence::Fence;
use crate::memory::{BufferUsage, SurfaceBuffer};
use crate::producer::ProducerEndpoint;
use crate::queue::{
    HdrMetaData, HdrMetadataKey, PresentTimestampType, RequestBufferReturn, TunnelHandle,
};
use crate::{BufferFlushConfig, BufferRequestConfig, ScalingMode, Transform, VerifyAllocInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum CallCode {
    RequestBuffer = 0,
    CancelBuffer,
    FlushBuffer,
    AttachBuffer,
    DetachBuffer,
    GetQueueSize,
    SetQueueSize,
    GetName,
    GetDefaultWidth,
    GetDefaultHeight,
    GetDefaultUsage,
    GetUniqueId,
    CleanCache,
    RegisterReleaseListener,
    SetTransform,
    IsSupportedAlloc,
    GetNameAndUniqueId,
    Disconnect,
    SetScalingMode,
    SetMetaData,
    SetMetaDataSet,
    SetTunnelHandle,
    GoBackground,
    GetPresentTimestamp,
}

impl CallCode {
    /// Whether the call changes the queue or one of its buffers, and is thus
    /// reserved to the connected producer.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            CallCode::CancelBuffer
                | CallCode::FlushBuffer
                | CallCode::SetQueueSize
                | CallCode::SetTransform
                | CallCode::SetScalingMode
                | CallCode::SetMetaData
                | CallCode::SetMetaDataSet
                | CallCode::SetTunnelHandle
        )
    }
}

/// Payload of a request. Enumerations are sent as their raw values and
/// validated by the receiving end.
#[derive(Debug)]
pub enum Parcel {
    Empty,
    RequestBuffer(BufferRequestConfig),
    CancelBuffer {
        sequence: u32,
        extra_data: BufferExtraData,
    },
    FlushBuffer {
        sequence: u32,
        extra_data: BufferExtraData,
        fence: Arc<Fence>,
        config: BufferFlushConfig,
    },
    AttachBuffer(Arc<SurfaceBuffer>),
    DetachBuffer(u32),
    QueueSize(u32),
    Transform(u32),
    AllocInfos(Vec<VerifyAllocInfo>),
    ScalingMode {
        sequence: u32,
        mode: u32,
    },
    MetaData {
        sequence: u32,
        metadata: Vec<HdrMetaData>,
    },
    MetaDataSet {
        sequence: u32,
        key: u32,
        metadata: Vec<u8>,
    },
    TunnelHandle(Option<TunnelHandle>),
    PresentTimestamp {
        sequence: u32,
        type_: u32,
    },
}

/// Payload of a successful reply.
#[derive(Debug)]
pub enum Reply {
    None,
    Buffer {
        ret: RequestBufferReturn,
        extra_data: BufferExtraData,
    },
    QueueSize(u32),
    Name(String),
    UniqueId(u64),
    NameAndUniqueId(String, u64),
    Dimension(i32),
    Usage(BufferUsage),
    Supported(Vec<bool>),
    Timestamp(i64),
}

/// A buffer obtained by a remote producer.
#[derive(Debug)]
pub struct RequestedBuffer {
    pub buffer: Arc<SurfaceBuffer>,
    /// Wait on this before writing into the buffer.
    pub fence: Arc<Fence>,
    pub extra_data: BufferExtraData,
}

impl RequestedBuffer {
    pub fn seq_num(&self) -> u32 {
        self.buffer.seq_num()
    }
}

fn unexpected_reply(code: CallCode, reply: Reply) -> SurfaceError {
    error!("Unexpected reply to {:?}: {:?}", code, reply);
    SurfaceError::Internal
}

/// Client side of a producer endpoint.
///
/// The queue only sends a buffer the first time it is handed to a producer,
/// so the proxy keeps the buffers it received, indexed by sequence number, and
/// forgets them when the queue reports them deleted.
pub struct RemoteProducer {
    endpoint: Arc<ProducerEndpoint>,
    pid: Pid,
    cache: Mutex<BTreeMap<u32, Arc<SurfaceBuffer>>>,
}

impl RemoteProducer {
    /// Create a proxy sending requests to `endpoint` on behalf of process
    /// `pid`.
    pub fn new(endpoint: Arc<ProducerEndpoint>, pid: Pid) -> Self {
        RemoteProducer {
            endpoint,
            pid,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Number of buffers currently known to this producer.
    pub fn num_cached_buffers(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    fn transact(&self, code: CallCode, parcel: Parcel) -> Result<Reply> {
        self.endpoint.on_remote_request(self.pid, code as u32, parcel)
    }

    fn transact_status(&self, code: CallCode, parcel: Parcel) -> Result<()> {
        match self.transact(code, parcel)? {
            Reply::None => Ok(()),
            reply => Err(unexpected_reply(code, reply)),
        }
    }

    pub fn request_buffer(&self, config: &BufferRequestConfig) -> Result<RequestedBuffer> {
        let code = CallCode::RequestBuffer;
        let (ret, extra_data) = match self.transact(code, Parcel::RequestBuffer(config.clone()))? {
            Reply::Buffer { ret, extra_data } => (ret, extra_data),
            reply => return Err(unexpected_reply(code, reply)),
        };

        let mut cache = self.cache.lock().unwrap();
        for sequence in &ret.deleting_buffers {
            cache.remove(sequence);
        }
        let buffer = match ret.buffer {
            Some(buffer) => {
                cache.insert(ret.sequence, Arc::clone(&buffer));
                buffer
            }
            None => match cache.get(&ret.sequence) {
                Some(buffer) => Arc::clone(buffer),
                None => {
                    error!("Buffer {} missing from the producer cache", ret.sequence);
                    return Err(SurfaceError::Internal);
                }
            },
        };
        debug!("Got buffer {} from {:?}", ret.sequence, code);

        Ok(RequestedBuffer {
            buffer,
            fence: ret.fence,
            extra_data,
        })
    }

    pub fn cancel_buffer(&self, sequence: u32, extra_data: BufferExtraData) -> Result<()> {
        self.transact_status(
            CallCode::CancelBuffer,
            Parcel::CancelBuffer {
                sequence,
                extra_data,
            },
        )
    }

    pub fn flush_buffer(
        &self,
        sequence: u32,
        extra_data: BufferExtraData,
        fence: Arc<Fence>,
        config: &BufferFlushConfig,
    ) -> Result<()> {
        self.transact_status(
            CallCode::FlushBuffer,
            Parcel::FlushBuffer {
                sequence,
                extra_data,
                fence,
                config: *config,
            },
        )
    }

    pub fn attach_buffer(&self, buffer: Arc<SurfaceBuffer>) -> Result<()> {
        self.transact_status(CallCode::AttachBuffer, Parcel::AttachBuffer(buffer))
    }

    pub fn detach_buffer(&self, sequence: u32) -> Result<()> {
        self.transact_status(CallCode::DetachBuffer, Parcel::DetachBuffer(sequence))
    }

    pub fn register_release_listener(&self) -> Result<()> {
        self.transact_status(CallCode::RegisterReleaseListener, Parcel::Empty)
    }

    pub fn get_queue_size(&self) -> Result<u32> {
        let code = CallCode::GetQueueSize;
        match self.transact(code, Parcel::Empty)? {
            Reply::QueueSize(queue_size) => Ok(queue_size),
            reply => Err(unexpected_reply(code, reply)),
        }
    }

    pub fn set_queue_size(&self, queue_size: u32) -> Result<()> {
        self.transact_status(CallCode::SetQueueSize, Parcel::QueueSize(queue_size))
    }

    pub fn get_name(&self) -> Result<String> {
        let code = CallCode::GetName;
        match self.transact(code, Parcel::Empty)? {
            Reply::Name(name) => Ok(name),
            reply => Err(unexpected_reply(code, reply)),
        }
    }

    pub fn get_unique_id(&self) -> Result<u64> {
        let code = CallCode::GetUniqueId;
        match self.transact(code, Parcel::Empty)? {
            Reply::UniqueId(id) => Ok(id),
            reply => Err(unexpected_reply(code, reply)),
        }
    }

    pub fn get_name_and_unique_id(&self) -> Result<(String, u64)> {
        let code = CallCode::GetNameAndUniqueId;
        match self.transact(code, Parcel::Empty)? {
            Reply::NameAndUniqueId(name, id) => Ok((name, id)),
            reply => Err(unexpected_reply(code, reply)),
        }
    }

    fn get_dimension(&self, code: CallCode) -> Result<i32> {
        match self.transact(code, Parcel::Empty)? {
            Reply::Dimension(value) => Ok(value),
            reply => Err(unexpected_reply(code, reply)),
        }
    }

    pub fn get_default_width(&self) -> Result<i32> {
        self.get_dimension(CallCode::GetDefaultWidth)
    }

    pub fn get_default_height(&self) -> Result<i32> {
        self.get_dimension(CallCode::GetDefaultHeight)
    }

    pub fn get_default_usage(&self) -> Result<BufferUsage> {
        let code = CallCode::GetDefaultUsage;
        match self.transact(code, Parcel::Empty)? {
            Reply::Usage(usage) => Ok(usage),
            reply => Err(unexpected_reply(code, reply)),
        }
    }

    pub fn clean_cache(&self) -> Result<()> {
        self.transact_status(CallCode::CleanCache, Parcel::Empty)?;
        self.cache.lock().unwrap().clear();
        Ok(())
    }

    /// Drop all cached buffers, e.g. when the producer application goes to
    /// the background. The queue will send them again.
    pub fn go_background(&self) -> Result<()> {
        self.transact_status(CallCode::GoBackground, Parcel::Empty)?;
        self.cache.lock().unwrap().clear();
        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        self.transact_status(CallCode::Disconnect, Parcel::Empty)?;
        self.cache.lock().unwrap().clear();
        Ok(())
    }

    pub fn set_transform(&self, transform: Transform) -> Result<()> {
        self.transact_status(CallCode::SetTransform, Parcel::Transform(transform as u32))
    }

    pub fn is_supported_alloc(&self, infos: &[VerifyAllocInfo]) -> Result<Vec<bool>> {
        let code = CallCode::IsSupportedAlloc;
        match self.transact(code, Parcel::AllocInfos(infos.to_vec()))? {
            Reply::Supported(supported) => Ok(supported),
            reply => Err(unexpected_reply(code, reply)),
        }
    }

    pub fn set_scaling_mode(&self, sequence: u32, mode: ScalingMode) -> Result<()> {
        self.transact_status(
            CallCode::SetScalingMode,
            Parcel::ScalingMode {
                sequence,
                mode: mode as u32,
            },
        )
    }

    pub fn set_metadata(&self, sequence: u32, metadata: Vec<HdrMetaData>) -> Result<()> {
        self.transact_status(
            CallCode::SetMetaData,
            Parcel::MetaData { sequence, metadata },
        )
    }

    pub fn set_metadata_set(
        &self,
        sequence: u32,
        key: HdrMetadataKey,
        metadata: Vec<u8>,
    ) -> Result<()> {
        self.transact_status(
            CallCode::SetMetaDataSet,
            Parcel::MetaDataSet {
                sequence,
                key: key as u32,
                metadata,
            },
        )
    }

    pub fn set_tunnel_handle(&self, handle: Option<TunnelHandle>) -> Result<()> {
        self.transact_status(CallCode::SetTunnelHandle, Parcel::TunnelHandle(handle))
    }

    pub fn get_present_timestamp(
        &self,
        sequence: u32,
        type_: PresentTimestampType,
    ) -> Result<i64> {
        let code = CallCode::GetPresentTimestamp;
        match self.transact(
            code,
            Parcel::PresentTimestamp {
                sequence,
                type_: type_ as u32,
            },
        )? {
            Reply::Timestamp(time) => Ok(time),
            reply => Err(unexpected_reply(code, reply)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Allocator, ShmAllocator};
    use crate::queue::{BufferQueue, PresentTimestamp};
    use crate::PixelFormat;

    fn new_remote() -> (Arc<BufferQueue>, RemoteProducer) {
        let queue = Arc::new(BufferQueue::new(
            "remote",
            false,
            Arc::new(ShmAllocator::new()),
        ));
        queue.register_consumer_listener(Arc::new(|| ()));
        let endpoint = Arc::new(ProducerEndpoint::new(Arc::clone(&queue)));
        (queue, RemoteProducer::new(endpoint, Pid::from_raw(1234)))
    }

    fn config() -> BufferRequestConfig {
        BufferRequestConfig::from((PixelFormat::Rgb565, (16, 16)))
    }

    #[test]
    fn call_codes() {
        assert_eq!(CallCode::n(0), Some(CallCode::RequestBuffer));
        assert_eq!(CallCode::n(23), Some(CallCode::GetPresentTimestamp));
        assert_eq!(CallCode::n(24), None);
    }

    #[test]
    fn round_trip() {
        let (queue, producer) = new_remote();
        let requested = producer.request_buffer(&config()).unwrap();
        assert_eq!(producer.num_cached_buffers(), 1);

        producer
            .flush_buffer(
                requested.seq_num(),
                BufferExtraData::new(),
                Arc::new(Fence::invalid()),
                &Default::default(),
            )
            .unwrap();
        let acquired = queue.acquire_buffer().unwrap();
        assert!(Arc::ptr_eq(&acquired.buffer, &requested.buffer));
        queue
            .release_buffer(acquired.seq_num(), Arc::new(Fence::invalid()))
            .unwrap();

        // The buffer comes back from the cache.
        let again = producer.request_buffer(&config()).unwrap();
        assert!(Arc::ptr_eq(&again.buffer, &requested.buffer));
        producer
            .cancel_buffer(again.seq_num(), BufferExtraData::new())
            .unwrap();
    }

    #[test]
    fn cache_follows_deletions() {
        let (_queue, producer) = new_remote();
        producer.set_queue_size(1).unwrap();
        let first = producer.request_buffer(&config()).unwrap();
        producer
            .cancel_buffer(first.seq_num(), BufferExtraData::new())
            .unwrap();

        let other = BufferRequestConfig {
            width: 32,
            ..config()
        };
        let second = producer.request_buffer(&other).unwrap();
        assert_ne!(second.seq_num(), first.seq_num());
        assert_eq!(producer.num_cached_buffers(), 1);
    }

    #[test]
    fn go_background_refills_cache() {
        let (_queue, producer) = new_remote();
        let requested = producer.request_buffer(&config()).unwrap();
        producer
            .cancel_buffer(requested.seq_num(), BufferExtraData::new())
            .unwrap();

        producer.go_background().unwrap();
        assert_eq!(producer.num_cached_buffers(), 0);
        let again = producer.request_buffer(&config()).unwrap();
        assert_eq!(again.seq_num(), requested.seq_num());
        assert_eq!(producer.num_cached_buffers(), 1);
    }

    #[test]
    fn queries() {
        let (queue, producer) = new_remote();
        queue.set_default_width_and_height(640, 480).unwrap();
        queue.set_default_usage(BufferUsage::CPU_READ);

        assert_eq!(producer.get_queue_size(), Ok(3));
        assert_eq!(producer.get_name().unwrap(), "remote");
        assert_eq!(producer.get_unique_id(), Ok(queue.unique_id()));
        assert_eq!(producer.get_default_width(), Ok(640));
        assert_eq!(producer.get_default_height(), Ok(480));
        assert_eq!(producer.get_default_usage(), Ok(BufferUsage::CPU_READ));

        producer.set_transform(Transform::FlipH).unwrap();
        assert_eq!(queue.get_transform(), Transform::FlipH);

        let info = VerifyAllocInfo {
            width: 64,
            height: 64,
            usage: BufferUsage::CPU_READ,
            format: PixelFormat::Rgba8888,
        };
        assert_eq!(producer.is_supported_alloc(&[info]), Ok(vec![true]));
    }

    #[test]
    fn metadata_and_timestamps() {
        let (queue, producer) = new_remote();
        let sequence = producer.request_buffer(&config()).unwrap().seq_num();

        producer
            .set_scaling_mode(sequence, ScalingMode::NoScaleCrop)
            .unwrap();
        assert_eq!(
            queue.get_scaling_mode(sequence),
            Ok(ScalingMode::NoScaleCrop)
        );
        producer
            .set_metadata_set(sequence, HdrMetadataKey::Hdr10Plus, vec![7; 4])
            .unwrap();
        assert_eq!(
            queue.get_metadata_set(sequence),
            Ok((HdrMetadataKey::Hdr10Plus, vec![7; 4]))
        );

        queue
            .set_present_timestamp(
                sequence,
                PresentTimestamp {
                    type_: PresentTimestampType::Delay,
                    time: 8,
                },
            )
            .unwrap();
        assert_eq!(
            producer.get_present_timestamp(sequence, PresentTimestampType::Delay),
            Ok(8)
        );
    }

    #[test]
    fn local_only_calls() {
        let (_queue, producer) = new_remote();
        let config = config();
        let handle = ShmAllocator::new().alloc(&config).unwrap();
        let buffer = Arc::new(SurfaceBuffer::new(handle, &config));

        assert_eq!(
            producer.attach_buffer(buffer),
            Err(SurfaceError::NotSupport)
        );
        assert_eq!(producer.detach_buffer(0), Err(SurfaceError::NotSupport));
        assert_eq!(
            producer.register_release_listener(),
            Err(SurfaceError::NotSupport)
        );
    }

    #[test]
    fn single_producer() {
        let (queue, producer) = new_remote();
        let endpoint = Arc::new(ProducerEndpoint::new(Arc::clone(&queue)));
        let first = RemoteProducer::new(Arc::clone(&endpoint), Pid::from_raw(1));
        let second = RemoteProducer::new(endpoint, Pid::from_raw(2));
        drop(producer);

        first.request_buffer(&config()).unwrap();
        assert_eq!(
            second.request_buffer(&config()).unwrap_err(),
            SurfaceError::InvalidOperating
        );
        assert_eq!(second.disconnect(), Err(SurfaceError::InvalidOperating));
        assert_eq!(
            second.set_queue_size(1),
            Err(SurfaceError::InvalidOperating)
        );
        assert_eq!(
            second.set_transform(Transform::Rotate90),
            Err(SurfaceError::InvalidOperating)
        );
        assert_eq!(queue.get_queue_size(), 3);
        first.disconnect().unwrap();
        assert_eq!(queue.used_size(), 0);
        second.request_buffer(&config()).unwrap();
    }
}
