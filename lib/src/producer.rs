//! Producer side of a buffer queue.
//!
//! A queue accepts buffers from a single producer at a time. The producer is
//! identified by its process id, which the endpoint latches on its first
//! buffer request and forgets on `disconnect`.
//!
//! Remote producers talk to the endpoint through `on_remote_request`, which
//! decodes the messages defined in the `rpc` module and dispatches them to the
//! local methods.
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use nix::unistd::Pid;

use crate::error::{Result, SurfaceError};
use crate::extra_data::BufferExtraData;
use crate::fence::Fence;
use crate::memory::{BufferUsage, SurfaceBuffer};
use crate::queue::*;
use crate::rpc::{CallCode, Parcel, Reply};
use crate::{BufferFlushConfig, BufferRequestConfig, ScalingMode, Transform, VerifyAllocInfo};

pub struct ProducerEndpoint {
    queue: Arc<BufferQueue>,
    /// Process currently producing into the queue, if any.
    connected_pid: Mutex<Option<Pid>>,
}

impl ProducerEndpoint {
    pub fn new(queue: Arc<BufferQueue>) -> Self {
        ProducerEndpoint {
            queue,
            connected_pid: Mutex::new(None),
        }
    }

    /// Latch `caller` as the producer of the queue if nobody is connected,
    /// or check that it is the one already connected.
    fn connect(&self, caller: Pid) -> Result<()> {
        let mut connected_pid = self.connected_pid.lock().unwrap();
        match *connected_pid {
            None => {
                debug!("Process {} connected to {}", caller, self.queue.name());
                *connected_pid = Some(caller);
                Ok(())
            }
            Some(pid) if pid == caller => Ok(()),
            Some(pid) => {
                warn!(
                    "Process {} cannot use {}, already connected to process {}",
                    caller,
                    self.queue.name(),
                    pid
                );
                Err(SurfaceError::InvalidOperating)
            }
        }
    }

    fn check_connected(&self, caller: Pid) -> Result<()> {
        match *self.connected_pid.lock().unwrap() {
            Some(pid) if pid == caller => Ok(()),
            _ => {
                warn!("Process {} is not connected to {}", caller, self.queue.name());
                Err(SurfaceError::InvalidOperating)
            }
        }
    }

    /// Calls changing the queue are refused to any process but the connected
    /// one. Nothing is latched: only a buffer request connects.
    fn check_identity(&self, caller: Pid) -> Result<()> {
        match *self.connected_pid.lock().unwrap() {
            Some(pid) if pid != caller => {
                warn!(
                    "Process {} cannot change {}, connected to process {}",
                    caller,
                    self.queue.name(),
                    pid
                );
                Err(SurfaceError::InvalidOperating)
            }
            _ => Ok(()),
        }
    }

    /// Process currently connected, if any.
    pub fn connected_pid(&self) -> Option<Pid> {
        *self.connected_pid.lock().unwrap()
    }

    pub fn request_buffer(
        &self,
        caller: Pid,
        config: &BufferRequestConfig,
        extra_data: &mut BufferExtraData,
    ) -> Result<RequestBufferReturn> {
        self.connect(caller)?;
        self.queue.request_buffer(config, extra_data)
    }

    pub fn cancel_buffer(&self, sequence: u32, extra_data: BufferExtraData) -> Result<()> {
        self.queue.cancel_buffer(sequence, extra_data)
    }

    pub fn flush_buffer(
        &self,
        sequence: u32,
        extra_data: BufferExtraData,
        fence: Arc<Fence>,
        config: &BufferFlushConfig,
    ) -> Result<()> {
        self.queue.flush_buffer(sequence, extra_data, fence, config)
    }

    pub fn attach_buffer(&self, buffer: Arc<SurfaceBuffer>) -> Result<()> {
        self.queue.attach_buffer(buffer)
    }

    pub fn detach_buffer(&self, sequence: u32) -> Result<()> {
        self.queue.detach_buffer(sequence)
    }

    pub fn register_release_listener(&self, listener: ReleaseListener) {
        self.queue.register_release_listener(listener)
    }

    pub fn get_queue_size(&self) -> u32 {
        self.queue.get_queue_size()
    }

    pub fn set_queue_size(&self, queue_size: u32) -> Result<()> {
        self.queue.set_queue_size(queue_size)
    }

    pub fn get_name(&self) -> &str {
        self.queue.name()
    }

    pub fn get_unique_id(&self) -> u64 {
        self.queue.unique_id()
    }

    pub fn get_default_width(&self) -> i32 {
        self.queue.get_default_width()
    }

    pub fn get_default_height(&self) -> i32 {
        self.queue.get_default_height()
    }

    pub fn get_default_usage(&self) -> BufferUsage {
        self.queue.get_default_usage()
    }

    /// Drop every buffer of the queue. Only the connected producer can do
    /// this.
    pub fn clean_cache(&self, caller: Pid) -> Result<()> {
        self.check_connected(caller)?;
        self.queue.clean_cache()
    }

    /// The producer dropped its buffer cache: make the queue send every buffer
    /// again.
    pub fn go_background(&self, caller: Pid) -> Result<()> {
        self.check_connected(caller)?;
        self.queue.set_producer_cache_clean_flag(true);
        Ok(())
    }

    /// Disconnect the producer. All buffers are freed and another process can
    /// connect.
    pub fn disconnect(&self, caller: Pid) -> Result<()> {
        {
            let mut connected_pid = self.connected_pid.lock().unwrap();
            match *connected_pid {
                Some(pid) if pid == caller => *connected_pid = None,
                _ => {
                    warn!(
                        "Process {} cannot disconnect from {}: not connected",
                        caller,
                        self.queue.name()
                    );
                    return Err(SurfaceError::InvalidOperating);
                }
            }
        }
        debug!("Process {} disconnected from {}", caller, self.queue.name());

        self.queue.go_background()
    }

    pub fn set_transform(&self, transform: Transform) {
        self.queue.set_transform(transform)
    }

    pub fn is_supported_alloc(&self, infos: &[VerifyAllocInfo]) -> Vec<bool> {
        self.queue.is_supported_alloc(infos)
    }

    pub fn set_scaling_mode(&self, sequence: u32, scaling_mode: ScalingMode) -> Result<()> {
        self.queue.set_scaling_mode(sequence, scaling_mode)
    }

    pub fn set_metadata(&self, sequence: u32, metadata: Vec<HdrMetaData>) -> Result<()> {
        self.queue.set_metadata(sequence, metadata)
    }

    pub fn set_metadata_set(
        &self,
        sequence: u32,
        key: HdrMetadataKey,
        metadata: Vec<u8>,
    ) -> Result<()> {
        self.queue.set_metadata_set(sequence, key, metadata)
    }

    pub fn set_tunnel_handle(&self, handle: Option<TunnelHandle>) -> Result<()> {
        self.queue.set_tunnel_handle(handle)
    }

    pub fn get_present_timestamp(
        &self,
        sequence: u32,
        type_: PresentTimestampType,
    ) -> Result<i64> {
        self.queue.get_present_timestamp(sequence, type_)
    }

    /// Serve a request sent by a remote producer running in process `caller`.
    ///
    /// Attaching, detaching and release listeners only make sense within the
    /// process owning the queue and are refused here.
    pub fn on_remote_request(&self, caller: Pid, code: u32, parcel: Parcel) -> Result<Reply> {
        let code = CallCode::n(code).ok_or_else(|| {
            warn!("Unknown call code {} from process {}", code, caller);
            SurfaceError::NotSupport
        })?;

        if code.is_mutating() {
            self.check_identity(caller)?;
        }

        match (code, parcel) {
            (CallCode::RequestBuffer, Parcel::RequestBuffer(config)) => {
                let mut extra_data = BufferExtraData::new();
                let ret = self.request_buffer(caller, &config, &mut extra_data)?;
                Ok(Reply::Buffer { ret, extra_data })
            }
            (
                CallCode::CancelBuffer,
                Parcel::CancelBuffer {
                    sequence,
                    extra_data,
                },
            ) => self.cancel_buffer(sequence, extra_data).map(|()| Reply::None),
            (
                CallCode::FlushBuffer,
                Parcel::FlushBuffer {
                    sequence,
                    extra_data,
                    fence,
                    config,
                },
            ) => self
                .flush_buffer(sequence, extra_data, fence, &config)
                .map(|()| Reply::None),
            (
                CallCode::AttachBuffer
                | CallCode::DetachBuffer
                | CallCode::RegisterReleaseListener,
                _,
            ) => {
                debug!("{:?} is not available to remote producers", code);
                Err(SurfaceError::NotSupport)
            }
            (CallCode::GetQueueSize, Parcel::Empty) => Ok(Reply::QueueSize(self.get_queue_size())),
            (CallCode::SetQueueSize, Parcel::QueueSize(queue_size)) => {
                self.set_queue_size(queue_size).map(|()| Reply::None)
            }
            (CallCode::GetName, Parcel::Empty) => Ok(Reply::Name(self.get_name().to_owned())),
            (CallCode::GetDefaultWidth, Parcel::Empty) => {
                Ok(Reply::Dimension(self.get_default_width()))
            }
            (CallCode::GetDefaultHeight, Parcel::Empty) => {
                Ok(Reply::Dimension(self.get_default_height()))
            }
            (CallCode::GetDefaultUsage, Parcel::Empty) => {
                Ok(Reply::Usage(self.get_default_usage()))
            }
            (CallCode::GetUniqueId, Parcel::Empty) => Ok(Reply::UniqueId(self.get_unique_id())),
            (CallCode::CleanCache, Parcel::Empty) => self.clean_cache(caller).map(|()| Reply::None),
            (CallCode::SetTransform, Parcel::Transform(raw)) => {
                let transform = Transform::n(raw).ok_or(SurfaceError::InvalidArguments)?;
                self.set_transform(transform);
                Ok(Reply::None)
            }
            (CallCode::IsSupportedAlloc, Parcel::AllocInfos(infos)) => {
                Ok(Reply::Supported(self.is_supported_alloc(&infos)))
            }
            (CallCode::GetNameAndUniqueId, Parcel::Empty) => Ok(Reply::NameAndUniqueId(
                self.get_name().to_owned(),
                self.get_unique_id(),
            )),
            (CallCode::Disconnect, Parcel::Empty) => self.disconnect(caller).map(|()| Reply::None),
            (CallCode::SetScalingMode, Parcel::ScalingMode { sequence, mode }) => {
                let mode = ScalingMode::n(mode).ok_or(SurfaceError::InvalidArguments)?;
                self.set_scaling_mode(sequence, mode).map(|()| Reply::None)
            }
            (CallCode::SetMetaData, Parcel::MetaData { sequence, metadata }) => {
                self.set_metadata(sequence, metadata).map(|()| Reply::None)
            }
            (
                CallCode::SetMetaDataSet,
                Parcel::MetaDataSet {
                    sequence,
                    key,
                    metadata,
                },
            ) => {
                let key = HdrMetadataKey::n(key).ok_or(SurfaceError::InvalidArguments)?;
                self.set_metadata_set(sequence, key, metadata)
                    .map(|()| Reply::None)
            }
            (CallCode::SetTunnelHandle, Parcel::TunnelHandle(handle)) => {
                if matches!(&handle, Some(h) if h.reserve_ints.is_empty()) {
                    warn!("Tunnel handle without reserved ints");
                    return Err(SurfaceError::InvalidArguments);
                }
                self.set_tunnel_handle(handle).map(|()| Reply::None)
            }
            (CallCode::GoBackground, Parcel::Empty) => {
                self.go_background(caller).map(|()| Reply::None)
            }
            (CallCode::GetPresentTimestamp, Parcel::PresentTimestamp { sequence, type_ }) => {
                let type_ = PresentTimestampType::n(type_).ok_or(SurfaceError::InvalidArguments)?;
                self.get_present_timestamp(sequence, type_)
                    .map(Reply::Timestamp)
            }
            (code, parcel) => {
                warn!("Malformed {:?} request: {:?}", code, parcel);
                Err(SurfaceError::InvalidArguments)
            }
        }
    }
}
